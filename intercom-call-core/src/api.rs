//! Backend call API
//!
//! Call details, answer tokens and decline/end notifications. The backend is
//! authoritative for participants and display data; its status payloads mix
//! camelCase and snake_case keys, so decoding accepts both.

use crate::identity::UserType;
use crate::types::{CallId, DeclineReason, EndReason, Participant, TokenBundle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "http-api")]
pub use http::HttpCallApi;

/// Backend API errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The call does not exist (HTTP 404)
    #[error("Call not found: {0}")]
    NotFound(CallId),

    /// Non-success HTTP status
    #[error("Backend returned {code}: {message}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Response body or reason
        message: String,
    },

    /// Backend answered but flagged the request unsuccessful
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    /// Request never completed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Answer response carried no token bundle
    #[error("Answer response carried no tokens")]
    MissingTokens,
}

/// Authoritative call details from the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDetails {
    /// Call identifier
    pub call_id: CallId,
    /// Transport channel; may be empty
    pub channel_name: String,
    /// Participants with a non-empty id
    pub participants: Vec<Participant>,
    /// Name of the calling doorman
    pub doorman_name: Option<String>,
    /// Apartment called
    pub apartment_number: Option<String>,
    /// Building identifier
    pub building_id: Option<String>,
    /// Backend call status
    pub status: Option<String>,
    /// Set once the backend has closed the call
    pub ended_at: Option<String>,
}

impl CallDetails {
    /// The backend considers the call over
    pub fn is_remotely_closed(&self) -> bool {
        let closed_status = self
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("ended") || s.eq_ignore_ascii_case("closed"))
            .unwrap_or(false);
        closed_status || self.ended_at.is_some()
    }

    /// Ids of every participant, in backend order
    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.user_id.clone()).collect()
    }

    /// Decode a `GET /api/calls/{id}/status` body
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Rejected`] when `success` is false or `data` is
    /// absent, [`ApiError::Decode`] when the body has the wrong shape
    pub fn from_status_body(call_id: &CallId, body: serde_json::Value) -> Result<Self, ApiError> {
        let envelope: StatusEnvelope =
            serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope.error.unwrap_or_else(|| "success=false".to_string()),
            ));
        }
        let data = envelope
            .data
            .ok_or_else(|| ApiError::Rejected("response carried no data".to_string()))?;

        let call = data.call.unwrap_or_default();
        let participants = data
            .participants
            .into_iter()
            .filter_map(RawParticipant::into_participant)
            .collect();

        Ok(Self {
            call_id: call_id.clone(),
            channel_name: call.channel_name.unwrap_or_default(),
            participants,
            doorman_name: non_empty(call.doorman_name),
            apartment_number: non_empty(call.apartment_number),
            building_id: non_empty(call.building_id),
            status: non_empty(call.status),
            ended_at: non_empty(call.ended_at),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<StatusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    #[serde(default)]
    call: Option<RawCall>,
    #[serde(default)]
    participants: Vec<RawParticipant>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCall {
    #[serde(alias = "channel_name")]
    channel_name: Option<String>,
    #[serde(alias = "doorman_name")]
    doorman_name: Option<String>,
    #[serde(alias = "apartment_number")]
    apartment_number: Option<String>,
    #[serde(alias = "building_id")]
    building_id: Option<String>,
    status: Option<String>,
    #[serde(alias = "ended_at")]
    ended_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawParticipant {
    #[serde(alias = "user_id")]
    user_id: Option<String>,
    status: Option<String>,
    #[serde(alias = "joined_at")]
    joined_at: Option<String>,
    #[serde(alias = "left_at")]
    left_at: Option<String>,
}

impl RawParticipant {
    fn into_participant(self) -> Option<Participant> {
        let user_id = self.user_id.filter(|id| !id.is_empty())?;
        Some(Participant {
            user_id,
            status: self.status,
            joined_at: parse_timestamp(self.joined_at),
            left_at: parse_timestamp(self.left_at),
        })
    }
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
struct AnswerEnvelope {
    #[serde(default)]
    data: Option<AnswerData>,
}

#[derive(Debug, Deserialize)]
struct AnswerData {
    #[serde(default)]
    tokens: Option<TokenBundle>,
}

/// Decode a `POST /api/calls/{id}/answer` body into its token bundle
///
/// # Errors
///
/// Returns [`ApiError::MissingTokens`] if the bundle is absent
pub fn tokens_from_answer_body(body: serde_json::Value) -> Result<TokenBundle, ApiError> {
    let envelope: AnswerEnvelope =
        serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    envelope
        .data
        .and_then(|d| d.tokens)
        .ok_or(ApiError::MissingTokens)
}

/// Body of an answer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerCallRequest {
    /// Answering user
    pub user_id: String,
    /// Role, always `resident` on this device
    pub user_type: &'static str,
}

/// Body of a decline request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclineCallRequest {
    /// Declining user
    pub user_id: String,
    /// Role
    pub user_type: &'static str,
    /// Decline reason
    pub reason: DeclineReason,
}

/// Body of an end request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallRequest {
    /// User ending the call
    pub user_id: String,
    /// Role
    pub user_type: &'static str,
    /// End cause
    pub cause: EndReason,
}

/// Role this device reports to the backend
pub const DEVICE_USER_ROLE: UserType = UserType::Resident;

/// Backend call API trait
#[async_trait]
pub trait CallApi: Send + Sync {
    /// Fetch authoritative call details
    async fn call_details(&self, call_id: &CallId) -> Result<CallDetails, ApiError>;

    /// Answer the call, returning the transport token bundle
    async fn answer(&self, call_id: &CallId, user_id: &str) -> Result<TokenBundle, ApiError>;

    /// Record a decline
    async fn decline(
        &self,
        call_id: &CallId,
        user_id: &str,
        reason: DeclineReason,
    ) -> Result<(), ApiError>;

    /// Record the end of an answered call
    async fn end(&self, call_id: &CallId, user_id: &str, cause: EndReason)
        -> Result<(), ApiError>;
}

#[cfg(feature = "http-api")]
mod http {
    use super::*;
    use crate::config::ApiConfig;
    use crate::identity::AuthProvider;
    use std::sync::Arc;

    /// [`CallApi`] over HTTP
    pub struct HttpCallApi {
        client: reqwest::Client,
        base_url: String,
        auth: Option<Arc<dyn AuthProvider>>,
    }

    impl HttpCallApi {
        /// Build a client for `config.base_url`
        ///
        /// # Errors
        ///
        /// Returns error if the HTTP client cannot be constructed
        pub fn new(config: &ApiConfig, auth: Option<Arc<dyn AuthProvider>>) -> Result<Self, ApiError> {
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout())
                .build()
                .map_err(|e| ApiError::Transport(e.to_string()))?;
            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                auth,
            })
        }

        fn url(&self, call_id: &CallId, action: &str) -> String {
            format!("{}/api/calls/{}/{}", self.base_url, call_id, action)
        }

        async fn execute(
            &self,
            call_id: &CallId,
            request: reqwest::RequestBuilder,
        ) -> Result<serde_json::Value, ApiError> {
            let request = match &self.auth {
                Some(auth) => match auth.access_token().await {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                },
                None => request,
            };

            let response = request
                .send()
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ApiError::NotFound(call_id.clone()));
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    code: status.as_u16(),
                    message,
                });
            }

            response
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))
        }
    }

    #[async_trait]
    impl CallApi for HttpCallApi {
        #[tracing::instrument(skip(self), fields(call_id = %call_id))]
        async fn call_details(&self, call_id: &CallId) -> Result<CallDetails, ApiError> {
            let body = self
                .execute(call_id, self.client.get(self.url(call_id, "status")))
                .await?;
            CallDetails::from_status_body(call_id, body)
        }

        #[tracing::instrument(skip(self), fields(call_id = %call_id))]
        async fn answer(&self, call_id: &CallId, user_id: &str) -> Result<TokenBundle, ApiError> {
            let body = AnswerCallRequest {
                user_id: user_id.to_string(),
                user_type: DEVICE_USER_ROLE.api_role(),
            };
            let response = self
                .execute(call_id, self.client.post(self.url(call_id, "answer")).json(&body))
                .await?;
            tokens_from_answer_body(response)
        }

        #[tracing::instrument(skip(self), fields(call_id = %call_id))]
        async fn decline(
            &self,
            call_id: &CallId,
            user_id: &str,
            reason: DeclineReason,
        ) -> Result<(), ApiError> {
            let body = DeclineCallRequest {
                user_id: user_id.to_string(),
                user_type: DEVICE_USER_ROLE.api_role(),
                reason,
            };
            self.execute(call_id, self.client.post(self.url(call_id, "decline")).json(&body))
                .await?;
            Ok(())
        }

        #[tracing::instrument(skip(self), fields(call_id = %call_id))]
        async fn end(
            &self,
            call_id: &CallId,
            user_id: &str,
            cause: EndReason,
        ) -> Result<(), ApiError> {
            let body = EndCallRequest {
                user_id: user_id.to_string(),
                user_type: DEVICE_USER_ROLE.api_role(),
                cause,
            };
            self.execute(call_id, self.client.post(self.url(call_id, "end")).json(&body))
                .await?;
            Ok(())
        }
    }

}
