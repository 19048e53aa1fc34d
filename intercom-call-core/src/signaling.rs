//! Call signaling protocol
//!
//! Invite/answer/decline/end messages exchanged over the real-time messaging
//! channel, independent of the audio path. The wire format is a small JSON
//! object keyed by `t`; older peers spell end-like messages through `type`,
//! `action` or `event` instead, and those spellings are still accepted.

use crate::identity::CurrentUser;
use crate::outcome::BestEffort;
use crate::state_machine::SignalType;
use crate::types::CallId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Channel did not connect within the warm-up bound
    #[error("Signaling warm-up timed out after {0:?}")]
    WarmupTimeout(Duration),

    /// Channel is not connected
    #[error("Signaling channel not connected: {0}")]
    NotConnected(String),

    /// Sending failed
    #[error("Signal send failed: {0}")]
    SendFailed(String),

    /// Inbound message could not be understood
    #[error("Malformed signaling message: {0}")]
    Malformed(String),
}

/// Connection status of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Not connected
    Disconnected,
    /// Login in progress
    Connecting,
    /// Ready to send and receive
    Connected,
}

/// Raw inbound message from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender's peer id
    pub peer_id: String,
    /// Message body
    pub text: String,
}

/// Signaling channel trait
///
/// Implement this for the real-time messaging service in use.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Current connection status
    fn status(&self) -> ChannelStatus;

    /// Connect (or wait for an in-progress login); resolves once connected
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Send a message to each of `peers`
    async fn send_peer_message(
        &self,
        peers: &[String],
        message: &SignalMessage,
    ) -> Result<(), SignalingError>;

    /// User the channel is logged in as
    fn current_user(&self) -> Option<CurrentUser>;

    /// Set the user context used for login and outgoing messages
    fn set_current_user(&self, user: CurrentUser);

    /// Subscribe to inbound messages
    fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage>;
}

/// Outbound signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// Message type
    pub t: SignalType,
    /// Call identifier
    pub call_id: CallId,
    /// Sender's user id
    pub from: String,
    /// Transport channel of the call
    pub channel: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Optional reason (e.g. `busy`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SignalMessage {
    /// New message stamped with the current time
    pub fn new(t: SignalType, call_id: &CallId, from: &str, channel: &str) -> Self {
        Self {
            t,
            call_id: call_id.clone(),
            from: from.to_string(),
            channel: channel.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason: None,
        }
    }

    /// Attach a reason
    #[must_use]
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Alternate spellings that mean the call is over
const END_SPELLINGS: &[&str] = &[
    "end",
    "ended",
    "hangup",
    "cancel",
    "cancelled",
    "intercom_call_end",
    "call_end",
    "end_call",
];

/// Alternate spellings for a decline
const DECLINE_SPELLINGS: &[&str] = &["decline", "declined"];

/// Classification of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// One of the known signal types
    Signal(SignalType),
    /// Anything else, carrying the raw type string
    Other(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSignal {
    t: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    action: Option<String>,
    event: Option<String>,
    call_id: Option<String>,
    from: Option<String>,
    from_name: Option<String>,
    caller_name: Option<String>,
    channel: Option<String>,
    channel_name: Option<String>,
    apartment_number: Option<String>,
    building_name: Option<String>,
    timestamp: Option<i64>,
    reason: Option<String>,
}

/// Parsed inbound signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    /// What the message means
    pub kind: InboundKind,
    /// Call it refers to
    pub call_id: Option<CallId>,
    /// Sender as stated in the body
    pub from: Option<String>,
    /// Caller display name, when the body carries one
    pub caller_name: Option<String>,
    /// Transport channel (`channel` or `channelName`)
    pub channel: Option<String>,
    /// Apartment the invite is addressed to
    pub apartment_number: Option<String>,
    /// Building name
    pub building_name: Option<String>,
    /// Sender timestamp
    pub timestamp: Option<i64>,
    /// Reason, for declines
    pub reason: Option<String>,
}

impl InboundSignal {
    /// Parse a message body
    ///
    /// # Errors
    ///
    /// Returns error if the body is not a JSON object
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let raw: RawSignal =
            serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;

        let kind = classify(&raw);
        Ok(Self {
            kind,
            call_id: raw.call_id.filter(|s| !s.is_empty()).map(CallId::new),
            from: raw.from,
            caller_name: raw.from_name.or(raw.caller_name),
            channel: raw.channel.or(raw.channel_name).filter(|s| !s.is_empty()),
            apartment_number: raw.apartment_number,
            building_name: raw.building_name,
            timestamp: raw.timestamp,
            reason: raw.reason,
        })
    }

    /// END or DECLINE in any accepted spelling
    pub fn is_end_like(&self) -> bool {
        matches!(
            self.kind,
            InboundKind::Signal(SignalType::End) | InboundKind::Signal(SignalType::Decline)
        )
    }

    /// An invite
    pub fn is_invite(&self) -> bool {
        self.kind == InboundKind::Signal(SignalType::Invite)
    }
}

fn classify(raw: &RawSignal) -> InboundKind {
    if let Some(t) = raw.t.as_deref() {
        let known = SignalType::ALL.iter().find(|s| s.as_str() == t);
        if let Some(signal) = known {
            return InboundKind::Signal(*signal);
        }
    }

    let alt = raw
        .kind
        .as_deref()
        .or(raw.action.as_deref())
        .or(raw.event.as_deref())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if END_SPELLINGS.contains(&alt.as_str()) {
        InboundKind::Signal(SignalType::End)
    } else if DECLINE_SPELLINGS.contains(&alt.as_str()) {
        InboundKind::Signal(SignalType::Decline)
    } else {
        InboundKind::Other(raw.t.clone().unwrap_or(alt))
    }
}

/// Signaling handler
///
/// Wraps a [`SignalingChannel`] with bounded warm-up and best-effort sends.
#[derive(Clone)]
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    /// Make sure the channel is connected, waiting at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::WarmupTimeout`] when the bound elapses, or
    /// the channel's own error if login fails outright
    #[tracing::instrument(skip(self), fields(timeout_ms = timeout.as_millis()))]
    pub async fn ensure_ready(&self, timeout: Duration) -> Result<(), SignalingError> {
        if self.channel.status() == ChannelStatus::Connected {
            tracing::trace!("Signaling channel already connected");
            return Ok(());
        }

        tracing::debug!("Warming signaling channel");
        match tokio::time::timeout(timeout, self.channel.connect()).await {
            Ok(Ok(())) => {
                tracing::debug!("Signaling channel connected");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Signaling channel failed to connect");
                Err(e)
            }
            Err(_) => {
                tracing::warn!("Signaling warm-up timed out");
                Err(SignalingError::WarmupTimeout(timeout))
            }
        }
    }

    /// Send `message` to every non-empty id in `targets`
    #[tracing::instrument(skip(self, targets, message), fields(call_id = %message.call_id, t = %message.t))]
    pub async fn broadcast(&self, targets: &[String], message: &SignalMessage) -> BestEffort {
        let peers: Vec<String> = targets.iter().filter(|id| !id.is_empty()).cloned().collect();
        if peers.is_empty() {
            return BestEffort::failed("signal_broadcast", "no valid participant ids");
        }

        let result = self.channel.send_peer_message(&peers, message).await;
        if result.is_ok() {
            tracing::debug!(peers = peers.len(), "Signal sent");
        }
        BestEffort::from_result("signal_broadcast", result)
    }

    /// Send `message` to a single peer
    pub async fn send_to(&self, peer: &str, message: &SignalMessage) -> BestEffort {
        self.broadcast(&[peer.to_string()], message).await
    }

    /// User the channel is logged in as
    #[must_use]
    pub fn current_user(&self) -> Option<CurrentUser> {
        self.channel.current_user()
    }

    /// Id of the logged-in user, empty when unknown
    #[must_use]
    pub fn current_user_id(&self) -> String {
        self.channel
            .current_user()
            .map(|u| u.id)
            .unwrap_or_default()
    }

    /// Set the user context for warm-up
    pub fn set_current_user(&self, user: CurrentUser) {
        self.channel.set_current_user(user);
    }

    /// Subscribe to inbound messages
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.channel.subscribe_messages()
    }

    /// Current connection status
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }
}
