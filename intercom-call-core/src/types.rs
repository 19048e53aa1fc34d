//! Intercom call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-assigned identifier for a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Wrap a backend call id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel name used when neither the signal nor the backend provide one
    pub fn default_channel_name(&self) -> String {
        format!("call-{}", self.0)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Placed by this device
    Outgoing,
    /// Received by this device
    Incoming,
}

/// One participant of a call, as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Participant user id (signaling peer id)
    #[serde(alias = "user_id")]
    pub user_id: String,
    /// Backend participant status (e.g. `invited`, `joined`)
    #[serde(default)]
    pub status: Option<String>,
    /// When the participant joined
    #[serde(default, alias = "joined_at")]
    pub joined_at: Option<DateTime<Utc>>,
    /// When the participant left
    #[serde(default, alias = "left_at")]
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Participant with only an id
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: None,
            joined_at: None,
            left_at: None,
        }
    }
}

/// Display metadata shown for a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDisplay {
    /// Name of the caller (doorman)
    pub caller_name: Option<String>,
    /// Apartment the call is addressed to
    pub apartment_number: Option<String>,
    /// Building identifier
    pub building_id: Option<String>,
}

/// Credentials returned by the backend when a call is answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    /// Token for joining the RTC transport
    pub rtc_token: String,
    /// Token for the signaling channel
    #[serde(default)]
    pub rtm_token: Option<String>,
    /// User account to join the transport with
    pub uid: String,
    /// Channel the token is valid for
    pub channel_name: String,
}

/// Where an incoming call announcement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushSource {
    /// OS-delivered push while the app was not in the foreground
    Background,
    /// Push handled by the foreground notification listener
    Foreground,
    /// In-band invite on the signaling channel
    Rtm,
}

impl PushSource {
    /// No interactive dialog can be shown from this source
    pub fn is_headless(self) -> bool {
        matches!(self, PushSource::Background)
    }
}

/// Normalized incoming call announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipPushData {
    /// Call identifier
    pub call_id: CallId,
    /// Peer id of the caller
    pub from: String,
    /// Caller name carried by the payload (best-effort)
    pub caller_name: Option<String>,
    /// Apartment carried by the payload
    pub apartment_number: Option<String>,
    /// Building carried by the payload
    pub building_name: Option<String>,
    /// Transport channel name; may be empty
    pub channel_name: String,
    /// Delivery source
    pub source: PushSource,
    /// Whether the native incoming-call UI should be shown
    #[serde(rename = "shouldShowNativeUI")]
    pub should_show_native_ui: bool,
}

/// Why an answered call is ending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// Local user hung up
    Hangup,
    /// Remote side went away
    Drop,
    /// Timed out
    Timeout,
}

impl EndReason {
    /// Wire spelling
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Drop => "drop",
            EndReason::Timeout => "timeout",
        }
    }
}

/// Why a call is declined before answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// User refused
    Declined,
    /// Already in another call
    Busy,
    /// Signaling channel could not be reached
    ConnectionFailed,
}

impl DeclineReason {
    /// Wire spelling
    pub fn as_str(self) -> &'static str {
        match self {
            DeclineReason::Declined => "declined",
            DeclineReason::Busy => "busy",
            DeclineReason::ConnectionFailed => "connection_failed",
        }
    }
}

/// User-facing request to stop the active call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndRequest {
    /// Refuse a ringing call
    Decline,
    /// Hang up an answered call
    Hangup,
}
