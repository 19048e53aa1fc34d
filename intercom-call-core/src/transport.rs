//! RTC transport seam
//!
//! The audio path itself lives in an external real-time communication
//! service. A session only joins, leaves and watches remote presence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Join was rejected or failed
    #[error("Join error: {0}")]
    JoinError(String),

    /// Leave failed
    #[error("Leave error: {0}")]
    LeaveError(String),

    /// Transport engine could not be created
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Error reported by the engine while joined
    #[error("RTC error {code}: {message}")]
    Engine {
        /// Platform error code
        code: i32,
        /// Description
        message: String,
    },
}

/// Parameters for joining a call channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinParams {
    /// Token from the answer bundle
    pub token: String,
    /// Channel to join
    pub channel_name: String,
    /// User account from the answer bundle
    pub user_account: String,
}

/// Events raised by the transport while joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote participant joined
    RemoteJoined {
        /// Remote uid
        uid: String,
    },
    /// A remote participant left
    RemoteLeft {
        /// Remote uid
        uid: String,
        /// Platform reason code
        reason: Option<String>,
    },
    /// Transport-level error
    Error {
        /// Platform error code
        code: i32,
        /// Description
        message: String,
    },
}

/// RTC transport trait
///
/// Implement this for the audio service SDK in use. One session owns the
/// transport at a time.
#[async_trait]
pub trait RtcTransport: Send + Sync {
    /// Join a channel
    async fn join(&self, params: &JoinParams) -> Result<(), TransportError>;

    /// Leave the current channel
    async fn leave(&self) -> Result<(), TransportError>;

    /// Subscribe to transport events
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}
