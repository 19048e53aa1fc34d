//! Host platform seams
//!
//! Alerts, the warm-up retry dialog, microphone permission and the local
//! notification shown when the native call UI cannot be used.

use crate::types::{CallId, VoipPushData};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Platform call failed
    #[error("Platform call failed: {0}")]
    Failed(String),
}

/// Operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// iOS
    Ios,
    /// Android
    Android,
}

/// User's answer to the warm-up retry dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try warming the signaling channel again
    Retry,
    /// Give up and decline the call
    Cancel,
}

/// Interactive UI of the host app
#[async_trait]
pub trait HostUi: Send + Sync {
    /// Show a blocking alert
    async fn alert(&self, title: &str, message: &str);

    /// Ask whether to retry after a signaling warm-up failure
    async fn prompt_warmup_retry(&self, call_id: &CallId) -> RetryDecision;
}

/// Microphone permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Permission granted
    Granted,
    /// Permission refused
    Denied,
}

/// Audio permission prompt
#[async_trait]
pub trait AudioPermission: Send + Sync {
    /// Request microphone access
    async fn request_microphone(&self) -> Result<PermissionStatus, PlatformError>;
}

/// Local notification used when the native call UI is unavailable
#[async_trait]
pub trait FallbackNotifier: Send + Sync {
    /// Show an incoming-call notification
    async fn show_incoming_call(&self, data: &VoipPushData) -> Result<(), PlatformError>;
}

/// [`HostUi`] for contexts with no screen; alerts are logged and retry
/// prompts always cancel
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessUi;

#[async_trait]
impl HostUi for HeadlessUi {
    async fn alert(&self, title: &str, message: &str) {
        tracing::warn!(title, message, "Alert suppressed (headless)");
    }

    async fn prompt_warmup_retry(&self, call_id: &CallId) -> RetryDecision {
        tracing::info!(call_id = %call_id, "No UI for retry prompt, cancelling");
        RetryDecision::Cancel
    }
}

/// [`AudioPermission`] that is always granted
#[derive(Debug, Default, Clone, Copy)]
pub struct PreGrantedPermission;

#[async_trait]
impl AudioPermission for PreGrantedPermission {
    async fn request_microphone(&self) -> Result<PermissionStatus, PlatformError> {
        Ok(PermissionStatus::Granted)
    }
}
