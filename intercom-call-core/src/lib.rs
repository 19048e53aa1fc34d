//! Intercom call core - call-session lifecycle for doorman-to-resident calls
//!
//! This library decides when an intercom call session exists and which state
//! it is in, reconciling the two ways a call is announced to a resident's
//! device:
//!
//! - **Push notifications**, possibly delivered while the app is suspended
//! - **In-band invites** on the real-time signaling channel
//!
//! The audio path, the OS call screen and the backend are external services
//! reached through traits ([`RtcTransport`], [`NativeCallPlatform`],
//! [`CallApi`]), so the lifecycle logic runs and is tested without them.
//!
//! # Examples
//!
//! ```rust,no_run
//! use intercom_call_core::prelude::*;
//!
//! # async fn example(deps: CoordinatorDeps, data: VoipPushData) -> anyhow::Result<()> {
//! let config = IntercomConfig::from_env()?;
//! let coordinator = CallCoordinator::new(deps, config.coordinator);
//! coordinator.initialize(false).await;
//!
//! // An announcement for the same call from both channels yields one session
//! coordinator.handle_incoming_push(data).await?;
//! coordinator.answer_active_call().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call lifecycle states and the transition table
pub mod state_machine;

/// Shared call data types
pub mod types;

/// Signed-in user context
pub mod identity;

/// Best-effort operation outcomes
pub mod outcome;

/// Configuration
pub mod config;

/// Signaling protocol and handler
pub mod signaling;

/// RTC transport seam
pub mod transport;

/// Backend call API
pub mod api;

/// Host platform seams
pub mod platform;

/// Single call session
pub mod session;

/// Native call UI bridge
pub mod native_ui;

/// Single-active-call coordinator
pub mod coordinator;

/// Background push delivery
pub mod push;

// Re-export main types at crate root
pub use api::{ApiError, CallApi, CallDetails};
#[cfg(feature = "http-api")]
pub use api::HttpCallApi;
pub use config::{ApiConfig, ConfigError, CoordinatorConfig, IntercomConfig};
pub use coordinator::{CallCoordinator, CoordinatorDeps, CoordinatorError, CoordinatorEvent};
pub use identity::{AuthError, AuthProvider, CurrentUser, UserType};
pub use native_ui::{
    FilePendingStore, MemoryPendingStore, NativeCallBridge, NativeCallEvent, NativeCallPlatform,
    PendingActionStore,
};
pub use outcome::BestEffort;
pub use platform::{AudioPermission, FallbackNotifier, HostUi, PlatformKind, RetryDecision};
pub use push::{parse_push_payload, BackgroundDelivery, DeliveryOutcome};
pub use session::{
    CallSession, FileSessionStore, MemorySessionStore, SessionError, SessionEvent, SessionRecord,
    SessionStore,
};
pub use signaling::{SignalingChannel, SignalingError, SignalingHandler};
pub use state_machine::{next_state, CallLifecycleState, SignalType};
pub use transport::{RtcTransport, TransportError, TransportEvent};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::CallApi;
    pub use crate::config::IntercomConfig;
    pub use crate::coordinator::{CallCoordinator, CoordinatorDeps, CoordinatorEvent};
    pub use crate::identity::{AuthProvider, CurrentUser};
    pub use crate::native_ui::{NativeCallBridge, NativeCallPlatform};
    pub use crate::platform::{AudioPermission, HostUi};
    pub use crate::push::BackgroundDelivery;
    pub use crate::session::CallSession;
    pub use crate::signaling::{SignalingChannel, SignalingHandler};
    pub use crate::state_machine::CallLifecycleState;
    pub use crate::transport::RtcTransport;
    pub use crate::types::{CallId, EndRequest, PushSource, VoipPushData};
}
