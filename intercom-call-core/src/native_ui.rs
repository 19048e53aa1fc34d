//! Native call UI bridge
//!
//! Adapter over the OS telephony UI (CallKit / ConnectionService). Raw
//! platform events are normalised into [`NativeCallEvent`]s, and answer/end
//! actions that arrive before a matching session exists are persisted as
//! pending markers so they survive a cold start.
//!
//! When the platform has no native UI, or registration failed, every
//! operation is a logged no-op.

use crate::outcome::BestEffort;
use crate::types::CallId;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Native UI errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeUiError {
    /// Registration with the OS failed
    #[error("Native call UI registration failed: {0}")]
    Registration(String),

    /// A platform operation failed
    #[error("Native call UI operation failed: {0}")]
    Platform(String),

    /// Pending marker could not be read or written
    #[error("Pending action store error: {0}")]
    Store(String),
}

/// Reason reported to the OS when a call ends without local action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeEndReason {
    /// Call failed
    Failed,
    /// Remote side hung up
    RemoteEnded,
    /// Nobody answered
    Unanswered,
    /// Answered on another device
    AnsweredElsewhere,
    /// Declined on another device
    DeclinedElsewhere,
    /// Missed
    Missed,
}

impl NativeEndReason {
    /// Numeric code the OS bridge expects
    pub fn code(self) -> u8 {
        match self {
            NativeEndReason::Failed => 1,
            NativeEndReason::RemoteEnded => 2,
            NativeEndReason::Unanswered => 3,
            NativeEndReason::AnsweredElsewhere => 4,
            NativeEndReason::DeclinedElsewhere => 5,
            NativeEndReason::Missed => 6,
        }
    }
}

/// Event as delivered by the platform bridge
#[derive(Debug, Clone, PartialEq)]
pub struct RawNativeEvent {
    /// Event name, e.g. `answerCall`
    pub name: String,
    /// Event payload
    pub payload: serde_json::Value,
}

impl RawNativeEvent {
    /// Build a raw event
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Action replayed from before the event listeners were attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeAction {
    /// User tapped answer
    Answer(CallId),
    /// User tapped end
    End(CallId),
}

/// Normalised native UI event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCallEvent {
    /// User answered from the native UI
    AnswerCall {
        /// Call
        call_id: CallId,
    },
    /// User ended or declined from the native UI
    EndCall {
        /// Call
        call_id: CallId,
    },
    /// Actions queued before the listeners were attached
    DidLoadWithEvents(Vec<NativeAction>),
    /// OS activated the audio session
    DidActivateAudioSession,
    /// OS could not create the incoming connection
    IncomingConnectionFailed {
        /// Call
        call_id: CallId,
    },
    /// Another native call (e.g. cellular) became active
    HasActiveNativeCall,
}

const EARLY_ANSWER: &str = "RNCallKeepPerformAnswerCallAction";
const EARLY_END: &str = "RNCallKeepPerformEndCallAction";

/// Call id from `callUUID | callId | uuid | id`
pub fn normalize_call_id(payload: &serde_json::Value) -> Option<CallId> {
    ["callUUID", "callId", "uuid", "id"]
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .map(CallId::new)
}

impl NativeCallEvent {
    /// Normalise a raw platform event; unknown or id-less events yield `None`
    pub fn from_raw(raw: &RawNativeEvent) -> Option<Self> {
        match raw.name.as_str() {
            "answerCall" => normalize_call_id(&raw.payload).map(|call_id| Self::AnswerCall { call_id }),
            "endCall" => normalize_call_id(&raw.payload).map(|call_id| Self::EndCall { call_id }),
            "didLoadWithEvents" => {
                let actions = raw
                    .payload
                    .as_array()
                    .map(|events| events.iter().filter_map(early_action).collect())
                    .unwrap_or_default();
                Some(Self::DidLoadWithEvents(actions))
            }
            "didActivateAudioSession" => Some(Self::DidActivateAudioSession),
            "createIncomingConnectionFailed" => normalize_call_id(&raw.payload)
                .map(|call_id| Self::IncomingConnectionFailed { call_id }),
            "onHasActiveCall" => Some(Self::HasActiveNativeCall),
            other => {
                tracing::trace!(event = other, "Ignoring native UI event");
                None
            }
        }
    }
}

fn early_action(event: &serde_json::Value) -> Option<NativeAction> {
    let name = event.get("name")?.as_str()?;
    let call_id = normalize_call_id(event.get("data")?)?;
    match name {
        EARLY_ANSWER => Some(NativeAction::Answer(call_id)),
        EARLY_END => Some(NativeAction::End(call_id)),
        _ => None,
    }
}

/// OS telephony UI bridge trait
#[async_trait]
pub trait NativeCallPlatform: Send + Sync {
    /// Register with the OS
    async fn register(&self) -> Result<(), NativeUiError>;

    /// Show the incoming-call screen
    async fn display_incoming_call(
        &self,
        call_id: &CallId,
        handle: &str,
        caller_name: &str,
        has_video: bool,
    ) -> Result<(), NativeUiError>;

    /// Dismiss the call UI
    async fn end_call(&self, call_id: &CallId) -> Result<(), NativeUiError>;

    /// Report an end that was not initiated from the native UI
    async fn report_end_call(
        &self,
        call_id: &CallId,
        reason: NativeEndReason,
    ) -> Result<(), NativeUiError>;

    /// Mark the call as active (audio flowing)
    async fn set_current_call_active(&self, call_id: &CallId) -> Result<(), NativeUiError>;

    /// Bring the app to the foreground
    async fn bring_to_foreground(&self) -> Result<(), NativeUiError>;

    /// Subscribe to raw platform events
    fn subscribe_raw_events(&self) -> broadcast::Receiver<RawNativeEvent>;
}

/// Kind of pending marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// Native answer not yet applied
    Answer,
    /// Native end not yet applied
    End,
}

impl PendingKind {
    /// Storage key
    pub fn key(self) -> &'static str {
        match self {
            PendingKind::Answer => "@pending_callkeep_answer_call_id",
            PendingKind::End => "@pending_callkeep_end_call_id",
        }
    }
}

/// Durable storage for pending native actions
pub trait PendingActionStore: Send + Sync {
    /// Record a marker, replacing any previous one of the same kind
    fn put(&self, kind: PendingKind, call_id: &CallId) -> Result<(), NativeUiError>;

    /// Read and clear a marker
    fn take(&self, kind: PendingKind) -> Result<Option<CallId>, NativeUiError>;
}

/// In-memory pending store
#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    markers: Mutex<HashMap<PendingKind, CallId>>,
}

impl MemoryPendingStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingActionStore for MemoryPendingStore {
    fn put(&self, kind: PendingKind, call_id: &CallId) -> Result<(), NativeUiError> {
        self.markers.lock().insert(kind, call_id.clone());
        Ok(())
    }

    fn take(&self, kind: PendingKind) -> Result<Option<CallId>, NativeUiError> {
        Ok(self.markers.lock().remove(&kind))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMarker {
    call_id: CallId,
    recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Pending store backed by one JSON file per marker kind
#[derive(Debug, Clone)]
pub struct FilePendingStore {
    dir: PathBuf,
}

impl FilePendingStore {
    /// Store markers under `dir`, which must exist
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, kind: PendingKind) -> PathBuf {
        let name = kind.key().trim_start_matches('@');
        self.dir.join(format!("{name}.json"))
    }
}

impl PendingActionStore for FilePendingStore {
    fn put(&self, kind: PendingKind, call_id: &CallId) -> Result<(), NativeUiError> {
        let marker = StoredMarker {
            call_id: call_id.clone(),
            recorded_at: chrono::Utc::now(),
        };
        let json =
            serde_json::to_vec(&marker).map_err(|e| NativeUiError::Store(e.to_string()))?;
        std::fs::write(self.path(kind), json).map_err(|e| NativeUiError::Store(e.to_string()))
    }

    fn take(&self, kind: PendingKind) -> Result<Option<CallId>, NativeUiError> {
        let path = self.path(kind);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NativeUiError::Store(e.to_string())),
        };
        std::fs::remove_file(&path).map_err(|e| NativeUiError::Store(e.to_string()))?;

        match serde_json::from_slice::<StoredMarker>(&raw) {
            Ok(marker) => Ok(Some(marker.call_id)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt pending marker");
                Ok(None)
            }
        }
    }
}

/// Answers whether a call id belongs to the active session
pub type ActiveCallProbe = Arc<dyn Fn(&CallId) -> bool + Send + Sync>;

struct PumpShared {
    store: Arc<dyn PendingActionStore>,
    probe: RwLock<Option<ActiveCallProbe>>,
    events: broadcast::Sender<NativeCallEvent>,
}

impl PumpShared {
    fn dispatch(&self, raw: &RawNativeEvent) {
        let Some(event) = NativeCallEvent::from_raw(raw) else {
            if raw.name == "answerCall" || raw.name == "endCall" {
                tracing::warn!(event = %raw.name, "Native event without call id");
            }
            return;
        };

        let marker = match &event {
            NativeCallEvent::AnswerCall { call_id } => Some((PendingKind::Answer, call_id)),
            NativeCallEvent::EndCall { call_id } => Some((PendingKind::End, call_id)),
            _ => None,
        };
        if let Some((kind, call_id)) = marker {
            let resolved = self
                .probe
                .read()
                .as_ref()
                .map(|probe| probe(call_id))
                .unwrap_or(false);
            if !resolved {
                tracing::info!(call_id = %call_id, kind = ?kind, "Persisting pending native action");
                BestEffort::from_result("pending_marker_put", self.store.put(kind, call_id)).log();
            }
        }

        tracing::debug!(event = ?event, "Native UI event");
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct BridgeState {
    available: bool,
    pump: Option<JoinHandle<()>>,
}

/// Native call UI bridge
pub struct NativeCallBridge {
    platform: Option<Arc<dyn NativeCallPlatform>>,
    shared: Arc<PumpShared>,
    state: Mutex<BridgeState>,
    setup_lock: tokio::sync::Mutex<()>,
}

impl NativeCallBridge {
    /// Bridge over `platform`; `None` when the device has no native call UI
    pub fn new(
        platform: Option<Arc<dyn NativeCallPlatform>>,
        store: Arc<dyn PendingActionStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            platform,
            shared: Arc::new(PumpShared {
                store,
                probe: RwLock::new(None),
                events,
            }),
            state: Mutex::new(BridgeState::default()),
            setup_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register with the OS once; returns availability
    ///
    /// A failed attempt is not remembered, so a later call tries again.
    pub async fn setup(&self) -> bool {
        let _guard = self.setup_lock.lock().await;
        if self.state.lock().available {
            return true;
        }
        let Some(platform) = self.platform.clone() else {
            tracing::debug!("No native call UI on this platform");
            return false;
        };

        match platform.register().await {
            Ok(()) => {
                let mut raw = platform.subscribe_raw_events();
                let shared = Arc::clone(&self.shared);
                let pump = tokio::spawn(async move {
                    loop {
                        match raw.recv().await {
                            Ok(event) => shared.dispatch(&event),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "Native event pump lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });

                let mut state = self.state.lock();
                if let Some(old) = state.pump.replace(pump) {
                    old.abort();
                }
                state.available = true;
                tracing::info!("Native call UI registered");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Native call UI setup failed");
                false
            }
        }
    }

    /// Drop any previous registration and try again
    pub async fn retry_setup(&self) -> bool {
        {
            let mut state = self.state.lock();
            state.available = false;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
        }
        self.setup().await
    }

    /// Registered and usable
    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    fn platform(&self, operation: &'static str) -> Option<&Arc<dyn NativeCallPlatform>> {
        if !self.is_available() {
            tracing::debug!(operation, "Native call UI unavailable, skipping");
            return None;
        }
        self.platform.as_ref()
    }

    /// Show the incoming-call screen
    pub async fn display_incoming_call(
        &self,
        call_id: &CallId,
        handle: &str,
        caller_name: &str,
        has_video: bool,
    ) {
        if let Some(platform) = self.platform("display_incoming_call") {
            tracing::info!(call_id = %call_id, caller_name, "Showing native incoming call");
            BestEffort::from_result(
                "display_incoming_call",
                platform
                    .display_incoming_call(call_id, handle, caller_name, has_video)
                    .await,
            )
            .log();
        }
    }

    /// Dismiss the call UI
    pub async fn end_call(&self, call_id: &CallId) {
        if let Some(platform) = self.platform("end_call") {
            BestEffort::from_result("native_end_call", platform.end_call(call_id).await).log();
        }
    }

    /// Report an end that did not come from the native UI
    pub async fn report_end_call(&self, call_id: &CallId, reason: NativeEndReason) {
        if let Some(platform) = self.platform("report_end_call") {
            BestEffort::from_result(
                "native_report_end_call",
                platform.report_end_call(call_id, reason).await,
            )
            .log();
        }
    }

    /// Mark the call active
    pub async fn set_current_call_active(&self, call_id: &CallId) {
        if let Some(platform) = self.platform("set_current_call_active") {
            BestEffort::from_result(
                "native_set_active",
                platform.set_current_call_active(call_id).await,
            )
            .log();
        }
    }

    /// Bring the app to the foreground
    pub async fn bring_to_foreground(&self) {
        if let Some(platform) = self.platform("bring_to_foreground") {
            BestEffort::from_result("native_foreground", platform.bring_to_foreground().await)
                .log();
        }
    }

    /// Subscribe to normalised events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NativeCallEvent> {
        self.shared.events.subscribe()
    }

    /// Install the active-call probe used to decide whether to persist markers
    pub fn set_active_call_probe(&self, probe: ActiveCallProbe) {
        *self.shared.probe.write() = Some(probe);
    }

    /// Remove the probe
    pub fn clear_active_call_probe(&self) {
        *self.shared.probe.write() = None;
    }

    /// Read and clear a pending marker; store errors are logged and read as empty
    pub fn take_pending(&self, kind: PendingKind) -> Option<CallId> {
        match self.shared.store.take(kind) {
            Ok(marker) => marker,
            Err(e) => {
                tracing::warn!(kind = ?kind, error = %e, "Could not read pending marker");
                None
            }
        }
    }

    /// Clear a marker once its action was applied
    pub fn acknowledge_action(&self, kind: PendingKind, call_id: &CallId) {
        if let Some(stored) = self.take_pending(kind) {
            if &stored != call_id {
                // A different call's marker; keep it
                BestEffort::from_result("pending_marker_put", self.shared.store.put(kind, &stored))
                    .log();
            }
        }
    }
}

impl Drop for NativeCallBridge {
    fn drop(&mut self) {
        if let Some(pump) = self.state.get_mut().pump.take() {
            pump.abort();
        }
    }
}
