//! Call session
//!
//! One [`CallSession`] owns the state, readiness flags, token bundle and RTC
//! transport of a single call. Every state change goes through the
//! transition table; illegal requests are logged and dropped.
//!
//! `answer`, `end` and `decline` are idempotent. Each claims its first
//! transition atomically under the session lock, so a second caller sees the
//! claimed state and returns without repeating side effects.

use crate::api::{ApiError, CallApi, CallDetails};
use crate::outcome::BestEffort;
use crate::platform::{AudioPermission, PermissionStatus, PlatformError};
use crate::signaling::{SignalMessage, SignalingError, SignalingHandler};
use crate::state_machine::{CallLifecycleState, SignalType};
use crate::transport::{JoinParams, RtcTransport, TransportError, TransportEvent};
use crate::types::{
    CallDirection, CallDisplay, CallId, DeclineReason, EndReason, Participant, TokenBundle,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use CallLifecycleState::*;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not allowed in the current state
    #[error("Operation not allowed in state {0}")]
    InvalidState(CallLifecycleState),

    /// Another operation moved the session while this one was running
    #[error("Interrupted: session moved to {0}")]
    Interrupted(CallLifecycleState),

    /// Signaling failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Backend failure
    #[error(transparent)]
    Api(#[from] ApiError),

    /// RTC transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Platform failure (permission prompt)
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        /// Call
        call_id: CallId,
        /// Previous state
        old: CallLifecycleState,
        /// New state
        new: CallLifecycleState,
    },
    /// An operation failed
    Error {
        /// Call
        call_id: CallId,
        /// Failed operation
        operation: &'static str,
        /// Error description
        error: String,
    },
}

/// Collaborators a session talks to
#[derive(Clone)]
pub struct SessionDeps {
    /// Signaling channel
    pub signaling: SignalingHandler,
    /// RTC transport
    pub transport: Arc<dyn RtcTransport>,
    /// Backend call API
    pub api: Arc<dyn CallApi>,
    /// Microphone permission prompt
    pub permission: Arc<dyn AudioPermission>,
    /// Bound on signaling warm-up during initialize and answer
    pub warmup_timeout: Duration,
}

/// Identity and initial data of a new session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    /// Call id
    pub call_id: CallId,
    /// Transport channel
    pub channel_name: String,
    /// Direction
    pub direction: CallDirection,
    /// Participants known at creation
    pub participants: Vec<Participant>,
    /// Display metadata
    pub display: CallDisplay,
}

/// Point-in-time view of a session, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Call id
    pub call_id: CallId,
    /// Transport channel
    pub channel_name: String,
    /// Direction
    pub direction: CallDirection,
    /// Current state
    pub state: CallLifecycleState,
    /// Signaling confirmed ready
    pub signaling_ready: bool,
    /// Joined to the RTC transport
    pub transport_joined: bool,
    /// Token bundle received
    pub has_tokens: bool,
    /// Participants
    pub participants: Vec<Participant>,
    /// Display metadata
    pub display: CallDisplay,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Persisted form of the active session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Identity and display data
    #[serde(flatten)]
    pub params: SessionParams,
    /// When the session was created
    pub initiated_at: DateTime<Utc>,
}

/// Session store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    /// Record could not be read or written
    #[error("Session store I/O failed: {0}")]
    Io(String),

    /// Record could not be encoded
    #[error("Session record encoding failed: {0}")]
    Encoding(String),
}

/// Durable slot for the active session, read back on the next start
pub trait SessionStore: Send + Sync {
    /// Replace the stored record
    fn save(&self, record: &SessionRecord) -> Result<(), SessionStoreError>;

    /// Stored record, if any
    fn load(&self) -> Result<Option<SessionRecord>, SessionStoreError>;

    /// Remove the stored record
    fn clear(&self) -> Result<(), SessionStoreError>;
}

/// In-memory session store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemorySessionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        *self.record.lock() = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionRecord>, SessionStoreError> {
        Ok(self.record.lock().clone())
    }

    fn clear(&self) -> Result<(), SessionStoreError> {
        self.record.lock().take();
        Ok(())
    }
}

/// Session store backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store the record in `dir`, which must exist
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("active_call_session.json"),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let json = serde_json::to_vec(record).map_err(|e| SessionStoreError::Encoding(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| SessionStoreError::Io(e.to_string()))
    }

    fn load(&self) -> Result<Option<SessionRecord>, SessionStoreError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionStoreError::Io(e.to_string())),
        };
        match serde_json::from_slice(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Discarding corrupt session record");
                Ok(None)
            }
        }
    }

    fn clear(&self) -> Result<(), SessionStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionStoreError::Io(e.to_string())),
        }
    }
}

struct SessionInner {
    state: CallLifecycleState,
    channel_name: String,
    signaling_ready: bool,
    transport_joined: bool,
    remote_present: bool,
    tokens: Option<TokenBundle>,
    participants: Vec<Participant>,
    display: CallDisplay,
}

impl SessionInner {
    fn transition(&mut self, new: CallLifecycleState) -> Option<(CallLifecycleState, CallLifecycleState)> {
        let old = self.state;
        if old == new {
            return None;
        }
        if !old.can_transition_to(new) {
            tracing::warn!(from = %old, to = %new, "Illegal state transition ignored");
            return None;
        }
        self.state = new;
        Some((old, new))
    }
}

/// A single intercom call
pub struct CallSession {
    id: CallId,
    direction: CallDirection,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    deps: SessionDeps,
}

impl CallSession {
    /// Create a session in `idle`
    #[must_use]
    pub fn new(params: SessionParams, deps: SessionDeps) -> Arc<Self> {
        Self::with_created_at(params, Utc::now(), deps)
    }

    /// Rebuild a session from a persisted record, in `idle`
    #[must_use]
    pub fn restore(record: SessionRecord, deps: SessionDeps) -> Arc<Self> {
        Self::with_created_at(record.params, record.initiated_at, deps)
    }

    fn with_created_at(params: SessionParams, created_at: DateTime<Utc>, deps: SessionDeps) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id: params.call_id,
            direction: params.direction,
            created_at,
            inner: Mutex::new(SessionInner {
                state: Idle,
                channel_name: params.channel_name,
                signaling_ready: false,
                transport_joined: false,
                remote_present: false,
                tokens: None,
                participants: params.participants,
                display: params.display,
            }),
            events,
            watcher: Mutex::new(None),
            deps,
        })
    }

    /// Call id
    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// Direction
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Current state
    pub fn state(&self) -> CallLifecycleState {
        self.inner.lock().state
    }

    /// Transport channel
    pub fn channel_name(&self) -> String {
        self.inner.lock().channel_name.clone()
    }

    /// Signaling was confirmed ready
    pub fn signaling_ready(&self) -> bool {
        self.inner.lock().signaling_ready
    }

    /// Joined to the RTC transport
    pub fn transport_joined(&self) -> bool {
        self.inner.lock().transport_joined
    }

    /// Token bundle, once answered
    pub fn token_bundle(&self) -> Option<TokenBundle> {
        self.inner.lock().tokens.clone()
    }

    /// Participants
    pub fn participants(&self) -> Vec<Participant> {
        self.inner.lock().participants.clone()
    }

    /// Display metadata
    pub fn display(&self) -> CallDisplay {
        self.inner.lock().display.clone()
    }

    /// Record to persist for recovery after a restart
    pub fn record(&self) -> SessionRecord {
        let inner = self.inner.lock();
        SessionRecord {
            params: SessionParams {
                call_id: self.id.clone(),
                channel_name: inner.channel_name.clone(),
                direction: self.direction,
                participants: inner.participants.clone(),
                display: inner.display.clone(),
            },
            initiated_at: self.created_at,
        }
    }

    /// Subscribe to session events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            call_id: self.id.clone(),
            channel_name: inner.channel_name.clone(),
            direction: self.direction,
            state: inner.state,
            signaling_ready: inner.signaling_ready,
            transport_joined: inner.transport_joined,
            has_tokens: inner.tokens.is_some(),
            participants: inner.participants.clone(),
            display: inner.display.clone(),
            created_at: self.created_at,
        }
    }

    /// Request a state change; illegal requests are logged and ignored
    ///
    /// Returns whether the state changed.
    pub fn set_state(&self, new: CallLifecycleState) -> bool {
        let change = self.inner.lock().transition(new);
        match change {
            Some((old, new)) => {
                self.emit_change(old, new);
                true
            }
            None => false,
        }
    }

    fn emit_change(&self, old: CallLifecycleState, new: CallLifecycleState) {
        tracing::info!(call_id = %self.id, from = %old, to = %new, "Call state changed");
        let _ = self.events.send(SessionEvent::StateChanged {
            call_id: self.id.clone(),
            old,
            new,
        });
    }

    fn emit_error(&self, operation: &'static str, error: &SessionError) {
        let _ = self.events.send(SessionEvent::Error {
            call_id: self.id.clone(),
            operation,
            error: error.to_string(),
        });
    }

    /// Move from `from` to `to`, or report what moved the session
    fn advance(&self, from: CallLifecycleState, to: CallLifecycleState) -> Result<(), SessionError> {
        let change = {
            let mut inner = self.inner.lock();
            if inner.state != from {
                return Err(SessionError::Interrupted(inner.state));
            }
            inner.transition(to)
        };
        if let Some((old, new)) = change {
            self.emit_change(old, new);
        }
        Ok(())
    }

    /// Fold backend details into the session
    ///
    /// Backend participants replace the local list when present and the
    /// backend's doorman name wins over whatever the announcement carried.
    pub fn apply_details(&self, details: &CallDetails) {
        let mut inner = self.inner.lock();
        if !details.participants.is_empty() {
            inner.participants = details.participants.clone();
        }
        if inner.channel_name.is_empty() && !details.channel_name.is_empty() {
            inner.channel_name = details.channel_name.clone();
        }
        if let Some(name) = &details.doorman_name {
            inner.display.caller_name = Some(name.clone());
        }
        if details.apartment_number.is_some() {
            inner.display.apartment_number = details.apartment_number.clone();
        }
        if details.building_id.is_some() {
            inner.display.building_id = details.building_id.clone();
        }
    }

    /// Warm signaling, then ring
    ///
    /// # Errors
    ///
    /// Returns error if the session is not idle or warm-up fails; the
    /// session is then `failed`
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SessionError> {
        self.advance(Idle, RtmWarming)?;

        if let Err(e) = self.deps.signaling.ensure_ready(self.deps.warmup_timeout).await {
            return Err(self.fail("initialize", e.into()).await);
        }
        self.inner.lock().signaling_ready = true;

        self.advance(RtmWarming, Ringing)?;
        self.start_watcher();
        Ok(())
    }

    /// Ring without confirming signaling; warm-up is deferred to answer
    ///
    /// # Errors
    ///
    /// Returns error if the session is not idle
    pub fn initialize_lightweight(self: &Arc<Self>) -> Result<(), SessionError> {
        self.advance(Idle, Ringing)?;
        self.start_watcher();
        Ok(())
    }

    /// Answer the call
    ///
    /// Returns at once when an answer is already in progress or the call is
    /// past answering.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not ringing, or any answer step
    /// fails; the session is then `failed`
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn answer(self: &Arc<Self>) -> Result<(), SessionError> {
        let change = {
            let mut inner = self.inner.lock();
            if inner.state.is_answering_or_past() {
                tracing::debug!(state = %inner.state, "Answer already handled");
                return Ok(());
            }
            if inner.state != Ringing {
                return Err(SessionError::InvalidState(inner.state));
            }
            inner.transition(NativeAnswered)
        };
        if let Some((old, new)) = change {
            self.emit_change(old, new);
        }

        match self.run_answer().await {
            Ok(()) => {
                tracing::info!("Call answered");
                Ok(())
            }
            Err(e @ SessionError::Interrupted(_)) => {
                tracing::info!(error = %e, "Answer abandoned");
                Err(e)
            }
            Err(e) => Err(self.fail("answer", e).await),
        }
    }

    async fn run_answer(self: &Arc<Self>) -> Result<(), SessionError> {
        self.deps
            .signaling
            .ensure_ready(self.deps.warmup_timeout)
            .await?;
        self.inner.lock().signaling_ready = true;

        let details = self.deps.api.call_details(&self.id).await?;
        self.apply_details(&details);

        self.advance(NativeAnswered, TokenFetching)?;
        let user_id = self.deps.signaling.current_user_id();
        let tokens = self.deps.api.answer(&self.id, &user_id).await?;
        {
            let mut inner = self.inner.lock();
            if inner.tokens.is_some() {
                tracing::warn!("Token bundle already set, keeping the first");
            } else {
                inner.tokens = Some(tokens.clone());
            }
        }

        match self.deps.permission.request_microphone().await? {
            PermissionStatus::Granted => tracing::debug!("Microphone permission granted"),
            PermissionStatus::Denied => {
                tracing::warn!("Microphone permission denied, joining anyway")
            }
        }

        self.advance(TokenFetching, RtcJoining)?;
        self.start_watcher();

        let channel_name = {
            let inner = self.inner.lock();
            if inner.channel_name.is_empty() {
                tokens.channel_name.clone()
            } else {
                inner.channel_name.clone()
            }
        };
        let params = JoinParams {
            token: tokens.rtc_token.clone(),
            channel_name,
            user_account: tokens.uid.clone(),
        };
        self.deps.transport.join(&params).await?;

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state == RtcJoining {
                inner.transport_joined = true;
                let mut changes = Vec::with_capacity(2);
                changes.extend(inner.transition(Connecting));
                if inner.remote_present {
                    changes.extend(inner.transition(Connected));
                }
                Ok(changes)
            } else {
                Err(inner.state)
            }
        };

        match outcome {
            Ok(changes) => {
                for (old, new) in changes {
                    self.emit_change(old, new);
                }
            }
            Err(state) => {
                // Torn down while joining; nobody else will leave
                BestEffort::from_result("transport_leave", self.deps.transport.leave().await)
                    .log();
                return Err(SessionError::Interrupted(state));
            }
        }

        self.broadcast_signal(SignalType::Answer).await.log();
        Ok(())
    }

    /// End the call
    ///
    /// Every teardown step is attempted; broadcast and backend failures are
    /// logged only.
    #[tracing::instrument(skip(self), fields(call_id = %self.id, reason = reason.as_str()))]
    pub async fn end(&self, reason: EndReason) {
        if !self.claim_teardown() {
            tracing::debug!("Call already ending or ended");
            return;
        }

        self.broadcast_signal(SignalType::End).await.log();
        self.release_transport().await;
        self.stop_watcher();

        let user_id = self.deps.signaling.current_user_id();
        BestEffort::from_result(
            "backend_end",
            self.deps.api.end(&self.id, &user_id, reason).await,
        )
        .log();

        self.set_state(Ended);
    }

    /// Decline before answering; behaves as `end(hangup)` once answered
    #[tracing::instrument(skip(self), fields(call_id = %self.id, reason = reason.as_str()))]
    pub async fn decline(&self, reason: DeclineReason) {
        if self.state().is_answered() {
            tracing::debug!("Decline after answer, hanging up instead");
            self.end(EndReason::Hangup).await;
            return;
        }
        if !self.claim_teardown() {
            tracing::debug!("Call already ending or ended");
            return;
        }

        self.broadcast_signal(SignalType::Decline).await.log();
        let user_id = self.deps.signaling.current_user_id();
        BestEffort::from_result(
            "backend_decline",
            self.deps.api.decline(&self.id, &user_id, reason).await,
        )
        .log();

        self.release_transport().await;
        self.stop_watcher();
        self.set_state(Declined);
    }

    /// Enter `ending` (or `ended` where `ending` is not reachable)
    fn claim_teardown(&self) -> bool {
        let change = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            if state.is_terminal() || state == Ending {
                return false;
            }
            let target = if state.can_transition_to(Ending) {
                Ending
            } else {
                Ended
            };
            inner.transition(target)
        };
        match change {
            Some((old, new)) => {
                self.emit_change(old, new);
                true
            }
            None => false,
        }
    }

    async fn fail(&self, operation: &'static str, error: SessionError) -> SessionError {
        tracing::error!(call_id = %self.id, operation, error = %error, "Call operation failed");
        self.set_state(Failed);
        self.emit_error(operation, &error);
        self.stop_watcher();
        self.release_transport().await;
        error
    }

    /// Clear `transport_joined`, then leave if it was set
    async fn release_transport(&self) {
        let was_joined = std::mem::replace(&mut self.inner.lock().transport_joined, false);
        if was_joined {
            BestEffort::from_result("transport_leave", self.deps.transport.leave().await).log();
        }
    }

    async fn broadcast_signal(&self, t: SignalType) -> BestEffort {
        let user_id = self.deps.signaling.current_user_id();
        let (channel, targets) = {
            let inner = self.inner.lock();
            let targets: Vec<String> = inner
                .participants
                .iter()
                .map(|p| p.user_id.clone())
                .filter(|id| *id != user_id)
                .collect();
            (inner.channel_name.clone(), targets)
        };

        let message = SignalMessage::new(t, &self.id, &user_id, &channel);
        self.deps.signaling.broadcast(&targets, &message).await
    }

    fn start_watcher(self: &Arc<Self>) {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return;
        }

        let mut rx = self.deps.transport.subscribe_events();
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Transport event watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if session.on_transport_event(event).await {
                    break;
                }
            }
        }));
    }

    fn stop_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }

    /// Handle one transport event; returns true when watching should stop
    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) -> bool {
        match event {
            TransportEvent::RemoteJoined { uid } => {
                let change = {
                    let mut inner = self.inner.lock();
                    inner.remote_present = true;
                    if inner.state == Connecting {
                        inner.transition(Connected)
                    } else {
                        None
                    }
                };
                tracing::debug!(call_id = %self.id, uid = %uid, "Remote participant joined");
                if let Some((old, new)) = change {
                    self.emit_change(old, new);
                }
                self.state().is_terminal()
            }
            TransportEvent::RemoteLeft { uid, reason } => {
                if self.state() != Connected {
                    tracing::debug!(call_id = %self.id, uid = %uid, "Remote left before connect");
                    return self.state().is_terminal();
                }
                tracing::info!(call_id = %self.id, uid = %uid, reason = ?reason, "Remote participant left, ending call");
                // Detach; end() would otherwise abort this task mid-teardown
                drop(self.watcher.lock().take());
                let session = Arc::clone(self);
                tokio::spawn(async move { session.end(EndReason::Drop).await });
                true
            }
            TransportEvent::Error { code, message } => {
                if self.state().is_terminal() {
                    return true;
                }
                drop(self.watcher.lock().take());
                let error = SessionError::Transport(TransportError::Engine { code, message });
                self.fail("rtc", error).await;
                true
            }
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
