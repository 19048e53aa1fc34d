//! Call coordinator
//!
//! Owns the single active call. Incoming call announcements arrive twice, as
//! a push notification and as an in-band invite on the signaling channel;
//! the coordinator collapses them into one session, refuses a second call
//! while one is active, and watches for remote hangups the signaling channel
//! might have missed.
//!
//! Session creation for a call id runs on its own task behind a shared
//! future. Concurrent announcements for the same id await that future, and a
//! caller that gives up waiting does not cancel the creation.

use crate::api::{ApiError, CallApi};
use crate::config::CoordinatorConfig;
use crate::identity::AuthProvider;
use crate::native_ui::{NativeAction, NativeCallBridge, NativeCallEvent, NativeEndReason, PendingKind};
use crate::outcome::BestEffort;
use crate::platform::{AudioPermission, HostUi, RetryDecision};
use crate::session::{
    CallSession, SessionDeps, SessionError, SessionEvent, SessionParams, SessionSnapshot,
    SessionStore,
};
use crate::signaling::{InboundMessage, InboundSignal, SignalMessage, SignalingHandler};
use crate::state_machine::{CallLifecycleState, SignalType};
use crate::transport::RtcTransport;
use crate::types::{
    CallDirection, CallDisplay, CallId, DeclineReason, EndReason, EndRequest, Participant,
    PushSource, VoipPushData,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Signaling channel could not be warmed
    #[error("Signaling unavailable for call {0}")]
    SignalingUnavailable(CallId),

    /// User cancelled after a warm-up failure
    #[error("Call {0} cancelled after connection failure")]
    Cancelled(CallId),

    /// Call details could not be fetched
    #[error("Call details unavailable for {call_id}: {error}")]
    DetailsUnavailable {
        /// Call
        call_id: CallId,
        /// Backend error
        error: ApiError,
    },

    /// Session operation failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No active call to act on
    #[error("No active call")]
    NoActiveCall,

    /// Creation task stopped, or was overtaken by `cleanup`
    #[error("Session creation for call {0} was aborted")]
    CreationAborted(CallId),
}

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A session became active
    SessionCreated {
        /// Call
        call_id: CallId,
    },
    /// The active session was released
    SessionEnded {
        /// Call
        call_id: CallId,
        /// State the session finished in
        final_state: CallLifecycleState,
    },
    /// Something failed
    Error {
        /// Call, when known
        call_id: Option<CallId>,
        /// Failed operation
        operation: &'static str,
        /// Error description
        error: String,
    },
}

/// Collaborators of the coordinator
#[derive(Clone)]
pub struct CoordinatorDeps {
    /// Signaling channel
    pub signaling: SignalingHandler,
    /// RTC transport
    pub transport: Arc<dyn RtcTransport>,
    /// Backend call API
    pub api: Arc<dyn CallApi>,
    /// Signed-in user source
    pub auth: Arc<dyn AuthProvider>,
    /// Native call UI
    pub native_ui: Arc<NativeCallBridge>,
    /// Alerts and dialogs
    pub host_ui: Arc<dyn HostUi>,
    /// Microphone permission
    pub permission: Arc<dyn AudioPermission>,
    /// Persisted active session, recovered on the next start
    pub sessions: Arc<dyn SessionStore>,
}

/// Diagnostic view of the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSnapshot {
    /// `initialize` has run
    pub initialized: bool,
    /// Native call UI registered
    pub native_ui_available: bool,
    /// Active session
    pub active: Option<SessionSnapshot>,
    /// Calls with a creation in progress
    pub in_flight: Vec<CallId>,
    /// Remote-hangup poll running
    pub polling: bool,
}

type CreationFuture = Shared<BoxFuture<'static, Result<(), CoordinatorError>>>;

#[derive(Default)]
struct CoordinatorState {
    initialized: bool,
    native_ui_available: bool,
    active: Option<Arc<CallSession>>,
    in_flight: HashMap<CallId, (u64, CreationFuture)>,
    next_generation: u64,
    epoch: u64,
    poll: Option<JoinHandle<()>>,
    session_watcher: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    remote_end_in_progress: bool,
}

struct CoordinatorInner {
    deps: CoordinatorDeps,
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<CoordinatorEvent>,
}

/// Call coordinator
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<CoordinatorInner>,
}

enum Route {
    Duplicate,
    Join(CreationFuture),
    Busy,
    Create(CreationFuture),
}

impl CallCoordinator {
    /// Create a coordinator
    ///
    /// Zero timeouts or intervals in `config` fall back to their defaults.
    #[must_use]
    pub fn new(deps: CoordinatorDeps, config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CoordinatorInner {
                deps,
                config: config.sanitized(),
                state: Mutex::new(CoordinatorState::default()),
                events,
            }),
        }
    }

    fn from_weak(weak: &Weak<CoordinatorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, call_id: Option<&CallId>, operation: &'static str, error: impl ToString) {
        self.emit(CoordinatorEvent::Error {
            call_id: call_id.cloned(),
            operation,
            error: error.to_string(),
        });
    }

    /// Subscribe to coordinator events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// The active, non-terminal session
    pub fn active_session(&self) -> Option<Arc<CallSession>> {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .filter(|s| !s.state().is_terminal())
            .cloned()
    }

    /// A call is in progress
    pub fn has_active_call(&self) -> bool {
        self.active_session().is_some()
    }

    /// Native call UI is registered
    pub fn native_ui_available(&self) -> bool {
        self.inner.state.lock().native_ui_available
    }

    fn session_for(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.active_session().filter(|s| s.id() == call_id)
    }

    fn is_active(&self, session: &Arc<CallSession>) -> bool {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|a| Arc::ptr_eq(a, session))
            .unwrap_or(false)
    }

    fn in_flight(&self, call_id: &CallId) -> Option<CreationFuture> {
        self.inner
            .state
            .lock()
            .in_flight
            .get(call_id)
            .map(|(_, f)| f.clone())
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let st = self.inner.state.lock();
        CoordinatorSnapshot {
            initialized: st.initialized,
            native_ui_available: st.native_ui_available,
            active: st.active.as_ref().map(|s| s.snapshot()),
            in_flight: st.in_flight.keys().cloned().collect(),
            polling: st.poll.as_ref().map(|p| !p.is_finished()).unwrap_or(false),
        }
    }

    /// Start listening to signaling and native UI events
    ///
    /// Pending native actions recorded before a restart are replayed here,
    /// answer first. Calling it again is a no-op until [`cleanup`](Self::cleanup).
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self, skip_native_setup: bool) {
        {
            let mut st = self.inner.state.lock();
            if st.initialized {
                tracing::debug!("Coordinator already initialized");
                return;
            }
            st.initialized = true;
        }

        if skip_native_setup {
            let available = self.inner.deps.native_ui.is_available();
            self.inner.state.lock().native_ui_available = available;
        } else {
            self.setup_native_ui().await;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .deps
            .native_ui
            .set_active_call_probe(Arc::new(move |call_id: &CallId| {
                CallCoordinator::from_weak(&weak)
                    .and_then(|c| c.session_for(call_id))
                    .is_some()
            }));

        let rtm_listener = self.spawn_rtm_listener();
        let native_listener = self.spawn_native_listener();
        self.inner
            .state
            .lock()
            .listeners
            .extend([rtm_listener, native_listener]);

        self.recover_persisted_session().await;

        let bridge = &self.inner.deps.native_ui;
        if let Some(call_id) = bridge.take_pending(PendingKind::Answer) {
            tracing::info!(call_id = %call_id, "Replaying pending native answer");
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.handle_native_answer(call_id).await });
        } else if let Some(call_id) = bridge.take_pending(PendingKind::End) {
            tracing::info!(call_id = %call_id, "Replaying pending native end");
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.handle_native_end(call_id).await });
        }

        tracing::info!("Call coordinator initialized");
    }

    /// Restore the session saved before a restart if the backend still has
    /// the call open; otherwise drop the record
    async fn recover_persisted_session(&self) {
        let deps = &self.inner.deps;
        let record = match deps.sessions.load() {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read persisted session");
                return;
            }
        };
        let call_id = record.params.call_id.clone();
        tracing::info!(call_id = %call_id, "Found persisted session");

        let open = match deps.api.call_details(&call_id).await {
            Ok(details) if !details.is_remotely_closed() => Some(details),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(call_id = %call_id, error = %e, "Persisted call not confirmed by backend");
                None
            }
        };
        let Some(details) = open else {
            tracing::info!(call_id = %call_id, "Persisted call is no longer active, clearing");
            BestEffort::from_result("session_clear", deps.sessions.clear()).log();
            return;
        };

        if self.has_active_call() || !self.inner.state.lock().in_flight.is_empty() {
            tracing::debug!(call_id = %call_id, "A call is already in progress, not restoring");
            return;
        }
        self.resolve_current_user().await;
        let session = CallSession::restore(record, self.session_deps());
        session.apply_details(&details);
        if let Err(e) = session.initialize_lightweight() {
            tracing::warn!(call_id = %call_id, error = %e, "Persisted session could not be restored");
            BestEffort::from_result("session_clear", deps.sessions.clear()).log();
            return;
        }

        {
            let mut st = self.inner.state.lock();
            let occupied = st.active.as_ref().is_some_and(|s| !s.state().is_terminal())
                || !st.in_flight.is_empty();
            if occupied {
                tracing::debug!(call_id = %call_id, "Call started while restoring, dropping restored session");
                return;
            }
            st.active = Some(Arc::clone(&session));
        }
        self.watch_session(&session);
        tracing::info!(call_id = %call_id, "Session recovered");
        self.emit(CoordinatorEvent::SessionCreated { call_id });
        self.start_hangup_poll(&session);
    }

    /// Register the native call UI (e.g. after login); returns availability
    pub async fn setup_native_ui(&self) -> bool {
        let available = self.inner.deps.native_ui.setup().await;
        self.inner.state.lock().native_ui_available = available;
        available
    }

    fn spawn_rtm_listener(&self) -> JoinHandle<()> {
        let mut messages = self.inner.deps.signaling.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let message = match messages.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Signaling listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(coordinator) = CallCoordinator::from_weak(&weak) else {
                    break;
                };
                tokio::spawn(async move { coordinator.handle_rtm_message(message).await });
            }
        })
    }

    fn spawn_native_listener(&self) -> JoinHandle<()> {
        let mut events = self.inner.deps.native_ui.subscribe_events();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Native UI listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(coordinator) = CallCoordinator::from_weak(&weak) else {
                    break;
                };
                tokio::spawn(async move { coordinator.handle_native_event(event).await });
            }
        })
    }

    /// Handle an incoming call announcement
    ///
    /// A duplicate of the active call is ignored, a creation already running
    /// for the id is awaited, and any other call while one is active is
    /// declined as busy.
    ///
    /// # Errors
    ///
    /// Returns the creation error when the session could not be created
    #[tracing::instrument(skip(self, data), fields(call_id = %data.call_id, source = ?data.source))]
    pub async fn handle_incoming_push(&self, data: VoipPushData) -> Result<(), CoordinatorError> {
        let route = self.route(&data);
        match route {
            Route::Duplicate => {
                tracing::debug!("Call already active, ignoring duplicate announcement");
                Ok(())
            }
            Route::Join(creation) => {
                tracing::debug!("Session creation in progress, waiting for it");
                creation.await
            }
            Route::Busy => {
                self.decline_busy(&data).await;
                Ok(())
            }
            Route::Create(creation) => creation.await,
        }
    }

    fn route(&self, data: &VoipPushData) -> Route {
        let mut st = self.inner.state.lock();

        if let Some(active) = st.active.as_ref().filter(|s| !s.state().is_terminal()) {
            return if active.id() == &data.call_id {
                Route::Duplicate
            } else {
                Route::Busy
            };
        }
        if let Some((_, creation)) = st.in_flight.get(&data.call_id) {
            return Route::Join(creation.clone());
        }
        if !st.in_flight.is_empty() {
            return Route::Busy;
        }

        let generation = st.next_generation;
        st.next_generation += 1;
        let epoch = st.epoch;

        let coordinator = self.clone();
        let call_id = data.call_id.clone();
        let task_data = data.clone();
        let task = tokio::spawn(async move {
            coordinator
                .create_session(task_data, generation, epoch)
                .await
        });
        let creation = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(call_id = %call_id, error = %e, "Session creation task failed");
                    Err(CoordinatorError::CreationAborted(call_id))
                }
            }
        }
        .boxed()
        .shared();

        st.in_flight
            .insert(data.call_id.clone(), (generation, creation.clone()));
        Route::Create(creation)
    }

    async fn decline_busy(&self, data: &VoipPushData) {
        tracing::info!(call_id = %data.call_id, "Already in a call, declining as busy");
        self.decline_call(&data.call_id, DeclineReason::Busy).await;

        if data.source == PushSource::Rtm {
            let signaling = &self.inner.deps.signaling;
            let channel = if data.channel_name.is_empty() {
                data.call_id.default_channel_name()
            } else {
                data.channel_name.clone()
            };
            let message = SignalMessage::new(
                SignalType::Decline,
                &data.call_id,
                &signaling.current_user_id(),
                &channel,
            )
            .with_reason(DeclineReason::Busy.as_str());
            signaling.send_to(&data.from, &message).await.log();
        }
    }

    async fn decline_call(&self, call_id: &CallId, reason: DeclineReason) {
        let user_id = self.inner.deps.signaling.current_user_id();
        BestEffort::from_result(
            "backend_decline",
            self.inner.deps.api.decline(call_id, &user_id, reason).await,
        )
        .log();
    }

    async fn create_session(
        &self,
        data: VoipPushData,
        generation: u64,
        epoch: u64,
    ) -> Result<(), CoordinatorError> {
        let result = self.run_creation(&data, epoch).await;

        {
            let mut st = self.inner.state.lock();
            if st
                .in_flight
                .get(&data.call_id)
                .map(|(g, _)| *g == generation)
                .unwrap_or(false)
            {
                st.in_flight.remove(&data.call_id);
            }
        }

        if let Err(e) = &result {
            tracing::warn!(call_id = %data.call_id, error = %e, "Incoming call not set up");
            self.emit_error(Some(&data.call_id), "create_session", e);
        }
        result
    }

    async fn resolve_current_user(&self) {
        let deps = &self.inner.deps;
        match deps.auth.current_user().await {
            Ok(Some(user)) => deps.signaling.set_current_user(user),
            Ok(None) => tracing::warn!("No signed-in user for incoming call"),
            Err(e) => tracing::warn!(error = %e, "Could not resolve signed-in user"),
        }
    }

    /// Creation started before the last [`cleanup`](Self::cleanup)
    fn is_stale(&self, epoch: u64) -> bool {
        self.inner.state.lock().epoch != epoch
    }

    async fn run_creation(&self, data: &VoipPushData, epoch: u64) -> Result<(), CoordinatorError> {
        let deps = &self.inner.deps;
        let call_id = &data.call_id;

        self.resolve_current_user().await;
        self.warm_signaling(data).await?;

        let details = match deps.api.call_details(call_id).await {
            Ok(details) => details,
            Err(error) => {
                deps.host_ui
                    .alert("Call Error", "Unable to retrieve call information.")
                    .await;
                return Err(CoordinatorError::DetailsUnavailable {
                    call_id: call_id.clone(),
                    error,
                });
            }
        };

        let caller_name = details
            .doorman_name
            .clone()
            .or_else(|| data.caller_name.clone().filter(|n| !n.is_empty()))
            .unwrap_or_else(|| self.inner.config.default_caller_name.clone());

        if self.is_stale(epoch) {
            tracing::info!(call_id = %call_id, "Coordinator cleaned up during creation, dropping call");
            return Err(CoordinatorError::CreationAborted(call_id.clone()));
        }

        let show_native = data.should_show_native_ui
            && self.native_ui_available()
            && self.session_for(call_id).is_none();
        if show_native {
            deps.native_ui
                .display_incoming_call(call_id, &data.from, &caller_name, false)
                .await;
        }

        let channel_name = [data.channel_name.as_str(), details.channel_name.as_str()]
            .into_iter()
            .find(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| call_id.default_channel_name());
        let participants = if details.participants.is_empty() {
            vec![Participant::new(data.from.clone())]
        } else {
            details.participants.clone()
        };

        let session = CallSession::new(
            SessionParams {
                call_id: call_id.clone(),
                channel_name,
                direction: CallDirection::Incoming,
                participants,
                display: CallDisplay {
                    caller_name: Some(caller_name),
                    apartment_number: details
                        .apartment_number
                        .clone()
                        .or_else(|| data.apartment_number.clone()),
                    building_id: details.building_id.clone(),
                },
            },
            self.session_deps(),
        );

        let init = if self.inner.config.lightweight_sessions {
            session.initialize_lightweight()
        } else {
            session.initialize().await
        };
        if let Err(e) = init {
            if show_native {
                deps.native_ui
                    .report_end_call(call_id, NativeEndReason::Failed)
                    .await;
            }
            return Err(e.into());
        }

        let installed = {
            let mut st = self.inner.state.lock();
            let current = st.epoch == epoch;
            if current {
                st.active = Some(Arc::clone(&session));
            }
            current
        };
        if !installed {
            tracing::info!(call_id = %call_id, "Coordinator cleaned up during creation, ending call");
            session.end(EndReason::Drop).await;
            if show_native {
                deps.native_ui.end_call(call_id).await;
            }
            return Err(CoordinatorError::CreationAborted(call_id.clone()));
        }

        BestEffort::from_result("session_save", deps.sessions.save(&session.record())).log();
        self.watch_session(&session);
        tracing::info!(call_id = %call_id, "Incoming call ready");
        self.emit(CoordinatorEvent::SessionCreated {
            call_id: call_id.clone(),
        });
        self.start_hangup_poll(&session);
        Ok(())
    }

    async fn warm_signaling(&self, data: &VoipPushData) -> Result<(), CoordinatorError> {
        let deps = &self.inner.deps;
        let call_id = &data.call_id;
        loop {
            let Err(e) = deps
                .signaling
                .ensure_ready(self.inner.config.warmup_timeout())
                .await
            else {
                return Ok(());
            };
            tracing::warn!(call_id = %call_id, error = %e, "Signaling warm-up failed");

            if data.source.is_headless() {
                deps.native_ui.end_call(call_id).await;
                self.decline_call(call_id, DeclineReason::ConnectionFailed).await;
                return Err(CoordinatorError::SignalingUnavailable(call_id.clone()));
            }

            match deps.host_ui.prompt_warmup_retry(call_id).await {
                RetryDecision::Retry => {
                    tracing::info!(call_id = %call_id, "Retrying signaling warm-up");
                }
                RetryDecision::Cancel => {
                    deps.native_ui.end_call(call_id).await;
                    self.decline_call(call_id, DeclineReason::Declined).await;
                    return Err(CoordinatorError::Cancelled(call_id.clone()));
                }
            }
        }
    }

    fn session_deps(&self) -> SessionDeps {
        let deps = &self.inner.deps;
        SessionDeps {
            signaling: deps.signaling.clone(),
            transport: Arc::clone(&deps.transport),
            api: Arc::clone(&deps.api),
            permission: Arc::clone(&deps.permission),
            warmup_timeout: self.inner.config.warmup_timeout(),
        }
    }

    fn watch_session(&self, session: &Arc<CallSession>) {
        let mut events = session.subscribe_events();
        let weak = Arc::downgrade(&self.inner);
        let session = Arc::clone(session);

        let handle = tokio::spawn(async move {
            if !session.state().is_terminal() {
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::StateChanged { new, .. }) if new.is_terminal() => break,
                        Ok(SessionEvent::Error {
                            call_id,
                            operation,
                            error,
                        }) => {
                            if let Some(c) = CallCoordinator::from_weak(&weak) {
                                c.emit_error(Some(&call_id), operation, error);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            if session.state().is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            if let Some(coordinator) = CallCoordinator::from_weak(&weak) {
                coordinator.finish_session(&session).await;
            }
        });

        // The previous watcher belongs to a finished session; let it run out
        drop(self.inner.state.lock().session_watcher.replace(handle));
    }

    /// Release `session` from the active slot if it still holds it
    async fn finish_session(&self, session: &Arc<CallSession>) {
        let released = {
            let mut st = self.inner.state.lock();
            let holds = st
                .active
                .as_ref()
                .map(|a| Arc::ptr_eq(a, session))
                .unwrap_or(false);
            if holds {
                st.active = None;
                // Detached, not aborted: the poll may be the task ending this call
                drop(st.poll.take());
            }
            holds
        };
        if !released {
            return;
        }

        let state = session.state();
        let final_state = if state.is_terminal() {
            state
        } else {
            CallLifecycleState::Ended
        };
        self.inner.deps.native_ui.end_call(session.id()).await;
        BestEffort::from_result("session_clear", self.inner.deps.sessions.clear()).log();
        tracing::info!(call_id = %session.id(), final_state = %final_state, "Call session released");
        self.emit(CoordinatorEvent::SessionEnded {
            call_id: session.id().clone(),
            final_state,
        });
    }

    /// Handle an inbound signaling message
    #[tracing::instrument(skip(self, message), fields(peer = %message.peer_id))]
    pub async fn handle_rtm_message(&self, message: InboundMessage) {
        let signal = match InboundSignal::parse(&message.text) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unparseable signaling message");
                return;
            }
        };

        if signal.is_end_like() {
            let Some(call_id) = signal.call_id else {
                return;
            };
            match self.session_for(&call_id) {
                Some(session) => self.handle_remote_end(session, "signaling").await,
                None => tracing::debug!(call_id = %call_id, "End for a call that is not active"),
            }
            return;
        }

        if !signal.is_invite() {
            tracing::trace!(kind = ?signal.kind, "Ignoring signaling message");
            return;
        }
        let Some(call_id) = signal.call_id.clone() else {
            tracing::warn!("Invite without call id");
            return;
        };
        if !self.receives_calls().await {
            tracing::debug!(call_id = %call_id, "Current user does not take calls, ignoring invite");
            return;
        }

        let data = VoipPushData {
            channel_name: signal
                .channel
                .clone()
                .unwrap_or_else(|| call_id.default_channel_name()),
            call_id,
            from: signal.from.clone().unwrap_or_else(|| message.peer_id.clone()),
            caller_name: signal.caller_name.clone(),
            apartment_number: signal.apartment_number.clone(),
            building_name: signal.building_name.clone(),
            source: PushSource::Rtm,
            should_show_native_ui: false,
        };
        if let Err(e) = self.handle_incoming_push(data).await {
            tracing::warn!(error = %e, "Invite not handled");
        }
    }

    async fn receives_calls(&self) -> bool {
        if let Some(user) = self.inner.deps.signaling.current_user() {
            return user.user_type.receives_calls();
        }
        match self.inner.deps.auth.current_user().await {
            Ok(Some(user)) => user.user_type.receives_calls(),
            _ => false,
        }
    }

    async fn handle_remote_end(&self, session: Arc<CallSession>, origin: &'static str) {
        {
            let mut st = self.inner.state.lock();
            if st.remote_end_in_progress {
                return;
            }
            st.remote_end_in_progress = true;
        }

        tracing::info!(call_id = %session.id(), origin, "Remote hangup");
        session.end(EndReason::Drop).await;
        self.finish_session(&session).await;

        self.inner.state.lock().remote_end_in_progress = false;
    }

    fn start_hangup_poll(&self, session: &Arc<CallSession>) {
        let weak = Arc::downgrade(&self.inner);
        let session = Arc::clone(session);
        let period = self.inner.config.hangup_poll_interval();
        let max_attempts = self.inner.config.hangup_poll_max_attempts;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            for attempt in 1..=max_attempts {
                ticker.tick().await;
                let Some(coordinator) = CallCoordinator::from_weak(&weak) else {
                    break;
                };
                if !coordinator.is_active(&session) {
                    break;
                }
                let state = session.state();
                if matches!(
                    state,
                    CallLifecycleState::Connected | CallLifecycleState::Ending
                ) || state.is_terminal()
                {
                    break;
                }

                let status = coordinator.inner.deps.api.call_details(session.id()).await;
                match status {
                    Ok(details) if details.is_remotely_closed() => {
                        coordinator.handle_remote_end(session, "poll").await;
                        return;
                    }
                    Ok(_) => tracing::trace!(call_id = %session.id(), attempt, "Call still open"),
                    Err(ApiError::NotFound(_)) => {
                        coordinator.handle_remote_end(session, "poll").await;
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(call_id = %session.id(), attempt, error = %e, "Hangup poll failed")
                    }
                }
            }
            tracing::debug!(call_id = %session.id(), "Hangup poll stopped");
        });

        let mut st = self.inner.state.lock();
        if let Some(previous) = st.poll.replace(handle) {
            previous.abort();
        }
    }

    /// Answer the active call
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NoActiveCall`] when there is no call, or
    /// the session's error when answering fails
    #[tracing::instrument(skip(self))]
    pub async fn answer_active_call(&self) -> Result<(), CoordinatorError> {
        let deps = &self.inner.deps;
        let Some(session) = self.active_session() else {
            deps.host_ui.alert("No active call", "").await;
            return Err(CoordinatorError::NoActiveCall);
        };

        match session.answer().await {
            Ok(()) => {
                deps.native_ui.set_current_call_active(session.id()).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(call_id = %session.id(), error = %e, "Answer failed");
                deps.host_ui
                    .alert("Call Failed", "Unable to connect to the call.")
                    .await;
                Err(e.into())
            }
        }
    }

    /// Decline or hang up the active call; the slot is cleared afterwards
    #[tracing::instrument(skip(self))]
    pub async fn end_active_call(&self, request: EndRequest) {
        let Some(session) = self.active_session() else {
            tracing::debug!("No active call to end");
            return;
        };

        match request {
            EndRequest::Decline => session.decline(DeclineReason::Declined).await,
            EndRequest::Hangup => session.end(EndReason::Hangup).await,
        }
        self.finish_session(&session).await;
    }

    async fn handle_native_event(&self, event: NativeCallEvent) {
        match event {
            NativeCallEvent::AnswerCall { call_id } => self.handle_native_answer(call_id).await,
            NativeCallEvent::EndCall { call_id } => self.handle_native_end(call_id).await,
            NativeCallEvent::DidLoadWithEvents(actions) => {
                tracing::info!(count = actions.len(), "Replaying early native actions");
                for action in actions {
                    match action {
                        NativeAction::Answer(call_id) => self.handle_native_answer(call_id).await,
                        NativeAction::End(call_id) => self.handle_native_end(call_id).await,
                    }
                }
            }
            NativeCallEvent::DidActivateAudioSession => {
                tracing::debug!("Native audio session activated");
            }
            NativeCallEvent::IncomingConnectionFailed { call_id } => {
                self.handle_connection_failed(call_id).await;
            }
            NativeCallEvent::HasActiveNativeCall => {
                tracing::info!("Another native call became active, declining ours");
                self.end_active_call(EndRequest::Decline).await;
            }
        }
    }

    async fn handle_native_answer(&self, call_id: CallId) {
        let bridge = &self.inner.deps.native_ui;
        bridge.bring_to_foreground().await;
        bridge.set_current_call_active(&call_id).await;

        let Some(session) = self.wait_for_session(&call_id).await else {
            tracing::warn!(call_id = %call_id, "Native answer for a call that never appeared");
            self.emit_error(Some(&call_id), "native_answer", "session not found");
            return;
        };

        // Alerts the user on failure
        if self.answer_active_call().await.is_err() {
            tracing::warn!(call_id = %session.id(), "Native answer did not connect");
        }
        bridge.acknowledge_action(PendingKind::Answer, &call_id);
    }

    /// Wait for a session for `call_id`, bounded by the configured timeout
    async fn wait_for_session(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        let mut events = self.subscribe_events();
        if let Some(session) = self.session_for(call_id) {
            return Some(session);
        }
        let creation = self.in_flight(call_id);

        let wait = async {
            if let Some(creation) = creation {
                let _ = creation.await;
                if let Some(session) = self.session_for(call_id) {
                    return Some(session);
                }
            }
            loop {
                match events.recv().await {
                    Ok(CoordinatorEvent::SessionCreated { call_id: created }) if &created == call_id => {
                        if let Some(session) = self.session_for(call_id) {
                            return Some(session);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(session) = self.session_for(call_id) {
                            return Some(session);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        tokio::time::timeout(self.inner.config.session_wait_timeout(), wait)
            .await
            .ok()
            .flatten()
    }

    async fn handle_native_end(&self, call_id: CallId) {
        if let Some(creation) = self.in_flight(&call_id) {
            let _ = tokio::time::timeout(self.inner.config.session_wait_timeout(), creation).await;
        }

        match self.active_session() {
            Some(session) if session.id() == &call_id => {
                self.end_active_call(EndRequest::Decline).await;
                self.inner
                    .deps
                    .native_ui
                    .acknowledge_action(PendingKind::End, &call_id);
            }
            Some(session) => {
                tracing::debug!(call_id = %call_id, active = %session.id(), "Native end for another call, ignoring");
            }
            None => tracing::debug!(call_id = %call_id, "Native end with no active call"),
        }
    }

    async fn handle_connection_failed(&self, call_id: CallId) {
        tracing::warn!(call_id = %call_id, "Native incoming call could not be shown");
        self.inner
            .deps
            .host_ui
            .alert("Call Error", "Unable to show the incoming call.")
            .await;
        if self.session_for(&call_id).is_some() {
            self.end_active_call(EndRequest::Decline).await;
        }
    }

    /// Tear everything down: end the active call, stop listeners and polling
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) {
        let (session, handles) = {
            let mut st = self.inner.state.lock();
            st.initialized = false;
            st.epoch += 1;
            st.in_flight.clear();
            st.remote_end_in_progress = false;
            let mut handles: Vec<JoinHandle<()>> = st.listeners.drain(..).collect();
            handles.extend(st.poll.take());
            handles.extend(st.session_watcher.take());
            (st.active.take(), handles)
        };

        for handle in handles {
            handle.abort();
        }
        self.inner.deps.native_ui.clear_active_call_probe();

        if let Some(session) = session {
            session.end(EndReason::Drop).await;
            self.inner.deps.native_ui.end_call(session.id()).await;
            BestEffort::from_result("session_clear", self.inner.deps.sessions.clear()).log();
            self.emit(CoordinatorEvent::SessionEnded {
                call_id: session.id().clone(),
                final_state: session.state(),
            });
        }
        tracing::info!("Call coordinator cleaned up");
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
