//! Shared mocks for integration tests

#![allow(dead_code)]

use intercom_call_core::api::{ApiError, CallApi, CallDetails};
use intercom_call_core::config::CoordinatorConfig;
use intercom_call_core::coordinator::{CallCoordinator, CoordinatorDeps, CoordinatorEvent};
use intercom_call_core::identity::{AuthError, AuthProvider, CurrentUser, UserType};
use intercom_call_core::native_ui::{
    MemoryPendingStore, NativeCallBridge, NativeCallPlatform, NativeEndReason, NativeUiError,
    PendingActionStore, RawNativeEvent,
};
use intercom_call_core::platform::{
    FallbackNotifier, HostUi, PlatformError, PreGrantedPermission, RetryDecision,
};
use intercom_call_core::session::{
    CallSession, MemorySessionStore, SessionDeps, SessionParams, SessionStore,
};
use intercom_call_core::signaling::{
    ChannelStatus, InboundMessage, SignalMessage, SignalingChannel, SignalingError,
    SignalingHandler,
};
use intercom_call_core::state_machine::SignalType;
use intercom_call_core::transport::{JoinParams, RtcTransport, TransportError, TransportEvent};
use intercom_call_core::types::{
    CallDirection, CallDisplay, CallId, DeclineReason, EndReason, Participant, PushSource,
    TokenBundle, VoipPushData,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const RESIDENT_ID: &str = "resident-1";
pub const DOORMAN_ID: &str = "doorman-1";

/// How the next `connect` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Succeed,
    Fail,
    Hang,
}

// Mock signaling channel
pub struct MockSignaling {
    status: Mutex<ChannelStatus>,
    modes: Mutex<VecDeque<ConnectMode>>,
    default_mode: Mutex<ConnectMode>,
    pub connects: AtomicUsize,
    pub fail_sends: AtomicBool,
    sent: Mutex<Vec<(Vec<String>, SignalMessage)>>,
    user: Mutex<Option<CurrentUser>>,
    inbound: broadcast::Sender<InboundMessage>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        let (inbound, _) = broadcast::channel(32);
        Arc::new(Self {
            status: Mutex::new(ChannelStatus::Disconnected),
            modes: Mutex::new(VecDeque::new()),
            default_mode: Mutex::new(ConnectMode::Succeed),
            connects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            user: Mutex::new(None),
            inbound,
        })
    }

    /// Queue connect outcomes; afterwards the default applies
    pub fn queue_modes(&self, modes: &[ConnectMode]) {
        self.modes.lock().extend(modes.iter().copied());
    }

    pub fn set_default_mode(&self, mode: ConnectMode) {
        *self.default_mode.lock() = mode;
    }

    pub fn disconnect(&self) {
        *self.status.lock() = ChannelStatus::Disconnected;
    }

    pub fn deliver(&self, peer_id: &str, text: &str) {
        let _ = self.inbound.send(InboundMessage {
            peer_id: peer_id.to_string(),
            text: text.to_string(),
        });
    }

    pub fn sent(&self) -> Vec<(Vec<String>, SignalMessage)> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, t: SignalType) -> Vec<(Vec<String>, SignalMessage)> {
        self.sent().into_iter().filter(|(_, m)| m.t == t).collect()
    }
}

#[async_trait::async_trait]
impl SignalingChannel for MockSignaling {
    fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    async fn connect(&self) -> Result<(), SignalingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mode = self
            .modes
            .lock()
            .pop_front()
            .unwrap_or(*self.default_mode.lock());
        match mode {
            ConnectMode::Succeed => {
                *self.status.lock() = ChannelStatus::Connected;
                Ok(())
            }
            ConnectMode::Fail => Err(SignalingError::NotConnected("login rejected".to_string())),
            ConnectMode::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn send_peer_message(
        &self,
        peers: &[String],
        message: &SignalMessage,
    ) -> Result<(), SignalingError> {
        self.sent.lock().push((peers.to_vec(), message.clone()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("peer offline".to_string()));
        }
        Ok(())
    }

    fn current_user(&self) -> Option<CurrentUser> {
        self.user.lock().clone()
    }

    fn set_current_user(&self, user: CurrentUser) {
        *self.user.lock() = Some(user);
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }
}

// Mock RTC transport
pub struct MockTransport {
    pub joins: AtomicUsize,
    pub leaves: AtomicUsize,
    pub fail_join: AtomicBool,
    join_delay: Mutex<Duration>,
    joined_with: Mutex<Vec<JoinParams>>,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            fail_join: AtomicBool::new(false),
            join_delay: Mutex::new(Duration::ZERO),
            joined_with: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock() = delay;
    }

    pub fn joined_with(&self) -> Vec<JoinParams> {
        self.joined_with.lock().clone()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait::async_trait]
impl RtcTransport for MockTransport {
    async fn join(&self, params: &JoinParams) -> Result<(), TransportError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let delay = *self.join_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(TransportError::JoinError("invalid token".to_string()));
        }
        self.joined_with.lock().push(params.clone());
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// Mock backend
pub struct MockApi {
    details: Mutex<HashMap<CallId, CallDetails>>,
    missing: Mutex<Vec<CallId>>,
    pub fail_details: AtomicBool,
    pub fail_answer: AtomicBool,
    pub fail_notify: AtomicBool,
    pub details_calls: AtomicUsize,
    details_delay: Mutex<Option<Duration>>,
    answers: Mutex<Vec<(CallId, String)>>,
    declines: Mutex<Vec<(CallId, DeclineReason)>>,
    ends: Mutex<Vec<(CallId, EndReason)>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            details: Mutex::new(HashMap::new()),
            missing: Mutex::new(Vec::new()),
            fail_details: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
            fail_notify: AtomicBool::new(false),
            details_calls: AtomicUsize::new(0),
            details_delay: Mutex::new(None),
            answers: Mutex::new(Vec::new()),
            declines: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
        })
    }

    pub fn set_details(&self, details: CallDetails) {
        self.details.lock().insert(details.call_id.clone(), details);
    }

    /// Make every details request take `delay`
    pub fn set_details_delay(&self, delay: Duration) {
        *self.details_delay.lock() = Some(delay);
    }

    /// Mark the call closed on the backend
    pub fn close_call(&self, call_id: &str) {
        let call_id = CallId::new(call_id);
        let mut details = self.details.lock();
        let entry = details
            .entry(call_id.clone())
            .or_insert_with(|| open_details(call_id.as_str()));
        entry.ended_at = Some("2026-10-17T12:00:00Z".to_string());
    }

    /// Make the backend answer 404 for the call
    pub fn forget_call(&self, call_id: &str) {
        self.missing.lock().push(CallId::new(call_id));
    }

    pub fn answers(&self) -> Vec<(CallId, String)> {
        self.answers.lock().clone()
    }

    pub fn declines(&self) -> Vec<(CallId, DeclineReason)> {
        self.declines.lock().clone()
    }

    pub fn ends(&self) -> Vec<(CallId, EndReason)> {
        self.ends.lock().clone()
    }
}

/// Open call with the doorman and the resident as participants
pub fn open_details(call_id: &str) -> CallDetails {
    CallDetails {
        call_id: CallId::new(call_id),
        channel_name: String::new(),
        participants: vec![Participant::new(DOORMAN_ID), Participant::new(RESIDENT_ID)],
        doorman_name: None,
        apartment_number: Some("101".to_string()),
        building_id: Some("b1".to_string()),
        status: Some("ringing".to_string()),
        ended_at: None,
    }
}

#[async_trait::async_trait]
impl CallApi for MockApi {
    async fn call_details(&self, call_id: &CallId) -> Result<CallDetails, ApiError> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.details_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_details.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("connection refused".to_string()));
        }
        if self.missing.lock().contains(call_id) {
            return Err(ApiError::NotFound(call_id.clone()));
        }
        Ok(self
            .details
            .lock()
            .get(call_id)
            .cloned()
            .unwrap_or_else(|| open_details(call_id.as_str())))
    }

    async fn answer(&self, call_id: &CallId, user_id: &str) -> Result<TokenBundle, ApiError> {
        self.answers
            .lock()
            .push((call_id.clone(), user_id.to_string()));
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                code: 409,
                message: "call already answered".to_string(),
            });
        }
        Ok(TokenBundle {
            rtc_token: format!("rtc-{call_id}"),
            rtm_token: None,
            uid: user_id.to_string(),
            channel_name: call_id.default_channel_name(),
        })
    }

    async fn decline(
        &self,
        call_id: &CallId,
        _user_id: &str,
        reason: DeclineReason,
    ) -> Result<(), ApiError> {
        self.declines.lock().push((call_id.clone(), reason));
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("backend down".to_string()));
        }
        Ok(())
    }

    async fn end(
        &self,
        call_id: &CallId,
        _user_id: &str,
        cause: EndReason,
    ) -> Result<(), ApiError> {
        self.ends.lock().push((call_id.clone(), cause));
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("backend down".to_string()));
        }
        Ok(())
    }
}

// Mock auth layer
pub struct MockAuth {
    user: Mutex<Option<CurrentUser>>,
}

impl MockAuth {
    pub fn resident() -> Arc<Self> {
        Arc::new(Self {
            user: Mutex::new(Some(CurrentUser::resident(RESIDENT_ID))),
        })
    }

    pub fn with_role(user_type: UserType) -> Arc<Self> {
        Arc::new(Self {
            user: Mutex::new(Some(CurrentUser {
                id: "someone-1".to_string(),
                user_type,
                display_name: None,
            })),
        })
    }
}

#[async_trait::async_trait]
impl AuthProvider for MockAuth {
    async fn current_user(&self) -> Result<Option<CurrentUser>, AuthError> {
        Ok(self.user.lock().clone())
    }

    async fn access_token(&self) -> Option<String> {
        Some("test-token".to_string())
    }
}

// Mock OS call UI
pub struct MockNativePlatform {
    pub registrations: AtomicUsize,
    pub foregrounded: AtomicUsize,
    displayed: Mutex<Vec<(CallId, String, String)>>,
    ended: Mutex<Vec<CallId>>,
    reported: Mutex<Vec<(CallId, NativeEndReason)>>,
    activated: Mutex<Vec<CallId>>,
    raw: broadcast::Sender<RawNativeEvent>,
}

impl MockNativePlatform {
    pub fn new() -> Arc<Self> {
        let (raw, _) = broadcast::channel(32);
        Arc::new(Self {
            registrations: AtomicUsize::new(0),
            foregrounded: AtomicUsize::new(0),
            displayed: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            reported: Mutex::new(Vec::new()),
            activated: Mutex::new(Vec::new()),
            raw,
        })
    }

    pub fn fire(&self, name: &str, payload: serde_json::Value) {
        let _ = self.raw.send(RawNativeEvent::new(name, payload));
    }

    /// `(call id, handle, caller name)` of every incoming-call screen shown
    pub fn displayed(&self) -> Vec<(CallId, String, String)> {
        self.displayed.lock().clone()
    }

    pub fn ended(&self) -> Vec<CallId> {
        self.ended.lock().clone()
    }

    pub fn reported(&self) -> Vec<(CallId, NativeEndReason)> {
        self.reported.lock().clone()
    }

    pub fn activated(&self) -> Vec<CallId> {
        self.activated.lock().clone()
    }
}

#[async_trait::async_trait]
impl NativeCallPlatform for MockNativePlatform {
    async fn register(&self) -> Result<(), NativeUiError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn display_incoming_call(
        &self,
        call_id: &CallId,
        handle: &str,
        caller_name: &str,
        _has_video: bool,
    ) -> Result<(), NativeUiError> {
        self.displayed.lock().push((
            call_id.clone(),
            handle.to_string(),
            caller_name.to_string(),
        ));
        Ok(())
    }

    async fn end_call(&self, call_id: &CallId) -> Result<(), NativeUiError> {
        self.ended.lock().push(call_id.clone());
        Ok(())
    }

    async fn report_end_call(
        &self,
        call_id: &CallId,
        reason: NativeEndReason,
    ) -> Result<(), NativeUiError> {
        self.reported.lock().push((call_id.clone(), reason));
        Ok(())
    }

    async fn set_current_call_active(&self, call_id: &CallId) -> Result<(), NativeUiError> {
        self.activated.lock().push(call_id.clone());
        Ok(())
    }

    async fn bring_to_foreground(&self) -> Result<(), NativeUiError> {
        self.foregrounded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_raw_events(&self) -> broadcast::Receiver<RawNativeEvent> {
        self.raw.subscribe()
    }
}

// Mock alerts and retry dialog
pub struct MockHostUi {
    alerts: Mutex<Vec<(String, String)>>,
    decisions: Mutex<VecDeque<RetryDecision>>,
    pub prompts: AtomicUsize,
}

impl MockHostUi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alerts: Mutex::new(Vec::new()),
            decisions: Mutex::new(VecDeque::new()),
            prompts: AtomicUsize::new(0),
        })
    }

    /// Answers for upcoming retry prompts; `Cancel` once exhausted
    pub fn queue_decisions(&self, decisions: &[RetryDecision]) {
        self.decisions.lock().extend(decisions.iter().copied());
    }

    pub fn alert_titles(&self) -> Vec<String> {
        self.alerts.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait::async_trait]
impl HostUi for MockHostUi {
    async fn alert(&self, title: &str, message: &str) {
        self.alerts
            .lock()
            .push((title.to_string(), message.to_string()));
    }

    async fn prompt_warmup_retry(&self, _call_id: &CallId) -> RetryDecision {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.decisions
            .lock()
            .pop_front()
            .unwrap_or(RetryDecision::Cancel)
    }
}

// Mock local notification
#[derive(Default)]
pub struct MockNotifier {
    shown: Mutex<Vec<CallId>>,
}

impl MockNotifier {
    pub fn shown(&self) -> Vec<CallId> {
        self.shown.lock().clone()
    }
}

#[async_trait::async_trait]
impl FallbackNotifier for MockNotifier {
    async fn show_incoming_call(&self, data: &VoipPushData) -> Result<(), PlatformError> {
        self.shown.lock().push(data.call_id.clone());
        Ok(())
    }
}

/// Coordinator wired to mocks
pub struct Harness {
    pub signaling: Arc<MockSignaling>,
    pub transport: Arc<MockTransport>,
    pub api: Arc<MockApi>,
    pub platform: Arc<MockNativePlatform>,
    pub store: Arc<dyn PendingActionStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub host_ui: Arc<MockHostUi>,
    pub coordinator: CallCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), true, MockAuth::resident(), Arc::new(MemoryPendingStore::new()))
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self::build(config, true, MockAuth::resident(), Arc::new(MemoryPendingStore::new()))
    }

    pub fn without_native_ui() -> Self {
        Self::build(test_config(), false, MockAuth::resident(), Arc::new(MemoryPendingStore::new()))
    }

    pub fn with_session_store(sessions: Arc<dyn SessionStore>) -> Self {
        Self::build_with(
            test_config(),
            true,
            MockAuth::resident(),
            Arc::new(MemoryPendingStore::new()),
            sessions,
        )
    }

    pub fn build(
        config: CoordinatorConfig,
        native: bool,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn PendingActionStore>,
    ) -> Self {
        Self::build_with(config, native, auth, store, Arc::new(MemorySessionStore::new()))
    }

    pub fn build_with(
        config: CoordinatorConfig,
        native: bool,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn PendingActionStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let signaling = MockSignaling::new();
        let transport = MockTransport::new();
        let api = MockApi::new();
        let platform = MockNativePlatform::new();
        let host_ui = MockHostUi::new();

        let native_platform = native.then(|| platform.clone() as Arc<dyn NativeCallPlatform>);
        let bridge = Arc::new(NativeCallBridge::new(native_platform, Arc::clone(&store)));

        let deps = CoordinatorDeps {
            signaling: SignalingHandler::new(signaling.clone()),
            transport: transport.clone(),
            api: api.clone(),
            auth,
            native_ui: bridge,
            host_ui: host_ui.clone(),
            permission: Arc::new(PreGrantedPermission),
            sessions: Arc::clone(&sessions),
        };

        Self {
            signaling,
            transport,
            api,
            platform,
            store,
            sessions,
            host_ui,
            coordinator: CallCoordinator::new(deps, config),
        }
    }

    /// Number of `SessionCreated` events seen on `events` so far
    pub fn count_created(events: &mut broadcast::Receiver<CoordinatorEvent>) -> usize {
        let mut created = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoordinatorEvent::SessionCreated { .. }) {
                created += 1;
            }
        }
        created
    }

    pub fn active_id(&self) -> Option<CallId> {
        self.coordinator.active_session().map(|s| s.id().clone())
    }

    pub fn active_session(&self) -> Option<Arc<CallSession>> {
        self.coordinator.active_session()
    }
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
}

/// Announcement for `call_id` from the default doorman
pub fn push(call_id: &str, source: PushSource) -> VoipPushData {
    VoipPushData {
        call_id: CallId::new(call_id),
        from: DOORMAN_ID.to_string(),
        caller_name: Some("Porteiro".to_string()),
        apartment_number: Some("101".to_string()),
        building_name: None,
        channel_name: String::new(),
        source,
        should_show_native_ui: true,
    }
}

/// Session wired directly to mocks, outside any coordinator
pub struct SessionFixture {
    pub signaling: Arc<MockSignaling>,
    pub transport: Arc<MockTransport>,
    pub api: Arc<MockApi>,
    pub session: Arc<CallSession>,
}

impl SessionFixture {
    pub fn new(call_id: &str) -> Self {
        let signaling = MockSignaling::new();
        signaling.set_current_user(CurrentUser::resident(RESIDENT_ID));
        let transport = MockTransport::new();
        let api = MockApi::new();

        let deps = SessionDeps {
            signaling: SignalingHandler::new(signaling.clone()),
            transport: transport.clone(),
            api: api.clone(),
            permission: Arc::new(PreGrantedPermission),
            warmup_timeout: Duration::from_secs(6),
        };
        let session = CallSession::new(
            SessionParams {
                call_id: CallId::new(call_id),
                channel_name: CallId::new(call_id).default_channel_name(),
                direction: CallDirection::Incoming,
                participants: vec![Participant::new(DOORMAN_ID), Participant::new(RESIDENT_ID)],
                display: CallDisplay {
                    caller_name: Some("Porteiro".to_string()),
                    ..CallDisplay::default()
                },
            },
            deps,
        );

        Self {
            signaling,
            transport,
            api,
            session,
        }
    }
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds, giving up after a while
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}
