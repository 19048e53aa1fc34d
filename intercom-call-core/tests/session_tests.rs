//! Call session lifecycle tests

mod common;

use common::{ConnectMode, SessionFixture, DOORMAN_ID, RESIDENT_ID};
use intercom_call_core::api::CallDetails;
use intercom_call_core::session::{SessionError, SessionEvent};
use intercom_call_core::signaling::SignalingError;
use intercom_call_core::state_machine::SignalType;
use intercom_call_core::transport::TransportEvent;
use intercom_call_core::types::{CallId, DeclineReason, EndReason, Participant};
use intercom_call_core::CallLifecycleState::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn initialize_warms_signaling_then_rings() {
    let fixture = SessionFixture::new("c1");
    let mut events = fixture.session.subscribe_events();

    fixture.session.initialize().await.unwrap();

    assert_eq!(fixture.session.state(), Ringing);
    assert!(fixture.session.signaling_ready());
    assert_eq!(fixture.signaling.connects.load(Ordering::SeqCst), 1);

    let mut seen = Vec::new();
    while let Ok(SessionEvent::StateChanged { old, new, .. }) = events.try_recv() {
        seen.push((old, new));
    }
    assert_eq!(seen, vec![(Idle, RtmWarming), (RtmWarming, Ringing)]);

    // Not idle any more
    assert_eq!(
        fixture.session.initialize().await,
        Err(SessionError::Interrupted(Ringing))
    );
}

#[tokio::test(start_paused = true)]
async fn initialize_warmup_timeout_fails_session() {
    let fixture = SessionFixture::new("c1");
    fixture.signaling.set_default_mode(ConnectMode::Hang);
    let mut events = fixture.session.subscribe_events();

    let result = fixture.session.initialize().await;

    assert_eq!(
        result,
        Err(SessionError::Signaling(SignalingError::WarmupTimeout(
            Duration::from_secs(6)
        )))
    );
    assert_eq!(fixture.session.state(), Failed);
    assert!(!fixture.session.signaling_ready());

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Error { operation, .. } = event {
            assert_eq!(operation, "initialize");
            errors += 1;
        }
    }
    assert_eq!(errors, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_answers_run_once() {
    let fixture = SessionFixture::new("c1");
    fixture.transport.set_join_delay(Duration::from_millis(200));
    fixture.session.initialize_lightweight().unwrap();
    assert!(!fixture.session.signaling_ready());

    let (first, second) = tokio::join!(fixture.session.answer(), fixture.session.answer());
    first.unwrap();
    second.unwrap();

    assert_eq!(fixture.signaling.connects.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.api.answers().len(), 1);
    assert_eq!(fixture.transport.joins.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.session.state(), Connecting);
    assert!(fixture.session.transport_joined());

    // Answering again after the fact is a no-op
    fixture.session.answer().await.unwrap();
    assert_eq!(fixture.api.answers().len(), 1);
}

#[tokio::test]
async fn answer_joins_with_backend_tokens_and_signals_peers() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();

    fixture.session.answer().await.unwrap();

    let tokens = fixture.session.token_bundle().unwrap();
    assert_eq!(tokens.rtc_token, "rtc-c1");
    assert_eq!(fixture.api.answers(), vec![(CallId::new("c1"), RESIDENT_ID.to_string())]);

    let joined = fixture.transport.joined_with();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].channel_name, "call-c1");
    assert_eq!(joined[0].user_account, RESIDENT_ID);

    // ANSWER goes to everyone but ourselves
    let answers = fixture.signaling.sent_of(SignalType::Answer);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].0, vec![DOORMAN_ID.to_string()]);
    assert_eq!(answers[0].1.from, RESIDENT_ID);
}

#[tokio::test]
async fn answer_requires_ringing() {
    let fixture = SessionFixture::new("c1");
    assert_eq!(
        fixture.session.answer().await,
        Err(SessionError::InvalidState(Idle))
    );
    assert!(fixture.api.answers().is_empty());
}

#[tokio::test]
async fn answer_failure_fails_session() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();
    fixture.api.fail_answer.store(true, Ordering::SeqCst);

    let result = fixture.session.answer().await;

    assert!(matches!(result, Err(SessionError::Api(_))));
    assert_eq!(fixture.session.state(), Failed);
    assert!(!fixture.session.transport_joined());
    assert_eq!(fixture.transport.joins.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remote_join_connects_and_remote_leave_ends() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();
    fixture.session.answer().await.unwrap();
    assert_eq!(fixture.session.state(), Connecting);

    fixture.transport.emit(TransportEvent::RemoteJoined {
        uid: DOORMAN_ID.to_string(),
    });
    assert!(common::wait_until(|| fixture.session.state() == Connected).await);

    fixture.transport.emit(TransportEvent::RemoteLeft {
        uid: DOORMAN_ID.to_string(),
        reason: Some("quit".to_string()),
    });
    assert!(common::wait_until(|| fixture.session.state() == Ended).await);
    assert_eq!(fixture.api.ends(), vec![(CallId::new("c1"), EndReason::Drop)]);
    assert!(!fixture.session.transport_joined());
    assert_eq!(fixture.transport.leaves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn remote_already_present_connects_on_join() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();

    // The doorman is in the channel before we join
    fixture.transport.emit(TransportEvent::RemoteJoined {
        uid: DOORMAN_ID.to_string(),
    });
    common::settle().await;

    fixture.session.answer().await.unwrap();
    assert_eq!(fixture.session.state(), Connected);
}

#[tokio::test]
async fn transport_error_fails_session() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();
    fixture.session.answer().await.unwrap();

    fixture.transport.emit(TransportEvent::Error {
        code: 110,
        message: "token expired".to_string(),
    });

    assert!(common::wait_until(|| fixture.session.state() == Failed).await);
    assert!(!fixture.session.transport_joined());
    assert_eq!(fixture.transport.leaves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn end_completes_when_broadcast_and_backend_fail() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();
    fixture.session.answer().await.unwrap();
    assert!(fixture.session.transport_joined());

    fixture.signaling.fail_sends.store(true, Ordering::SeqCst);
    fixture.api.fail_notify.store(true, Ordering::SeqCst);
    fixture.session.end(EndReason::Hangup).await;

    assert_eq!(fixture.session.state(), Ended);
    assert!(!fixture.session.transport_joined());
    assert_eq!(fixture.transport.leaves.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.signaling.sent_of(SignalType::End).len(), 1);
    assert_eq!(fixture.api.ends(), vec![(CallId::new("c1"), EndReason::Hangup)]);
}

#[tokio::test]
async fn end_is_idempotent() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();

    tokio::join!(
        fixture.session.end(EndReason::Hangup),
        fixture.session.end(EndReason::Hangup)
    );
    fixture.session.end(EndReason::Drop).await;

    assert_eq!(fixture.session.state(), Ended);
    assert_eq!(fixture.api.ends().len(), 1);
    assert_eq!(fixture.signaling.sent_of(SignalType::End).len(), 1);
}

#[tokio::test]
async fn end_from_idle_goes_straight_to_ended() {
    let fixture = SessionFixture::new("c1");
    fixture.session.end(EndReason::Drop).await;
    assert_eq!(fixture.session.state(), Ended);
}

#[tokio::test(start_paused = true)]
async fn end_during_join_interrupts_answer() {
    let fixture = SessionFixture::new("c1");
    fixture.transport.set_join_delay(Duration::from_millis(500));
    fixture.session.initialize().await.unwrap();

    let session = fixture.session.clone();
    let answering = tokio::spawn(async move { session.answer().await });
    assert!(common::wait_until(|| fixture.session.state() == RtcJoining).await);

    fixture.session.end(EndReason::Hangup).await;
    assert_eq!(fixture.session.state(), Ended);

    let result = answering.await.unwrap();
    assert_eq!(result, Err(SessionError::Interrupted(Ended)));
    assert_eq!(fixture.session.state(), Ended);
    assert!(!fixture.session.transport_joined());
    // The join finished after teardown, so the answer path left
    assert_eq!(fixture.transport.leaves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn decline_before_answer() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();

    fixture.session.decline(DeclineReason::Declined).await;

    assert_eq!(fixture.session.state(), Declined);
    assert_eq!(
        fixture.api.declines(),
        vec![(CallId::new("c1"), DeclineReason::Declined)]
    );
    let declines = fixture.signaling.sent_of(SignalType::Decline);
    assert_eq!(declines.len(), 1);
    assert_eq!(declines[0].0, vec![DOORMAN_ID.to_string()]);
    assert!(fixture.api.ends().is_empty());
}

#[tokio::test]
async fn decline_after_answer_hangs_up() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();
    fixture.session.answer().await.unwrap();

    fixture.session.decline(DeclineReason::Declined).await;

    assert_eq!(fixture.session.state(), Ended);
    assert!(fixture.api.declines().is_empty());
    assert_eq!(fixture.api.ends(), vec![(CallId::new("c1"), EndReason::Hangup)]);
    assert!(!fixture.session.transport_joined());
}

#[tokio::test]
async fn backend_details_override_display() {
    let fixture = SessionFixture::new("c1");
    let details = CallDetails {
        call_id: CallId::new("c1"),
        channel_name: "ch-9".to_string(),
        participants: vec![Participant::new("doorman-7")],
        doorman_name: Some("J. Silva".to_string()),
        apartment_number: Some("202".to_string()),
        building_id: None,
        status: Some("ringing".to_string()),
        ended_at: None,
    };

    fixture.session.apply_details(&details);

    let display = fixture.session.display();
    assert_eq!(display.caller_name.as_deref(), Some("J. Silva"));
    assert_eq!(display.apartment_number.as_deref(), Some("202"));
    assert_eq!(fixture.session.participants(), vec![Participant::new("doorman-7")]);
    // A channel already known is kept
    assert_eq!(fixture.session.channel_name(), "call-c1");
}

#[tokio::test]
async fn snapshot_reflects_progress() {
    let fixture = SessionFixture::new("c1");
    fixture.session.initialize().await.unwrap();
    fixture.session.answer().await.unwrap();

    let snapshot = fixture.session.snapshot();
    assert_eq!(snapshot.state, Connecting);
    assert!(snapshot.has_tokens);
    assert!(snapshot.transport_joined);
    assert!(snapshot.signaling_ready);
}
