//! Call lifecycle state machine
//!
//! Pure data: the table of legal state transitions and the mapping from
//! signaling message types to target states. Every other component consults
//! this table instead of hand-rolling transition checks.
//!
//! ```text
//!   Idle ──► RtmWarming ──► Ringing ──► NativeAnswered ──► TokenFetching
//!     │                       │  ▲                               │
//!     └──────► Dialing ───────┘  │                               ▼
//!                                │            Connected ◄── Connecting ◄── RtcJoining
//!                                │                │
//!            (any pre-connected) └──► Ending ◄────┘
//!                                       │
//!                                       ▼
//!                              Ended / Declined
//! ```
//!
//! `Failed` is reachable from every non-terminal state except `Ending`;
//! `Missed` only from `Ringing`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLifecycleState {
    /// Session constructed, nothing happened yet
    Idle,
    /// Outgoing call being placed
    Dialing,
    /// Incoming call ringing, ready to be answered
    Ringing,
    /// User accepted; answer protocol started
    NativeAnswered,
    /// Signaling channel being warmed during initialization
    RtmWarming,
    /// Requesting the answer token bundle from the backend
    TokenFetching,
    /// Joining the RTC transport
    RtcJoining,
    /// Joined, waiting for the remote participant
    Connecting,
    /// Media flowing between both participants
    Connected,
    /// Teardown in progress
    Ending,
    /// Call finished normally
    Ended,
    /// Call declined before answer
    Declined,
    /// Call failed
    Failed,
    /// Caller gave up before anyone answered
    Missed,
}

use CallLifecycleState::*;

impl CallLifecycleState {
    /// Every state, in declaration order
    pub const ALL: [CallLifecycleState; 14] = [
        Idle,
        Dialing,
        Ringing,
        NativeAnswered,
        RtmWarming,
        TokenFetching,
        RtcJoining,
        Connecting,
        Connected,
        Ending,
        Ended,
        Declined,
        Failed,
        Missed,
    ];

    /// States reachable from `self` in one step
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [CallLifecycleState] {
        match self {
            Idle => &[Dialing, Ringing, RtmWarming, Failed, Ended],
            RtmWarming => &[Ringing, Failed, Ended],
            Dialing => &[Ringing, Connecting, Ending, Failed, Ended],
            Ringing => &[
                NativeAnswered,
                Connecting,
                Ending,
                Declined,
                Missed,
                Failed,
                Ended,
            ],
            NativeAnswered => &[TokenFetching, Ending, Failed, Ended],
            TokenFetching => &[RtcJoining, Ending, Failed, Ended],
            RtcJoining => &[Connecting, Ending, Failed, Ended],
            Connecting => &[Connected, Ending, Failed, Ended],
            Connected => &[Ending, Ended, Failed],
            Ending => &[Ended, Declined],
            Ended | Declined | Failed | Missed => &[],
        }
    }

    /// Whether `self → next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: CallLifecycleState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Terminal states have no outgoing transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Ended | Declined | Failed | Missed)
    }

    /// The user has accepted the call and it has not started tearing down
    #[must_use]
    pub fn is_answered(self) -> bool {
        matches!(
            self,
            NativeAnswered | TokenFetching | RtcJoining | Connecting | Connected
        )
    }

    /// Answer already in progress, completed, or no longer meaningful
    #[must_use]
    pub fn is_answering_or_past(self) -> bool {
        self.is_answered() || matches!(self, Ending) || self.is_terminal()
    }

    /// Stable lowercase name, matching the serialized form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Idle => "idle",
            Dialing => "dialing",
            Ringing => "ringing",
            NativeAnswered => "native_answered",
            RtmWarming => "rtm_warming",
            TokenFetching => "token_fetching",
            RtcJoining => "rtc_joining",
            Connecting => "connecting",
            Connected => "connected",
            Ending => "ending",
            Ended => "ended",
            Declined => "declined",
            Failed => "failed",
            Missed => "missed",
        }
    }

    /// Map a backend call status string onto the terminal state it implies
    ///
    /// Unknown statuses are treated as a normal end.
    #[must_use]
    pub fn from_backend_status(status: &str) -> CallLifecycleState {
        match status.trim().to_ascii_lowercase().as_str() {
            "declined" => Declined,
            "missed" | "timeout" | "timed_out" => Missed,
            "failed" | "error" | "unavailable" => Failed,
            _ => Ended,
        }
    }
}

impl fmt::Display for CallLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal kinds that drive state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    /// A call is being offered
    Invite,
    /// The callee's device is ringing
    Ringing,
    /// The callee accepted
    Answer,
    /// The callee refused before answering
    Decline,
    /// Either side hung up
    End,
}

impl SignalType {
    /// All signal kinds
    pub const ALL: [SignalType; 5] = [
        SignalType::Invite,
        SignalType::Ringing,
        SignalType::Answer,
        SignalType::Decline,
        SignalType::End,
    ];

    /// State this signal tries to move a session into
    #[must_use]
    pub fn target_state(self) -> CallLifecycleState {
        match self {
            SignalType::Invite | SignalType::Ringing => Ringing,
            SignalType::Answer => Connecting,
            SignalType::Decline => Declined,
            SignalType::End => Ended,
        }
    }

    /// Wire spelling (`t` field)
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Invite => "INVITE",
            SignalType::Ringing => "RINGING",
            SignalType::Answer => "ANSWER",
            SignalType::Decline => "DECLINE",
            SignalType::End => "END",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply a signal to a state
///
/// Returns the target state when the transition is legal and `current`
/// unchanged otherwise.
#[must_use]
pub fn next_state(current: CallLifecycleState, signal: SignalType) -> CallLifecycleState {
    let target = signal.target_state();
    if current.can_transition_to(target) {
        target
    } else {
        tracing::debug!(
            state = %current,
            signal = %signal,
            "Signal does not apply in current state, ignoring"
        );
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in CallLifecycleState::ALL {
            assert_eq!(state.is_terminal(), state.allowed_transitions().is_empty());
        }
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(next_state(Idle, SignalType::Invite), Ringing);
        assert_eq!(next_state(Ringing, SignalType::Answer), Connecting);
        assert_eq!(next_state(Ringing, SignalType::Decline), Declined);
        assert_eq!(next_state(Connected, SignalType::End), Ended);
        assert_eq!(next_state(Idle, SignalType::End), Ended);
    }

    #[test]
    fn test_illegal_signal_is_noop() {
        assert_eq!(next_state(Ended, SignalType::Invite), Ended);
        assert_eq!(next_state(Connected, SignalType::Answer), Connected);
        assert_eq!(next_state(Connecting, SignalType::Decline), Connecting);
        assert_eq!(next_state(Idle, SignalType::Answer), Idle);
    }

    #[test]
    fn test_answer_progress_predicates() {
        assert!(!Ringing.is_answering_or_past());
        assert!(NativeAnswered.is_answered());
        assert!(Connected.is_answered());
        assert!(!Ending.is_answered());
        assert!(Ending.is_answering_or_past());
        assert!(Missed.is_answering_or_past());
    }

    #[test]
    fn test_backend_status_mapping() {
        assert_eq!(CallLifecycleState::from_backend_status("declined"), Declined);
        assert_eq!(CallLifecycleState::from_backend_status("TIMED_OUT"), Missed);
        assert_eq!(CallLifecycleState::from_backend_status("error"), Failed);
        assert_eq!(CallLifecycleState::from_backend_status("ended"), Ended);
        assert_eq!(CallLifecycleState::from_backend_status("whatever"), Ended);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&NativeAnswered).unwrap_or_default();
        assert_eq!(json, "\"native_answered\"");
        let sig = serde_json::to_string(&SignalType::Decline).unwrap_or_default();
        assert_eq!(sig, "\"DECLINE\"");
    }
}
