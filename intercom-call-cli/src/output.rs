//! Text and JSON rendering for CLI results

use anyhow::Result;
use clap::ValueEnum;
use intercom_call_core::api::CallDetails;
use intercom_call_core::push::{IncomingCallPayload, PayloadShape};
use intercom_call_core::signaling::{InboundKind, InboundSignal};
use intercom_call_core::state_machine::{next_state, CallLifecycleState, SignalType};
use serde_json::{json, Value};
use std::fmt::Write;

/// Output format selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// Pretty-printed JSON
    Json,
}

fn pretty(value: &Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Transition table, optionally restricted to one source state
pub fn render_transitions(format: OutputFormat, from: Option<CallLifecycleState>) -> Result<String> {
    let states: Vec<CallLifecycleState> = match from {
        Some(state) => vec![state],
        None => CallLifecycleState::ALL.to_vec(),
    };

    match format {
        OutputFormat::Json => {
            let rows: Vec<Value> = states
                .iter()
                .map(|state| {
                    let signals: serde_json::Map<String, Value> = SignalType::ALL
                        .iter()
                        .map(|signal| {
                            (signal.as_str().to_string(), json!(next_state(*state, *signal).as_str()))
                        })
                        .collect();
                    json!({
                        "state": state.as_str(),
                        "terminal": state.is_terminal(),
                        "allowed": state.allowed_transitions().iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                        "signals": signals,
                    })
                })
                .collect();
            pretty(&Value::Array(rows))
        }
        OutputFormat::Text => {
            let mut out = String::new();
            for state in states {
                let allowed: Vec<&str> = state.allowed_transitions().iter().map(|s| s.as_str()).collect();
                let allowed = if allowed.is_empty() {
                    "(terminal)".to_string()
                } else {
                    allowed.join(", ")
                };
                writeln!(out, "{:<16} -> {}", state.as_str(), allowed)?;
            }
            Ok(out)
        }
    }
}

/// Result of locating a call payload in a notification
pub fn render_push(
    format: OutputFormat,
    parsed: Option<&(PayloadShape, IncomingCallPayload)>,
) -> Result<String> {
    match (format, parsed) {
        (OutputFormat::Json, Some((shape, payload))) => {
            pretty(&json!({ "intercomCall": true, "shape": shape, "payload": payload }))
        }
        (OutputFormat::Json, None) => pretty(&json!({ "intercomCall": false })),
        (OutputFormat::Text, Some((shape, payload))) => {
            let mut out = String::new();
            writeln!(out, "intercom call ({shape:?})")?;
            writeln!(out, "  call id:   {}", payload.call_id)?;
            writeln!(out, "  from:      {}", payload.from)?;
            writeln!(out, "  caller:    {}", payload.caller_name)?;
            writeln!(
                out,
                "  apartment: {}",
                payload.apartment_number.as_deref().unwrap_or("-")
            )?;
            let channel = if payload.channel_name.is_empty() {
                payload.call_id.default_channel_name()
            } else {
                payload.channel_name.clone()
            };
            writeln!(out, "  channel:   {channel}")?;
            Ok(out)
        }
        (OutputFormat::Text, None) => Ok("not an intercom call\n".to_string()),
    }
}

fn kind_name(kind: &InboundKind) -> String {
    match kind {
        InboundKind::Signal(signal) => signal.as_str().to_string(),
        InboundKind::Other(raw) => format!("other:{raw}"),
    }
}

/// How the coordinator would treat a signaling message
pub fn render_signal(format: OutputFormat, signal: &InboundSignal) -> Result<String> {
    let handling = if signal.is_end_like() {
        "remote end (applies to the active call only)"
    } else if signal.is_invite() {
        "incoming call announcement"
    } else {
        "ignored"
    };
    let call_id = signal.call_id.as_ref().map(|id| id.as_str().to_string());

    match format {
        OutputFormat::Json => pretty(&json!({
            "kind": kind_name(&signal.kind),
            "callId": call_id,
            "from": signal.from,
            "callerName": signal.caller_name,
            "channel": signal.channel,
            "reason": signal.reason,
            "endLike": signal.is_end_like(),
            "invite": signal.is_invite(),
            "handling": handling,
        })),
        OutputFormat::Text => {
            let mut out = String::new();
            writeln!(out, "kind:     {}", kind_name(&signal.kind))?;
            writeln!(out, "call id:  {}", call_id.as_deref().unwrap_or("-"))?;
            writeln!(out, "from:     {}", signal.from.as_deref().unwrap_or("-"))?;
            if let Some(reason) = &signal.reason {
                writeln!(out, "reason:   {reason}")?;
            }
            writeln!(out, "handling: {handling}")?;
            Ok(out)
        }
    }
}

/// Terminal state a closed call maps to, `None` while still open
pub fn implied_final_state(details: &CallDetails) -> Option<CallLifecycleState> {
    details.is_remotely_closed().then(|| {
        CallLifecycleState::from_backend_status(details.status.as_deref().unwrap_or("ended"))
    })
}

/// Backend call status
pub fn render_status(format: OutputFormat, details: &CallDetails) -> Result<String> {
    let final_state = implied_final_state(details);
    match format {
        OutputFormat::Json => pretty(&json!({
            "details": details,
            "remotelyClosed": details.is_remotely_closed(),
            "finalState": final_state.map(CallLifecycleState::as_str),
        })),
        OutputFormat::Text => {
            let mut out = String::new();
            writeln!(out, "call:         {}", details.call_id)?;
            writeln!(out, "status:       {}", details.status.as_deref().unwrap_or("-"))?;
            writeln!(out, "doorman:      {}", details.doorman_name.as_deref().unwrap_or("-"))?;
            writeln!(
                out,
                "apartment:    {}",
                details.apartment_number.as_deref().unwrap_or("-")
            )?;
            writeln!(out, "channel:      {}", details.channel_name)?;
            writeln!(out, "participants: {}", details.participant_ids().join(", "))?;
            match final_state {
                Some(state) => writeln!(out, "closed:       yes ({state})")?,
                None => writeln!(out, "closed:       no")?,
            }
            Ok(out)
        }
    }
}
