//! Background push delivery
//!
//! Entry point for call pushes delivered while the app is not in the
//! foreground. Push providers wrap the call payload differently, so the
//! payload is located by trying a fixed list of shapes in order.

use crate::coordinator::{CallCoordinator, CoordinatorError};
use crate::outcome::BestEffort;
use crate::platform::{FallbackNotifier, PlatformKind};
use crate::types::{CallId, PushSource, VoipPushData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Payload `type` of an intercom call push
pub const INTERCOM_CALL_TYPE: &str = "intercom_call";

/// Where in a notification the call payload was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// `notification.request.content.data`
    NotificationContent,
    /// `data`
    FlatData,
    /// `data.data`
    NestedData,
    /// JSON string in `data.dataString`
    DataStringJson,
    /// JSON string in `data.body`
    BodyJson,
    /// The notification itself
    Bare,
}

impl PayloadShape {
    /// Shapes in matching order
    pub const ALL: [PayloadShape; 6] = [
        PayloadShape::NotificationContent,
        PayloadShape::FlatData,
        PayloadShape::NestedData,
        PayloadShape::DataStringJson,
        PayloadShape::BodyJson,
        PayloadShape::Bare,
    ];

    fn candidate(self, root: &Value) -> Option<Value> {
        match self {
            PayloadShape::NotificationContent => root
                .pointer("/notification/request/content/data")
                .cloned(),
            PayloadShape::FlatData => root.get("data").cloned(),
            PayloadShape::NestedData => root.pointer("/data/data").cloned(),
            PayloadShape::DataStringJson => json_string(root.pointer("/data/dataString")?),
            PayloadShape::BodyJson => json_string(root.pointer("/data/body")?),
            PayloadShape::Bare => Some(root.clone()),
        }
    }
}

fn json_string(value: &Value) -> Option<Value> {
    serde_json::from_str(value.as_str()?).ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntercomCallFields {
    #[serde(rename = "type")]
    kind: String,
    call_id: String,
    from: String,
    #[serde(default)]
    caller_name: Option<String>,
    #[serde(default)]
    from_name: Option<String>,
    #[serde(default)]
    apartment_number: Option<String>,
    #[serde(default)]
    channel_name: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

/// Call announcement extracted from a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    /// Call
    pub call_id: CallId,
    /// Caller peer id
    pub from: String,
    /// `fromName`, then `callerName`, then the default name
    pub caller_name: String,
    /// Apartment
    pub apartment_number: Option<String>,
    /// `channelName`, then `channel`; may be empty
    pub channel_name: String,
}

impl IncomingCallPayload {
    /// Normalised coordinator input
    pub fn into_push_data(self, source: PushSource, should_show_native_ui: bool) -> VoipPushData {
        VoipPushData {
            call_id: self.call_id,
            from: self.from,
            caller_name: Some(self.caller_name),
            apartment_number: self.apartment_number,
            building_name: None,
            channel_name: self.channel_name,
            source,
            should_show_native_ui,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Locate and validate the call payload of a notification
///
/// `default_caller_name` is used when the payload names no caller.
pub fn parse_push_payload(
    notification: &Value,
    default_caller_name: &str,
) -> Option<(PayloadShape, IncomingCallPayload)> {
    PayloadShape::ALL.iter().find_map(|shape| {
        let candidate = shape.candidate(notification)?;
        let fields: IntercomCallFields = serde_json::from_value(candidate).ok()?;
        if fields.kind != INTERCOM_CALL_TYPE {
            return None;
        }
        let payload = IncomingCallPayload {
            call_id: CallId::new(fields.call_id),
            from: fields.from,
            caller_name: non_empty(fields.from_name)
                .or_else(|| non_empty(fields.caller_name))
                .unwrap_or_else(|| default_caller_name.to_string()),
            apartment_number: non_empty(fields.apartment_number),
            channel_name: non_empty(fields.channel_name)
                .or_else(|| non_empty(fields.channel))
                .unwrap_or_default(),
        };
        Some((*shape, payload))
    })
}

/// What happened to a delivered notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Android app in the foreground; its own listener handles the push
    SkippedForeground,
    /// The task was invoked with an error
    SkippedTaskError,
    /// User tapped the notification; not a new call
    SkippedResponseEvent,
    /// Not an intercom call payload
    NotIntercomCall,
    /// Handed to the coordinator
    Delivered {
        /// Call
        call_id: CallId,
    },
    /// The coordinator could not set the call up
    Failed {
        /// Call
        call_id: CallId,
        /// Why
        error: CoordinatorError,
    },
}

/// Background push handler
pub struct BackgroundDelivery {
    coordinator: CallCoordinator,
    platform: PlatformKind,
    notifier: Option<Arc<dyn FallbackNotifier>>,
    default_caller_name: String,
}

impl BackgroundDelivery {
    /// Create a handler
    pub fn new(
        coordinator: CallCoordinator,
        platform: PlatformKind,
        notifier: Option<Arc<dyn FallbackNotifier>>,
        default_caller_name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            platform,
            notifier,
            default_caller_name: default_caller_name.into(),
        }
    }

    /// Handle one background notification task invocation
    #[tracing::instrument(skip(self, data, task_error), fields(platform = ?self.platform))]
    pub async fn on_notification(
        &self,
        data: Option<&Value>,
        task_error: Option<&str>,
        app_in_foreground: bool,
    ) -> DeliveryOutcome {
        if self.platform == PlatformKind::Android && app_in_foreground {
            tracing::debug!("App in foreground, leaving push to the foreground listener");
            return DeliveryOutcome::SkippedForeground;
        }
        if let Some(error) = task_error {
            tracing::error!(error, "Background notification task failed");
            return DeliveryOutcome::SkippedTaskError;
        }
        let Some(data) = data else {
            return DeliveryOutcome::NotIntercomCall;
        };
        if data.get("actionIdentifier").is_some() {
            tracing::debug!("Notification response event, ignoring");
            return DeliveryOutcome::SkippedResponseEvent;
        }

        let Some((shape, payload)) = parse_push_payload(data, &self.default_caller_name) else {
            tracing::debug!("Notification is not an intercom call");
            return DeliveryOutcome::NotIntercomCall;
        };
        let call_id = payload.call_id.clone();
        tracing::info!(call_id = %call_id, shape = ?shape, "Intercom call push received");

        self.coordinator.initialize(false).await;
        let native_ui = self.coordinator.native_ui_available();
        let push = payload.into_push_data(PushSource::Background, native_ui);

        if !native_ui && self.platform == PlatformKind::Android {
            match &self.notifier {
                Some(notifier) => {
                    tracing::warn!(call_id = %call_id, "Native call UI unavailable, showing fallback notification");
                    BestEffort::from_result(
                        "fallback_notification",
                        notifier.show_incoming_call(&push).await,
                    )
                    .log();
                }
                None => tracing::warn!(call_id = %call_id, "No native call UI and no fallback notifier"),
            }
        }

        match self.coordinator.handle_incoming_push(push).await {
            Ok(()) => DeliveryOutcome::Delivered { call_id },
            Err(error) => DeliveryOutcome::Failed { call_id, error },
        }
    }
}
