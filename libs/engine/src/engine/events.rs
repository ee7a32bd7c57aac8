//! Structured Kubernetes `Event` recording for every non-transient error
//! surfaced by a reconciler — the user-visible surface alongside status
//! Conditions. Thin wrapper over `kube::runtime::events::Recorder`, which
//! already does the `events.k8s.io/v1` `Event` POST; this module only
//! decides what to say.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

use crate::error::{Error, ErrorKind};

/// Builds the `Reporter` identity every recorder in the process shares:
/// `controller` names the logical controller (e.g. the composite's plural
/// kind), `instance` is this replica's pod name when running in-cluster.
pub fn reporter(controller: impl Into<String>) -> Reporter {
    Reporter {
        controller: controller.into(),
        instance: std::env::var("POD_NAME").ok(),
    }
}

pub fn recorder_for(client: Client, controller: impl Into<String>, reference: ObjectReference) -> Recorder {
    Recorder::new(client, reporter(controller), reference)
}

/// Records one `Warning` event for `error`, unless it is transient — a
/// transient error is expected to clear on the next reconcile and recording
/// one for every blip would just spam the object's event history.
pub async fn record_error(recorder: &Recorder, action: &str, error: &Error) {
    if error.kind() == ErrorKind::Transient {
        return;
    }
    let event = Event {
        type_: EventType::Warning,
        reason: error.metric_label().to_string(),
        note: Some(error.to_string()),
        action: action.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event).await {
        tracing::warn!(error = %e, "failed to publish event");
    }
}

pub async fn record_normal(recorder: &Recorder, action: &str, reason: &str, note: impl Into<String>) {
    let event = Event {
        type_: EventType::Normal,
        reason: reason.to_string(),
        note: Some(note.into()),
        action: action.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event).await {
        tracing::warn!(error = %e, "failed to publish event");
    }
}
