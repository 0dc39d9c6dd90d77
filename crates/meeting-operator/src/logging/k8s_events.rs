//! Warning events on AutoScalers whose reconcile failed.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    events::{Event, EventType, Recorder, Reporter},
    reflector::ObjectRef,
};
use tracing::Instrument;

use super::controller::ReconcilerError;
use crate::{client::Client, crd::AutoScaler};

/// Events carry at most this many bytes of error message.
const MAX_NOTE_LEN: usize = 1024;

const ELLIPSIS: char = '…';

/// Builds the event describing `error`, with the whole source chain as note.
pub(crate) fn error_to_event<E: ReconcilerError>(error: &E) -> Event {
    let mut note = error.to_string();
    for source in std::iter::successors(error.source(), |&source| source.source()) {
        note.push_str(": ");
        note.push_str(&source.to_string());
    }
    truncate_note(&mut note);

    Event {
        type_: EventType::Warning,
        reason: error.category().to_owned(),
        note: Some(note),
        action: "Autoscale".to_owned(),
        secondary: error.secondary_object().map(Into::into),
    }
}

/// Publishes `error` on `autoscaler` in the background.
pub fn publish_reconcile_error<E: ReconcilerError>(
    client: &Client,
    controller_name: &str,
    error: &E,
    autoscaler: &ObjectRef<AutoScaler>,
) {
    let recorder = Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: controller_name.to_owned(),
            instance: None,
        },
    );
    let reference: ObjectReference = autoscaler.clone().into();
    let event = error_to_event(error);

    tokio::spawn(
        async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to publish reconcile error as event"
                );
            }
        }
        .in_current_span(),
    );
}

/// Cuts `note` down to [`MAX_NOTE_LEN`] bytes on a char boundary, marking the cut.
fn truncate_note(note: &mut String) {
    if note.len() <= MAX_NOTE_LEN {
        return;
    }

    let budget = MAX_NOTE_LEN - ELLIPSIS.len_utf8();
    let end = note
        .char_indices()
        .map(|(index, _)| index)
        .take_while(|&index| index <= budget)
        .last()
        .unwrap_or_default();
    note.truncate(end);
    note.push(ELLIPSIS);
}
