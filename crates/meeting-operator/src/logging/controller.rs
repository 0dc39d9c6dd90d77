//! Reporting of reconcile results to the operator log and to AutoScaler owners.

use std::error::Error;

use kube::{
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use crate::{
    client::Client, crd::AutoScaler, error::ErrorKind, logging::k8s_events::publish_reconcile_error,
};

/// Errors a reconcile can end with.
pub trait ReconcilerError: Error {
    /// `PascalCase` name of the failed step, used as the event reason.
    ///
    /// Usually delegates to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    fn kind(&self) -> ErrorKind;

    /// The object the failed step worked on, if it is not the AutoScaler itself.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Whether the owner of an AutoScaler is told about an error with a Warning event.
///
/// Lost write races settle on the retry and are only logged.
pub fn is_user_facing(kind: ErrorKind) -> bool {
    !matches!(kind, ErrorKind::Conflict)
}

/// Logs the outcome of one reconcile and publishes failed ones as events.
pub fn report_controller_reconciled<ReconcileErr, QueueErr>(
    client: &Client,
    controller_name: &str,
    result: &Result<(ObjectRef<AutoScaler>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    match result {
        Ok((autoscaler, action)) => {
            tracing::debug!(
                controller.name = controller_name,
                %autoscaler,
                ?action,
                "reconciled AutoScaler"
            );
        }
        Err(controller::Error::ReconcilerFailed(error, autoscaler)) => {
            let kind = error.kind();
            if is_user_facing(kind) {
                tracing::error!(
                    controller.name = controller_name,
                    %autoscaler,
                    %kind,
                    error = error as &dyn Error,
                    "failed to reconcile AutoScaler"
                );
                publish_reconcile_error(
                    client,
                    controller_name,
                    error,
                    &autoscaler.clone().into_kind_unchecked::<AutoScaler>(()),
                );
            } else {
                tracing::warn!(
                    controller.name = controller_name,
                    %autoscaler,
                    %kind,
                    error = error as &dyn Error,
                    "reconcile lost a race, retrying"
                );
            }
        }
        // Watch and queue failures are not tied to one AutoScaler
        Err(error) => {
            tracing::error!(
                controller.name = controller_name,
                error = error as &dyn Error,
                "controller failed"
            );
        }
    }
}
