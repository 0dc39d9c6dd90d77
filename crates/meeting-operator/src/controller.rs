//! The AutoScaler control loop.
//!
//! Every AutoScaler moves through three states:
//!
//! - `Pending`: no finalizer yet. The finalizer is added and the reconcile
//!   carries on as `Active`.
//! - `Active`: the metric is sampled, the [policy](crate::policy) computes the
//!   replica count and the scale target is resized. The next reconcile is
//!   scheduled after `spec.interval`.
//! - `Terminating`: the deletion timestamp is set. The finalizer is removed and
//!   nothing is requeued, the API server then garbage collects the object.
//!
//! [`reconcile_autoscaler`] holds the logic and is independent of the kube
//! runtime. [`run`] wires it into a [`kube::runtime::Controller`].

use std::{future::Future, sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    Api, ResourceExt,
    core::DynamicObject,
    runtime::{
        Controller,
        controller::{self, Action},
        reflector::ObjectRef,
        watcher,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    client::Client,
    crd::{AutoScaler, AutoScalerSpec, FINALIZER, ValidationError},
    error::ErrorKind,
    finalizer::{self, FinalizerStore, has_deletion_stamp},
    logging::controller::{ReconcilerError, report_controller_reconciled},
    metrics::{self, MetricSource},
    policy,
    target::{self, TargetStore},
};

pub const FULL_CONTROLLER_NAME: &str = "autoscaler.meeting.jitsi.io";

/// Delay before a failed reconcile is retried.
pub const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("AutoScaler {name} has no namespace"))]
    MissingNamespace { name: String },

    /// Returned by [`ScalingLoop::new`] for objects with a deletion timestamp.
    #[snafu(display("AutoScaler {namespace}/{name} is being deleted"))]
    UnderDeletion { name: String, namespace: String },

    #[snafu(display("AutoScaler has an invalid spec"))]
    InvalidSpec { source: ValidationError },

    #[snafu(display("failed to set up the metric source"))]
    MetricSource { source: metrics::ConfigError },

    #[snafu(display("failed to add finalizer"))]
    AddFinalizer { source: finalizer::Error },

    #[snafu(display("failed to remove finalizer"))]
    RemoveFinalizer { source: finalizer::Error },

    #[snafu(display("failed to load scale target"))]
    LoadTarget { source: target::Error },

    #[snafu(display("failed to write replicas"))]
    WriteReplicas { source: target::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingNamespace { .. } | Self::InvalidSpec { .. } => ErrorKind::InvalidConfig,
            Self::UnderDeletion { .. } => ErrorKind::UnderDeletion,
            Self::MetricSource { source } => source.kind(),
            Self::AddFinalizer { source } | Self::RemoveFinalizer { source } => source.kind(),
            Self::LoadTarget { source } | Self::WriteReplicas { source } => source.kind(),
        }
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn kind(&self) -> ErrorKind {
        Self::kind(self)
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::LoadTarget { source } | Self::WriteReplicas { source } => {
                Some(source.target_ref())
            }
            _ => None,
        }
    }
}

/// What the controller should do once a reconcile returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Run the loop again after the given delay.
    Requeue(Duration),

    /// Wait until the object changes.
    Done,
}

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction::Requeue(interval) => Action::requeue(interval),
            ReconcileAction::Done => Action::await_change(),
        }
    }
}

/// One control loop, built from a snapshot of an AutoScaler.
///
/// Only the name and namespace of the object are kept besides its spec. Nothing
/// is cached across reconciles.
pub struct ScalingLoop {
    pub name: String,
    pub namespace: String,
    spec: AutoScalerSpec,
    source: Box<dyn MetricSource>,
}

impl ScalingLoop {
    /// Validates `autoscaler` and constructs the metric source its spec selects.
    ///
    /// Fails with [`Error::UnderDeletion`] if the object is being deleted.
    pub fn new(autoscaler: &AutoScaler) -> Result<Self, Error> {
        let name = autoscaler.name_any();
        let namespace = autoscaler
            .namespace()
            .context(MissingNamespaceSnafu { name: name.clone() })?;

        if has_deletion_stamp(autoscaler) {
            return UnderDeletionSnafu { name, namespace }.fail();
        }

        let spec = autoscaler.spec.clone();
        spec.validate().context(InvalidSpecSnafu)?;
        let source = metrics::source_for(&spec).context(MetricSourceSnafu)?;

        Ok(Self {
            name,
            namespace,
            spec,
            source,
        })
    }

    /// Samples the metric, computes the replica count and writes it to the scale target.
    ///
    /// Returns the replica count that was written.
    pub async fn scale(&self, targets: &impl TargetStore) -> Result<i32, Error> {
        let sample = self.source.sample_average(&self.spec.metric.name).await;

        let target = targets
            .load_target(&self.namespace, &self.spec.scale_target_ref.name)
            .await
            .context(LoadTargetSnafu)?;

        let desired = policy::desired_replicas(
            sample.average,
            self.spec.metric.target_average_utilization,
            target.replicas,
            self.spec.min_replicas,
            self.spec.max_replicas,
        );

        tracing::info!(
            scale_target = %target.name,
            average = sample.average,
            degraded = sample.is_degraded(),
            current_replicas = target.replicas,
            desired_replicas = desired,
            "resizing scale target"
        );

        targets
            .write_replicas(&target, desired)
            .await
            .context(WriteReplicasSnafu)?;

        Ok(desired)
    }

    pub fn requeue_interval(&self) -> Duration {
        self.spec.requeue_interval().into()
    }
}

/// Runs one reconcile of `autoscaler` against `store`.
///
/// Misconfigured objects are logged and not requeued, a fixed spec triggers
/// the next reconcile. Missing AutoScalers are ignored.
pub async fn reconcile_autoscaler<S>(
    autoscaler: &AutoScaler,
    store: &S,
) -> Result<ReconcileAction, Error>
where
    S: FinalizerStore + TargetStore,
{
    let scaling_loop = match ScalingLoop::new(autoscaler) {
        Err(Error::UnderDeletion { .. }) => return terminate(autoscaler, store).await,
        result => result,
    };

    match store.add_finalizer(autoscaler, FINALIZER).await {
        Ok(true) => tracing::debug!("added finalizer"),
        Ok(false) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {
            tracing::debug!("AutoScaler is gone, skipping");
            return Ok(ReconcileAction::Done);
        }
        Err(error) => return Err(error).context(AddFinalizerSnafu),
    }

    let scaling_loop = match scaling_loop {
        Ok(scaling_loop) => scaling_loop,
        Err(error) if error.kind() == ErrorKind::InvalidConfig => {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                "AutoScaler is misconfigured, waiting for it to be fixed"
            );
            return Ok(ReconcileAction::Done);
        }
        Err(error) => return Err(error),
    };

    scaling_loop.scale(store).await?;
    Ok(ReconcileAction::Requeue(scaling_loop.requeue_interval()))
}

async fn terminate(
    autoscaler: &AutoScaler,
    store: &impl FinalizerStore,
) -> Result<ReconcileAction, Error> {
    match store.remove_finalizer(autoscaler, FINALIZER).await {
        Ok(removed) => {
            tracing::info!(finalizer_removed = removed, "AutoScaler is being deleted");
            Ok(ReconcileAction::Done)
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(ReconcileAction::Done),
        Err(error) => Err(error).context(RemoveFinalizerSnafu),
    }
}

/// Shared state handed to every reconcile.
pub struct Ctx {
    pub client: Client,
}

#[tracing::instrument(
    skip_all,
    fields(
        autoscaler.name = %autoscaler.name_any(),
        autoscaler.namespace = %autoscaler.namespace().unwrap_or_default(),
    )
)]
#[allow(clippy::needless_pass_by_value)]
pub async fn reconcile(autoscaler: Arc<AutoScaler>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    reconcile_autoscaler(&autoscaler, &ctx.client)
        .await
        .map(Action::from)
}

/// Retries a failed reconcile after [`ERROR_REQUEUE_INTERVAL`].
///
/// The delay is fixed, there is no exponential backoff. Failing AutoScalers are
/// retried at most every few seconds and pick up a fixed scale target quickly.
#[allow(clippy::needless_pass_by_value)]
pub fn error_policy(_autoscaler: Arc<AutoScaler>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::debug!(
        kind = %error.kind(),
        retry_in = ?ERROR_REQUEUE_INTERVAL,
        "requeueing failed reconcile"
    );
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// Settings of the AutoScaler controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Only watch AutoScalers in this namespace, all namespaces if unset.
    pub watch_namespace: Option<String>,

    /// Number of AutoScalers reconciled in parallel.
    pub concurrency: u16,
}

/// Runs the AutoScaler controller until `shutdown` completes.
pub async fn run<F>(client: Client, options: ControllerOptions, shutdown: F)
where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let api: Api<AutoScaler> = match &options.watch_namespace {
        Some(namespace) => Api::namespaced(client.as_kube_client(), namespace),
        None => Api::all(client.as_kube_client()),
    };

    tracing::info!(
        controller.name = FULL_CONTROLLER_NAME,
        watch_namespace = options.watch_namespace.as_deref().unwrap_or("<all>"),
        concurrency = options.concurrency,
        "starting controller"
    );

    let ctx = Arc::new(Ctx {
        client: client.clone(),
    });

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(options.concurrency))
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            report_controller_reconciled(&client, FULL_CONTROLLER_NAME, &result);
            futures::future::ready(())
        })
        .await;
}
