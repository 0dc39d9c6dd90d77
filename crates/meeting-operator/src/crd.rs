//! The `AutoScaler` custom resource.
//!
//! `backendType` and `metric.name` are plain strings in the schema. Objects
//! carrying unknown values still reach the controller, which reports them
//! instead of the watcher dropping objects it cannot decode.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::time::{Duration, DurationParseError};

pub const APP_GROUP: &str = "meeting.jitsi.io";

/// Marks an AutoScaler as managed by this operator while it is live.
pub const FINALIZER: &str = "meeting-operator/autoscaler";

/// Used when `interval` is empty or cannot be parsed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidationError {
    #[snafu(display("targetAverageUtilization must be greater than zero, got {target}"))]
    NonPositiveTarget { target: i32 },

    #[snafu(display("minReplicas must not be negative, got {min_replicas}"))]
    NegativeMinReplicas { min_replicas: i32 },

    #[snafu(display(
        "minReplicas ({min_replicas}) must not be greater than maxReplicas ({max_replicas})"
    ))]
    InvertedBounds {
        min_replicas: i32,
        max_replicas: i32,
    },

    #[snafu(display("scaleTargetRef.name must not be empty"))]
    EmptyTargetName,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("failed to parse interval {interval:?}"))]
pub struct IntervalError {
    interval: String,
    source: DurationParseError,
}

/// A control loop sizing one JVB pool from a metric sample.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "meeting.jitsi.io",
    version = "v1alpha1",
    kind = "AutoScaler",
    plural = "autoscalers",
    shortname = "as",
    namespaced,
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalerSpec {
    /// The metrics backend to sample: `rangeTSDB` (Prometheus) or `bucketTSDB` (InfluxDB).
    pub backend_type: String,

    /// URL of the metrics backend, for example `http://prometheus.monitoring:9090`.
    pub host: String,

    /// Credentials for the metrics backend. Prometheus uses `token` as bearer token or
    /// `login`/`password` as basic auth, InfluxDB uses `token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BackendAuth>,

    /// InfluxDB bucket to query. Only used by `bucketTSDB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// InfluxDB organization owning the bucket. Only used by `bucketTSDB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,

    /// The JVB resource in the same namespace whose `spec.replicas` is controlled.
    pub scale_target_ref: ScaleTargetRef,

    pub metric: MetricSpec,

    #[schemars(range(min = 0))]
    pub min_replicas: i32,

    #[schemars(range(min = 0))]
    pub max_replicas: i32,

    /// Time between two reconciles, for example `30s` or `1m`. Defaults to `30s`.
    #[serde(default)]
    pub interval: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    #[schemars(length(min = 1))]
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    /// One of `cpu`, `conferences` or `participants`.
    pub name: String,

    /// The load per replica the autoscaler aims to maintain.
    #[schemars(range(min = 1))]
    pub target_average_utilization: i32,
}

impl AutoScalerSpec {
    /// Checks the invariants the schema cannot express on its own.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let target = self.metric.target_average_utilization;
        if target <= 0 {
            return NonPositiveTargetSnafu { target }.fail();
        }

        if self.min_replicas < 0 {
            return NegativeMinReplicasSnafu {
                min_replicas: self.min_replicas,
            }
            .fail();
        }

        if self.min_replicas > self.max_replicas {
            return InvertedBoundsSnafu {
                min_replicas: self.min_replicas,
                max_replicas: self.max_replicas,
            }
            .fail();
        }

        if self.scale_target_ref.name.trim().is_empty() {
            return EmptyTargetNameSnafu.fail();
        }

        Ok(())
    }

    /// Parses `interval`, returning [`None`] if it is empty.
    pub fn interval(&self) -> Result<Option<Duration>, IntervalError> {
        let interval = self.interval.trim();
        if interval.is_empty() {
            return Ok(None);
        }

        interval.parse().map(Some).context(IntervalSnafu {
            interval: self.interval.clone(),
        })
    }

    /// The delay before the next reconcile, falling back to [`DEFAULT_INTERVAL`].
    ///
    /// A zero interval would requeue immediately and is replaced as well.
    pub fn requeue_interval(&self) -> Duration {
        match self.interval() {
            Ok(Some(interval)) if interval.is_zero() => {
                tracing::warn!(
                    interval = %self.interval,
                    fallback = %DEFAULT_INTERVAL,
                    "zero interval, using the default"
                );
                DEFAULT_INTERVAL
            }
            Ok(Some(interval)) => interval,
            Ok(None) => DEFAULT_INTERVAL,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    fallback = %DEFAULT_INTERVAL,
                    "invalid interval, using the default"
                );
                DEFAULT_INTERVAL
            }
        }
    }
}
