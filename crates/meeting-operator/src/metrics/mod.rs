//! Metric sources sampled by the autoscaler.
//!
//! A [`MetricSource`] answers a single question: what was the average load of
//! the JVB pool over the last [`LOOKBACK_WINDOW`]? Two backends are supported,
//! selected by `spec.backendType`:
//!
//! - [`PrometheusSource`] issues a range query against a Prometheus compatible
//!   HTTP API (`rangeTSDB`).
//! - [`InfluxDbSource`] runs a Flux query against an InfluxDB 2 bucket
//!   (`bucketTSDB`).
//!
//! Backend failures never fail a reconcile. [`MetricSource::sample_average`]
//! logs them and falls back to [`MetricSource::degraded_average`].

use std::time::Duration;

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{crd::AutoScalerSpec, error::ErrorKind};

mod influxdb;
mod prometheus;

pub use influxdb::InfluxDbSource;
pub use prometheus::PrometheusSource;

/// How far back each sample looks.
pub const LOOKBACK_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Hard cap for a single backend request.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("metric {name:?} is not one of cpu, conferences or participants"))]
    InvalidMetric { name: String },

    #[snafu(display("failed to send query to {url}"))]
    SendQuery { source: reqwest::Error, url: String },

    #[snafu(display("failed to read the response body"))]
    ReadResponse { source: reqwest::Error },

    #[snafu(display("backend answered with HTTP status {status}: {body}"))]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[snafu(display("failed to decode the query response"))]
    DecodeResponse { source: serde_json::Error },

    #[snafu(display("failed to parse the CSV query response"))]
    ParseCsv { source: csv::Error },

    #[snafu(display("query failed: {message}"))]
    QueryFailed { message: String },

    #[snafu(display("expected a matrix result, got {result_type:?}"))]
    UnexpectedResultType { result_type: String },

    #[snafu(display("query for {metric} returned no series"))]
    NoSeries { metric: MetricName },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMetric { .. } => ErrorKind::InvalidMetric,
            _ => ErrorKind::TransientSource,
        }
    }
}

/// Errors raised while building a [`MetricSource`] from an AutoScaler spec.
#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display(
        "unknown backend type {backend_type:?}, expected one of rangeTSDB or bucketTSDB"
    ))]
    UnknownBackend { backend_type: String },

    #[snafu(display("invalid backend host {host:?}"))]
    InvalidHost {
        source: url::ParseError,
        host: String,
    },

    #[snafu(display("bucketTSDB requires a bucket"))]
    MissingBucket,

    #[snafu(display("failed to build the HTTP client"))]
    BuildClient { source: reqwest::Error },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BuildClient { .. } => ErrorKind::Unknown,
            _ => ErrorKind::InvalidConfig,
        }
    }
}

/// The metric backend flavours an AutoScaler can point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BackendType {
    /// Pull-style time series database queried over a time range.
    #[strum(to_string = "rangeTSDB", serialize = "prometheus")]
    RangeTsdb,

    /// Push-style time series database queried per bucket.
    #[strum(to_string = "bucketTSDB", serialize = "influxdb")]
    BucketTsdb,
}

/// The load metrics an AutoScaler can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MetricName {
    Cpu,
    Conferences,
    Participants,
}

impl MetricName {
    /// The PromQL expression sampled by [`PrometheusSource`].
    pub fn range_query(self) -> &'static str {
        match self {
            Self::Cpu => {
                r#"rate(container_cpu_usage_seconds_total{container="jvb",id=~"/kubelet.*"}[5m])"#
            }
            Self::Conferences => r#"jitsi_conferences{job=~"exporter-jvb-.*"}"#,
            Self::Participants => r#"jitsi_participants{job=~"exporter-jvb-.*"}"#,
        }
    }

    /// The `_field` filtered on by [`InfluxDbSource`].
    pub fn bucket_field(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Conferences => "conferences",
            Self::Participants => "participants",
        }
    }
}

/// Result of [`MetricSource::sample_average`].
///
/// `error` is set when `average` is a fallback rather than a real measurement.
#[derive(Debug)]
pub struct Sample {
    pub average: f64,
    pub error: Option<Error>,
}

impl Sample {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// The average reported when the backend cannot be queried.
    fn degraded_average(&self) -> f64;

    /// Queries the backend for the pool-wide average of `metric`.
    async fn query_average(&self, metric: MetricName) -> Result<f64, Error>;

    /// Samples `metric` without ever failing.
    ///
    /// Unknown metric names average to `0.0`, backend errors to
    /// [`Self::degraded_average`]. Both are logged and returned alongside the
    /// value.
    async fn sample_average(&self, metric: &str) -> Sample {
        let Ok(metric_name) = metric.parse::<MetricName>() else {
            let error = InvalidMetricSnafu { name: metric }.build();
            tracing::error!(
                error = &error as &dyn std::error::Error,
                backend = %self.backend_type(),
                "unsupported metric, sampling as 0"
            );
            return Sample {
                average: 0.0,
                error: Some(error),
            };
        };

        match self.query_average(metric_name).await {
            Ok(average) => {
                tracing::debug!(
                    backend = %self.backend_type(),
                    metric = %metric_name,
                    average,
                    "sampled metric"
                );
                Sample {
                    average,
                    error: None,
                }
            }
            Err(error) => {
                let average = self.degraded_average();
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    backend = %self.backend_type(),
                    metric = %metric_name,
                    average,
                    "failed to sample metric, using degraded value"
                );
                Sample {
                    average,
                    error: Some(error),
                }
            }
        }
    }
}

/// Builds the metric source selected by `spec.backendType`.
pub fn source_for(spec: &AutoScalerSpec) -> Result<Box<dyn MetricSource>, ConfigError> {
    let backend_type = spec
        .backend_type
        .trim()
        .parse::<BackendType>()
        .ok()
        .context(UnknownBackendSnafu {
            backend_type: spec.backend_type.clone(),
        })?;

    let auth = spec.auth.as_ref();
    match backend_type {
        BackendType::RangeTsdb => Ok(Box::new(PrometheusSource::new(
            &spec.host,
            auth,
            QUERY_TIMEOUT,
        )?)),
        BackendType::BucketTsdb => {
            let bucket = spec
                .bucket
                .as_deref()
                .filter(|bucket| !bucket.trim().is_empty())
                .context(MissingBucketSnafu)?;

            Ok(Box::new(InfluxDbSource::new(
                &spec.host,
                bucket,
                spec.org.as_deref(),
                auth.and_then(|auth| auth.token.as_deref()),
                QUERY_TIMEOUT,
            )?))
        }
    }
}

/// Parses `host` as a base URL that paths can be joined onto.
pub(crate) fn base_url(host: &str) -> Result<url::Url, ConfigError> {
    let trimmed = host.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };

    url::Url::parse(&with_slash).context(InvalidHostSnafu { host })
}
