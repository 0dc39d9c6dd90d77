//! Tracing subscriber setup and reconcile reporting.
//!
//! [`Tracing`] installs up to three layers, each with its own level filter:
//!
//! - console output, level from `CONSOLE_LOG_LEVEL`
//! - rolling JSON log files, level from `FILE_LOG_LEVEL`
//! - OpenTelemetry trace export via OTLP, level from `OTEL_TRACE_EXPORTER_LEVEL`
//!
//! Each variable accepts anything [`EnvFilter`] understands, for example
//! `meeting_operator=debug,kube=info`.

use std::path::{Path, PathBuf};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{ExporterBuildError, SpanExporter};
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace::SdkTracerProvider};
use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

pub mod controller;
pub mod k8s_events;

pub const CONSOLE_LOG_LEVEL_ENV: &str = "CONSOLE_LOG_LEVEL";
pub const FILE_LOG_LEVEL_ENV: &str = "FILE_LOG_LEVEL";
pub const OTEL_TRACE_EXPORTER_LEVEL_ENV: &str = "OTEL_TRACE_EXPORTER_LEVEL";

const MAX_LOG_FILES: usize = 6;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to install opentelemetry trace exporter"))]
    InstallOtelTraceExporter { source: ExporterBuildError },

    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Options for the telemetry layers, usable as flattened CLI arguments.
#[derive(clap::Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[arg(long, env)]
    pub console_log_disabled: bool,

    /// Enable logging to files located in the specified DIRECTORY.
    #[arg(long, env, value_name = "DIRECTORY", group = "file_log")]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[arg(long, env, value_name = "PERIOD", requires = "file_log")]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Enable exporting OTEL traces via OTLP.
    #[arg(long, env)]
    pub otel_trace_exporter_enabled: bool,
}

/// Supported periods when the log file is rolled over.
#[derive(
    clap::ValueEnum, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

/// Guard owning the installed subscriber's exporters.
///
/// Must be kept alive for the lifetime of the process, dropping it flushes and
/// shuts down the OTLP exporter.
pub struct Tracing {
    service_name: &'static str,
    options: TelemetryOptions,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Tracing {
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        Self {
            service_name,
            options,
            tracer_provider: None,
        }
    }

    /// Installs the configured layers as the global default subscriber.
    pub fn init(mut self) -> Result<Self, Error> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

        if !self.options.console_log_disabled {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_filter(env_filter(CONSOLE_LOG_LEVEL_ENV, LevelFilter::INFO))
                    .boxed(),
            );
        }

        if let Some(file_log_directory) = &self.options.file_log_directory {
            let rotation_period = self
                .options
                .file_log_rotation_period
                .clone()
                .unwrap_or_default();

            let file_appender = self.file_appender(file_log_directory, rotation_period)?;

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(file_appender)
                    .with_filter(env_filter(FILE_LOG_LEVEL_ENV, LevelFilter::INFO))
                    .boxed(),
            );
        }

        if self.options.otel_trace_exporter_enabled {
            let trace_exporter = SpanExporter::builder()
                .with_tonic()
                .build()
                .context(InstallOtelTraceExporterSnafu)?;

            let tracer_provider = SdkTracerProvider::builder()
                .with_batch_exporter(trace_exporter)
                .with_resource(
                    Resource::builder()
                        .with_service_name(self.service_name)
                        .build(),
                )
                .build();

            let tracer = tracer_provider.tracer(self.service_name);
            let mut filter = env_filter(OTEL_TRACE_EXPORTER_LEVEL_ENV, LevelFilter::INFO);
            // The exporter's own gRPC client must not feed back into itself
            if let Ok(directive) = "h2=off".parse::<Directive>() {
                filter = filter.add_directive(directive);
            }

            layers.push(
                tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(filter)
                    .boxed(),
            );
            self.tracer_provider = Some(tracer_provider);

            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        // Returning self keeps the providers alive, dropping it here would shut them down
        Ok(self)
    }

    fn file_appender(
        &self,
        directory: &Path,
        rotation_period: RotationPeriod,
    ) -> Result<RollingFileAppender, Error> {
        RollingFileAppender::builder()
            .rotation(rotation_period.into())
            .filename_prefix(self.service_name)
            .filename_suffix("tracing-rs.json")
            .max_log_files(MAX_LOG_FILES)
            .build(directory)
            .context(InitRollingFileAppenderSnafu)
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        if let Some(tracer_provider) = &self.tracer_provider {
            tracing::debug!("shutting down opentelemetry OTLP trace provider");
            if let Err(error) = tracer_provider.shutdown() {
                tracing::error!(%error, "unable to shutdown TracerProvider");
            }
        }
    }
}

fn env_filter(env_var: &str, default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(default_level.into())
        .from_env_lossy()
}
