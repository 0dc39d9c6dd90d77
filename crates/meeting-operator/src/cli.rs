use std::convert::Infallible;

use clap::{Args, Parser};

use crate::{controller::ControllerOptions, logging::TelemetryOptions};

pub const DEFAULT_FIELD_MANAGER: &str = "meeting-operator";

/// Metric-driven autoscaler for Jitsi Video Bridge pools.
#[derive(Debug, PartialEq, Eq, Parser)]
#[command(author, version, about)]
pub enum Command {
    /// Print the AutoScaler CRD as YAML.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Number of AutoScalers reconciled in parallel
    #[arg(
        long,
        env = "RECONCILE_CONCURRENCY",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub concurrency: u16,

    /// Field manager recorded for every write to the cluster
    #[arg(long, env, default_value = DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,

    // Flattened structs go last so that the help headings stay correct
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

impl RunArguments {
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            watch_namespace: self.watch_namespace.namespace().map(ToOwned::to_owned),
            concurrency: self.concurrency,
        }
    }
}

/// The namespaces AutoScalers are watched in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl WatchNamespace {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::One(namespace) => Some(namespace),
        }
    }
}

impl std::str::FromStr for WatchNamespace {
    type Err = Infallible;

    fn from_str(namespace: &str) -> Result<Self, Self::Err> {
        let namespace = namespace.trim();
        Ok(if namespace.is_empty() {
            Self::All
        } else {
            Self::One(namespace.to_owned())
        })
    }
}
