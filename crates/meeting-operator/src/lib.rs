//! A Kubernetes operator resizing Jitsi Video Bridge pools from load metrics.
//!
//! Each [`AutoScaler`](crd::AutoScaler) samples a metric from Prometheus or
//! InfluxDB, computes the replica count with [`policy::desired_replicas`] and
//! writes it to the `spec.replicas` of its JVB scale target.

pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod target;
pub mod time;
pub mod utils;
pub mod yaml;
