/// Coarse classification of everything that can go wrong during a reconcile.
///
/// The kind decides how the controller reacts, see [`crate::controller`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum ErrorKind {
    /// The AutoScaler or its scale target does not exist.
    NotFound,

    /// The AutoScaler has a deletion timestamp.
    UnderDeletion,

    /// The AutoScaler spec cannot be acted upon until a user fixes it.
    InvalidConfig,

    /// `metric.name` is not one of the supported metrics.
    InvalidMetric,

    /// The metrics backend was unreachable or answered with malformed data.
    TransientSource,

    /// A write lost an optimistic concurrency race.
    Conflict,

    Unknown,
}
