use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::Resource;
use serde_json::{Value, json};
use snafu::Snafu;

use crate::{crd::AutoScaler, error::ErrorKind};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to patch finalizers of {namespace}/{name}"))]
    PatchFinalizers {
        source: kube::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("{namespace}/{name} was modified while updating its finalizers"))]
    Conflict { name: String, namespace: String },

    #[snafu(display("{namespace}/{name} no longer exists"))]
    NotFound { name: String, namespace: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PatchFinalizers { .. } => ErrorKind::Unknown,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// The finalizers currently set on `resource`, deduplicated.
pub fn finalizers<T: Resource>(resource: &T) -> BTreeSet<String> {
    resource
        .meta()
        .finalizers
        .iter()
        .flatten()
        .cloned()
        .collect()
}

/// Checks whether `finalizer` is set on `resource`.
pub fn has_finalizer<T: Resource>(resource: &T, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

/// Checks whether the resource has a deletion timestamp set.
///
/// Such a resource is gone as soon as all finalizers are removed.
pub fn has_deletion_stamp<T: Resource>(resource: &T) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// The merge patch replacing the finalizer list of `resource` with `finalizers`.
///
/// Merge patches replace lists as a whole, so `resourceVersion` is included to
/// not drop finalizers other controllers added in the meantime.
pub fn finalizers_patch<T: Resource>(resource: &T, finalizers: &BTreeSet<String>) -> Value {
    let mut metadata = json!({ "finalizers": finalizers });
    if let Some(resource_version) = &resource.meta().resource_version {
        metadata["resourceVersion"] = json!(resource_version);
    }

    json!({ "metadata": metadata })
}

/// Cluster access needed to manage AutoScaler finalizers.
#[async_trait]
pub trait FinalizerStore: Send + Sync {
    /// Replaces the finalizers of `autoscaler` with `finalizers`.
    async fn set_finalizers(
        &self,
        autoscaler: &AutoScaler,
        finalizers: &BTreeSet<String>,
    ) -> Result<(), Error>;

    /// Adds `finalizer` unless it is already present.
    ///
    /// Returns whether a write was issued.
    async fn add_finalizer(&self, autoscaler: &AutoScaler, finalizer: &str) -> Result<bool, Error> {
        let mut finalizers = finalizers(autoscaler);
        let needs_write = finalizers.insert(finalizer.to_owned())
            || autoscaler.meta().finalizers.as_ref().map(Vec::len) != Some(finalizers.len());
        if !needs_write {
            return Ok(false);
        }

        self.set_finalizers(autoscaler, &finalizers).await?;
        Ok(true)
    }

    /// Removes `finalizer` if it is present.
    ///
    /// Returns whether a write was issued.
    async fn remove_finalizer(
        &self,
        autoscaler: &AutoScaler,
        finalizer: &str,
    ) -> Result<bool, Error> {
        let mut finalizers = finalizers(autoscaler);
        if !finalizers.remove(finalizer) {
            return Ok(false);
        }

        self.set_finalizers(autoscaler, &finalizers).await?;
        Ok(true)
    }
}
