//! Reads and resizes the JVB pool an AutoScaler points at.
//!
//! The target is only ever touched through `.spec.replicas`. It is accessed as
//! a [`DynamicObject`] so that no other part of its schema is assumed.

use async_trait::async_trait;
use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject},
    core::GroupVersionKind,
    runtime::reflector::ObjectRef,
};
use serde_json::{Value, json};
use snafu::{OptionExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{crd::APP_GROUP, error::ErrorKind};

/// Replica count assumed when the target does not declare `.spec.replicas`.
pub const DEFAULT_REPLICAS: i32 = 1;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("scale target {namespace}/{name} does not exist"))]
    NotFound { name: String, namespace: String },

    #[snafu(display("scale target {namespace}/{name} was modified concurrently"))]
    Conflict { name: String, namespace: String },

    #[snafu(display("failed to load scale target {namespace}/{name}"))]
    LoadTarget {
        source: kube::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("failed to write replicas of scale target {namespace}/{name}"))]
    PatchReplicas {
        source: kube::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("scale target {namespace}/{name} has a malformed spec.replicas: {value}"))]
    MalformedReplicas {
        name: String,
        namespace: String,
        value: Value,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::LoadTarget { .. } | Self::PatchReplicas { .. } | Self::MalformedReplicas { .. } => {
                ErrorKind::Unknown
            }
        }
    }

    /// The JVB this error is about.
    pub fn target_ref(&self) -> ObjectRef<DynamicObject> {
        let (Self::NotFound { name, namespace }
        | Self::Conflict { name, namespace }
        | Self::LoadTarget {
            name, namespace, ..
        }
        | Self::PatchReplicas {
            name, namespace, ..
        }
        | Self::MalformedReplicas {
            name, namespace, ..
        }) = self;

        ObjectRef::new_with(name, TargetKind::jvb().api_resource().clone()).within(namespace)
    }
}

/// Describes the kind of workload AutoScalers resize.
///
/// Built once at startup and shared by reference afterwards.
#[derive(Clone, Debug)]
pub struct TargetKind {
    api_resource: ApiResource,
}

impl TargetKind {
    /// The Jitsi Video Bridge pool, `jvbs.meeting.jitsi.io/v1alpha1`.
    pub fn jvb() -> Self {
        let gvk = GroupVersionKind::gvk(APP_GROUP, "v1alpha1", "JVB");
        Self {
            api_resource: ApiResource::from_gvk_with_plural(&gvk, "jvbs"),
        }
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.api_resource
    }
}

/// A snapshot of the scale target, taken right before it is resized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetWorkload {
    pub name: String,
    pub namespace: String,

    /// Guards the replica write against concurrent modifications.
    pub resource_version: Option<String>,

    pub replicas: i32,
}

impl TargetWorkload {
    pub fn from_dynamic(object: &DynamicObject, namespace: &str) -> Result<Self, Error> {
        let name = object.name_any();
        let replicas = match object.data.pointer("/spec/replicas") {
            None | Some(Value::Null) => DEFAULT_REPLICAS,
            Some(value) => value
                .as_i64()
                .and_then(|replicas| i32::try_from(replicas).ok())
                .context(MalformedReplicasSnafu {
                    name: name.clone(),
                    namespace,
                    value: value.clone(),
                })?,
        };

        Ok(Self {
            name,
            namespace: object.namespace().unwrap_or_else(|| namespace.to_owned()),
            resource_version: object.resource_version(),
            replicas,
        })
    }

    /// The merge patch setting `.spec.replicas` and nothing else.
    ///
    /// The `resourceVersion` turns the patch into a conditional write, the API
    /// server rejects it with a conflict if the object changed since it was read.
    pub fn replicas_patch(&self, replicas: i32) -> Value {
        let mut patch = json!({
            "spec": {
                "replicas": replicas,
            },
        });

        if let Some(resource_version) = &self.resource_version {
            patch["metadata"] = json!({ "resourceVersion": resource_version });
        }

        patch
    }
}

/// Cluster access needed to resize scale targets.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn load_target(&self, namespace: &str, name: &str) -> Result<TargetWorkload, Error>;

    /// Sets `.spec.replicas` of `target`, leaving every other field untouched.
    async fn write_replicas(&self, target: &TargetWorkload, replicas: i32) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    fn jvb(data: Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("jvb".to_owned()),
                namespace: Some("jitsi".to_owned()),
                resource_version: Some("42".to_owned()),
                ..ObjectMeta::default()
            },
            data,
        }
    }

    #[test]
    fn jvb_api_resource() {
        let kind = TargetKind::jvb();
        let resource = kind.api_resource();
        assert_eq!(resource.group, "meeting.jitsi.io");
        assert_eq!(resource.version, "v1alpha1");
        assert_eq!(resource.api_version, "meeting.jitsi.io/v1alpha1");
        assert_eq!(resource.kind, "JVB");
        assert_eq!(resource.plural, "jvbs");
    }

    #[test]
    fn reads_replicas_and_resource_version() {
        let object = jvb(json!({ "spec": { "replicas": 6, "image": "jitsi/jvb" } }));
        let target = TargetWorkload::from_dynamic(&object, "jitsi").unwrap();
        assert_eq!(
            target,
            TargetWorkload {
                name: "jvb".to_owned(),
                namespace: "jitsi".to_owned(),
                resource_version: Some("42".to_owned()),
                replicas: 6,
            }
        );
    }

    #[test]
    fn missing_replicas_default_to_one() {
        let target = TargetWorkload::from_dynamic(&jvb(json!({ "spec": {} })), "jitsi").unwrap();
        assert_eq!(target.replicas, DEFAULT_REPLICAS);

        let target = TargetWorkload::from_dynamic(&jvb(json!({})), "jitsi").unwrap();
        assert_eq!(target.replicas, DEFAULT_REPLICAS);
    }

    #[test]
    fn malformed_replicas_are_rejected() {
        let object = jvb(json!({ "spec": { "replicas": "six" } }));
        let result = TargetWorkload::from_dynamic(&object, "jitsi");
        assert!(matches!(result, Err(Error::MalformedReplicas { .. })));

        let too_many = i64::from(i32::MAX) + 1;
        let object = jvb(json!({ "spec": { "replicas": too_many } }));
        let result = TargetWorkload::from_dynamic(&object, "jitsi");
        assert!(matches!(result, Err(Error::MalformedReplicas { .. })));
    }

    #[test]
    fn patch_only_touches_replicas() {
        let object = jvb(json!({ "spec": { "replicas": 3, "image": "jitsi/jvb" } }));
        let target = TargetWorkload::from_dynamic(&object, "jitsi").unwrap();

        assert_eq!(
            target.replicas_patch(10),
            json!({
                "metadata": { "resourceVersion": "42" },
                "spec": { "replicas": 10 },
            })
        );
    }

    #[test]
    fn patch_without_resource_version_is_unconditional() {
        let target = TargetWorkload {
            name: "jvb".to_owned(),
            namespace: "jitsi".to_owned(),
            resource_version: None,
            replicas: 3,
        };
        assert_eq!(target.replicas_patch(2), json!({ "spec": { "replicas": 2 } }));
    }

    #[test]
    fn error_kinds() {
        let not_found = NotFoundSnafu {
            name: "jvb",
            namespace: "jitsi",
        }
        .build();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let conflict = ConflictSnafu {
            name: "jvb",
            namespace: "jitsi",
        }
        .build();
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn error_points_at_the_jvb() {
        let error = MalformedReplicasSnafu {
            name: "jvb-eu",
            namespace: "jitsi",
            value: json!("three"),
        }
        .build();

        let target = error.target_ref();
        assert_eq!(target.name, "jvb-eu");
        assert_eq!(target.namespace.as_deref(), Some("jitsi"));
        assert_eq!(target.dyntype.kind, "JVB");
        assert_eq!(target.dyntype.group, APP_GROUP);
    }
}
