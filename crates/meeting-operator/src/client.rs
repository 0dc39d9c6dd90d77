use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::{
    Api, ResourceExt,
    api::{DynamicObject, Patch, PatchParams},
};

use crate::{
    crd::AutoScaler,
    finalizer::{self, FinalizerStore, finalizers_patch},
    target::{self, TargetKind, TargetStore, TargetWorkload},
};

/// This `Client` can be used to access Kubernetes.
///
/// It wraps an underlying [`kube::Client`] and carries the field manager used
/// for every write plus the registry of scale target kinds.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    merge_patch_params: PatchParams,
    target_kind: TargetKind,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: &str, target_kind: TargetKind) -> Self {
        Self {
            client,
            merge_patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
            target_kind,
        }
    }

    /// Returns a [`kube::Client`] that can be freely used.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    fn target_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            self.target_kind.api_resource(),
        )
    }
}

/// The HTTP status code of an error the API server answered with.
fn api_status_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(status) => Some(status.code),
        _ => None,
    }
}

#[async_trait]
impl FinalizerStore for Client {
    async fn set_finalizers(
        &self,
        autoscaler: &AutoScaler,
        finalizers: &BTreeSet<String>,
    ) -> Result<(), finalizer::Error> {
        let name = autoscaler.name_any();
        let namespace = autoscaler.namespace().unwrap_or_default();
        let api: Api<AutoScaler> = Api::namespaced(self.client.clone(), &namespace);
        let patch = finalizers_patch(autoscaler, finalizers);

        match api
            .patch(&name, &self.merge_patch_params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => Err(match api_status_code(&error) {
                Some(409) => finalizer::Error::Conflict { name, namespace },
                Some(404) => finalizer::Error::NotFound { name, namespace },
                _ => finalizer::Error::PatchFinalizers {
                    source: error,
                    name,
                    namespace,
                },
            }),
        }
    }
}

#[async_trait]
impl TargetStore for Client {
    async fn load_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<TargetWorkload, target::Error> {
        match self.target_api(namespace).get(name).await {
            Ok(object) => TargetWorkload::from_dynamic(&object, namespace),
            Err(error) if api_status_code(&error) == Some(404) => Err(target::Error::NotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }),
            Err(error) => Err(target::Error::LoadTarget {
                source: error,
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }),
        }
    }

    async fn write_replicas(
        &self,
        target: &TargetWorkload,
        replicas: i32,
    ) -> Result<(), target::Error> {
        let patch = target.replicas_patch(replicas);
        let result = self
            .target_api(&target.namespace)
            .patch(&target.name, &self.merge_patch_params, &Patch::Merge(&patch))
            .await;

        let name = target.name.clone();
        let namespace = target.namespace.clone();
        match result {
            Ok(_) => Ok(()),
            Err(error) => Err(match api_status_code(&error) {
                Some(409) => target::Error::Conflict { name, namespace },
                Some(404) => target::Error::NotFound { name, namespace },
                _ => target::Error::PatchReplicas {
                    source: error,
                    name,
                    namespace,
                },
            }),
        }
    }
}
