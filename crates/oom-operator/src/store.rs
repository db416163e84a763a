//! Resource store abstraction
//!
//! The reconciler talks to the cluster only through [`ResourceStore`]. The
//! live implementation wraps `kube::Api`; `InMemoryStore` (`test-support` feature)
//! provides the same semantics in-process.

use crate::crd::{ObjectKey, Oomer};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

/// Operations the reconciler needs from the cluster
///
/// Lookups return `Ok(None)` for absent objects. Updates carry the caller's
/// `resourceVersion` and fail with a conflict when it is stale.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_oomer(&self, key: &ObjectKey) -> Result<Option<Oomer>>;

    /// Replace the record (metadata and spec), optimistic-concurrency checked
    async fn update_oomer(&self, oomer: &Oomer) -> Result<Oomer>;

    /// Replace the status subresource, optimistic-concurrency checked
    async fn update_oomer_status(&self, oomer: &Oomer) -> Result<Oomer>;

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Delete a Deployment. Returns `false` when it was already absent.
    async fn delete_deployment(&self, key: &ObjectKey) -> Result<bool>;
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

/// Translate API status codes into the operator's error taxonomy
fn map_api_error<K: Resource<DynamicType = ()>>(err: kube::Error, key: &ObjectKey) -> OperatorError {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            OperatorError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => OperatorError::Conflict {
            kind: K::kind(&()).to_string(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        },
        kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound {
            kind: K::kind(&()).to_string(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        },
        _ => OperatorError::KubeError(err),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_oomer(&self, key: &ObjectKey) -> Result<Option<Oomer>> {
        let api: Api<Oomer> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name)
            .await
            .map_err(|e| map_api_error::<Oomer>(e, key))
    }

    async fn update_oomer(&self, oomer: &Oomer) -> Result<Oomer> {
        let key = oomer.key();
        let api: Api<Oomer> = Api::namespaced(self.client.clone(), &key.namespace);
        debug!(name = %key.name, "Replacing Oomer");
        api.replace(&key.name, &self.post_params(), oomer)
            .await
            .map_err(|e| map_api_error::<Oomer>(e, &key))
    }

    async fn update_oomer_status(&self, oomer: &Oomer) -> Result<Oomer> {
        let key = oomer.key();
        let api: Api<Oomer> = Api::namespaced(self.client.clone(), &key.namespace);
        debug!(name = %key.name, status = ?oomer.status, "Replacing Oomer status");
        let body = serde_json::to_vec(oomer)?;
        api.replace_status(&key.name, &self.post_params(), body)
            .await
            .map_err(|e| map_api_error::<Oomer>(e, &key))
    }

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name)
            .await
            .map_err(|e| map_api_error::<Deployment>(e, key))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = ObjectKey::of(deployment);
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        debug!(name = %key.name, "Creating Deployment");
        api.create(&self.post_params(), deployment)
            .await
            .map_err(|e| map_api_error::<Deployment>(e, &key))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = ObjectKey::of(deployment);
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        debug!(name = %deployment.name_any(), "Replacing Deployment");
        api.replace(&key.name, &self.post_params(), deployment)
            .await
            .map_err(|e| map_api_error::<Deployment>(e, &key))
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        debug!(name = %key.name, "Deleting Deployment");
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(map_api_error::<Deployment>(e, key)),
        }
    }
}
