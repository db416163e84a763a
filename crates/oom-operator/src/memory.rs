//! In-process resource store
//!
//! Mirrors the API server semantics the reconciler depends on: resource
//! versions with conflict detection, finalizer-gated erasure of records that
//! are being deleted, and not-found as absence. Every successful write is
//! journaled so tests can assert ordering.

use crate::crd::{ObjectKey, Oomer};
use crate::error::{OperatorError, Result};
use crate::store::ResourceStore;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Kind of store operation, used for journaling and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    GetOomer,
    UpdateOomer,
    UpdateOomerStatus,
    GetDeployment,
    CreateDeployment,
    UpdateDeployment,
    DeleteDeployment,
}

/// A successful write recorded by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Record replaced; carries the finalizers after the write
    OomerUpdated {
        key: ObjectKey,
        finalizers: Vec<String>,
    },
    /// Record erased after its last finalizer was removed
    OomerErased { key: ObjectKey },
    OomerStatusUpdated {
        key: ObjectKey,
        observed_replicas: Option<i32>,
    },
    DeploymentCreated { key: ObjectKey, replicas: Option<i32> },
    DeploymentUpdated { key: ObjectKey, replicas: Option<i32> },
    DeploymentDeleted { key: ObjectKey },
}

#[derive(Default)]
struct State {
    oomers: BTreeMap<ObjectKey, Oomer>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    journal: Vec<StoreOp>,
    faults: HashMap<OpKind, Vec<OperatorError>>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_fault(&mut self, op: OpKind) -> Result<()> {
        match self.faults.get_mut(&op).and_then(|queue| queue.pop()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Thread-safe in-memory [`ResourceStore`]
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

fn conflict<K: Resource<DynamicType = ()>>(key: &ObjectKey) -> OperatorError {
    OperatorError::Conflict {
        kind: K::kind(&()).to_string(),
        name: key.name.clone(),
        namespace: key.namespace.clone(),
    }
}

fn not_found<K: Resource<DynamicType = ()>>(key: &ObjectKey) -> OperatorError {
    OperatorError::NotFound {
        kind: K::kind(&()).to_string(),
        name: key.name.clone(),
        namespace: key.namespace.clone(),
    }
}

/// Versions must match exactly; an unset version is treated as unconditional
fn check_version(stored: &Option<String>, incoming: &Option<String>) -> bool {
    incoming.is_none() || stored == incoming
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user-authored record, assigning uid, version and timestamp
    pub async fn insert_oomer(&self, mut oomer: Oomer) -> Oomer {
        let mut state = self.state.lock().await;
        let key = oomer.key();
        let version = state.bump();
        oomer.metadata.namespace = Some(key.namespace.clone());
        oomer.metadata.resource_version = Some(version);
        oomer.metadata.uid = Some(format!("uid-{}-{}", key.namespace, key.name));
        oomer.metadata.generation = Some(1);
        oomer.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.oomers.insert(key, oomer.clone());
        oomer
    }

    /// Simulate a user edit of the record's spec
    pub async fn edit_oomer<F>(&self, key: &ObjectKey, edit: F) -> Result<Oomer>
    where
        F: FnOnce(&mut Oomer),
    {
        let mut state = self.state.lock().await;
        let version = state.bump();
        let oomer = state
            .oomers
            .get_mut(key)
            .ok_or_else(|| not_found::<Oomer>(key))?;
        edit(oomer);
        oomer.metadata.resource_version = Some(version);
        oomer.metadata.generation = Some(oomer.metadata.generation.unwrap_or(0) + 1);
        Ok(oomer.clone())
    }

    /// Simulate an out-of-band change to a Deployment
    pub async fn edit_deployment<F>(&self, key: &ObjectKey, edit: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let mut state = self.state.lock().await;
        let version = state.bump();
        let deployment = state
            .deployments
            .get_mut(key)
            .ok_or_else(|| not_found::<Deployment>(key))?;
        edit(deployment);
        deployment.metadata.resource_version = Some(version);
        Ok(deployment.clone())
    }

    /// Request deletion the way the API server does: set the deletion
    /// timestamp, erasing immediately only when no finalizers remain
    pub async fn request_deletion(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let version = state.bump();
        let oomer = state
            .oomers
            .get_mut(key)
            .ok_or_else(|| not_found::<Oomer>(key))?;
        if oomer.finalizers().is_empty() {
            state.oomers.remove(key);
            state.journal.push(StoreOp::OomerErased { key: key.clone() });
            return Ok(());
        }
        if oomer.metadata.deletion_timestamp.is_none() {
            oomer.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        oomer.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Queue an error to be returned by the next call of `op`
    pub async fn fail_next(&self, op: OpKind, err: OperatorError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().insert(0, err);
    }

    pub async fn oomer(&self, key: &ObjectKey) -> Option<Oomer> {
        self.state.lock().await.oomers.get(key).cloned()
    }

    pub async fn deployment(&self, key: &ObjectKey) -> Option<Deployment> {
        self.state.lock().await.deployments.get(key).cloned()
    }

    pub async fn deployment_count(&self) -> usize {
        self.state.lock().await.deployments.len()
    }

    pub async fn journal(&self) -> Vec<StoreOp> {
        self.state.lock().await.journal.clone()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_oomer(&self, key: &ObjectKey) -> Result<Option<Oomer>> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::GetOomer)?;
        Ok(state.oomers.get(key).cloned())
    }

    async fn update_oomer(&self, oomer: &Oomer) -> Result<Oomer> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::UpdateOomer)?;
        let key = oomer.key();
        let stored = state
            .oomers
            .get(&key)
            .ok_or_else(|| not_found::<Oomer>(&key))?;
        if !check_version(&stored.metadata.resource_version, &oomer.metadata.resource_version) {
            return Err(conflict::<Oomer>(&key));
        }

        // Status and server-managed metadata are not writable through this call
        let mut updated = oomer.clone();
        updated.status = stored.status.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.generation = stored.metadata.generation;

        let finalizers = updated.finalizers().to_vec();
        if updated.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            state.oomers.remove(&key);
            state.journal.push(StoreOp::OomerUpdated {
                key: key.clone(),
                finalizers,
            });
            state.journal.push(StoreOp::OomerErased { key });
            return Ok(updated);
        }

        updated.metadata.resource_version = Some(state.bump());
        state.oomers.insert(key.clone(), updated.clone());
        state.journal.push(StoreOp::OomerUpdated { key, finalizers });
        Ok(updated)
    }

    async fn update_oomer_status(&self, oomer: &Oomer) -> Result<Oomer> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::UpdateOomerStatus)?;
        let key = oomer.key();
        let version = state.bump();
        let stored = state
            .oomers
            .get_mut(&key)
            .ok_or_else(|| not_found::<Oomer>(&key))?;
        if !check_version(&stored.metadata.resource_version, &oomer.metadata.resource_version) {
            return Err(conflict::<Oomer>(&key));
        }

        stored.status = oomer.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.journal.push(StoreOp::OomerStatusUpdated {
            key,
            observed_replicas: updated.observed_replicas(),
        });
        Ok(updated)
    }

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::GetDeployment)?;
        Ok(state.deployments.get(key).cloned())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::CreateDeployment)?;
        let key = ObjectKey::of(deployment);
        if state.deployments.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: "Deployment".to_string(),
                name: key.name,
                namespace: key.namespace,
            });
        }

        let mut created = deployment.clone();
        created.metadata.resource_version = Some(state.bump());
        created.metadata.uid = Some(format!("deployment-uid-{}-{}", key.namespace, key.name));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        let replicas = created.spec.as_ref().and_then(|s| s.replicas);
        state.deployments.insert(key.clone(), created.clone());
        state
            .journal
            .push(StoreOp::DeploymentCreated { key, replicas });
        Ok(created)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::UpdateDeployment)?;
        let key = ObjectKey::of(deployment);
        let version = state.bump();
        let stored = state
            .deployments
            .get_mut(&key)
            .ok_or_else(|| not_found::<Deployment>(&key))?;
        if !check_version(
            &stored.metadata.resource_version,
            &deployment.metadata.resource_version,
        ) {
            return Err(conflict::<Deployment>(&key));
        }

        let mut updated = deployment.clone();
        updated.metadata.resource_version = Some(version);
        updated.metadata.uid = stored.metadata.uid.clone();
        *stored = updated.clone();
        let replicas = updated.spec.as_ref().and_then(|s| s.replicas);
        state
            .journal
            .push(StoreOp::DeploymentUpdated { key, replicas });
        Ok(updated)
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.take_fault(OpKind::DeleteDeployment)?;
        if state.deployments.remove(key).is_some() {
            state
                .journal
                .push(StoreOp::DeploymentDeleted { key: key.clone() });
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
