//! Oomer Controller
//!
//! This module implements the reconciliation loop for Oomer custom
//! resources. [`Reconciler`] holds the control logic and works against any
//! [`ResourceStore`]; [`run_controller`] wires it to the kube-runtime
//! watcher and work queue.

use crate::config::OperatorConfig;
use crate::crd::{ObjectKey, Oomer, OomerStatus};
use crate::error::{OperatorError, Result};
use crate::finalizer::{self, FinalizerState};
use crate::resources::{DeploymentBuilder, Drift};
use crate::store::{KubeStore, ResourceStore};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    pub deployments_created: metrics::Counter,
    pub deployments_deleted: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("oom_operator_reconciliations_total"),
            errors: metrics::counter!("oom_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("oom_operator_reconciliation_duration_seconds"),
            deployments_created: metrics::counter!("oom_operator_deployments_created_total"),
            deployments_deleted: metrics::counter!("oom_operator_deployments_deleted_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an Oomer's Deployment and status toward its spec
pub struct Reconciler<S> {
    store: S,
    config: Arc<OperatorConfig>,
    metrics: Option<ControllerMetrics>,
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(store: S, config: Arc<OperatorConfig>) -> Self {
        Self {
            store,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one reconciliation pass for the Oomer identified by `key`
    ///
    /// The record is always re-read from the store, so the pass acts on
    /// fresh state regardless of what triggered it. Store errors are
    /// returned unchanged; retrying is left to the caller's scheduler.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(oomer) = self.store.get_oomer(key).await? else {
            debug!("Oomer not found, nothing to do");
            return Ok(Action::await_change());
        };

        let finalizer_name = self.config.finalizer.as_str();
        match FinalizerState::of(&oomer, finalizer_name) {
            FinalizerState::Unprotected => {
                let oomer =
                    finalizer::ensure_protected(&self.store, oomer, finalizer_name).await?;
                info!(name = %key.name, "Finalizer added");
                self.apply(oomer).await
            }
            FinalizerState::Protected => self.apply(oomer).await,
            FinalizerState::Terminating => {
                info!(name = %key.name, "Oomer marked for deletion, cleaning up");
                let deleted = finalizer::teardown(&self.store, oomer, finalizer_name).await?;
                if deleted {
                    if let Some(ref metrics) = self.metrics {
                        metrics.deployments_deleted.increment(1);
                    }
                }
                Ok(Action::await_change())
            }
            FinalizerState::Terminal => {
                debug!("Finalizer already released, waiting for removal");
                Ok(Action::await_change())
            }
        }
    }

    /// Apply path for a protected, live record
    async fn apply(&self, oomer: Oomer) -> Result<Action> {
        let key = oomer.key();
        oomer.spec.check()?;

        if oomer.spec.replicas == 0 {
            info!(name = %key.name, "0 replicas, no creation");
            return Ok(Action::await_change());
        }

        info!(name = %key.name, replicas = oomer.spec.replicas, "Reconciling Oomer");

        let builder = DeploymentBuilder::new(&oomer, &self.config)?;
        let applied = match self.store.get_deployment(&key).await? {
            None => {
                let deployment = builder.build_deployment();
                info!(
                    name = %key.name,
                    image = %builder.image(),
                    replicas = oomer.spec.replicas,
                    "Underlying Deployment not found, creating"
                );
                let created = self.store.create_deployment(&deployment).await?;
                if let Some(ref metrics) = self.metrics {
                    metrics.deployments_created.increment(1);
                }
                created
            }
            Some(existing) => match builder.drift(&existing) {
                Drift::InSync => existing,
                Drift::Patchable(updated) => {
                    info!(name = %key.name, "Deployment drifted from spec, updating");
                    self.store.update_deployment(&updated).await?
                }
                Drift::SelectorChanged => {
                    warn!(
                        name = %key.name,
                        "Label selector changed, deleting Deployment for recreation"
                    );
                    self.store.delete_deployment(&key).await?;
                    return Ok(Action::requeue(self.config.recreate_delay));
                }
            },
        };

        self.sync_status(oomer, &applied).await?;

        Ok(Action::requeue(self.config.requeue_interval))
    }

    /// Record the replica count that is actually on the Deployment
    async fn sync_status(&self, mut oomer: Oomer, applied: &Deployment) -> Result<()> {
        let applied_replicas = applied.spec.as_ref().and_then(|s| s.replicas);
        if oomer.observed_replicas() == applied_replicas {
            return Ok(());
        }

        debug!(
            name = %oomer.name_any(),
            replicas = ?applied_replicas,
            "Updating Oomer observed replicas status"
        );
        oomer.status = Some(OomerStatus {
            observed_replicas: applied_replicas,
        });
        self.store
            .update_oomer_status(&oomer)
            .await
            .inspect_err(|e| {
                error!(
                    error = %e,
                    observed_replicas = ?applied_replicas,
                    spec_replicas = oomer.spec.replicas,
                    "Unable to update Oomer status"
                )
            })?;
        Ok(())
    }
}

/// Context passed to the kube-runtime controller
pub struct ControllerContext {
    pub reconciler: Reconciler<KubeStore>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<ObjectKey, u32>,
}

/// Start the Oomer controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
) -> Result<()> {
    let oomers: Api<Oomer> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let deployments = match &namespace {
        Some(ns) => Api::<Deployment>::namespaced(client.clone(), ns),
        None => Api::<Deployment>::all(client.clone()),
    };

    let store = KubeStore::new(client.clone(), config.field_manager.clone());
    let ctx = Arc::new(ControllerContext {
        reconciler: Reconciler::new(store, Arc::new(config))
            .with_metrics(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting Oomer controller"
    );

    Controller::new(oomers, Config::default())
        .owns(deployments, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    info!("Oomer controller terminated");

    Ok(())
}

/// Adapter from the kube-runtime callback to [`Reconciler::reconcile`]
async fn reconcile(oomer: Arc<Oomer>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();
    let key = oomer.key();
    let metrics = ctx.reconciler.metrics.as_ref();

    if let Some(metrics) = metrics {
        metrics.reconciliations.increment(1);
    }

    let result = ctx.reconciler.reconcile(&key).await;

    if let Some(metrics) = metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.errors.increment(1);
        }
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }

    result
}

/// Delay before the next attempt after `retries` consecutive failures
///
/// 30s → 60s → 120s → 240s → 480s → 600s (capped), unless the error
/// suggests its own delay. Errors that a retry cannot fix yield `None`.
pub fn backoff_delay(error: &OperatorError, retries: u32) -> Option<Duration> {
    if !error.is_retryable() {
        return None;
    }
    Some(error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    }))
}

/// Action after `retries` consecutive failures: backoff for retryable
/// errors, otherwise wait for the Oomer to be edited
pub fn error_action(error: &OperatorError, retries: u32) -> Action {
    match backoff_delay(error, retries) {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

/// Error policy for the controller, exponential backoff per object
fn error_policy(oomer: Arc<Oomer>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = oomer.key();
    if !error.is_retryable() {
        ctx.error_counts.remove(&key);
        warn!(
            error = %error,
            "Reconciliation error for '{}' is not retryable, waiting for a change",
            key
        );
        return error_action(error, 0);
    }

    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let action = error_action(error, retries);

    warn!(
        error = %error,
        retry = retries,
        ?action,
        "Reconciliation error for '{}', will retry",
        key
    );

    action
}
