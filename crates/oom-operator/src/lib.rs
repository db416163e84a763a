//! # OOM Kubernetes Operator
//!
//! Kubernetes operator that runs a fleet of pods which deliberately exhaust
//! their memory and crash, for exercising OOM alerting and crash handling.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use oom_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, OperatorConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: kube-runtime watches `Oomer` resources and the Deployments
//!    they own
//! 2. **Reconcile**: [`controller::Reconciler`] re-reads the Oomer and compares
//!    it with its Deployment through a [`store::ResourceStore`]
//! 3. **Act**: create or update the Deployment, or tear it down when the
//!    Oomer is being deleted
//! 4. **Status**: record the replica count applied to the Deployment in
//!    `status.observedReplicas`
//!
//! Deletion is guarded by the `jdocklabs.co.uk/finalizer` finalizer, so the
//! Deployment is removed before the Oomer disappears.
//!
//! ## Modules
//!
//! - [`crd`] - the `Oomer` custom resource
//! - [`config`] - defaults injected into the synthesizer and reconciler
//! - [`resources`] - Deployment synthesis and drift detection
//! - [`finalizer`] - finalizer state machine and teardown
//! - [`controller`] - reconciliation logic and controller setup
//! - [`store`] - store trait and the API server implementation
//! - `memory` - in-process store for tests (`test-support` feature)
//! - [`error`] - error types
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: jdocklabs.co.uk/v1alpha1
//! kind: Oomer
//! metadata:
//!   name: test-oomer
//! spec:
//!   replicas: 1
//!   image: jdockerty/oomer:v0.0.1
//!   labels:
//!     app: oomer
//! ```

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod finalizer;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod resources;
pub mod store;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run_controller, ControllerMetrics, Reconciler};
    pub use crate::crd::{ObjectKey, Oomer, OomerSpec, OomerStatus};
    pub use crate::error::{OperatorError, Result};
    pub use crate::finalizer::FinalizerState;
    #[cfg(any(test, feature = "test-support"))]
    pub use crate::memory::InMemoryStore;
    pub use crate::resources::{DeploymentBuilder, Drift};
    pub use crate::store::{KubeStore, ResourceStore};
}
