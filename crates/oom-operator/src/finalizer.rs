//! Finalizer lifecycle
//!
//! An Oomer moves through four states on two axes: whether our finalizer is
//! present and whether deletion was requested.
//!
//! ```text
//! Unprotected --add--> Protected --delete requested--> Terminating --remove--> Terminal
//! ```
//!
//! The Deployment is always deleted while the record is `Terminating`, before
//! the finalizer is removed.

use crate::crd::{ObjectKey, Oomer};
use crate::error::Result;
use crate::store::ResourceStore;
use kube::ResourceExt;
use tracing::{debug, info};

/// Position of a record in the finalizer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live, finalizer not yet added
    Unprotected,
    /// Live, finalizer present
    Protected,
    /// Deletion requested, finalizer still present
    Terminating,
    /// Deletion requested, finalizer removed; the platform may erase it
    Terminal,
}

impl FinalizerState {
    pub fn of(oomer: &Oomer, finalizer: &str) -> Self {
        match (oomer.is_being_deleted(), has_finalizer(oomer, finalizer)) {
            (false, false) => FinalizerState::Unprotected,
            (false, true) => FinalizerState::Protected,
            (true, true) => FinalizerState::Terminating,
            (true, false) => FinalizerState::Terminal,
        }
    }
}

pub fn has_finalizer(oomer: &Oomer, finalizer: &str) -> bool {
    oomer.finalizers().iter().any(|f| f == finalizer)
}

/// Add the finalizer, returning whether the record changed
pub fn add_finalizer(oomer: &mut Oomer, finalizer: &str) -> bool {
    if has_finalizer(oomer, finalizer) {
        return false;
    }
    oomer.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove the finalizer, returning whether the record changed
pub fn remove_finalizer(oomer: &mut Oomer, finalizer: &str) -> bool {
    if !has_finalizer(oomer, finalizer) {
        return false;
    }
    oomer.finalizers_mut().retain(|f| f != finalizer);
    true
}

/// Move an `Unprotected` record to `Protected` and persist it
///
/// Returns the stored copy (with its new resource version) so the caller
/// can keep writing against it in the same pass.
pub async fn ensure_protected<S: ResourceStore + ?Sized>(
    store: &S,
    mut oomer: Oomer,
    finalizer: &str,
) -> Result<Oomer> {
    if !add_finalizer(&mut oomer, finalizer) {
        return Ok(oomer);
    }
    debug!(name = %oomer.name_any(), finalizer, "Adding finalizer");
    store.update_oomer(&oomer).await
}

/// Tear down a `Terminating` record: delete the Deployment, then release
/// the finalizer. Returns whether a Deployment was actually deleted.
pub async fn teardown<S: ResourceStore + ?Sized>(
    store: &S,
    mut oomer: Oomer,
    finalizer: &str,
) -> Result<bool> {
    let key = ObjectKey::of(&oomer);

    let deleted = store.delete_deployment(&key).await?;
    if deleted {
        info!(name = %key.name, namespace = %key.namespace, "Deployment deleted");
    } else {
        debug!(name = %key.name, "Deployment already absent");
    }

    if remove_finalizer(&mut oomer, finalizer) {
        store.update_oomer(&oomer).await?;
        info!(name = %key.name, "Finalizer removed");
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::OomerSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const FINALIZER: &str = "jdocklabs.co.uk/finalizer";

    fn oomer() -> Oomer {
        Oomer::new(
            "test-oomer",
            OomerSpec {
                image: None,
                replicas: 1,
                labels: None,
            },
        )
    }

    #[test]
    fn test_state_transitions() {
        let mut o = oomer();
        assert_eq!(FinalizerState::of(&o, FINALIZER), FinalizerState::Unprotected);

        add_finalizer(&mut o, FINALIZER);
        assert_eq!(FinalizerState::of(&o, FINALIZER), FinalizerState::Protected);

        o.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(FinalizerState::of(&o, FINALIZER), FinalizerState::Terminating);

        remove_finalizer(&mut o, FINALIZER);
        assert_eq!(FinalizerState::of(&o, FINALIZER), FinalizerState::Terminal);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut o = oomer();
        assert!(add_finalizer(&mut o, FINALIZER));
        assert!(!add_finalizer(&mut o, FINALIZER));
        assert_eq!(o.finalizers().len(), 1);
    }

    #[test]
    fn test_remove_leaves_foreign_finalizers() {
        let mut o = oomer();
        o.metadata.finalizers = Some(vec![
            "example.com/other".to_string(),
            FINALIZER.to_string(),
        ]);
        assert!(remove_finalizer(&mut o, FINALIZER));
        assert!(!remove_finalizer(&mut o, FINALIZER));
        assert_eq!(o.finalizers(), &["example.com/other".to_string()]);
    }

    #[test]
    fn test_foreign_finalizer_is_not_ours() {
        let mut o = oomer();
        o.metadata.finalizers = Some(vec!["example.com/other".to_string()]);
        assert_eq!(FinalizerState::of(&o, FINALIZER), FinalizerState::Unprotected);
    }
}
