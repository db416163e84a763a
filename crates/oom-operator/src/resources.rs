//! Kubernetes Resource Builders
//!
//! This module synthesizes the Deployment that backs an Oomer, and compares
//! an existing Deployment against the synthesized one.

use crate::config::OperatorConfig;
use crate::crd::Oomer;
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;
use tracing::debug;

/// Maximum number of user supplied labels
const MAX_LABELS: usize = 64;

/// Longest label key (prefix and name) the API server accepts
const MAX_LABEL_KEY_LEN: usize = 253;

/// Longest label value the API server accepts
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Whether a user supplied label map can be used as a selector
pub fn labels_are_valid(labels: &BTreeMap<String, String>) -> bool {
    !labels.is_empty()
        && labels.len() <= MAX_LABELS
        && labels.iter().all(|(key, value)| {
            !key.is_empty() && key.len() <= MAX_LABEL_KEY_LEN && value.len() <= MAX_LABEL_VALUE_LEN
        })
}

/// How an existing Deployment relates to the synthesized one
#[derive(Debug, Clone, PartialEq)]
pub enum Drift {
    /// Replicas, image, container and labels all match
    InSync,
    /// Fields differ but can be updated in place; carries the updated object
    Patchable(Box<Deployment>),
    /// The label selector differs. Selectors are immutable, so the
    /// Deployment has to be recreated
    SelectorChanged,
}

/// Builder for generating the Deployment of an Oomer
pub struct DeploymentBuilder<'a> {
    oomer: &'a Oomer,
    config: &'a OperatorConfig,
    name: String,
    namespace: String,
}

impl<'a> DeploymentBuilder<'a> {
    /// Create a new resource builder
    pub fn new(oomer: &'a Oomer, config: &'a OperatorConfig) -> Result<Self> {
        let name = oomer
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("oomer name is required".to_string()))?;

        let namespace = oomer
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            oomer,
            config,
            name,
            namespace,
        })
    }

    /// Image for the container, falling back to the configured default
    pub fn image(&self) -> String {
        match self.oomer.spec.image.as_deref() {
            Some(image) if !image.trim().is_empty() => image.to_string(),
            _ => self.config.default_image.clone(),
        }
    }

    /// Labels shared by the selector and the pod template, falling back to
    /// the configured defaults when the user map is unset, empty or malformed
    pub fn labels(&self) -> BTreeMap<String, String> {
        match &self.oomer.spec.labels {
            Some(labels) if labels_are_valid(labels) => labels.clone(),
            Some(_) => {
                debug!(name = %self.name, "Ignoring malformed labels, using defaults");
                self.config.default_labels.clone()
            }
            None => self.config.default_labels.clone(),
        }
    }

    /// Get owner reference for the Deployment
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: Oomer::api_version(&()).to_string(),
            kind: Oomer::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.oomer.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn build_container(&self) -> Container {
        Container {
            name: self.config.container_name.clone(),
            image: Some(self.image()),
            termination_message_path: Some(self.config.termination_message_path.clone()),
            ..Default::default()
        }
    }

    /// Build the Deployment for the Oomer
    pub fn build_deployment(&self) -> Deployment {
        let labels = self.labels();

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.oomer.spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![self.build_container()],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Compare an existing Deployment with the one this builder produces
    ///
    /// Only the fields the operator owns are compared. Anything the API
    /// server defaults (strategy, pull policy, resources) is left alone.
    pub fn drift(&self, existing: &Deployment) -> Drift {
        let desired_labels = self.labels();
        let existing_spec = existing.spec.clone().unwrap_or_default();

        if existing_spec.selector.match_labels.as_ref() != Some(&desired_labels) {
            return Drift::SelectorChanged;
        }

        let mut updated = existing.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        let mut changed = false;

        if spec.replicas != Some(self.oomer.spec.replicas) {
            spec.replicas = Some(self.oomer.spec.replicas);
            changed = true;
        }

        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        if template_meta.labels.as_ref() != Some(&desired_labels) {
            template_meta.labels = Some(desired_labels.clone());
            changed = true;
        }

        let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
        let desired = self.build_container();
        let single_container =
            matches!(pod_spec.containers.as_slice(), [c] if c.name == desired.name);
        match pod_spec.containers.first_mut() {
            Some(container) if single_container => {
                if container.image != desired.image {
                    container.image = desired.image;
                    changed = true;
                }
                if container.termination_message_path != desired.termination_message_path {
                    container.termination_message_path = desired.termination_message_path;
                    changed = true;
                }
            }
            _ => {
                pod_spec.containers = vec![desired];
                changed = true;
            }
        }

        if changed {
            Drift::Patchable(Box::new(updated))
        } else {
            Drift::InSync
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::OomerSpec;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn create_test_oomer(name: &str) -> Oomer {
        Oomer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid-123".to_string()),
                ..Default::default()
            },
            spec: OomerSpec {
                image: None,
                replicas: 1,
                labels: None,
            },
            status: None,
        }
    }

    fn template_labels(d: &Deployment) -> BTreeMap<String, String> {
        d.spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .clone()
            .unwrap()
    }

    fn selector_labels(d: &Deployment) -> BTreeMap<String, String> {
        d.spec
            .as_ref()
            .unwrap()
            .selector
            .match_labels
            .clone()
            .unwrap()
    }

    fn container(d: &Deployment) -> Container {
        d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0].clone()
    }

    #[test]
    fn test_default_substitution() {
        let oomer = create_test_oomer("test-oomer");
        let config = OperatorConfig::default();
        let deployment = DeploymentBuilder::new(&oomer, &config)
            .unwrap()
            .build_deployment();

        let mut expected = BTreeMap::new();
        expected.insert("app".to_string(), "oomer".to_string());

        assert_eq!(deployment.metadata.name, Some("test-oomer".to_string()));
        assert_eq!(deployment.metadata.namespace, Some("default".to_string()));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));
        assert_eq!(selector_labels(&deployment), expected);
        assert_eq!(template_labels(&deployment), expected);

        let container = container(&deployment);
        assert_eq!(container.name, "oomer");
        assert_eq!(container.image, Some("jdockerty/oomer:v0.0.1".to_string()));
        assert_eq!(
            container.termination_message_path,
            Some("/tmp/oomed-pod.log".to_string())
        );
    }

    #[test]
    fn test_custom_image_and_labels() {
        let mut oomer = create_test_oomer("test-oomer");
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "chaos".to_string());
        oomer.spec.image = Some("registry.local/oomer:v2".to_string());
        oomer.spec.labels = Some(labels.clone());
        oomer.spec.replicas = 4;

        let config = OperatorConfig::default();
        let deployment = DeploymentBuilder::new(&oomer, &config)
            .unwrap()
            .build_deployment();

        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(4));
        assert_eq!(selector_labels(&deployment), labels);
        assert_eq!(template_labels(&deployment), labels);
        assert_eq!(
            container(&deployment).image,
            Some("registry.local/oomer:v2".to_string())
        );
    }

    #[test]
    fn test_empty_optionals_fall_back() {
        let mut oomer = create_test_oomer("test-oomer");
        oomer.spec.image = Some("  ".to_string());
        oomer.spec.labels = Some(BTreeMap::new());

        let config = OperatorConfig::default().with_default_image("registry.local/oomer:test");
        let builder = DeploymentBuilder::new(&oomer, &config).unwrap();

        assert_eq!(builder.image(), "registry.local/oomer:test");
        assert_eq!(builder.labels(), config.default_labels);
    }

    #[test]
    fn test_label_validity() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "oomer".to_string());
        assert!(labels_are_valid(&labels));

        labels.insert("team".to_string(), String::new());
        assert!(labels_are_valid(&labels));

        let mut long_value = BTreeMap::new();
        long_value.insert("app".to_string(), "x".repeat(64));
        assert!(!labels_are_valid(&long_value));

        let mut empty_key = BTreeMap::new();
        empty_key.insert(String::new(), "oomer".to_string());
        assert!(!labels_are_valid(&empty_key));

        let too_many: BTreeMap<String, String> = (0..65)
            .map(|i| (format!("key-{}", i), "v".to_string()))
            .collect();
        assert!(!labels_are_valid(&too_many));

        assert!(!labels_are_valid(&BTreeMap::new()));
    }

    #[test]
    fn test_malformed_labels_fall_back() {
        let mut oomer = create_test_oomer("test-oomer");
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "x".repeat(64));
        oomer.spec.labels = Some(labels);

        let config = OperatorConfig::default();
        let deployment = DeploymentBuilder::new(&oomer, &config)
            .unwrap()
            .build_deployment();

        let mut expected = BTreeMap::new();
        expected.insert("app".to_string(), "oomer".to_string());
        assert_eq!(selector_labels(&deployment), expected);
        assert_eq!(template_labels(&deployment), expected);
    }

    #[test]
    fn test_owner_references() {
        let oomer = create_test_oomer("test-oomer");
        let config = OperatorConfig::default();
        let deployment = DeploymentBuilder::new(&oomer, &config)
            .unwrap()
            .build_deployment();

        let owner_refs = deployment.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].kind, "Oomer");
        assert_eq!(owner_refs[0].api_version, "jdocklabs.co.uk/v1alpha1");
        assert_eq!(owner_refs[0].name, "test-oomer");
        assert_eq!(owner_refs[0].uid, "test-uid-123");
        assert_eq!(owner_refs[0].controller, Some(true));
    }

    #[test]
    fn test_missing_name_rejected() {
        let mut oomer = create_test_oomer("test-oomer");
        oomer.metadata.name = None;
        let config = OperatorConfig::default();
        assert!(DeploymentBuilder::new(&oomer, &config).is_err());
    }

    #[test]
    fn test_drift_in_sync() {
        let oomer = create_test_oomer("test-oomer");
        let config = OperatorConfig::default();
        let builder = DeploymentBuilder::new(&oomer, &config).unwrap();
        let existing = builder.build_deployment();

        assert_eq!(builder.drift(&existing), Drift::InSync);
    }

    #[test]
    fn test_drift_replicas_and_image() {
        let mut oomer = create_test_oomer("test-oomer");
        let config = OperatorConfig::default();
        let mut existing = DeploymentBuilder::new(&oomer, &config)
            .unwrap()
            .build_deployment();
        existing.metadata.resource_version = Some("7".to_string());

        oomer.spec.replicas = 3;
        oomer.spec.image = Some("registry.local/oomer:v2".to_string());
        let builder = DeploymentBuilder::new(&oomer, &config).unwrap();

        match builder.drift(&existing) {
            Drift::Patchable(updated) => {
                assert_eq!(updated.spec.as_ref().unwrap().replicas, Some(3));
                assert_eq!(
                    container(&updated).image,
                    Some("registry.local/oomer:v2".to_string())
                );
                assert_eq!(updated.metadata.resource_version, Some("7".to_string()));
            }
            other => panic!("expected patchable drift, got {:?}", other),
        }
    }

    #[test]
    fn test_drift_selector_changed() {
        let mut oomer = create_test_oomer("test-oomer");
        let config = OperatorConfig::default();
        let existing = DeploymentBuilder::new(&oomer, &config)
            .unwrap()
            .build_deployment();

        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "chaos".to_string());
        oomer.spec.labels = Some(labels);
        let builder = DeploymentBuilder::new(&oomer, &config).unwrap();

        assert_eq!(builder.drift(&existing), Drift::SelectorChanged);
    }

    proptest! {
        #[test]
        fn test_selector_always_matches_template(
            labels in proptest::option::of(
                proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..5)
            ),
            image in proptest::option::of("[a-z/:.0-9]{0,20}"),
            replicas in 0i32..50,
        ) {
            let mut oomer = create_test_oomer("prop-oomer");
            oomer.spec.labels = labels;
            oomer.spec.image = image;
            oomer.spec.replicas = replicas;

            let config = OperatorConfig::default();
            let builder = DeploymentBuilder::new(&oomer, &config).unwrap();
            let deployment = builder.build_deployment();

            prop_assert_eq!(selector_labels(&deployment), template_labels(&deployment));
            prop_assert!(!selector_labels(&deployment).is_empty());
            prop_assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(replicas));
            prop_assert!(container(&deployment).image.map(|i| !i.trim().is_empty()).unwrap_or(false));
            prop_assert_eq!(builder.drift(&deployment), Drift::InSync);
        }
    }
}
