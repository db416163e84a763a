//! Custom Resource Definitions for the OOM operator
//!
//! This module defines the `Oomer` CRD that declares a fleet of pods which
//! deliberately run out of memory.

use crate::error::{OperatorError, Result};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

/// Oomer custom resource definition
///
/// Declares a Deployment of pods whose only job is to exhaust their memory
/// limit and crash. The operator keeps a Deployment with the same name and
/// namespace in line with this spec.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "jdocklabs.co.uk",
    version = "v1alpha1",
    kind = "Oomer",
    plural = "oomers",
    shortname = "oom",
    namespaced,
    status = "OomerStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Observed", "type":"integer", "jsonPath":".status.observedReplicas"}"#,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OomerSpec {
    /// Container image for the crashing workload; the operator default is
    /// used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Number of pods to run. Required; zero pauses the fleet
    #[validate(range(min = 0, message = "replicas must not be negative"))]
    pub replicas: i32,

    /// Labels applied to the pod template and used as the Deployment selector;
    /// the operator defaults are used when unset, empty or malformed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Observed state of an Oomer
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OomerStatus {
    /// Replica count last applied to the Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_replicas: Option<i32>,
}

impl OomerSpec {
    /// Validate the spec, flattening field errors into one message
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|errors| {
            let messages: Vec<String> = errors
                .field_errors()
                .iter()
                .flat_map(|(field, errs)| {
                    errs.iter().map(move |e| match &e.message {
                        Some(msg) => format!("{}: {}", field, msg),
                        None => format!("{}: {}", field, e.code),
                    })
                })
                .collect();
            OperatorError::ValidationError(messages.join("; "))
        })
    }
}

/// Namespaced identity of an object (`namespace/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object, falling back to the `default` namespace
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Oomer {
    /// Identity of this record
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self)
    }

    /// Whether the platform has recorded a deletion request
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Currently recorded `status.observedReplicas`
    pub fn observed_replicas(&self) -> Option<i32> {
        self.status.as_ref().and_then(|s| s.observed_replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;
    use serde_json::json;

    #[test]
    fn test_replicas_is_required() {
        let doc = json!({
            "apiVersion": "jdocklabs.co.uk/v1alpha1",
            "kind": "Oomer",
            "metadata": { "name": "test-oomer", "namespace": "default" },
            "spec": { "image": "jdockerty/oomer:v0.0.1" }
        });
        assert!(serde_json::from_value::<Oomer>(doc).is_err());
    }

    #[test]
    fn test_optional_fields_absent() {
        let doc = json!({
            "apiVersion": "jdocklabs.co.uk/v1alpha1",
            "kind": "Oomer",
            "metadata": { "name": "test-oomer", "namespace": "default" },
            "spec": { "replicas": 1 }
        });
        let oomer: Oomer = serde_json::from_value(doc).unwrap();
        assert_eq!(oomer.spec.replicas, 1);
        assert!(oomer.spec.image.is_none());
        assert!(oomer.spec.labels.is_none());
        assert!(oomer.status.is_none());
    }

    #[test]
    fn test_status_wire_name() {
        let status = OomerStatus {
            observed_replicas: Some(3),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value, json!({ "observedReplicas": 3 }));

        let empty = serde_json::to_value(OomerStatus::default()).unwrap();
        assert_eq!(empty, json!({}));
    }

    #[test]
    fn test_crd_schema_requires_replicas() {
        let crd = Oomer::crd();
        assert_eq!(crd.spec.group, "jdocklabs.co.uk");
        assert_eq!(crd.spec.names.kind, "Oomer");
        assert_eq!(crd.spec.names.plural, "oomers");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        let schema = serde_json::to_value(&version.schema).unwrap();
        let required = &schema["openAPIV3Schema"]["properties"]["spec"]["required"];
        assert!(required
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "replicas"));
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let spec = OomerSpec {
            image: None,
            replicas: -1,
            labels: None,
        };
        let err = spec.check().unwrap_err();
        assert!(err.to_string().contains("replicas"));
    }

    #[test]
    fn test_zero_replicas_valid() {
        let spec = OomerSpec {
            image: None,
            replicas: 0,
            labels: None,
        };
        assert!(spec.check().is_ok());
    }

    #[test]
    fn test_malformed_labels_are_not_rejected() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "x".repeat(64));
        let spec = OomerSpec {
            image: None,
            replicas: 1,
            labels: Some(labels),
        };
        assert!(spec.check().is_ok());
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new("default", "test-oomer");
        assert_eq!(key.to_string(), "default/test-oomer");
    }

    #[test]
    fn test_object_key_defaults_namespace() {
        let oomer = Oomer::new(
            "test-oomer",
            OomerSpec {
                image: None,
                replicas: 1,
                labels: None,
            },
        );
        assert_eq!(oomer.key(), ObjectKey::new("default", "test-oomer"));
        assert!(!oomer.is_being_deleted());
        assert_eq!(oomer.observed_replicas(), None);
    }
}
