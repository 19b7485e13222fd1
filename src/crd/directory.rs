//! DirectoryDeployment Custom Resource Definition
//!
//! A DirectoryDeployment declares a set of directory-server replicas, one per
//! pre-existing PersistentVolumeClaim, fronted by a routing proxy.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ConditionStatus, PodsSpec, ReplicasSpec, CONDITION_AVAILABLE,
    CONDITION_IN_PROGRESS,
};
use crate::Error;

/// Longest Kubernetes object name usable for a Service
const MAX_DNS_LABEL: usize = 63;

/// Specification for a DirectoryDeployment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ibm.com",
    version = "v1",
    kind = "DirectoryDeployment",
    plural = "directorydeployments",
    shortname = "vd",
    status = "DirectoryDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"InProgress","type":"string","jsonPath":".status.conditions[?(@.type==\"InProgress\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryDeploymentSpec {
    /// Replica identities
    pub replicas: ReplicasSpec,

    /// Pod, image and configuration settings
    pub pods: PodsSpec,
}

impl DirectoryDeploymentSpec {
    /// Structural validation of the document
    ///
    /// Checks only what can be decided without talking to the API server:
    /// identity syntax and uniqueness, and the proxy PVC not doubling as a
    /// replica.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for pvc in &self.replicas.pvcs {
            validate_identity(pvc)?;
            if !seen.insert(pvc.as_str()) {
                return Err(duplicate_pvc(pvc));
            }
        }

        if let Some(pvc) = &self.pods.proxy.pvc {
            if seen.contains(pvc.as_str()) {
                return Err(duplicate_pvc(pvc));
            }
        }

        let refs = &self.pods.config_map;
        for (what, r) in [("proxy", &refs.proxy), ("server", &refs.server)] {
            if r.name.is_empty() || r.key.is_empty() {
                return Err(Error::validation(format!(
                    "The spec.pods.configMap.{what} entry must name both a ConfigMap and a key."
                )));
            }
        }

        Ok(())
    }
}

fn duplicate_pvc(pvc: &str) -> Error {
    Error::validation(format!(
        "The document contains a PVC which is referenced more than once: {pvc}.  \
         Each PVC in the document must be unique."
    ))
}

/// An identity must be usable as the suffix of a DNS-1035 label
fn validate_identity(pvc: &str) -> Result<(), Error> {
    let valid = !pvc.is_empty()
        && pvc
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !pvc.starts_with('-')
        && !pvc.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "The PVC name, {pvc}, cannot be used as a replica identity: only lower case \
             alphanumeric characters and '-' are allowed."
        )))
    }
}

impl DirectoryDeployment {
    /// Namespace of the deployment, defaulting to `default`
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Full validation including name length constraints
    pub fn validate(&self) -> Result<(), Error> {
        self.spec.validate()?;

        let name = self.name_any();
        for pvc in &self.spec.replicas.pvcs {
            let pod = crate::naming::replica_pod_name(&name, pvc);
            if pod.len() > MAX_DNS_LABEL {
                return Err(Error::validation(format!(
                    "The replica name, {pod}, is longer than {MAX_DNS_LABEL} characters."
                )));
            }
        }
        Ok(())
    }

    /// Status of the named condition, if it has been recorded
    pub fn condition_status(&self, type_: &str) -> Option<&ConditionStatus> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| &c.status)
    }

    /// True while a previous pass still holds InProgress=True
    pub fn is_in_progress(&self) -> bool {
        self.condition_status(CONDITION_IN_PROGRESS) == Some(&ConditionStatus::True)
    }

    /// When the InProgress condition last became True, if it still is
    pub fn in_progress_since(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_IN_PROGRESS && c.status == ConditionStatus::True)
            .map(|c| c.last_transition_time)
    }

    /// True when the last pass failed (Available=False)
    pub fn is_unavailable(&self) -> bool {
        self.condition_status(CONDITION_AVAILABLE) == Some(&ConditionStatus::False)
    }
}

/// Status for a DirectoryDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryDeploymentStatus {
    /// InProgress and Available conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DirectoryDeploymentStatus {
    /// Start from the conditions already recorded on the resource
    pub fn from_existing(existing: Option<&DirectoryDeploymentStatus>) -> Self {
        existing.cloned().unwrap_or_default()
    }

    /// Add a condition and return self for chaining
    ///
    /// The last transition time is kept when the status did not change.
    pub fn condition(mut self, mut condition: Condition) -> Self {
        if let Some(existing) = self.conditions.iter().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
