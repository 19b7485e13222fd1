//! Supporting types for the DirectoryDeployment CRD

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, LocalObjectReference, ResourceRequirements,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set while a topology change is being applied
pub const CONDITION_IN_PROGRESS: &str = "InProgress";

/// Condition type recording the outcome of the last topology change
pub const CONDITION_AVAILABLE: &str = "Available";

/// Default image repository for the directory images
pub const DEFAULT_IMAGE_REPO: &str = "icr.io/isvd";

/// Default image label (tag) for the directory images
pub const DEFAULT_IMAGE_LABEL: &str = "latest";

fn default_repo() -> String {
    DEFAULT_IMAGE_REPO.to_string()
}

fn default_label() -> String {
    DEFAULT_IMAGE_LABEL.to_string()
}

/// Replica identities, one per pre-existing PersistentVolumeClaim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasSpec {
    /// Names of the PVCs backing each replica, in declaration order
    #[serde(default)]
    pub pvcs: Vec<String>,
}

/// Image settings shared by the server, seed and proxy containers
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Repository prefix, e.g. `icr.io/isvd`
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Image label applied to every directory image
    #[serde(default = "default_label")]
    pub label: String,

    /// Pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Secrets used when pulling the images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            label: default_label(),
            image_pull_policy: None,
            image_pull_secrets: None,
        }
    }
}

impl ImageSpec {
    /// Full image reference for one of the directory components
    ///
    /// `component` is one of `server`, `seed` or `proxy`.
    pub fn image_for(&self, component: &str) -> String {
        format!("{}/verify-directory-{}:{}", self.repo, component, self.label)
    }
}

/// Reference to a key within a ConfigMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapRef {
    /// ConfigMap name
    pub name: String,

    /// Key holding the YAML document
    pub key: String,
}

/// The two configuration documents consumed by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapRefs {
    /// Base document for the routing proxy
    pub proxy: ConfigMapRef,

    /// Document shared by every directory server replica
    pub server: ConfigMapRef,
}

/// Proxy specific settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProxySpec {
    /// Optional PVC mounted as the proxy's data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
}

/// Pod settings applied to every instance the operator creates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodsSpec {
    /// Image configuration
    #[serde(default)]
    pub image: ImageSpec,

    /// Server and proxy configuration documents
    pub config_map: ConfigMapRefs,

    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxySpec,

    /// Resource requirements for the server containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Service account the pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (InProgress, Available)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}
