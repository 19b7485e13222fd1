//! Custom Resource Definitions for the directory operator

mod directory;
mod types;

pub use directory::{DirectoryDeployment, DirectoryDeploymentSpec, DirectoryDeploymentStatus};
pub use types::{
    Condition, ConditionStatus, ConfigMapRef, ConfigMapRefs, ImageSpec, PodsSpec, ProxySpec,
    ReplicasSpec, CONDITION_AVAILABLE, CONDITION_IN_PROGRESS, DEFAULT_IMAGE_LABEL,
    DEFAULT_IMAGE_REPO,
};
