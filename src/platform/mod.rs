//! Access to the Kubernetes objects the engine reads and writes
//!
//! The reconciliation engine never talks to the API server directly. It goes
//! through the [`Platform`] trait so the add and delete plans can be driven
//! against mocks and in-memory fakes in tests.

pub mod kube;
pub mod manifests;

#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use ::kube::{Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::config::{ConfigDocument, SecretResolver};
use crate::crd::{ConfigMapRef, DirectoryDeployment, DirectoryDeploymentStatus, PodsSpec};
use crate::Error;

pub use self::kube::KubePlatform;

/// Observed state of a single pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodState {
    /// The pod does not exist
    Absent,
    /// Scheduled or pulling images
    Pending,
    /// Running; `ready` mirrors the first container's readiness
    Running {
        /// First container reports ready
        ready: bool,
    },
    /// Failed or Succeeded: the pod will not become ready again
    Terminated,
}

impl PodState {
    /// Derive the state from a pod object
    pub fn from_pod(pod: &Pod) -> Self {
        let status = match pod.status.as_ref() {
            Some(s) => s,
            None => return Self::Pending,
        };
        match status.phase.as_deref() {
            Some("Running") => {
                let ready = status
                    .container_statuses
                    .as_ref()
                    .and_then(|cs| cs.first())
                    .map(|c| c.ready)
                    .unwrap_or(false);
                Self::Running { ready }
            }
            Some("Failed") | Some("Succeeded") => Self::Terminated,
            _ => Self::Pending,
        }
    }

    /// Running with its first container ready
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Running { ready: true })
    }
}

/// Observed state of a one-shot Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// The job does not exist (not created yet or already garbage collected)
    Absent,
    /// Still running
    Active,
    /// At least one pod succeeded
    Succeeded,
    /// At least one pod failed
    Failed,
}

impl JobState {
    /// Derive the state from a job object
    pub fn from_job(job: &Job) -> Self {
        let status = match job.status.as_ref() {
            Some(s) => s,
            None => return Self::Active,
        };
        if status.failed.unwrap_or(0) > 0 {
            Self::Failed
        } else if status.succeeded.unwrap_or(0) > 0 {
            Self::Succeeded
        } else {
            Self::Active
        }
    }
}

/// Captured result of a command run inside a pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// The command exited successfully
    pub success: bool,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// The deployment a reconciliation pass or admission check acts on
///
/// Carries everything manifest construction needs: names, the owner
/// reference stamped on created objects, and the pod settings.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentTarget {
    /// DirectoryDeployment name
    pub name: String,
    /// Namespace of the deployment and every object it owns
    pub namespace: String,
    /// Controller owner reference for created objects
    pub owner: Option<OwnerReference>,
    /// Pod settings from the spec
    pub pods: PodsSpec,
}

impl DeploymentTarget {
    /// Build the target for a DirectoryDeployment resource
    pub fn from_resource(dd: &DirectoryDeployment) -> Self {
        Self {
            name: dd.name_any(),
            namespace: dd.namespace_or_default(),
            owner: dd.controller_owner_ref(&()),
            pods: dd.spec.pods.clone(),
        }
    }

    /// Owner references to stamp on created objects
    pub fn owner_references(&self) -> Option<Vec<OwnerReference>> {
        self.owner.clone().map(|o| vec![o])
    }
}

/// Trait abstracting the Kubernetes operations used by the engine
///
/// Every method is namespace scoped. Deleting an object that does not exist
/// succeeds; creating one that already exists succeeds without changing it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Current state of a pod
    async fn pod_state(&self, namespace: &str, name: &str) -> Result<PodState, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<(), Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: Service) -> Result<(), Error>;

    /// Delete a service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a job
    async fn create_job(&self, namespace: &str, job: Job) -> Result<(), Error>;

    /// Delete a job together with its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Current state of a job
    async fn job_state(&self, namespace: &str, name: &str) -> Result<JobState, Error>;

    /// Data of a config map, `None` when it does not exist
    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Create or replace a config map
    async fn apply_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<(), Error>;

    /// Delete a config map
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Decoded data of a secret, `None` when it does not exist
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Whether a PersistentVolumeClaim exists
    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Whether a Deployment exists
    async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deployment: Deployment)
        -> Result<(), Error>;

    /// Trigger a rolling restart by stamping the pod template
    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
        restarted_at: &str,
    ) -> Result<(), Error>;

    /// Run a command in the first container of a pod
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error>;

    /// Patch the status sub-resource of a DirectoryDeployment
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DirectoryDeploymentStatus,
    ) -> Result<(), Error>;
}

/// Resolves `secret:` references against one namespace
pub struct NamespacedSecrets<'a> {
    platform: &'a dyn Platform,
    namespace: &'a str,
}

impl<'a> NamespacedSecrets<'a> {
    /// Create a resolver for the given namespace
    pub fn new(platform: &'a dyn Platform, namespace: &'a str) -> Self {
        Self {
            platform,
            namespace,
        }
    }
}

#[async_trait]
impl SecretResolver for NamespacedSecrets<'_> {
    async fn secret_value(&self, name: &str, key: &str) -> Result<Option<String>, Error> {
        Ok(self
            .platform
            .secret_data(self.namespace, name)
            .await?
            .and_then(|mut data| data.remove(key)))
    }
}

/// Read and parse the document referenced by a ConfigMap key
///
/// A missing ConfigMap or key is a validation error: the deployment cannot
/// make progress until the document is fixed.
pub async fn load_document(
    platform: &dyn Platform,
    namespace: &str,
    reference: &ConfigMapRef,
) -> Result<ConfigDocument, Error> {
    let data = platform
        .config_map_data(namespace, &reference.name)
        .await?
        .ok_or_else(|| {
            Error::validation(format!("The ConfigMap, {}, doesn't exist!", reference.name))
        })?;
    let text = data.get(&reference.key).ok_or_else(|| {
        Error::validation(format!(
            "The ConfigMap, {}, does not contain the {} key!",
            reference.name, reference.key
        ))
    })?;
    ConfigDocument::parse(text)
}
