//! Single-replica lifecycle: start, expose, wait, stop, administer
//!
//! A [`ReplicaLifecycle`] is scoped to one reconciliation pass. It borrows
//! the platform, the deployment target and the resolved server settings, and
//! every wait it performs honours the pass's cancellation token.

mod poll;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use poll::poll_until;

use crate::config::ServerConfig;
use crate::naming::replica_pod_name;
use crate::platform::{manifests, DeploymentTarget, ExecOutput, Platform, PodState};
use crate::Error;

/// Ceilings and interval for the bounded waits of a pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for a pod to become ready
    pub pod_ready: Duration,
    /// Wait for a deleted pod to disappear
    pub pod_gone: Duration,
    /// Wait for a seed job to finish
    pub job_done: Duration,
    /// Poll interval shared by every wait
    pub interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pod_ready: Duration::from_secs(600),
            pod_gone: Duration::from_secs(300),
            job_done: Duration::from_secs(600),
            interval: Duration::from_secs(1),
        }
    }
}

impl Timeouts {
    /// Millisecond waits for tests
    pub fn fast() -> Self {
        Self {
            pod_ready: Duration::from_millis(200),
            pod_gone: Duration::from_millis(200),
            job_done: Duration::from_millis(200),
            interval: Duration::from_millis(1),
        }
    }
}

/// Operations on individual replicas of one deployment
pub struct ReplicaLifecycle<'a> {
    platform: &'a dyn Platform,
    target: &'a DeploymentTarget,
    server: &'a ServerConfig,
    timeouts: &'a Timeouts,
    cancel: &'a CancellationToken,
}

impl<'a> ReplicaLifecycle<'a> {
    /// Scope lifecycle operations to a pass
    pub fn new(
        platform: &'a dyn Platform,
        target: &'a DeploymentTarget,
        server: &'a ServerConfig,
        timeouts: &'a Timeouts,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            platform,
            target,
            server,
            timeouts,
            cancel,
        }
    }

    /// Platform handle, for collaborators sharing the pass
    pub fn platform(&self) -> &'a dyn Platform {
        self.platform
    }

    /// Deployment being reconciled
    pub fn target(&self) -> &'a DeploymentTarget {
        self.target
    }

    /// Resolved server settings of the pass
    pub fn server(&self) -> &'a ServerConfig {
        self.server
    }

    /// Wait settings of the pass
    pub fn timeouts(&self) -> &'a Timeouts {
        self.timeouts
    }

    /// Cancellation token of the pass
    pub fn cancel(&self) -> &'a CancellationToken {
        self.cancel
    }

    /// Pod (and service) name of an identity
    pub fn pod_name(&self, identity: &str) -> String {
        replica_pod_name(&self.target.name, identity)
    }

    /// Create the server pod of an identity
    pub async fn start_replica(&self, identity: &str) -> Result<(), Error> {
        info!(identity, pod = %self.pod_name(identity), "Starting replica");
        let pod = manifests::replica_pod(self.target, self.server, identity);
        self.platform.create_pod(&self.target.namespace, pod).await
    }

    /// Create the ClusterIP service of an identity
    pub async fn create_endpoint(&self, identity: &str) -> Result<(), Error> {
        debug!(identity, "Creating replica service");
        let service = manifests::replica_service(self.target, self.server, identity);
        self.platform
            .create_service(&self.target.namespace, service)
            .await
    }

    /// Block until the identity's pod is running with a ready container
    ///
    /// A pod that has already terminated will never become ready and fails
    /// the wait immediately.
    pub async fn wait_ready(&self, identity: &str) -> Result<(), Error> {
        let pod = self.pod_name(identity);
        let namespace = &self.target.namespace;
        poll_until(
            self.cancel,
            self.timeouts.pod_ready,
            self.timeouts.interval,
            &format!("pod {pod} to become ready"),
            || async {
                match self.platform.pod_state(namespace, &pod).await? {
                    PodState::Terminated => Err(Error::internal(format!(
                        "The pod, {pod}, is no longer running."
                    ))),
                    state => Ok(state.is_ready()),
                }
            },
        )
        .await?;
        info!(identity, pod = %pod, "Replica is ready");
        Ok(())
    }

    /// Delete the identity's service and pod, optionally waiting for the pod
    /// to disappear
    pub async fn stop_replica(&self, identity: &str, await_gone: bool) -> Result<(), Error> {
        let pod = self.pod_name(identity);
        let namespace = &self.target.namespace;
        info!(identity, pod = %pod, "Stopping replica");

        self.platform.delete_service(namespace, &pod).await?;
        self.platform.delete_pod(namespace, &pod).await?;

        if await_gone {
            poll_until(
                self.cancel,
                self.timeouts.pod_gone,
                self.timeouts.interval,
                &format!("pod {pod} to terminate"),
                || async {
                    Ok(self.platform.pod_state(namespace, &pod).await? == PodState::Absent)
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Run an administrative command in the identity's server
    pub async fn run_command(
        &self,
        identity: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let pod = self.pod_name(identity);
        debug!(pod = %pod, command = %command.join(" "), "Executing command");
        self.platform
            .exec(&self.target.namespace, &pod, command)
            .await
    }
}
