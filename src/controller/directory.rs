//! DirectoryDeployment reconciliation
//!
//! A pass compares the declared identities with the labelled replica pods.
//! When they differ it marks the resource InProgress, adds the new replicas,
//! re-renders the proxy configuration, removes the retired replicas and
//! records the outcome in the Available condition. Any failing step ends
//! the pass; the next pass starts again from the pods that actually exist.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::crd::{
    Condition, ConditionStatus, DirectoryDeployment, DirectoryDeploymentStatus,
    CONDITION_AVAILABLE, CONDITION_IN_PROGRESS,
};
use crate::lifecycle::{ReplicaLifecycle, Timeouts};
use crate::naming::{labels_for, replica_pod_name, selector};
use crate::platform::{load_document, DeploymentTarget, KubePlatform, NamespacedSecrets, Platform};
use crate::proxy::deploy_proxy;
use crate::replication::ReplicationExecutor;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::topology::{RunningTopology, TopologyDiff};
use crate::Error;

/// Reason recorded on the InProgress condition
pub const REASON_PROGRESS: &str = "DeploymentProgress";

/// Available reason for the first generation of a resource
pub const REASON_CREATED: &str = "DeploymentCreated";

/// Available reason for later generations
pub const REASON_UPDATED: &str = "DeploymentUpdated";

/// Delay before looking again at a resource another pass is working on
const IN_PROGRESS_REQUEUE: Duration = Duration::from_secs(30);

/// Controller context shared by every reconciliation pass
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .timeouts(Timeouts::default())
///     .shutdown(token)
///     .build();
/// ```
pub struct Context {
    /// Platform access (trait object for testability)
    pub platform: Arc<dyn Platform>,
    /// Ceilings for the waits of a pass
    pub timeouts: Timeouts,
    /// Age after which an InProgress=True condition is considered abandoned
    pub stale_after: Duration,
    /// Cancelled on shutdown; every pass waits on a child of this token
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context over a given platform with millisecond waits
    #[cfg(test)]
    pub fn for_testing(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            timeouts: Timeouts::fast(),
            stale_after: Duration::from_secs(3600),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    platform: Option<Arc<dyn Platform>>,
    timeouts: Timeouts,
    stale_after: Duration,
    shutdown: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            platform: None,
            timeouts: Timeouts::default(),
            stale_after: Duration::from_secs(3600),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the platform (primarily for testing)
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Set the wait ceilings
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the age after which an unfinished pass may be taken over
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Token cancelled when the operator shuts down
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            platform: self
                .platform
                .unwrap_or_else(|| Arc::new(KubePlatform::new(self.client.clone()))),
            timeouts: self.timeouts,
            stale_after: self.stale_after,
            shutdown: self.shutdown,
        }
    }
}

/// Reconcile a DirectoryDeployment
///
/// Retryable failures are returned so the controller requeues the
/// resource. Failures that need a document change are recorded in the
/// status and the pass waits for the next change.
#[instrument(skip(dd, ctx), fields(deployment = %dd.name_any()))]
pub async fn reconcile(dd: Arc<DirectoryDeployment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let target = DeploymentTarget::from_resource(&dd);
    let platform = ctx.platform.as_ref();

    let pods = platform
        .list_pods(&target.namespace, &selector(&labels_for(&target.name, "")))
        .await?;
    let running = RunningTopology::from_pods(&target.name, &pods);
    let desired = &dd.spec.replicas.pvcs;
    let diff = TopologyDiff::compute(desired, &running);

    if diff.is_empty() {
        debug!("topology is up to date");
        return Ok(Action::await_change());
    }

    if let Some(since) = dd.in_progress_since() {
        let fresh = (Utc::now() - since)
            .to_std()
            .map(|age| age < ctx.stale_after)
            .unwrap_or(true);
        if fresh {
            info!(%since, "previous pass still in progress, requeueing");
            return Ok(Action::requeue(IN_PROGRESS_REQUEUE));
        }
        warn!(%since, "taking over an abandoned pass");
    }

    info!(to_add = ?diff.to_add, to_delete = ?diff.to_delete, "applying topology change");

    let status = DirectoryDeploymentStatus::from_existing(dd.status.as_ref()).condition(
        Condition::new(
            CONDITION_IN_PROGRESS,
            ConditionStatus::True,
            REASON_PROGRESS,
            "The deployment is being processed.",
        ),
    );
    write_status(platform, &target, &status).await?;

    let cancel = ctx.shutdown.child_token();
    let outcome = apply_change(&ctx, &target, desired, &running, &diff, &cancel).await;

    let status = finished_status(status, dd.metadata.generation, outcome.as_ref().err());
    write_status(platform, &target, &status).await?;

    match outcome {
        Ok(()) => {
            info!("topology change applied");
            Ok(Action::await_change())
        }
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!(error = %e, "topology change needs a document change");
            Ok(Action::await_change())
        }
    }
}

/// Handle reconciliation errors
///
/// Only retryable errors reach this point; they are requeued after a delay.
pub fn error_policy(dd: Arc<DirectoryDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        deployment = %dd.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Read the server document with its secrets resolved
pub async fn resolve_server_config(
    platform: &dyn Platform,
    target: &DeploymentTarget,
) -> Result<ServerConfig, Error> {
    let namespace = &target.namespace;
    let document = load_document(platform, namespace, &target.pods.config_map.server)
        .await?
        .resolve_secrets(&NamespacedSecrets::new(platform, namespace))
        .await?;
    ServerConfig::from_document(&document)
}

async fn apply_change(
    ctx: &Context,
    target: &DeploymentTarget,
    desired: &[String],
    running: &RunningTopology,
    diff: &TopologyDiff,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let platform = ctx.platform.as_ref();
    let server = resolve_server_config(platform, target).await?;

    let lifecycle = ReplicaLifecycle::new(platform, target, &server, &ctx.timeouts, cancel);
    let mut executor = ReplicationExecutor::new(&lifecycle, running);

    executor.add_replicas(&diff.to_add, running).await?;

    let outcome = deploy_proxy(platform, target, desired, &server).await?;
    debug!(?outcome, "proxy configuration handled");

    // Newly added replicas hold agreements to the retiring ones too
    let grown = RunningTopology::from_members(
        running
            .identities()
            .chain(diff.to_add.iter().map(String::as_str))
            .map(|id| (id.to_string(), replica_pod_name(&target.name, id))),
    );
    executor.remove_replicas(&diff.to_delete, &grown).await
}

/// Terminal conditions of a pass
fn finished_status(
    status: DirectoryDeploymentStatus,
    generation: Option<i64>,
    error: Option<&Error>,
) -> DirectoryDeploymentStatus {
    let (reason, done) = if generation == Some(1) {
        (REASON_CREATED, "The deployment has been created.")
    } else {
        (REASON_UPDATED, "The deployment has been updated.")
    };
    let available = match error {
        None => Condition::new(CONDITION_AVAILABLE, ConditionStatus::True, reason, done),
        Some(e) => Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            reason,
            e.user_message(),
        ),
    };

    status
        .condition(Condition::new(
            CONDITION_IN_PROGRESS,
            ConditionStatus::False,
            REASON_PROGRESS,
            "The deployment has been processed.",
        ))
        .condition(available)
}

async fn write_status(
    platform: &dyn Platform,
    target: &DeploymentTarget,
    status: &DirectoryDeploymentStatus,
) -> Result<(), Error> {
    retry_with_backoff(&RetryConfig::default(), "patch status", || {
        platform.patch_status(&target.namespace, &target.name, status)
    })
    .await
}
