//! Bulk-loading new replicas from the principal's volume
//!
//! One Job per new replica copies the (stopped) principal's data into the
//! replica's PVC. All jobs of a pass run concurrently and share a transient
//! ConfigMap requesting a clean replica seed; the ConfigMap is removed
//! whatever the outcome.

use futures::future::try_join_all;
use tracing::{info, instrument, warn};

use crate::lifecycle::{poll_until, ReplicaLifecycle};
use crate::naming::{seed_config_map_name, seed_job_name};
use crate::platform::{manifests, JobState};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Seed every replica from `principal` and wait for all jobs to succeed
#[instrument(skip(lifecycle), fields(deployment = %lifecycle.target().name))]
pub async fn seed_replicas(
    lifecycle: &ReplicaLifecycle<'_>,
    principal: &str,
    replicas: &[String],
) -> Result<(), Error> {
    if replicas.is_empty() {
        return Ok(());
    }

    let platform = lifecycle.platform();
    let target = lifecycle.target();
    platform
        .apply_config_map(&target.namespace, manifests::seed_config_map(target))
        .await?;

    let outcome = run_jobs(lifecycle, principal, replicas).await;

    let name = seed_config_map_name(&target.name);
    let cleanup = retry_with_backoff(&RetryConfig::cleanup(), "delete seed config", || {
        platform.delete_config_map(&target.namespace, &name)
    })
    .await;
    if let Err(e) = cleanup {
        warn!(config_map = %name, error = %e, "Failed to delete the seed configuration");
    }

    outcome
}

async fn run_jobs(
    lifecycle: &ReplicaLifecycle<'_>,
    principal: &str,
    replicas: &[String],
) -> Result<(), Error> {
    let platform = lifecycle.platform();
    let target = lifecycle.target();

    for replica in replicas {
        clear_job(lifecycle, replica).await?;
        info!(principal, replica = %replica, "Creating seed job");
        let job = manifests::seed_job(target, lifecycle.server(), principal, replica);
        platform.create_job(&target.namespace, job).await?;
    }

    try_join_all(replicas.iter().map(|replica| wait_for_job(lifecycle, replica))).await?;
    info!(count = replicas.len(), "Seeding complete");
    Ok(())
}

/// Remove a seed job left behind by an earlier pass
///
/// Job names are fixed per replica, so an old job would otherwise be
/// mistaken for this pass's and its stale outcome reported.
async fn clear_job(lifecycle: &ReplicaLifecycle<'_>, replica: &str) -> Result<(), Error> {
    let platform = lifecycle.platform();
    let target = lifecycle.target();
    let job = seed_job_name(&target.name, replica);
    if platform.job_state(&target.namespace, &job).await? == JobState::Absent {
        return Ok(());
    }

    info!(job = %job, "Deleting leftover seed job");
    platform.delete_job(&target.namespace, &job).await?;
    let timeouts = lifecycle.timeouts();
    poll_until(
        lifecycle.cancel(),
        timeouts.pod_gone,
        timeouts.interval,
        &format!("seed job {job} to be deleted"),
        || async { Ok(platform.job_state(&target.namespace, &job).await? == JobState::Absent) },
    )
    .await
}

/// Wait for the seed job of `replica` to complete
///
/// A failed job is fatal. A job that vanished before reporting success is
/// treated the same way, since its outcome can no longer be observed.
async fn wait_for_job(lifecycle: &ReplicaLifecycle<'_>, replica: &str) -> Result<(), Error> {
    let target = lifecycle.target();
    let job = seed_job_name(&target.name, replica);
    let timeouts = lifecycle.timeouts();

    poll_until(
        lifecycle.cancel(),
        timeouts.job_done,
        timeouts.interval,
        &format!("seed job {job} to complete"),
        || async {
            match lifecycle.platform().job_state(&target.namespace, &job).await? {
                JobState::Succeeded => Ok(true),
                JobState::Active => Ok(false),
                JobState::Failed => Err(Error::command(format!("The job, {job}, failed!"))),
                JobState::Absent => Err(Error::command(format!(
                    "The job, {job}, disappeared before completing."
                ))),
            }
        },
    )
    .await
}
