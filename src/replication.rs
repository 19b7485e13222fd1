//! Executing add and remove plans against live replicas
//!
//! The plans come from [`crate::topology`]; this module turns each step into
//! lifecycle calls, seed jobs and `isvd_manage_replica` invocations. Steps
//! run strictly in order. Identities inside one step run concurrently and
//! all of them finish before the next step starts.

use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::lifecycle::ReplicaLifecycle;
use crate::seeding::seed_replicas;
use crate::topology::{
    plan_additions, plan_removals, Agreement, AgreementKind, PlanStep, ReplicaState,
    RunningTopology, Topology,
};
use crate::Error;

/// Administrative tool inside the server image managing agreements
pub const MANAGE_REPLICA: &str = "isvd_manage_replica";

/// Command removing any agreement towards `destination_pod`
pub fn remove_agreement_command(destination_pod: &str) -> Vec<String> {
    [MANAGE_REPLICA, "-r", "-i", destination_pod]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Command creating an agreement, to be run on the source pod
pub fn create_agreement_command(
    kind: AgreementKind,
    source_pod: &str,
    destination_pod: &str,
    principal_pod: &str,
    port: i32,
    secure: bool,
) -> Vec<String> {
    let port = port.to_string();
    let mut command: Vec<String> = match kind {
        AgreementKind::PrincipalToPeer => vec![
            MANAGE_REPLICA,
            "-ap",
            "-h",
            destination_pod,
            "-p",
            port.as_str(),
            "-i",
            destination_pod,
            "-ph",
            source_pod,
            "-pp",
            port.as_str(),
        ],
        AgreementKind::PeerToPeer => vec![
            MANAGE_REPLICA,
            "-ar",
            "-h",
            destination_pod,
            "-p",
            port.as_str(),
            "-i",
            destination_pod,
            "-s",
            principal_pod,
        ],
    }
    .into_iter()
    .map(str::to_string)
    .collect();

    if secure {
        command.push("-z".to_string());
    }
    command
}

/// Executes plans for one pass
pub struct ReplicationExecutor<'a> {
    lifecycle: &'a ReplicaLifecycle<'a>,
    principal: Option<String>,
    topology: Topology,
}

impl<'a> ReplicationExecutor<'a> {
    /// Start from the pass's running snapshot
    pub fn new(lifecycle: &'a ReplicaLifecycle<'a>, running: &RunningTopology) -> Self {
        Self {
            lifecycle,
            principal: None,
            topology: Topology::from_running(running),
        }
    }

    /// Replica states after the steps executed so far
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Bring `to_add` into the topology
    #[instrument(skip(self, running), fields(deployment = %self.lifecycle.target().name))]
    pub async fn add_replicas(
        &mut self,
        to_add: &[String],
        running: &RunningTopology,
    ) -> Result<(), Error> {
        if to_add.is_empty() {
            return Ok(());
        }
        let plan = plan_additions(to_add, running);
        if let Some(principal) = &plan.principal {
            info!(principal = %principal, "Using principal");
        }
        self.principal = plan.principal;

        // The principal is offline from its Stop step until its final restart
        let mut principal_down = false;
        for step in &plan.steps {
            principal_down |= matches!(step, PlanStep::Stop { .. });
            if let Err(e) = self.execute(step).await {
                if principal_down {
                    self.restore_principal().await;
                }
                return Err(e);
            }
            self.topology.apply(step);
        }
        Ok(())
    }

    /// Bring the principal back after an add plan failed while it was down
    ///
    /// Best effort. The plan's own error is what the pass reports, and a
    /// principal that cannot be restarted is only logged.
    async fn restore_principal(&mut self) {
        let Some(principal) = self.principal.clone() else {
            return;
        };
        let lifecycle = self.lifecycle;
        let state = self.topology.state(&principal);
        warn!(principal = %principal, ?state, "Add plan failed, restarting the principal");

        let restored = async {
            match state {
                ReplicaState::Starting => {}
                ReplicaState::PrincipalElected => lifecycle.start_replica(&principal).await?,
                // The Stop step itself failed part way
                _ => {
                    lifecycle.stop_replica(&principal, true).await?;
                    lifecycle.start_replica(&principal).await?;
                }
            }
            lifecycle.create_endpoint(&principal).await
        }
        .await;

        match restored {
            Ok(()) => self.topology.set(&principal, ReplicaState::Starting),
            Err(e) => warn!(principal = %principal, error = %e, "Failed to restart the principal"),
        }
    }

    /// Retire `to_delete` from the topology
    #[instrument(skip(self, running), fields(deployment = %self.lifecycle.target().name))]
    pub async fn remove_replicas(
        &mut self,
        to_delete: &[String],
        running: &RunningTopology,
    ) -> Result<(), Error> {
        let steps = plan_removals(to_delete, running);
        self.run(&steps).await
    }

    async fn run(&mut self, steps: &[PlanStep]) -> Result<(), Error> {
        for step in steps {
            self.execute(step).await?;
            self.topology.apply(step);
        }
        Ok(())
    }

    async fn execute(&self, step: &PlanStep) -> Result<(), Error> {
        let lifecycle = self.lifecycle;
        debug!(?step, "Executing plan step");
        match step {
            PlanStep::Start(ids) => {
                try_join_all(ids.iter().map(|id| lifecycle.start_replica(id))).await?;
            }
            PlanStep::CreateEndpoints(ids) => {
                try_join_all(ids.iter().map(|id| lifecycle.create_endpoint(id))).await?;
            }
            PlanStep::AwaitReady(ids) => {
                try_join_all(ids.iter().map(|id| lifecycle.wait_ready(id))).await?;
            }
            PlanStep::Agree(agreements) => {
                for agreement in agreements {
                    self.create_agreement(agreement).await?;
                }
            }
            PlanStep::Stop {
                identity,
                await_gone,
            } => lifecycle.stop_replica(identity, *await_gone).await?,
            PlanStep::Seed {
                principal,
                replicas,
            } => seed_replicas(lifecycle, principal, replicas).await?,
            PlanStep::Sever { holders, identity } => {
                for holder in holders {
                    self.remove_agreement(holder, identity).await;
                }
            }
        }
        Ok(())
    }

    async fn create_agreement(&self, agreement: &Agreement) -> Result<(), Error> {
        let lifecycle = self.lifecycle;
        let principal = self
            .principal
            .as_deref()
            .ok_or_else(|| Error::internal("agreement requested without a principal"))?;
        info!(%agreement, kind = ?agreement.kind, "Creating replication agreement");

        self.remove_agreement(&agreement.source, &agreement.destination)
            .await;

        let server = lifecycle.server();
        let command = create_agreement_command(
            agreement.kind,
            &lifecycle.pod_name(&agreement.source),
            &lifecycle.pod_name(&agreement.destination),
            &lifecycle.pod_name(principal),
            server.port,
            server.secure,
        );
        let output = lifecycle.run_command(&agreement.source, command).await?;
        if !output.success {
            return Err(Error::command(format!(
                "Failed to create the replication agreement {agreement}: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Best effort: a missing agreement or unreachable holder is only logged
    async fn remove_agreement(&self, holder: &str, identity: &str) {
        let lifecycle = self.lifecycle;
        let command = remove_agreement_command(&lifecycle.pod_name(identity));
        match lifecycle.run_command(holder, command).await {
            Ok(output) if output.success => {
                debug!(holder, identity, "Removed replication agreement")
            }
            Ok(output) => debug!(
                holder,
                identity,
                stderr = %output.stderr.trim(),
                "No replication agreement removed"
            ),
            Err(e) => warn!(holder, identity, error = %e, "Failed to remove replication agreement"),
        }
    }
}
