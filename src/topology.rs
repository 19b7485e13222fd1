//! Desired versus running topology and the add/remove plans
//!
//! Everything in this module is pure: the running set is a snapshot taken at
//! the start of a pass, and the plans are ordered lists of steps that the
//! executor in [`crate::replication`] carries out against the platform. The
//! [`Topology`] state map lets a plan be replayed against a synthetic
//! topology without a cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::core::v1::Pod;

use crate::naming::{replica_pod_name, PVC_LABEL};

/// Replica identity to live pod name, built from labelled pods
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunningTopology {
    members: BTreeMap<String, String>,
}

impl RunningTopology {
    /// Build the snapshot from the pods carrying the deployment's labels
    ///
    /// Only a pod named `<deployment>-<identity>` counts as the instance of
    /// the identity on its label; anything else is ignored.
    pub fn from_pods(deployment: &str, pods: &[Pod]) -> Self {
        let members = pods
            .iter()
            .filter_map(|pod| {
                let identity = pod.metadata.labels.as_ref()?.get(PVC_LABEL)?.clone();
                let name = pod.metadata.name.clone()?;
                (name == replica_pod_name(deployment, &identity)).then_some((identity, name))
            })
            .collect();
        Self { members }
    }

    /// Build a snapshot from identity/pod pairs
    pub fn from_members<I, K, V>(members: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            members: members
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Whether the identity has a live instance
    pub fn contains(&self, identity: &str) -> bool {
        self.members.contains_key(identity)
    }

    /// True when no replica is running
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Running identities in sorted order
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Pod name of a running identity
    pub fn pod(&self, identity: &str) -> Option<&str> {
        self.members.get(identity).map(String::as_str)
    }

    /// Pod names of every running replica
    pub fn pods(&self) -> impl Iterator<Item = &str> {
        self.members.values().map(String::as_str)
    }

    /// The member used as principal when the set is non-empty
    pub fn principal(&self) -> Option<&str> {
        self.identities().next()
    }
}

/// Identities to create and to retire in one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    /// Desired but not running, in desired order
    pub to_add: Vec<String>,
    /// Running but no longer desired, sorted
    pub to_delete: Vec<String>,
}

impl TopologyDiff {
    /// Set difference of the desired list and the running snapshot
    pub fn compute(desired: &[String], running: &RunningTopology) -> Self {
        let wanted: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
        let mut seen = BTreeSet::new();

        let to_add = desired
            .iter()
            .filter(|id| !running.contains(id) && seen.insert(id.as_str()))
            .cloned()
            .collect();
        let to_delete = running
            .identities()
            .filter(|id| !wanted.contains(id))
            .map(str::to_string)
            .collect();

        Self { to_add, to_delete }
    }

    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

/// Direction and role of a replication agreement
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgreementKind {
    /// From the principal to a new replica, used to source the seed
    PrincipalToPeer,
    /// Between two non-principal replicas, referencing the principal
    PeerToPeer,
}

/// A directed agreement between two identities
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Agreement {
    /// Identity whose server holds the agreement
    pub source: String,
    /// Identity receiving the changes
    pub destination: String,
    /// Role of the agreement
    pub kind: AgreementKind,
}

impl Agreement {
    fn new(source: &str, destination: &str, kind: AgreementKind) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            kind,
        }
    }
}

impl fmt::Display for Agreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// One ordered step of a plan; identities within a step may run concurrently
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanStep {
    /// Create the server pods
    Start(Vec<String>),
    /// Create the per-replica services
    CreateEndpoints(Vec<String>),
    /// Block until each pod is running and ready
    AwaitReady(Vec<String>),
    /// Establish agreements, removing any stale one with the same destination first
    Agree(Vec<Agreement>),
    /// Delete the replica's service and pod
    Stop {
        /// Replica to stop
        identity: String,
        /// Block until the pod is gone
        await_gone: bool,
    },
    /// Copy the principal's data into each replica's volume
    Seed {
        /// Source of the data, stopped while seeding
        principal: String,
        /// Volumes to seed
        replicas: Vec<String>,
    },
    /// Remove agreements referencing `identity` from each holder, best effort
    Sever {
        /// Replicas that may hold an agreement to `identity`
        holders: Vec<String>,
        /// Replica being retired
        identity: String,
    },
}

/// Ordered steps bringing new identities into the topology
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddPlan {
    /// Principal chosen for this pass
    pub principal: Option<String>,
    /// Steps in execution order
    pub steps: Vec<PlanStep>,
}

/// Build the add plan for `to_add` given the running snapshot
///
/// The principal is an existing member when there is one, otherwise the
/// first identity to add, which is started standalone before anything else.
pub fn plan_additions(to_add: &[String], running: &RunningTopology) -> AddPlan {
    let mut steps = Vec::new();
    let mut new: Vec<String> = to_add.to_vec();

    let principal = match running.principal() {
        Some(p) => p.to_string(),
        None => {
            if new.is_empty() {
                return AddPlan::default();
            }
            let p = new.remove(0);
            steps.push(PlanStep::Start(vec![p.clone()]));
            steps.push(PlanStep::CreateEndpoints(vec![p.clone()]));
            steps.push(PlanStep::AwaitReady(vec![p.clone()]));
            p
        }
    };

    if new.is_empty() {
        return AddPlan {
            principal: Some(principal),
            steps,
        };
    }

    steps.push(PlanStep::Agree(
        new.iter()
            .map(|id| Agreement::new(&principal, id, AgreementKind::PrincipalToPeer))
            .collect(),
    ));
    steps.push(PlanStep::Stop {
        identity: principal.clone(),
        await_gone: true,
    });
    steps.push(PlanStep::Seed {
        principal: principal.clone(),
        replicas: new.clone(),
    });
    steps.push(PlanStep::Start(new.clone()));
    steps.push(PlanStep::AwaitReady(new.clone()));

    let members: BTreeSet<&str> = running
        .identities()
        .chain(std::iter::once(principal.as_str()))
        .chain(new.iter().map(String::as_str))
        .collect();
    let mesh: Vec<Agreement> = new
        .iter()
        .flat_map(|dest| {
            members
                .iter()
                .filter(|src| **src != principal && **src != dest.as_str())
                .map(|src| Agreement::new(src, dest, AgreementKind::PeerToPeer))
                .collect::<Vec<_>>()
        })
        .collect();
    if !mesh.is_empty() {
        steps.push(PlanStep::Agree(mesh));
    }

    steps.push(PlanStep::CreateEndpoints(new));
    steps.push(PlanStep::Start(vec![principal.clone()]));
    steps.push(PlanStep::CreateEndpoints(vec![principal.clone()]));
    steps.push(PlanStep::AwaitReady(vec![principal.clone()]));

    AddPlan {
        principal: Some(principal),
        steps,
    }
}

/// Build the delete plan for `to_delete`
///
/// Survivors are the running members not themselves being deleted. Every
/// retired identity is severed from all survivors before it is stopped.
pub fn plan_removals(to_delete: &[String], running: &RunningTopology) -> Vec<PlanStep> {
    let retiring: BTreeSet<&str> = to_delete.iter().map(String::as_str).collect();
    let survivors: Vec<String> = running
        .identities()
        .filter(|id| !retiring.contains(id))
        .map(str::to_string)
        .collect();

    to_delete
        .iter()
        .flat_map(|id| {
            [
                PlanStep::Sever {
                    holders: survivors.clone(),
                    identity: id.clone(),
                },
                PlanStep::Stop {
                    identity: id.clone(),
                    await_gone: true,
                },
            ]
        })
        .collect()
}

/// Conceptual lifecycle state of one replica identity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    /// No instance and not part of the pass
    Absent,
    /// Chosen as the data source for this pass
    PrincipalElected,
    /// Volume being loaded from the principal
    Seeding,
    /// Pod created, not yet ready
    Starting,
    /// Pod ready
    Running,
    /// Ready but the agreement mesh towards it is incomplete
    AgreementsPending,
    /// Pod being deleted
    Stopping,
    /// Retired from the topology
    Removed,
}

/// Per-identity states plus the agreements established so far
///
/// Executors record each completed step so logs and tests can see where a
/// pass stopped; the same transitions let plans be replayed offline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    states: BTreeMap<String, ReplicaState>,
    agreements: BTreeSet<Agreement>,
    principal: Option<String>,
}

impl Topology {
    /// Every running member starts out Running
    pub fn from_running(running: &RunningTopology) -> Self {
        Self {
            states: running
                .identities()
                .map(|id| (id.to_string(), ReplicaState::Running))
                .collect(),
            agreements: BTreeSet::new(),
            principal: None,
        }
    }

    /// State of an identity; unknown identities are Absent
    pub fn state(&self, identity: &str) -> ReplicaState {
        self.states
            .get(identity)
            .copied()
            .unwrap_or(ReplicaState::Absent)
    }

    /// Force a state, e.g. when electing the principal
    pub fn set(&mut self, identity: &str, state: ReplicaState) {
        self.states.insert(identity.to_string(), state);
    }

    /// Identities currently Running
    pub fn running(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, s)| **s == ReplicaState::Running)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Agreements established by this pass
    pub fn agreements(&self) -> &BTreeSet<Agreement> {
        &self.agreements
    }

    /// Record the effect of a completed step
    pub fn apply(&mut self, step: &PlanStep) {
        match step {
            PlanStep::Start(ids) => {
                for id in ids {
                    self.set(id, ReplicaState::Starting);
                }
            }
            PlanStep::CreateEndpoints(_) => {}
            PlanStep::AwaitReady(ids) => {
                for id in ids {
                    let detached = match &self.principal {
                        Some(p) => p != id && !self.agreements.iter().any(|a| &a.destination == id),
                        None => false,
                    };
                    let next = if detached {
                        ReplicaState::AgreementsPending
                    } else {
                        ReplicaState::Running
                    };
                    self.set(id, next);
                }
            }
            PlanStep::Agree(agreements) => {
                for agreement in agreements {
                    self.agreements.retain(|a| {
                        a.source != agreement.source || a.destination != agreement.destination
                    });
                    self.agreements.insert(agreement.clone());
                }
                let destinations: BTreeSet<&str> =
                    agreements.iter().map(|a| a.destination.as_str()).collect();
                for id in destinations {
                    if self.state(id) == ReplicaState::AgreementsPending {
                        self.set(id, ReplicaState::Running);
                    }
                }
            }
            PlanStep::Stop { identity, .. } => {
                if self.state(identity) == ReplicaState::Stopping {
                    self.set(identity, ReplicaState::Removed);
                } else {
                    self.principal = Some(identity.clone());
                    self.set(identity, ReplicaState::PrincipalElected);
                }
            }
            PlanStep::Seed { replicas, .. } => {
                for id in replicas {
                    self.set(id, ReplicaState::Seeding);
                }
            }
            PlanStep::Sever { identity, .. } => {
                self.agreements
                    .retain(|a| &a.source != identity && &a.destination != identity);
                self.set(identity, ReplicaState::Stopping);
            }
        }
    }
}
