//! Directory operator - converges replicated directory-server deployments
//!
//! A `DirectoryDeployment` names one PersistentVolumeClaim per directory
//! server replica. The operator keeps one pod per claim, seeds new replicas
//! from the principal, maintains the replication agreements between every
//! pair, and fronts the set with a routing proxy whose configuration is
//! regenerated from the live topology.
//!
//! # Modules
//!
//! - [`crd`] - The DirectoryDeployment resource and its status conditions
//! - [`controller`] - Reconciliation loop driving each deployment to its declared topology
//! - [`topology`] - Running topology and the diff against the declared identities
//! - [`replication`] - Add and remove plans for replicas and their agreements
//! - [`seeding`] - Seed jobs that copy the principal's data onto a new claim
//! - [`lifecycle`] - Replica pod lifecycle with bounded waits
//! - [`proxy`] - Proxy configuration generation and rollout
//! - [`guard`] - Refuses removal of the replica the proxy currently writes to
//! - [`webhook`] - Validating admission webhook
//! - [`config`] - Server and proxy configuration documents
//! - [`platform`] - Cluster access behind a mockable trait
//! - [`naming`] - Object names and labels
//! - [`retry`] - Backoff for transient API failures
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod naming;
pub mod platform;
pub mod proxy;
pub mod replication;
pub mod retry;
pub mod seeding;
pub mod topology;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the admission webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;
