//! Controller for the DirectoryDeployment CRD
//!
//! Reconciliation follows the observe-diff-act loop: observe the labelled
//! replica pods, diff them against the declared identities, and act through
//! the add plan, the proxy generator and the remove plan.

mod directory;

pub use directory::{
    error_policy, reconcile, resolve_server_config, Context, ContextBuilder, REASON_CREATED,
    REASON_PROGRESS, REASON_UPDATED,
};
