//! Integration tests for the directory operator
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how directory administrators interact with the operator.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and deleting
//!   DirectoryDeployment resources through the Kubernetes API
//!
//! - `directory_lifecycle`: Stories about how the controller and the
//!   admission checks react to deployments against a live API server
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod directory_lifecycle;
mod helpers;
