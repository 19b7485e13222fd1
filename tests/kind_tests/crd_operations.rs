//! Integration tests for CRD operations
//!
//! These tests tell the story of how directory administrators manage
//! DirectoryDeployment resources through the Kubernetes API.

use kube::api::{Api, DeleteParams, PostParams};

use directory_operator::crd::{DirectoryDeployment, DEFAULT_IMAGE_REPO};

use super::helpers::{cleanup_deployment, ensure_test_cluster, sample_deployment, TEST_NAMESPACE};

/// Story: Administrator declares a three replica directory
///
/// The document is persisted as written and the defaults for omitted pod
/// settings are filled in by the schema.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_administrator_declares_replicated_directory() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<DirectoryDeployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-declare";

    cleanup_deployment(&client, name).await;

    let created = api
        .create(
            &PostParams::default(),
            &sample_deployment(name, &["replica-1", "replica-2", "replica-3"]),
        )
        .await
        .expect("failed to create deployment");
    assert_eq!(created.metadata.name.as_deref(), Some(name));

    let fetched = api.get(name).await.expect("failed to get deployment");
    assert_eq!(
        fetched.spec.replicas.pvcs,
        vec!["replica-1", "replica-2", "replica-3"]
    );
    assert_eq!(fetched.spec.pods.image.repo, DEFAULT_IMAGE_REPO);
    assert!(fetched.status.is_none(), "No pass has run yet");

    cleanup_deployment(&client, name).await;
}

/// Story: Administrator removes a deployment
///
/// The operator adds no finalizers; owned objects are collected through
/// their owner references, so the document disappears immediately.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_administrator_removes_deployment() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<DirectoryDeployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-remove";

    cleanup_deployment(&client, name).await;
    api.create(&PostParams::default(), &sample_deployment(name, &["replica-1"]))
        .await
        .expect("failed to create deployment");

    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to delete deployment");

    let remaining = api.get_opt(name).await.expect("failed to read deployment");
    assert!(remaining.is_none());
}
