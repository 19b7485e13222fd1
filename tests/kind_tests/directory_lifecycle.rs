//! Integration tests for the controller and admission checks
//!
//! These stories run the reconcile function and the validators directly
//! against a live API server, without deploying the operator itself.

use std::sync::Arc;

use kube::api::{Api, PostParams};

use directory_operator::controller::{reconcile, Context};
use directory_operator::crd::{ConditionStatus, DirectoryDeployment, CONDITION_AVAILABLE, CONDITION_IN_PROGRESS};
use directory_operator::platform::KubePlatform;
use directory_operator::webhook::validate::validate_create;

use super::helpers::{
    cleanup_deployment, ensure_pvc, ensure_test_cluster, put_document, sample_deployment,
    TEST_NAMESPACE,
};

/// Story: A deployment whose server document is missing fails with a
/// message naming the missing ConfigMap
///
/// Lifecycle: (no status) -> InProgress=True -> Available=False
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_missing_server_document_fails_with_explanation() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<DirectoryDeployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "life-missing-doc";

    cleanup_deployment(&client, name).await;
    let created = api
        .create(&PostParams::default(), &sample_deployment(name, &["life-missing-1"]))
        .await
        .expect("failed to create deployment");

    let ctx = Arc::new(Context::builder(client.clone()).build());
    let result = reconcile(Arc::new(created), ctx).await;
    assert!(result.is_ok(), "Configuration errors are not retried");

    let updated = api.get(name).await.expect("failed to get deployment");
    assert_eq!(
        updated.condition_status(CONDITION_IN_PROGRESS),
        Some(&ConditionStatus::False)
    );
    assert_eq!(
        updated.condition_status(CONDITION_AVAILABLE),
        Some(&ConditionStatus::False)
    );
    let message = updated
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == CONDITION_AVAILABLE))
        .map(|c| c.message.clone())
        .unwrap_or_default();
    assert!(message.contains(&format!("{name}-server-base")));

    cleanup_deployment(&client, name).await;
}

/// Story: Admission names the first claim that does not exist
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_admission_reports_missing_claim() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "life-admission";

    ensure_pvc(&client, "life-admission-1").await;
    put_document(&client, &format!("{name}-server-base"), "general: {}\n").await;
    put_document(&client, &format!("{name}-proxy-base"), "proxy: {}\n").await;

    let platform = KubePlatform::new(client.clone());

    validate_create(&platform, &sample_deployment(name, &["life-admission-1"]))
        .await
        .expect("complete document is admitted");

    let err = validate_create(
        &platform,
        &sample_deployment(name, &["life-admission-1", "life-admission-absent"]),
    )
    .await
    .expect_err("missing claim is denied");
    assert_eq!(
        err.user_message(),
        "The PVC, life-admission-absent, doesn't exist!"
    );
}

/// Story: A base proxy document that defines suffixes is refused
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_admission_rejects_generated_proxy_entries() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "life-generated";

    ensure_pvc(&client, "life-generated-1").await;
    put_document(&client, &format!("{name}-server-base"), "general: {}\n").await;
    put_document(
        &client,
        &format!("{name}-proxy-base"),
        "proxy:\n  suffixes:\n    - dc=example\n",
    )
    .await;

    let err = validate_create(
        &KubePlatform::new(client.clone()),
        &sample_deployment(name, &["life-generated-1"]),
    )
    .await
    .expect_err("generated entry is denied");
    assert!(err.user_message().contains("proxy.suffixes"));
}
