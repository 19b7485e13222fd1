//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster and fixture resources.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use directory_operator::crd::{
    ConfigMapRef, ConfigMapRefs, DirectoryDeployment, DirectoryDeploymentSpec, PodsSpec,
    ReplicasSpec,
};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "directory-integration-test";

/// Namespace every fixture is created in
pub const TEST_NAMESPACE: &str = "default";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRD has been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Install the DirectoryDeployment CRD into the cluster
pub async fn install_crd(client: &Client) -> Result<(), kube::Error> {
    let crd = DirectoryDeployment::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    match crds.get(&name).await {
        Ok(_) => {
            println!("CRD already installed, deleting and reinstalling...");
            crds.delete(&name, &DeleteParams::default()).await?;
            sleep(Duration::from_secs(2)).await;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e),
    }

    println!("Installing DirectoryDeployment CRD...");
    crds.create(&PostParams::default(), &crd).await?;

    // Wait for CRD to be established
    sleep(Duration::from_secs(2)).await;
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crd(&client)
                .await
                .map_err(|e| format!("failed to install CRD: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// A deployment over the given claims using `<name>-server` and `<name>-proxy` documents
pub fn sample_deployment(name: &str, pvcs: &[&str]) -> DirectoryDeployment {
    let mut dd = DirectoryDeployment::new(
        name,
        DirectoryDeploymentSpec {
            replicas: ReplicasSpec {
                pvcs: pvcs.iter().map(|p| p.to_string()).collect(),
            },
            pods: PodsSpec {
                config_map: ConfigMapRefs {
                    proxy: ConfigMapRef {
                        name: format!("{name}-proxy-base"),
                        key: "config.yaml".to_string(),
                    },
                    server: ConfigMapRef {
                        name: format!("{name}-server-base"),
                        key: "config.yaml".to_string(),
                    },
                },
                ..Default::default()
            },
        },
    );
    dd.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    dd
}

/// Create a config map holding one document, replacing any previous copy
pub async fn put_document(client: &Client, name: &str, document: &str) {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;

    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "config.yaml".to_string(),
            document.to_string(),
        )])),
        ..Default::default()
    };
    api.create(&PostParams::default(), &cm)
        .await
        .expect("failed to create config map");
}

/// Create a small claim if it does not exist yet
pub async fn ensure_pvc(client: &Client, name: &str) {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    if api.get_opt(name).await.expect("failed to read pvc").is_some() {
        return;
    }

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("100Mi".to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    api.create(&PostParams::default(), &pvc)
        .await
        .expect("failed to create pvc");
}

/// Delete a deployment, ignoring errors
pub async fn cleanup_deployment(client: &Client, name: &str) {
    let api: Api<DirectoryDeployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;
}
