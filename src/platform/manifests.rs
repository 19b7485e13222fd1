//! Manifest construction for the objects the operator creates
//!
//! Every builder is a pure function of the deployment target and the
//! resolved configuration so the shape of each object can be asserted in
//! unit tests without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction, KeyToPath,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::DeploymentTarget;
use crate::config::ServerConfig;
use crate::naming::{
    labels_for, proxy_config_map_name, proxy_deployment_name, replica_pod_name,
    seed_config_map_name, seed_job_name, CONFIG_KEY, CR_NAME_LABEL, KIND_LABEL,
};

/// Mount point of the configuration document
pub const CONFIG_MOUNT: &str = "/var/isvd/config";
/// Mount point of the replica data volume
pub const DATA_MOUNT: &str = "/var/isvd/data";
/// Mount point of the principal's data inside a seed job
pub const SOURCE_MOUNT: &str = "/var/isvd/source";

/// Document written to the seed ConfigMap
pub const SEED_DOCUMENT: &str = "seed: \n  replica: \n    clean: true\n";

/// Kind label value identifying the proxy pods
pub const PROXY_KIND: &str = "IBMSecurityVerifyDirectory";

const SERVER_CONFIG_VOLUME: &str = "isvd-server-config";
const DATA_VOLUME: &str = "isvd-data";
const PRINCIPAL_VOLUME: &str = "isvd-principal";
const PROXY_CONFIG_VOLUME: &str = "isvd-proxy-config";
const PROXY_DATA_VOLUME: &str = "isvd-proxy-data";
const HEALTH_CHECK: &str = "/sbin/health_check.sh";
const PORT_NAME: &str = "ldap";

fn meta(target: &DeploymentTarget, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(target.namespace.clone()),
        labels: Some(labels),
        owner_references: target.owner_references(),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// User supplied environment followed by the operator's own variables
fn env_with(target: &DeploymentTarget, extra: Vec<EnvVar>) -> Vec<EnvVar> {
    target.pods.env.iter().cloned().chain(extra).collect()
}

fn config_map_volume(volume: &str, config_map: &str, key: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pvc_volume(volume: &str, claim: &str, read_only: bool) -> Volume {
    Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: read_only.then_some(true),
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn exec_probe(command: &[&str], initial_delay: i32, period: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(command.iter().map(|c| c.to_string()).collect()),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn liveness_probe() -> Probe {
    exec_probe(&[HEALTH_CHECK, "livenessProbe"], 2, 10)
}

fn readiness_probe() -> Probe {
    exec_probe(&[HEALTH_CHECK], 4, 5)
}

fn ldap_port(port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(PORT_NAME.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn cluster_ip_service(
    target: &DeploymentTarget,
    name: &str,
    labels: BTreeMap<String, String>,
    port_name: &str,
    port: i32,
) -> Service {
    Service {
        metadata: meta(target, name, labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The long-running directory server pod for one replica
pub fn replica_pod(target: &DeploymentTarget, server: &ServerConfig, pvc: &str) -> Pod {
    let name = replica_pod_name(&target.name, pvc);
    let pods = &target.pods;
    let server_cm = &pods.config_map.server;

    let container = Container {
        name: name.clone(),
        image: Some(pods.image.image_for("server")),
        image_pull_policy: pods.image.image_pull_policy.clone(),
        ports: Some(vec![ldap_port(server.port)]),
        env: Some(env_with(
            target,
            vec![
                env("YAML_CONFIG_FILE", format!("{CONFIG_MOUNT}/{}", server_cm.key)),
                env("general.id", name.clone()),
            ],
        )),
        env_from: (!pods.env_from.is_empty()).then(|| pods.env_from.clone()),
        resources: pods.resources.clone(),
        volume_mounts: Some(vec![
            mount(SERVER_CONFIG_VOLUME, CONFIG_MOUNT),
            mount(DATA_VOLUME, DATA_MOUNT),
        ]),
        liveness_probe: Some(liveness_probe()),
        readiness_probe: Some(readiness_probe()),
        ..Default::default()
    };

    Pod {
        metadata: meta(target, &name, labels_for(&target.name, pvc)),
        spec: Some(PodSpec {
            hostname: Some(name.clone()),
            containers: vec![container],
            volumes: Some(vec![
                config_map_volume(SERVER_CONFIG_VOLUME, &server_cm.name, &server_cm.key),
                pvc_volume(DATA_VOLUME, pvc, false),
            ]),
            image_pull_secrets: pods.image.image_pull_secrets.clone(),
            service_account_name: pods.service_account_name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The ClusterIP service giving a replica its stable address
pub fn replica_service(target: &DeploymentTarget, server: &ServerConfig, pvc: &str) -> Service {
    let name = replica_pod_name(&target.name, pvc);
    cluster_ip_service(target, &name, labels_for(&target.name, pvc), &name, server.port)
}

/// The transient ConfigMap read by every seed job of a pass
pub fn seed_config_map(target: &DeploymentTarget) -> ConfigMap {
    ConfigMap {
        metadata: meta(target, &seed_config_map_name(&target.name), labels_for(&target.name, "")),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), SEED_DOCUMENT.to_string())])),
        ..Default::default()
    }
}

/// The one-shot job copying the principal's data into a new replica's PVC
pub fn seed_job(
    target: &DeploymentTarget,
    server: &ServerConfig,
    principal_pvc: &str,
    pvc: &str,
) -> Job {
    let name = seed_job_name(&target.name, pvc);
    let pods = &target.pods;
    let labels = labels_for(&target.name, pvc);

    let container = Container {
        name: name.clone(),
        image: Some(pods.image.image_for("seed")),
        image_pull_policy: pods.image.image_pull_policy.clone(),
        env: Some(env_with(
            target,
            vec![
                env("general.license.accept", "limited"),
                env("general.license.key", server.license_key.clone()),
                env("YAML_CONFIG_FILE", format!("{CONFIG_MOUNT}/{CONFIG_KEY}")),
            ],
        )),
        env_from: (!pods.env_from.is_empty()).then(|| pods.env_from.clone()),
        resources: pods.resources.clone(),
        volume_mounts: Some(vec![
            mount(SERVER_CONFIG_VOLUME, CONFIG_MOUNT),
            mount(DATA_VOLUME, DATA_MOUNT),
            mount(PRINCIPAL_VOLUME, SOURCE_MOUNT),
        ]),
        ..Default::default()
    };

    Job {
        metadata: meta(target, &name, labels),
        spec: Some(JobSpec {
            completions: Some(1),
            backoff_limit: Some(1),
            ttl_seconds_after_finished: Some(60),
            // Seed pods must stay invisible to the replica selector
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(vec![
                        config_map_volume(
                            SERVER_CONFIG_VOLUME,
                            &seed_config_map_name(&target.name),
                            CONFIG_KEY,
                        ),
                        pvc_volume(DATA_VOLUME, pvc, false),
                        pvc_volume(PRINCIPAL_VOLUME, principal_pvc, true),
                    ]),
                    image_pull_secrets: pods.image.image_pull_secrets.clone(),
                    service_account_name: pods.service_account_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Labels selecting the proxy pods
pub fn proxy_labels(target: &DeploymentTarget) -> BTreeMap<String, String> {
    BTreeMap::from([
        (KIND_LABEL.to_string(), PROXY_KIND.to_string()),
        (CR_NAME_LABEL.to_string(), proxy_deployment_name(&target.name)),
    ])
}

/// The generated proxy configuration
pub fn proxy_config_map(target: &DeploymentTarget, document: String) -> ConfigMap {
    ConfigMap {
        metadata: meta(target, &proxy_config_map_name(&target.name), labels_for(&target.name, "")),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), document)])),
        ..Default::default()
    }
}

/// The single-replica proxy Deployment
pub fn proxy_deployment(target: &DeploymentTarget, proxy_port: i32) -> Deployment {
    let name = proxy_deployment_name(&target.name);
    let pods = &target.pods;
    let labels = proxy_labels(target);

    let mut mounts = vec![mount(PROXY_CONFIG_VOLUME, CONFIG_MOUNT)];
    let mut volumes = vec![config_map_volume(
        PROXY_CONFIG_VOLUME,
        &proxy_config_map_name(&target.name),
        CONFIG_KEY,
    )];
    if let Some(pvc) = &pods.proxy.pvc {
        mounts.push(mount(PROXY_DATA_VOLUME, DATA_MOUNT));
        volumes.push(pvc_volume(PROXY_DATA_VOLUME, pvc, false));
    }

    let container = Container {
        name: name.clone(),
        image: Some(pods.image.image_for("proxy")),
        image_pull_policy: pods.image.image_pull_policy.clone(),
        ports: Some(vec![ldap_port(proxy_port)]),
        env: Some(env_with(
            target,
            vec![env("YAML_CONFIG_FILE", format!("{CONFIG_MOUNT}/{CONFIG_KEY}"))],
        )),
        env_from: (!pods.env_from.is_empty()).then(|| pods.env_from.clone()),
        resources: pods.resources.clone(),
        volume_mounts: Some(mounts),
        liveness_probe: Some(liveness_probe()),
        readiness_probe: Some(readiness_probe()),
        ..Default::default()
    };

    Deployment {
        metadata: meta(target, &name, labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    image_pull_secrets: pods.image.image_pull_secrets.clone(),
                    service_account_name: pods.service_account_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The ClusterIP service in front of the proxy
pub fn proxy_service(target: &DeploymentTarget, proxy_port: i32) -> Service {
    let name = proxy_deployment_name(&target.name);
    cluster_ip_service(target, &name, proxy_labels(target), &name, proxy_port)
}
