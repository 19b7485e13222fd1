//! In-memory platform used by the engine tests
//!
//! Objects are kept in maps and every mutating call is appended to an
//! ordered log so tests can assert on the sequence of operations a plan
//! performed, not just the end state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, ContainerStatus, Pod, PodStatus, Service};

use super::{ExecOutput, JobState, Platform, PodState};
use crate::crd::DirectoryDeploymentStatus;
use crate::Error;

#[derive(Default)]
struct State {
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    jobs: BTreeMap<String, Job>,
    config_maps: BTreeMap<String, BTreeMap<String, String>>,
    secrets: BTreeMap<String, BTreeMap<String, String>>,
    pvcs: BTreeSet<String>,
    deployments: BTreeMap<String, Deployment>,
    statuses: Vec<DirectoryDeploymentStatus>,
    failing_jobs: BTreeSet<String>,
    finished_jobs: BTreeMap<String, JobState>,
    unready_pods: BTreeSet<String>,
    failing_commands: Vec<String>,
    log: Vec<String>,
}

/// A platform whose pods become ready and jobs succeed immediately
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Seed an already running, ready pod
    pub fn add_running_pod(&self, pod: Pod) {
        let pod = mark_running(pod, true);
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.with(|s| s.pods.insert(name, pod));
    }

    /// Seed a service
    pub fn add_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.with(|s| s.services.insert(name, service));
    }

    /// Seed a config map
    pub fn add_config_map(&self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.with(|s| s.config_maps.insert(name.to_string(), data));
    }

    /// Seed a secret
    pub fn add_secret(&self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.with(|s| s.secrets.insert(name.to_string(), data));
    }

    /// Seed a PersistentVolumeClaim
    pub fn add_pvc(&self, name: &str) {
        self.with(|s| s.pvcs.insert(name.to_string()));
    }

    /// Make the named job fail once created
    pub fn fail_job(&self, name: &str) {
        self.with(|s| s.failing_jobs.insert(name.to_string()));
    }

    /// Seed a job left over from an earlier pass
    pub fn add_finished_job(&self, name: &str, state: JobState) {
        let mut job = Job::default();
        job.metadata.name = Some(name.to_string());
        self.with(|s| {
            s.jobs.insert(name.to_string(), job);
            s.finished_jobs.insert(name.to_string(), state);
        });
    }

    /// Keep the named pod running but never ready
    pub fn never_ready(&self, name: &str) {
        self.with(|s| s.unready_pods.insert(name.to_string()));
    }

    /// Fail every exec whose joined command line contains `fragment`
    pub fn fail_command(&self, fragment: &str) {
        self.with(|s| s.failing_commands.push(fragment.to_string()));
    }

    /// Ordered log of mutating operations
    pub fn log(&self) -> Vec<String> {
        self.with(|s| s.log.clone())
    }

    /// Log entries starting with `prefix`
    pub fn log_matching(&self, prefix: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.starts_with(prefix))
            .collect()
    }

    /// Names of the pods currently present
    pub fn pod_names(&self) -> Vec<String> {
        self.with(|s| s.pods.keys().cloned().collect())
    }

    /// Names of the services currently present
    pub fn service_names(&self) -> Vec<String> {
        self.with(|s| s.services.keys().cloned().collect())
    }

    /// Stored data of a config map
    pub fn config_map(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.with(|s| s.config_maps.get(name).cloned())
    }

    /// The stored Deployment, if created
    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.with(|s| s.deployments.get(name).cloned())
    }

    /// Every status written, oldest first
    pub fn statuses(&self) -> Vec<DirectoryDeploymentStatus> {
        self.with(|s| s.statuses.clone())
    }
}

fn mark_running(mut pod: Pod, ready: bool) -> Pod {
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        container_statuses: Some(vec![ContainerStatus {
            ready,
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

fn labels_match(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl Platform for FakePlatform {
    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        Ok(self.with(|s| {
            s.pods
                .values()
                .filter(|p| labels_match(p, selector))
                .cloned()
                .collect()
        }))
    }

    async fn pod_state(&self, _namespace: &str, name: &str) -> Result<PodState, Error> {
        Ok(self.with(|s| match s.pods.get(name) {
            Some(pod) => PodState::from_pod(pod),
            None => PodState::Absent,
        }))
    }

    async fn create_pod(&self, _namespace: &str, pod: Pod) -> Result<(), Error> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.with(|s| {
            s.log.push(format!("create_pod {name}"));
            let ready = !s.unready_pods.contains(&name);
            s.pods.entry(name).or_insert_with(|| mark_running(pod, ready));
        });
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.log.push(format!("delete_pod {name}"));
            s.pods.remove(name);
        });
        Ok(())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.with(|s| s.services.get(name).cloned()))
    }

    async fn create_service(&self, _namespace: &str, service: Service) -> Result<(), Error> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.with(|s| {
            s.log.push(format!("create_service {name}"));
            s.services.entry(name).or_insert(service);
        });
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.log.push(format!("delete_service {name}"));
            s.services.remove(name);
        });
        Ok(())
    }

    async fn create_job(&self, _namespace: &str, job: Job) -> Result<(), Error> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.with(|s| {
            s.log.push(format!("create_job {name}"));
            s.jobs.entry(name).or_insert(job);
        });
        Ok(())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.log.push(format!("delete_job {name}"));
            s.jobs.remove(name);
            s.finished_jobs.remove(name);
        });
        Ok(())
    }

    async fn job_state(&self, _namespace: &str, name: &str) -> Result<JobState, Error> {
        Ok(self.with(|s| {
            if !s.jobs.contains_key(name) {
                JobState::Absent
            } else if let Some(state) = s.finished_jobs.get(name) {
                state.clone()
            } else if s.failing_jobs.contains(name) {
                JobState::Failed
            } else {
                JobState::Succeeded
            }
        }))
    }

    async fn config_map_data(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        Ok(self.with(|s| s.config_maps.get(name).cloned()))
    }

    async fn apply_config_map(&self, _namespace: &str, config_map: ConfigMap) -> Result<(), Error> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.with(|s| {
            s.log.push(format!("apply_config_map {name}"));
            s.config_maps
                .insert(name, config_map.data.unwrap_or_default());
        });
        Ok(())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.log.push(format!("delete_config_map {name}"));
            s.config_maps.remove(name);
        });
        Ok(())
    }

    async fn secret_data(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        Ok(self.with(|s| s.secrets.get(name).cloned()))
    }

    async fn pvc_exists(&self, _namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.with(|s| s.pvcs.contains(name)))
    }

    async fn deployment_exists(&self, _namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.with(|s| s.deployments.contains_key(name)))
    }

    async fn create_deployment(
        &self,
        _namespace: &str,
        deployment: Deployment,
    ) -> Result<(), Error> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.with(|s| {
            s.log.push(format!("create_deployment {name}"));
            s.deployments.insert(name, deployment);
        });
        Ok(())
    }

    async fn restart_deployment(
        &self,
        _namespace: &str,
        name: &str,
        _restarted_at: &str,
    ) -> Result<(), Error> {
        self.with(|s| s.log.push(format!("restart_deployment {name}")));
        Ok(())
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let line = command.join(" ");
        let success = self.with(|s| {
            s.log.push(format!("exec {pod} {line}"));
            !s.failing_commands.iter().any(|f| line.contains(f.as_str()))
        });
        Ok(ExecOutput {
            success,
            stdout: String::new(),
            stderr: if success {
                String::new()
            } else {
                "command failed".to_string()
            },
        })
    }

    async fn patch_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &DirectoryDeploymentStatus,
    ) -> Result<(), Error> {
        self.with(|s| s.statuses.push(status.clone()));
        Ok(())
    }
}
