//! [`Platform`] implementation backed by the Kubernetes API

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::{ExecOutput, JobState, Platform, PodState};
use crate::crd::{DirectoryDeployment, DirectoryDeploymentStatus};
use crate::naming::FIELD_MANAGER;
use crate::Error;

/// Pod template annotation whose change triggers a rolling restart
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Real Kubernetes platform implementation
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    /// Create a new KubePlatform wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == code)
}

/// Treat "already exists" as success so an interrupted pass can resume
fn created<T>(result: Result<T, kube::Error>, kind: &str, name: &str) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 409) => {
            debug!(kind, name, "already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Treat "not found" as success for deletes
fn deleted<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Drain both output streams of a command at once
///
/// The remote side blocks once either pipe fills, so reading one stream to
/// the end before touching the other can stall a chatty command.
async fn read_streams<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
) -> (std::io::Result<String>, std::io::Result<String>)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    async fn drain(stream: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
        let mut text = String::new();
        if let Some(mut stream) = stream {
            stream.read_to_string(&mut text).await?;
        }
        Ok(text)
    }
    tokio::join!(drain(stdout), drain(stderr))
}

#[async_trait]
impl Platform for KubePlatform {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let pods: Api<Pod> = self.api(namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn pod_state(&self, namespace: &str, name: &str) -> Result<PodState, Error> {
        let pods: Api<Pod> = self.api(namespace);
        Ok(match pods.get_opt(name).await? {
            Some(pod) => PodState::from_pod(&pod),
            None => PodState::Absent,
        })
    }

    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<(), Error> {
        let pods: Api<Pod> = self.api(namespace);
        let name = pod.metadata.name.clone().unwrap_or_default();
        created(pods.create(&PostParams::default(), &pod).await, "Pod", &name)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let pods: Api<Pod> = self.api(namespace);
        deleted(pods.delete(name, &DeleteParams::default()).await)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let services: Api<Service> = self.api(namespace);
        Ok(services.get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: Service) -> Result<(), Error> {
        let services: Api<Service> = self.api(namespace);
        let name = service.metadata.name.clone().unwrap_or_default();
        created(
            services.create(&PostParams::default(), &service).await,
            "Service",
            &name,
        )
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let services: Api<Service> = self.api(namespace);
        deleted(services.delete(name, &DeleteParams::default()).await)
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<(), Error> {
        let jobs: Api<Job> = self.api(namespace);
        let name = job.metadata.name.clone().unwrap_or_default();
        created(jobs.create(&PostParams::default(), &job).await, "Job", &name)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let jobs: Api<Job> = self.api(namespace);
        deleted(jobs.delete(name, &DeleteParams::background()).await)
    }

    async fn job_state(&self, namespace: &str, name: &str) -> Result<JobState, Error> {
        let jobs: Api<Job> = self.api(namespace);
        Ok(match jobs.get_opt(name).await? {
            Some(job) => JobState::from_job(&job),
            None => JobState::Absent,
        })
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let config_maps: Api<ConfigMap> = self.api(namespace);
        Ok(config_maps
            .get_opt(name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }

    async fn apply_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<(), Error> {
        let config_maps: Api<ConfigMap> = self.api(namespace);
        let name = config_map
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("config map without a name"))?;
        config_maps
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&config_map),
            )
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let config_maps: Api<ConfigMap> = self.api(namespace);
        deleted(config_maps.delete(name, &DeleteParams::default()).await)
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let secrets: Api<Secret> = self.api(namespace);
        let Some(secret) = secrets.get_opt(name).await? else {
            return Ok(None);
        };

        let mut data: BTreeMap<String, String> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| String::from_utf8(v.0).ok().map(|s| (k, s)))
            .collect();
        data.extend(secret.string_data.unwrap_or_default());
        Ok(Some(data))
    }

    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let claims: Api<PersistentVolumeClaim> = self.api(namespace);
        Ok(claims.get_opt(name).await?.is_some())
    }

    async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let deployments: Api<Deployment> = self.api(namespace);
        Ok(deployments.get_opt(name).await?.is_some())
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: Deployment,
    ) -> Result<(), Error> {
        let deployments: Api<Deployment> = self.api(namespace);
        let name = deployment.metadata.name.clone().unwrap_or_default();
        created(
            deployments.create(&PostParams::default(), &deployment).await,
            "Deployment",
            &name,
        )
    }

    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
        restarted_at: &str,
    ) -> Result<(), Error> {
        let deployments: Api<Deployment> = self.api(namespace);
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { (RESTARTED_AT_ANNOTATION): restarted_at }
                    }
                }
            }
        });
        deployments
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let pods: Api<Pod> = self.api(namespace);
        let params = AttachParams::default().stdout(true).stderr(true);
        let mut attached = pods.exec(pod, command, &params).await?;

        let (stdout, stderr) = read_streams(attached.stdout(), attached.stderr()).await;
        let mut output = ExecOutput {
            stdout: stdout.map_err(|e| Error::command(format!("reading stdout of {pod}: {e}")))?,
            stderr: stderr.map_err(|e| Error::command(format!("reading stderr of {pod}: {e}")))?,
            ..ExecOutput::default()
        };

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        output.success = status
            .and_then(|s| s.status)
            .map(|s| s == "Success")
            .unwrap_or(false);

        attached
            .join()
            .await
            .map_err(|e| Error::command(format!("exec session on {pod}: {e}")))?;
        Ok(output)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DirectoryDeploymentStatus,
    ) -> Result<(), Error> {
        let api: Api<DirectoryDeployment> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
