//! Directory Operator - replicated directory-server deployments on Kubernetes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use directory_operator::controller::{error_policy, reconcile, Context};
use directory_operator::crd::DirectoryDeployment;
use directory_operator::naming::FIELD_MANAGER;
use directory_operator::webhook::{start_server, WebhookConfig, WebhookState};
use directory_operator::DEFAULT_WEBHOOK_PORT;

/// Directory Operator - converges DirectoryDeployments to their declared replicas
#[derive(Parser, Debug)]
#[command(name = "directory-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Address the admission webhook listens on
    #[arg(long, env = "WEBHOOK_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT)))]
    webhook_addr: SocketAddr,

    /// TLS certificate for the webhook (PEM)
    #[arg(long, env = "WEBHOOK_TLS_CERT", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt")]
    tls_cert: PathBuf,

    /// TLS private key for the webhook (PEM)
    #[arg(long, env = "WEBHOOK_TLS_KEY", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key")]
    tls_key: PathBuf,

    /// Run the controller without the admission webhook
    #[arg(long, env = "DISABLE_WEBHOOKS")]
    no_webhook: bool,

    /// Deployments reconciled concurrently
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value = "4")]
    concurrency: u16,

    /// Seconds after which an unfinished pass is considered abandoned
    #[arg(long, env = "STALE_AFTER_SECS", default_value = "3600")]
    stale_after_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook and the directory client both need a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}. \
             The operator cannot serve or dial TLS without it.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&DirectoryDeployment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

/// Install or update the DirectoryDeployment CRD with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DirectoryDeployment CRD...");
    crds.patch(
        "directorydeployments.ibm.com",
        &params,
        &Patch::Apply(&DirectoryDeployment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install DirectoryDeployment CRD: {}", e))?;

    Ok(())
}

async fn load_webhook_config(cli: &Cli) -> anyhow::Result<WebhookConfig> {
    let cert_pem = tokio::fs::read_to_string(&cli.tls_cert)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", cli.tls_cert, e))?;
    let key_pem = tokio::fs::read_to_string(&cli.tls_key)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", cli.tls_key, e))?;

    Ok(WebhookConfig {
        addr: cli.webhook_addr,
        cert_pem,
        key_pem,
    })
}

/// Run the DirectoryDeployment controller and, unless disabled, the webhook
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(
        Context::builder(client.clone())
            .stale_after(Duration::from_secs(cli.stale_after_secs))
            .shutdown(shutdown.clone())
            .build(),
    );

    let webhook = if cli.no_webhook {
        tracing::warn!("Admission webhook disabled");
        None
    } else {
        let config = load_webhook_config(&cli).await?;
        let state = Arc::new(WebhookState::new(client.clone()));
        Some(tokio::spawn(async move {
            if let Err(e) = start_server(config, state).await {
                tracing::error!(error = %e, "Admission webhook stopped");
            }
        }))
    };

    let deployments: Api<DirectoryDeployment> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());

    tracing::info!(concurrency = cli.concurrency, "Starting DirectoryDeployment controller");

    let controller = Controller::new(deployments, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .owns(jobs, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(cli.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Reconciliation error");
                }
            }
        });

    // Passes still waiting on pods or jobs observe the token and stop
    tokio::select! {
        _ = controller => {
            tracing::info!("Controller completed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
    shutdown.cancel();

    if let Some(handle) = webhook {
        handle.abort();
    }

    Ok(())
}
