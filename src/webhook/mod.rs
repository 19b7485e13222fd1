//! Validating Admission Webhook for DirectoryDeployments
//!
//! The API server sends every create, update and delete of a
//! DirectoryDeployment here before persisting it. Documents that name
//! missing objects, change immutable pod settings, or would remove the
//! replica the proxy writes to are denied with a message the user can act on.

pub mod validate;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tracing::info;

use crate::guard::{DirectoryQuery, LdapDirectoryQuery};
use crate::platform::{KubePlatform, Platform};
use crate::Error;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Cluster access for reference and readiness checks
    pub platform: Arc<dyn Platform>,
    /// Directory queries against the proxy
    pub directory: Arc<dyn DirectoryQuery>,
}

impl WebhookState {
    /// Create webhook state backed by the cluster and a live LDAP client
    pub fn new(client: Client) -> Self {
        Self::with_parts(
            Arc::new(KubePlatform::new(client)),
            Arc::new(LdapDirectoryQuery::default()),
        )
    }

    /// Create webhook state from explicit collaborators
    pub fn with_parts(platform: Arc<dyn Platform>, directory: Arc<dyn DirectoryQuery>) -> Self {
        Self {
            platform,
            directory,
        }
    }
}

/// Listener settings for the webhook server
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// TLS certificate PEM
    pub cert_pem: String,
    /// TLS private key PEM
    pub key_pem: String,
}

/// Create the webhook router
///
/// - POST /validate - admission review for DirectoryDeployments
/// - GET /healthz - liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate", post(validate::validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook over TLS until the server fails
pub async fn start_server(config: WebhookConfig, state: Arc<WebhookState>) -> Result<(), Error> {
    let tls_config =
        RustlsConfig::from_pem(config.cert_pem.into_bytes(), config.key_pem.into_bytes())
            .await
            .map_err(|e| Error::internal(format!("TLS config error: {e}")))?;

    info!(addr = %config.addr, "Starting admission webhook");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::internal(format!("Webhook server error: {e}")))
}
