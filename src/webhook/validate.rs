//! DirectoryDeployment validation
//!
//! Handles AdmissionReview requests for DirectoryDeployment resources.
//! Creation checks that everything the document refers to exists. Updates
//! are additionally refused while a pass is running or after one failed,
//! when a pod setting changed, or when the topology change is unsafe.
//! Deletion is refused only while a pass is running.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    ResourceExt,
};
use tracing::{debug, error, info};

use super::WebhookState;
use crate::crd::{DirectoryDeployment, PodsSpec};
use crate::guard::{check_topology_change, DirectoryQuery};
use crate::platform::{load_document, DeploymentTarget, Platform};
use crate::proxy::{generated_key_error, generated_key_in};
use crate::Error;

/// Handle validating admission review for DirectoryDeployments
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = review(&state, &req).await;
    Json(response.into_review())
}

async fn review(state: &WebhookState, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let platform = state.platform.as_ref();
    let directory = state.directory.as_ref();

    let outcome = match req.operation {
        Operation::Create => match parse(req.object.as_ref()) {
            Ok(dd) => validate_create(platform, &dd).await,
            Err(e) => Err(e),
        },
        Operation::Update => match (parse(req.old_object.as_ref()), parse(req.object.as_ref())) {
            (Ok(old), Ok(new)) => validate_update(platform, directory, &old, &new).await,
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        Operation::Delete => match parse(req.old_object.as_ref()) {
            Ok(old) => validate_delete(&old),
            Err(e) => Err(e),
        },
        Operation::Connect => Ok(()),
    };

    match outcome {
        Ok(()) => {
            debug!(uid = %req.uid, name = %req.name, operation = ?req.operation, "Request allowed");
            response
        }
        Err(e) => {
            info!(uid = %req.uid, name = %req.name, operation = ?req.operation, reason = %e, "Request denied");
            response.deny(e.user_message())
        }
    }
}

fn parse(object: Option<&DynamicObject>) -> Result<DirectoryDeployment, Error> {
    object
        .cloned()
        .ok_or_else(|| Error::validation("The request does not contain a document."))?
        .try_parse::<DirectoryDeployment>()
        .map_err(|e| Error::validation(format!("The document could not be parsed: {e}")))
}

/// Checks for a new document
pub async fn validate_create(platform: &dyn Platform, dd: &DirectoryDeployment) -> Result<(), Error> {
    dd.validate()?;
    check_references(platform, dd).await
}

/// Checks for a changed document
pub async fn validate_update(
    platform: &dyn Platform,
    directory: &dyn DirectoryQuery,
    old: &DirectoryDeployment,
    new: &DirectoryDeployment,
) -> Result<(), Error> {
    if old.is_in_progress() {
        return Err(Error::validation(
            "The last update to this document is still being processed by the operator.  \
             Wait until the existing document has been fully processed before attempting \
             to update the document.",
        ));
    }

    validate_create(platform, new).await?;

    if old.is_unavailable() {
        return Err(Error::validation(
            "The deployment is in a failing state which means that it cannot be updated \
             and instead must be deleted and then recreated.",
        ));
    }

    check_immutable(&old.spec.pods, &new.spec.pods)?;

    check_topology_change(
        platform,
        directory,
        &DeploymentTarget::from_resource(new),
        &new.spec.replicas.pvcs,
    )
    .await
}

/// Checks for a deleted document
pub fn validate_delete(old: &DirectoryDeployment) -> Result<(), Error> {
    if old.is_in_progress() {
        return Err(Error::validation(
            "The last update to this document is still being processed by the operator.  \
             Wait until the existing document has been fully processed before attempting \
             to delete the document.",
        ));
    }
    Ok(())
}

/// Pod settings are fixed once the replicas exist
pub fn check_immutable(old: &PodsSpec, new: &PodsSpec) -> Result<(), Error> {
    let fields = [
        ("image", old.image != new.image),
        ("configMap", old.config_map != new.config_map),
        ("resources", old.resources != new.resources),
        ("envFrom", old.env_from != new.env_from),
        ("env", old.env != new.env),
        ("serviceAccountName", old.service_account_name != new.service_account_name),
    ];

    match fields.iter().find(|(_, changed)| *changed) {
        Some((field, _)) => Err(Error::validation(format!(
            "The spec.pods.{field} entry has been changed.  If you need to modify \
             spec.pods.{field} you must first delete the document and then recreate it."
        ))),
        None => Ok(()),
    }
}

/// Every object the document names must exist in its namespace
async fn check_references(platform: &dyn Platform, dd: &DirectoryDeployment) -> Result<(), Error> {
    let namespace = dd.namespace_or_default();
    let pods = &dd.spec.pods;

    let pvcs = dd.spec.replicas.pvcs.iter().chain(pods.proxy.pvc.iter());
    for pvc in pvcs {
        if !platform.pvc_exists(&namespace, pvc).await? {
            return Err(Error::validation(format!("The PVC, {pvc}, doesn't exist!")));
        }
    }

    load_document(platform, &namespace, &pods.config_map.server).await?;

    let proxy = &pods.config_map.proxy;
    let base = load_document(platform, &namespace, proxy).await?;
    if let Some(key) = generated_key_in(&base) {
        return Err(generated_key_error(&proxy.name, &proxy.key, key));
    }

    for source in &pods.env_from {
        if let Some(cm) = source.config_map_ref.as_ref().filter(|r| r.optional != Some(true)) {
            if platform.config_map_data(&namespace, &cm.name).await?.is_none() {
                return Err(Error::validation(format!(
                    "The ConfigMap, {}, doesn't exist!",
                    cm.name
                )));
            }
        }
        if let Some(secret) = source.secret_ref.as_ref().filter(|r| r.optional != Some(true)) {
            if platform.secret_data(&namespace, &secret.name).await?.is_none() {
                return Err(Error::validation(format!(
                    "The secret, {}, doesn't exist!",
                    secret.name
                )));
            }
        }
    }

    debug!(deployment = %dd.name_any(), "All references resolved");
    Ok(())
}
