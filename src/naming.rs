//! Object names and identity labels
//!
//! Every object the operator creates is named after the deployment and, for
//! per-replica objects, the replica identity (its PVC name).

use std::collections::BTreeMap;

/// Label naming the managing operator
pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";
/// Label naming the product
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
/// Label carrying the owning deployment name
pub const CR_NAME_LABEL: &str = "app.kubernetes.io/cr-name";
/// Label carrying the replica identity
pub const PVC_LABEL: &str = "app.kubernetes.io/pvc-name";
/// Label marking the proxy pods
pub const KIND_LABEL: &str = "app.kubernetes.io/kind";

/// Key used for every configuration document the operator writes
pub const CONFIG_KEY: &str = "config.yaml";

/// Field manager for server-side apply and patches
pub const FIELD_MANAGER: &str = "verify-directory-operator";

/// Pod and Service name of a replica
pub fn replica_pod_name(deployment: &str, pvc: &str) -> String {
    format!("{deployment}-{pvc}").to_lowercase()
}

/// Name of the seed Job for a replica
pub fn seed_job_name(deployment: &str, pvc: &str) -> String {
    format!("{}-seed", replica_pod_name(deployment, pvc))
}

/// Name of the transient ConfigMap used by the seed Jobs
pub fn seed_config_map_name(deployment: &str) -> String {
    format!("{deployment}-seed").to_lowercase()
}

/// Name of the proxy Deployment and its Service
pub fn proxy_deployment_name(deployment: &str) -> String {
    format!("{deployment}-proxy").to_lowercase()
}

/// Name of the generated proxy ConfigMap
pub fn proxy_config_map_name(deployment: &str) -> String {
    proxy_deployment_name(deployment)
}

/// Identity labels for objects of a deployment
///
/// An empty `pvc` yields the deployment-wide selector used to list replicas.
pub fn labels_for(deployment: &str, pvc: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (CREATED_BY_LABEL.to_string(), "verify-directory-operator".to_string()),
        (PART_OF_LABEL.to_string(), "verify-directory".to_string()),
        (CR_NAME_LABEL.to_string(), deployment.to_string()),
    ]);
    if !pvc.is_empty() {
        labels.insert(PVC_LABEL.to_string(), pvc.to_string());
    }
    labels
}

/// Render labels as a list label selector
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_lower_cased() {
        assert_eq!(replica_pod_name("Directory", "Data-1"), "directory-data-1");
        assert_eq!(seed_job_name("Directory", "data-1"), "directory-data-1-seed");
        assert_eq!(seed_config_map_name("Directory"), "directory-seed");
        assert_eq!(proxy_deployment_name("Directory"), "directory-proxy");
        assert_eq!(proxy_config_map_name("Directory"), "directory-proxy");
    }

    #[test]
    fn test_labels_include_identity_only_when_given() {
        let all = labels_for("dir", "");
        assert_eq!(all.len(), 3);
        assert!(!all.contains_key(PVC_LABEL));

        let one = labels_for("dir", "data-1");
        assert_eq!(one.get(PVC_LABEL).map(String::as_str), Some("data-1"));
        assert_eq!(one.get(CR_NAME_LABEL).map(String::as_str), Some("dir"));
    }

    #[test]
    fn test_selector_is_sorted_and_comma_joined() {
        let sel = selector(&labels_for("dir", ""));
        assert_eq!(
            sel,
            "app.kubernetes.io/cr-name=dir,app.kubernetes.io/created-by=verify-directory-operator,\
             app.kubernetes.io/part-of=verify-directory"
        );
    }
}
