//! Routing proxy configuration and deployment
//!
//! The proxy's document is the user's base document with a generated
//! `proxy` section: one server group listing every replica and one
//! partition per managed suffix. The generated document is stored in the
//! `<deployment>-proxy` ConfigMap and the proxy is only restarted when that
//! content changes.

use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, instrument};

use crate::config::{ConfigDocument, ProxyConfig, ServerConfig};
use crate::naming::{proxy_config_map_name, proxy_deployment_name, replica_pod_name, CONFIG_KEY};
use crate::platform::{load_document, manifests, DeploymentTarget, NamespacedSecrets, Platform};
use crate::Error;

/// Keys under `proxy` owned by the operator
pub const GENERATED_KEYS: [&str; 2] = ["server-groups", "suffixes"];

/// Name of the single generated server group
const SERVER_GROUP: &str = "proxy";

/// What a proxy deployment pass did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// Rendered document equals the stored one
    Unchanged,
    /// Document saved and the existing proxy restarted
    Restarted,
    /// Document saved and the proxy created
    Created,
}

/// Name of a generated entry already present in the base document
pub fn generated_key_in(base: &ConfigDocument) -> Option<&'static str> {
    GENERATED_KEYS
        .into_iter()
        .find(|key| base.contains(&format!("proxy.{key}")))
}

fn string(s: impl Into<String>) -> Value {
    Value::String(s.into())
}

fn mapping<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Mapping(
        entries
            .into_iter()
            .map(|(k, v)| (string(k), v))
            .collect::<Mapping>(),
    )
}

/// Render the full proxy document
///
/// `identities` are listed in the given order in every partition and in the
/// server group. Rendering the same inputs always yields the same text.
pub fn render_proxy_config(
    base: &ConfigDocument,
    deployment: &str,
    identities: &[String],
    server: &ServerConfig,
) -> Result<String, Error> {
    let pods: Vec<String> = identities
        .iter()
        .map(|id| replica_pod_name(deployment, id))
        .collect();

    let servers = pods
        .iter()
        .map(|pod| {
            mapping([
                ("name", string(pod)),
                ("id", string(pod)),
                (
                    "target",
                    string(format!("{}://{}:{}", server.scheme(), pod, server.port)),
                ),
                (
                    "user",
                    mapping([
                        ("dn", string(&server.admin_dn)),
                        ("password", string(&server.admin_pwd)),
                    ]),
                ),
            ])
        })
        .collect();
    let server_groups = Value::Sequence(vec![mapping([
        ("name", string(SERVER_GROUP)),
        ("servers", Value::Sequence(servers)),
    ])]);

    let members = Value::Sequence(pods.iter().map(|pod| mapping([("name", string(pod))])).collect());
    let suffixes = server
        .suffixes
        .iter()
        .enumerate()
        .map(|(idx, suffix)| {
            mapping([
                ("base", string(suffix)),
                ("name", string(format!("split_{idx}"))),
                ("servers", members.clone()),
            ])
        })
        .collect();

    let mut root = base.as_mapping().clone();
    let proxy = root
        .entry(string("proxy"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if proxy.is_null() {
        *proxy = Value::Mapping(Mapping::new());
    }
    let section = proxy
        .as_mapping_mut()
        .ok_or_else(|| Error::validation("The proxy configuration is incorrect."))?;
    section.insert(string("server-groups"), server_groups);
    section.insert(string("suffixes"), Value::Sequence(suffixes));

    Ok(serde_yaml::to_string(&Value::Mapping(root))?)
}

/// Timestamp stamped on the pod template to force a rolling restart
pub fn restart_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Render, store and roll out the proxy configuration
///
/// Nothing is written when the rendered document equals the stored one.
#[instrument(skip(platform, target, server), fields(deployment = %target.name))]
pub async fn deploy_proxy(
    platform: &dyn Platform,
    target: &DeploymentTarget,
    identities: &[String],
    server: &ServerConfig,
) -> Result<ProxyOutcome, Error> {
    let namespace = &target.namespace;
    let reference = &target.pods.config_map.proxy;

    let base = load_document(platform, namespace, reference).await?;
    if let Some(key) = generated_key_in(&base) {
        return Err(generated_key_error(&reference.name, &reference.key, key));
    }

    let resolved = base
        .clone()
        .resolve_secrets(&NamespacedSecrets::new(platform, namespace))
        .await?;
    let listener = ProxyConfig::from_document(&resolved)?;

    let rendered = render_proxy_config(&base, &target.name, identities, server)?;

    let name = proxy_config_map_name(&target.name);
    let stored = platform
        .config_map_data(namespace, &name)
        .await?
        .and_then(|mut data| data.remove(CONFIG_KEY));
    if stored.as_deref() == Some(rendered.as_str()) {
        debug!(config_map = %name, "Proxy configuration unchanged");
        return Ok(ProxyOutcome::Unchanged);
    }

    platform
        .apply_config_map(namespace, manifests::proxy_config_map(target, rendered))
        .await?;

    let deployment = proxy_deployment_name(&target.name);
    if platform.deployment_exists(namespace, &deployment).await? {
        info!(deployment = %deployment, "Restarting proxy with new configuration");
        platform
            .restart_deployment(namespace, &deployment, &restart_stamp(Utc::now()))
            .await?;
        Ok(ProxyOutcome::Restarted)
    } else {
        info!(deployment = %deployment, port = listener.port, "Creating proxy");
        platform
            .create_deployment(namespace, manifests::proxy_deployment(target, listener.port))
            .await?;
        platform
            .create_service(namespace, manifests::proxy_service(target, listener.port))
            .await?;
        Ok(ProxyOutcome::Created)
    }
}

/// Error for a base document that defines a generated entry
pub fn generated_key_error(config_map: &str, key: &str, entry: &str) -> Error {
    Error::validation(format!(
        "The proxy ConfigMap key, {config_map}:{key}, includes the proxy.{entry} configuration \
         entry. This is not allowed as this entry will be generated by the operator."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigMapRef, ConfigMapRefs, PodsSpec};
    use crate::platform::fake::FakePlatform;
    use chrono::TimeZone;

    const BASE: &str = "general:\n  ports:\n    ldap: 1389\nproxy:\n  tuning: fast\n";

    fn server() -> ServerConfig {
        ServerConfig {
            port: 9389,
            secure: false,
            license_key: "key".to_string(),
            admin_dn: "cn=root".to_string(),
            admin_pwd: "passw0rd".to_string(),
            suffixes: vec!["o=sample".to_string(), "dc=example,dc=com".to_string()],
        }
    }

    fn target() -> DeploymentTarget {
        DeploymentTarget {
            name: "Dir".to_string(),
            namespace: "prod".to_string(),
            owner: None,
            pods: PodsSpec {
                config_map: ConfigMapRefs {
                    proxy: ConfigMapRef {
                        name: "proxy-base".to_string(),
                        key: "proxy.yaml".to_string(),
                    },
                    server: ConfigMapRef {
                        name: "server-base".to_string(),
                        key: "server.yaml".to_string(),
                    },
                },
                ..Default::default()
            },
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn platform_with_base(base: &str) -> FakePlatform {
        let platform = FakePlatform::new();
        platform.add_config_map("proxy-base", &[("proxy.yaml", base)]);
        platform
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Story: every replica serves every suffix, and the server group holds
    /// the connection target and admin credential per replica
    #[test]
    fn story_render_lists_every_replica_per_partition() {
        let base = ConfigDocument::parse(BASE).unwrap();
        let text = render_proxy_config(&base, "Dir", &ids(&["a", "b"]), &server()).unwrap();
        let doc: Value = serde_yaml::from_str(&text).unwrap();

        assert_eq!(doc["general"]["ports"]["ldap"], Value::from(1389));
        assert_eq!(doc["proxy"]["tuning"], string("fast"));

        let group = &doc["proxy"]["server-groups"][0];
        assert_eq!(group["name"], string("proxy"));
        let first = &group["servers"][0];
        assert_eq!(first["name"], string("dir-a"));
        assert_eq!(first["id"], string("dir-a"));
        assert_eq!(first["target"], string("ldap://dir-a:9389"));
        assert_eq!(first["user"]["dn"], string("cn=root"));
        assert_eq!(first["user"]["password"], string("passw0rd"));

        let splits = doc["proxy"]["suffixes"].as_sequence().unwrap();
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[0]["name"], string("split_0"));
        assert_eq!(splits[1]["base"], string("dc=example,dc=com"));
        assert_eq!(
            splits[1]["servers"].as_sequence().unwrap().len(),
            2,
            "each partition lists every replica"
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let base = ConfigDocument::parse(BASE).unwrap();
        let first = render_proxy_config(&base, "Dir", &ids(&["a", "b", "c"]), &server()).unwrap();
        let second = render_proxy_config(&base, "Dir", &ids(&["a", "b", "c"]), &server()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_secure_targets_use_ldaps() {
        let mut s = server();
        s.secure = true;
        s.port = 9636;
        let text =
            render_proxy_config(&ConfigDocument::parse("").unwrap(), "dir", &ids(&["a"]), &s).unwrap();
        assert!(text.contains("ldaps://dir-a:9636"));
    }

    #[test]
    fn test_generated_keys_are_detected() {
        let doc = ConfigDocument::parse("proxy:\n  suffixes: []\n").unwrap();
        assert_eq!(generated_key_in(&doc), Some("suffixes"));
        let doc = ConfigDocument::parse("proxy:\n  server-groups: []\n").unwrap();
        assert_eq!(generated_key_in(&doc), Some("server-groups"));
        assert_eq!(generated_key_in(&ConfigDocument::parse(BASE).unwrap()), None);
    }

    #[test]
    fn test_restart_stamp_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(restart_stamp(now), "20240309070501");
    }

    // =========================================================================
    // Deployment Stories
    // =========================================================================

    /// Story: the first configuration creates the proxy and its service on
    /// the port the base document configures
    #[tokio::test]
    async fn story_first_render_creates_proxy() {
        let platform = platform_with_base(BASE);
        let outcome = deploy_proxy(&platform, &target(), &ids(&["a"]), &server())
            .await
            .unwrap();
        assert_eq!(outcome, ProxyOutcome::Created);
        assert_eq!(
            platform.log(),
            vec![
                "apply_config_map dir-proxy",
                "create_deployment dir-proxy",
                "create_service dir-proxy",
            ]
        );
        let deployment = platform.deployment("dir-proxy").unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].ports.as_ref().unwrap()[0].container_port, 1389);
    }

    /// Story: re-rendering an unchanged topology leaves the proxy alone
    #[tokio::test]
    async fn story_unchanged_topology_does_not_redeploy() {
        let platform = platform_with_base(BASE);
        deploy_proxy(&platform, &target(), &ids(&["a", "b"]), &server())
            .await
            .unwrap();
        let before = platform.log().len();

        let outcome = deploy_proxy(&platform, &target(), &ids(&["a", "b"]), &server())
            .await
            .unwrap();
        assert_eq!(outcome, ProxyOutcome::Unchanged);
        assert_eq!(platform.log().len(), before);
    }

    /// Story: a topology change rewrites the document and rolls the proxy
    #[tokio::test]
    async fn story_changed_topology_restarts_proxy() {
        let platform = platform_with_base(BASE);
        deploy_proxy(&platform, &target(), &ids(&["a"]), &server())
            .await
            .unwrap();

        let outcome = deploy_proxy(&platform, &target(), &ids(&["a", "b"]), &server())
            .await
            .unwrap();
        assert_eq!(outcome, ProxyOutcome::Restarted);
        assert_eq!(
            platform.log_matching("restart_deployment"),
            vec!["restart_deployment dir-proxy"]
        );
        let stored = platform.config_map("dir-proxy").unwrap();
        assert!(stored[CONFIG_KEY].contains("dir-b"));
    }

    /// Story: a base document that already defines partitions is a
    /// configuration conflict and nothing is written
    #[tokio::test]
    async fn story_user_supplied_partitions_are_rejected() {
        let platform = platform_with_base("proxy:\n  suffixes:\n    - base: o=sample\n");
        let err = deploy_proxy(&platform, &target(), &ids(&["a"]), &server())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            err.user_message(),
            "The proxy ConfigMap key, proxy-base:proxy.yaml, includes the proxy.suffixes \
             configuration entry. This is not allowed as this entry will be generated by the operator."
        );
        assert!(platform.log().is_empty());
    }
}
