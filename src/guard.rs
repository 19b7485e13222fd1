//! Admission-time safety checks for topology changes
//!
//! Removing a replica is only allowed when every surviving replica is ready
//! and the routing proxy does not currently use the replica as the primary
//! writer of any partition. Primacy is read from the proxy's monitor
//! namespace over the directory protocol.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use regex::RegexBuilder;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::config::ProxyConfig;
use crate::crd::ConfigMapRef;
use crate::naming::{
    labels_for, proxy_config_map_name, proxy_deployment_name, replica_pod_name, selector,
    CONFIG_KEY,
};
use crate::platform::{load_document, DeploymentTarget, NamespacedSecrets, Platform};
use crate::topology::{RunningTopology, TopologyDiff};
use crate::Error;

/// Monitor entry describing the proxy's partitions
pub const PARTITIONS_BASE: &str = "cn=partitions,cn=proxy,cn=monitor";

/// Attribute holding a backend's current role
pub const ROLE_ATTRIBUTE: &str = "ibm-slapdProxyCurrentServerRole";

/// Role value of the primary writer
pub const PRIMARY_ROLE: &str = "primarywriteserver";

/// Connection details for the proxy's directory endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEndpoint {
    /// `ldap://host:port` or `ldaps://host:port`
    pub url: String,
    /// Bind DN
    pub bind_dn: String,
    /// Bind password
    pub password: String,
}

/// One entry returned by a directory search
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name
    pub dn: String,
    /// Attribute values by attribute name
    pub attrs: HashMap<String, Vec<String>>,
}

/// Read access to a directory server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DirectoryQuery: Send + Sync {
    /// Bind to `endpoint` and return the entry at `base` itself
    async fn read_base(
        &self,
        endpoint: &DirectoryEndpoint,
        base: &str,
    ) -> Result<Vec<DirectoryEntry>, Error>;
}

/// [`DirectoryQuery`] over the `ldap3` client
pub struct LdapDirectoryQuery {
    timeout: Duration,
}

impl LdapDirectoryQuery {
    /// Client giving up on connect, bind and search after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LdapDirectoryQuery {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn directory_error(e: ldap3::LdapError) -> Error {
    Error::directory(e.to_string())
}

#[async_trait]
impl DirectoryQuery for LdapDirectoryQuery {
    async fn read_base(
        &self,
        endpoint: &DirectoryEndpoint,
        base: &str,
    ) -> Result<Vec<DirectoryEntry>, Error> {
        // The proxy serves a self-signed certificate
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_no_tls_verify(true);

        debug!(url = %endpoint.url, "Connecting to the directory proxy");
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &endpoint.url)
            .await
            .map_err(directory_error)?;
        ldap3::drive!(conn);

        ldap.with_timeout(self.timeout)
            .simple_bind(&endpoint.bind_dn, &endpoint.password)
            .await
            .and_then(|r| r.success())
            .map_err(directory_error)?;

        let (entries, _) = ldap
            .with_timeout(self.timeout)
            .search(base, Scope::Base, "(objectClass=*)", vec!["*"])
            .await
            .and_then(|r| r.success())
            .map_err(directory_error)?;

        let _ = ldap.unbind().await;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                DirectoryEntry {
                    dn: entry.dn,
                    attrs: entry.attrs,
                }
            })
            .collect())
    }
}

/// Identities the proxy currently uses as primary writer
///
/// A partition entry names a primary when its role attribute holds exactly
/// the primary role. The identity is taken from the backend server name in
/// the entry's DN, which is the replica pod name `<deployment>-<identity>`.
pub fn find_primaries(
    entries: &[DirectoryEntry],
    deployment: &str,
) -> Result<BTreeSet<String>, Error> {
    let pattern = format!(
        "ibm-slapdProxyBackendServerName={}-([^+,]*)",
        regex::escape(&deployment.to_lowercase())
    );
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::internal(e.to_string()))?;

    Ok(entries
        .iter()
        .filter(|entry| {
            entry
                .attrs
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(ROLE_ATTRIBUTE))
                .is_some_and(|(_, values)| values.len() == 1 && values[0] == PRIMARY_ROLE)
        })
        .filter_map(|entry| re.captures(&entry.dn))
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect())
}

/// Address and credentials of the deployment's proxy
///
/// The address is the proxy service's cluster IP and first port. The
/// credentials come from the generated proxy document.
pub async fn proxy_endpoint(
    platform: &dyn Platform,
    target: &DeploymentTarget,
) -> Result<DirectoryEndpoint, Error> {
    let namespace = &target.namespace;
    let name = proxy_deployment_name(&target.name);

    let service = platform
        .get_service(namespace, &name)
        .await?
        .ok_or_else(|| Error::validation(format!("The proxy service, {name}, doesn't exist!")))?;
    let spec = service.spec.unwrap_or_default();
    let address = spec
        .cluster_ip
        .filter(|ip| !ip.is_empty() && ip != "None")
        .ok_or_else(|| Error::validation(format!("The proxy service, {name}, has no address.")))?;
    let port = spec
        .ports
        .and_then(|ports| ports.into_iter().next())
        .map(|p| p.port)
        .ok_or_else(|| Error::validation(format!("The proxy service, {name}, has no ports.")))?;

    let reference = ConfigMapRef {
        name: proxy_config_map_name(&target.name),
        key: CONFIG_KEY.to_string(),
    };
    let document = load_document(platform, namespace, &reference)
        .await?
        .resolve_secrets(&NamespacedSecrets::new(platform, namespace))
        .await?;
    let proxy = ProxyConfig::from_document(&document)?;
    let password = proxy
        .admin_pwd
        .ok_or_else(|| Error::validation("The general.admin.pwd configuration is missing."))?;

    let scheme = if proxy.secure { "ldaps" } else { "ldap" };
    Ok(DirectoryEndpoint {
        url: format!("{scheme}://{address}:{port}"),
        bind_dn: proxy.admin_dn,
        password,
    })
}

/// Ask the proxy which identities are primary writers
#[instrument(skip(platform, query, target), fields(deployment = %target.name))]
pub async fn primary_writers(
    platform: &dyn Platform,
    query: &dyn DirectoryQuery,
    target: &DeploymentTarget,
) -> Result<BTreeSet<String>, Error> {
    let endpoint = proxy_endpoint(platform, target).await?;
    let entries = query.read_base(&endpoint, PARTITIONS_BASE).await?;
    if entries.is_empty() {
        return Err(Error::validation(
            "The split information does not exist in the LDAP proxy.",
        ));
    }
    let primaries = find_primaries(&entries, &target.name)?;
    info!(?primaries, "Found primary write servers");
    Ok(primaries)
}

/// Every listed identity must have a running, ready pod
pub async fn check_replicas_ready<'i>(
    platform: &dyn Platform,
    target: &DeploymentTarget,
    identities: impl IntoIterator<Item = &'i str>,
) -> Result<(), Error> {
    for identity in identities {
        let pod = replica_pod_name(&target.name, identity);
        if !platform.pod_state(&target.namespace, &pod).await?.is_ready() {
            return Err(Error::validation(format!(
                "The pod, {pod}, is not currently ready.  You must wait until all pods \
                 are ready before attempting to edit the document."
            )));
        }
    }
    Ok(())
}

/// Refuse to remove any identity the proxy uses as primary writer
///
/// Failing to reach or read the proxy refuses the removal too.
pub async fn check_removal(
    platform: &dyn Platform,
    query: &dyn DirectoryQuery,
    target: &DeploymentTarget,
    to_delete: &[String],
) -> Result<(), Error> {
    if to_delete.is_empty() {
        return Ok(());
    }
    let primaries = primary_writers(platform, query, target)
        .await
        .map_err(|e| Error::validation(e.user_message()))?;

    match to_delete.iter().find(|id| primaries.contains(id.as_str())) {
        Some(pvc) => Err(Error::validation(format!(
            "The pvc, {pvc}, is currently being used as the primary write master by the \
             LDAP proxy. As a result it is not currently possible to remove this PVC."
        ))),
        None => Ok(()),
    }
}

/// Admission check for a change of the desired identities
///
/// Nothing is checked when the running set already matches. Otherwise the
/// surviving replicas must be ready and no removed replica may be a primary.
pub async fn check_topology_change(
    platform: &dyn Platform,
    query: &dyn DirectoryQuery,
    target: &DeploymentTarget,
    desired: &[String],
) -> Result<(), Error> {
    let pods = platform
        .list_pods(&target.namespace, &selector(&labels_for(&target.name, "")))
        .await?;
    let running = RunningTopology::from_pods(&target.name, &pods);
    let diff = TopologyDiff::compute(desired, &running);
    if diff.is_empty() {
        return Ok(());
    }

    let survivors: Vec<String> = running
        .identities()
        .filter(|id| !diff.to_delete.iter().any(|d| d == id))
        .map(str::to_string)
        .collect();
    check_replicas_ready(platform, target, survivors.iter().map(String::as_str)).await?;
    check_removal(platform, query, target, &diff.to_delete).await
}
