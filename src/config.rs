//! Typed access to the server and proxy configuration documents
//!
//! The documents are free-form YAML owned by the user. The operator only
//! reads a handful of dotted paths out of them, so instead of modelling the
//! whole document this module wraps the parsed tree and exposes typed
//! getters. Values of the form `secret:<name>/<key>` are dereferenced against
//! the deployment's namespace before any getter runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Prefix marking a value that lives in a Secret
pub const SECRET_PREFIX: &str = "secret:";

/// Default plain LDAP port
pub const DEFAULT_LDAP_PORT: i32 = 9389;

/// Default LDAPS port, used when the plain port is disabled
pub const DEFAULT_LDAPS_PORT: i32 = 9636;

/// Default administrative bind DN
pub const DEFAULT_ADMIN_DN: &str = "cn=root";

/// Nesting limit for documents; deeper trees are rejected
const MAX_DEPTH: usize = 32;

/// Source of Secret values referenced from configuration documents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Read `key` from the Secret `name`
    ///
    /// Returns `Ok(None)` when the Secret or the key does not exist.
    async fn secret_value(&self, name: &str, key: &str) -> Result<Option<String>, Error>;
}

/// Split a `secret:<name>/<key>` reference
pub fn parse_secret_ref(value: &str) -> Option<(&str, &str)> {
    let (name, key) = value.strip_prefix(SECRET_PREFIX)?.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((name, key))
}

/// A parsed configuration document
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDocument {
    root: Mapping,
}

impl ConfigDocument {
    /// Parse a YAML document whose top level must be a mapping
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| Error::validation(format!("The configuration cannot be parsed: {e}")))?;
        match value {
            Value::Mapping(root) => {
                root.values().try_for_each(|v| check_depth(v, 1))?;
                Ok(Self { root })
            }
            Value::Null => Ok(Self {
                root: Mapping::new(),
            }),
            _ => Err(Error::validation("The configuration cannot be parsed.")),
        }
    }

    /// Wrap an existing mapping
    pub fn from_mapping(root: Mapping) -> Self {
        Self { root }
    }

    /// The underlying mapping
    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    /// Consume the document, returning the underlying mapping
    pub fn into_mapping(self) -> Mapping {
        self.root
    }

    /// Replace every secret reference with the value it points at
    ///
    /// References that cannot be resolved become null, so getters treat them
    /// as absent. API failures other than not-found are propagated.
    pub async fn resolve_secrets(mut self, resolver: &dyn SecretResolver) -> Result<Self, Error> {
        let mut refs = BTreeSet::new();
        for value in self.root.values() {
            collect_secret_refs(value, &mut refs);
        }
        if refs.is_empty() {
            return Ok(self);
        }

        let mut resolved: BTreeMap<String, Option<String>> = BTreeMap::new();
        for reference in refs {
            let value = match parse_secret_ref(&reference) {
                Some((name, key)) => resolver.secret_value(name, key).await?,
                None => None,
            };
            if value.is_none() {
                warn!(reference = %reference, "secret reference could not be resolved");
            }
            resolved.insert(reference, value);
        }

        for value in self.root.values_mut() {
            substitute_secrets(value, &resolved);
        }
        debug!(count = resolved.len(), "resolved secret references");
        Ok(self)
    }

    /// Raw value at a dotted path, e.g. `general.ports.ldap`
    pub fn get_value(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_mapping()?.get(segment)?;
        }
        match current {
            Value::Null => None,
            other => Some(other),
        }
    }

    /// True when the path resolves to a non-null value
    pub fn contains(&self, path: &str) -> bool {
        self.get_value(path).is_some()
    }

    /// Integer at `path`; a non-integer value is a validation error
    pub fn get_int(&self, path: &str) -> Result<Option<i64>, Error> {
        match self.get_value(path) {
            None => Ok(None),
            Some(Value::Number(n)) if n.is_i64() => Ok(n.as_i64()),
            Some(_) => Err(incorrect(path)),
        }
    }

    /// String at `path`; a non-string value is a validation error
    pub fn get_str(&self, path: &str) -> Result<Option<String>, Error> {
        match self.get_value(path) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(incorrect(path)),
        }
    }

    /// Sequence at `path`; a non-sequence value is a validation error
    pub fn get_list(&self, path: &str) -> Result<Option<&[Value]>, Error> {
        match self.get_value(path) {
            None => Ok(None),
            Some(Value::Sequence(seq)) => Ok(Some(seq.as_slice())),
            Some(_) => Err(incorrect(path)),
        }
    }

    /// Port configured for directory traffic and whether it is LDAPS
    ///
    /// `general.ports.ldap` defaults to 9389. A value of 0 disables plain
    /// LDAP, in which case `general.ports.ldaps` (default 9636) is used.
    pub fn listener(&self) -> Result<(i32, bool), Error> {
        let ldap = match self.get_int("general.ports.ldap")? {
            Some(port) => to_port("general.ports.ldap", port)?,
            None => DEFAULT_LDAP_PORT,
        };
        if ldap != 0 {
            return Ok((ldap, false));
        }
        let ldaps = match self.get_int("general.ports.ldaps")? {
            Some(port) => to_port("general.ports.ldaps", port)?,
            None => DEFAULT_LDAPS_PORT,
        };
        Ok((ldaps, true))
    }
}

fn incorrect(path: &str) -> Error {
    Error::validation(format!("The {path} configuration is incorrect."))
}

fn to_port(path: &str, port: i64) -> Result<i32, Error> {
    if (0..=65535).contains(&port) {
        Ok(port as i32)
    } else {
        Err(incorrect(path))
    }
}

fn check_depth(value: &Value, depth: usize) -> Result<(), Error> {
    if depth > MAX_DEPTH {
        return Err(Error::validation("The configuration is nested too deeply."));
    }
    match value {
        Value::Mapping(m) => m.values().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Sequence(s) => s.iter().try_for_each(|v| check_depth(v, depth + 1)),
        _ => Ok(()),
    }
}

fn collect_secret_refs(value: &Value, refs: &mut BTreeSet<String>) {
    match value {
        Value::String(s) if s.starts_with(SECRET_PREFIX) => {
            refs.insert(s.clone());
        }
        Value::Mapping(m) => m.values().for_each(|v| collect_secret_refs(v, refs)),
        Value::Sequence(s) => s.iter().for_each(|v| collect_secret_refs(v, refs)),
        _ => {}
    }
}

fn substitute_secrets(value: &mut Value, resolved: &BTreeMap<String, Option<String>>) {
    let replacement = match value {
        Value::String(s) if s.starts_with(SECRET_PREFIX) => match resolved.get(s.as_str()) {
            Some(Some(secret)) => Some(Value::String(secret.clone())),
            _ => Some(Value::Null),
        },
        Value::Mapping(m) => {
            m.values_mut().for_each(|v| substitute_secrets(v, resolved));
            None
        }
        Value::Sequence(s) => {
            s.iter_mut().for_each(|v| substitute_secrets(v, resolved));
            None
        }
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

/// Scalar configuration shared by every replica, resolved once per pass
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// Port every replica listens on
    pub port: i32,
    /// True when replicas only listen on LDAPS
    pub secure: bool,
    /// Product license key passed to the seed jobs
    pub license_key: String,
    /// Administrative bind DN
    pub admin_dn: String,
    /// Administrative bind password
    pub admin_pwd: String,
    /// Suffixes managed by the deployment, in document order
    pub suffixes: Vec<String>,
}

impl ServerConfig {
    /// Extract the server settings from a resolved document
    ///
    /// The license key and admin password are required; the admin DN falls
    /// back to `cn=root`.
    pub fn from_document(doc: &ConfigDocument) -> Result<Self, Error> {
        let (port, secure) = doc.listener()?;

        let license_key = doc
            .get_str("general.license.key")?
            .ok_or_else(|| Error::validation("The general.license.key configuration is missing."))?;

        let admin_dn = doc
            .get_str("general.admin.dn")?
            .unwrap_or_else(|| DEFAULT_ADMIN_DN.to_string());

        let admin_pwd = doc
            .get_str("general.admin.pwd")?
            .ok_or_else(|| Error::validation("The general.admin.pwd configuration is missing."))?;

        let suffixes = suffixes(doc)?;

        Ok(Self {
            port,
            secure,
            license_key,
            admin_dn,
            admin_pwd,
            suffixes,
        })
    }

    /// URL scheme for connections to a replica
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "ldaps"
        } else {
            "ldap"
        }
    }
}

fn suffixes(doc: &ConfigDocument) -> Result<Vec<String>, Error> {
    const MISSING: &str = "The server.suffixes configuration is missing.";
    const INCORRECT: &str = "The server.suffixes configuration is incorrect.";

    let entries = match doc.get_value("server.suffixes") {
        None => return Err(Error::validation(MISSING)),
        Some(Value::Sequence(entries)) => entries,
        Some(_) => return Err(Error::validation(INCORRECT)),
    };

    entries
        .iter()
        .map(|entry| {
            entry
                .as_mapping()
                .and_then(|m| m.get("dn"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::validation(INCORRECT))
        })
        .collect()
}

/// Administrative connection details for the routing proxy
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyConfig {
    /// Port the proxy listens on
    pub port: i32,
    /// True when the proxy only listens on LDAPS
    pub secure: bool,
    /// Administrative bind DN
    pub admin_dn: String,
    /// Administrative bind password
    pub admin_pwd: Option<String>,
}

impl ProxyConfig {
    /// Extract the proxy listener and credentials from a resolved document
    pub fn from_document(doc: &ConfigDocument) -> Result<Self, Error> {
        let (port, secure) = doc.listener()?;
        Ok(Self {
            port,
            secure,
            admin_dn: doc
                .get_str("general.admin.dn")?
                .unwrap_or_else(|| DEFAULT_ADMIN_DN.to_string()),
            admin_pwd: doc.get_str("general.admin.pwd")?,
        })
    }
}
