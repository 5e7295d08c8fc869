//! LDAP backend
//!
//! Simple-binds as the configured administrative DN and time-limits every
//! operation. The connection driver runs on its own task until unbind.

use std::collections::HashSet;
use std::time::Duration;

use base64::Engine;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, SearchEntry};

use super::{Connector, Directory, Dn, Entry, Filter, Modification, Scope};
use crate::config::DirectoryConfig;
use crate::error::{Error, Result};

/// Attributes requested on every search. The RUV is not returned by `*`.
const SEARCH_ATTRS: [&str; 3] = ["*", "+", "nsds50ruv"];

/// Connection settings shared by every session
#[derive(Clone)]
pub struct LdapSettings {
    pub scheme: String,
    pub port: u16,
    pub starttls: bool,
    pub tls_verify: bool,
    pub bind_dn: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl std::fmt::Debug for LdapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSettings")
            .field("scheme", &self.scheme)
            .field("port", &self.port)
            .field("starttls", &self.starttls)
            .field("tls_verify", &self.tls_verify)
            .field("bind_dn", &self.bind_dn)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl LdapSettings {
    pub fn from_config(config: &DirectoryConfig, password: String) -> Self {
        Self {
            scheme: config.scheme.clone(),
            port: config.port,
            starttls: config.starttls,
            tls_verify: config.tls_verify,
            bind_dn: config.bind_dn.clone(),
            password,
            connect_timeout: config.connect_timeout(),
            operation_timeout: config.operation_timeout(),
        }
    }

    pub fn url_for(&self, host: &str) -> String {
        format!("{}://{}:{}", self.scheme, host, self.port)
    }
}

/// Opens LDAP sessions
#[derive(Debug, Clone)]
pub struct LdapConnector {
    settings: LdapSettings,
}

impl LdapConnector {
    pub fn new(settings: LdapSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl Connector for LdapConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn Directory>> {
        let url = self.settings.url_for(host);
        tracing::debug!("Connecting to {}", url);

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(self.settings.connect_timeout)
            .set_starttls(self.settings.starttls)
            .set_no_tls_verify(!self.settings.tls_verify);

        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, &url)
            .await
            .map_err(|e| Error::ConnectionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let driver_host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!("LDAP connection to {} ended: {}", driver_host, e);
            }
        });

        ldap.with_timeout(self.settings.operation_timeout)
            .simple_bind(&self.settings.bind_dn, &self.settings.password)
            .await
            .and_then(|result| result.success())
            .map_err(|e| Error::BindFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Bound to {} as {}", host, self.settings.bind_dn);
        Ok(Box::new(LdapSession {
            host: host.to_string(),
            ldap,
            timeout: self.settings.operation_timeout,
        }))
    }
}

/// Authenticated LDAP session
pub struct LdapSession {
    host: String,
    ldap: Ldap,
    timeout: Duration,
}

impl LdapSession {
    fn map_error(&self, target: &Dn, err: LdapError) -> Error {
        match err {
            LdapError::LdapResult { result } => match result.rc {
                32 => Error::NotFound(target.to_string()),
                68 => Error::AlreadyExists(target.to_string()),
                49 => Error::BindFailed {
                    host: self.host.clone(),
                    reason: result.text,
                },
                rc => Error::Directory {
                    host: self.host.clone(),
                    message: format!("{} (rc={}): {}", target, rc, result.text),
                },
            },
            LdapError::Timeout { .. } => Error::OperationTimeout {
                host: self.host.clone(),
            },
            LdapError::Io { source } => Error::ConnectionFailed {
                host: self.host.clone(),
                reason: source.to_string(),
            },
            other => Error::Directory {
                host: self.host.clone(),
                message: other.to_string(),
            },
        }
    }
}

fn to_ldap_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

fn to_entry(raw: SearchEntry) -> Entry {
    let mut entry = Entry::new(Dn::new(raw.dn));
    for (attr, values) in raw.attrs {
        entry.set(&attr, values);
    }
    for (attr, values) in raw.bin_attrs {
        let encoded = values
            .iter()
            .map(|v| base64::engine::general_purpose::STANDARD.encode(v));
        entry.set(&attr, encoded);
    }
    entry
}

fn to_set(values: &[String]) -> HashSet<String> {
    values.iter().cloned().collect()
}

fn to_ldap_mod(modification: &Modification) -> Mod<String> {
    match modification {
        Modification::Replace(attr, values) => Mod::Replace(attr.clone(), to_set(values)),
        Modification::Add(attr, values) => Mod::Add(attr.clone(), to_set(values)),
        Modification::Delete(attr, values) => Mod::Delete(attr.clone(), to_set(values)),
    }
}

#[async_trait::async_trait]
impl Directory for LdapSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn search(&mut self, base: &Dn, scope: Scope, filter: Option<&Filter>) -> Result<Vec<Entry>> {
        let filter = filter
            .map(|f| f.to_string())
            .unwrap_or_else(|| "(objectClass=*)".to_string());
        tracing::trace!("search {} on {}: {}", base, self.host, filter);

        let result = self
            .ldap
            .with_timeout(self.timeout)
            .search(base.as_str(), to_ldap_scope(scope), &filter, SEARCH_ATTRS.to_vec())
            .await
            .and_then(|r| r.success());

        match result {
            Ok((entries, _)) => Ok(entries
                .into_iter()
                .map(|e| to_entry(SearchEntry::construct(e)))
                .collect()),
            Err(e) => Err(self.map_error(base, e)),
        }
    }

    async fn add_entry(&mut self, entry: Entry) -> Result<()> {
        let attrs: Vec<(String, HashSet<String>)> = entry
            .attributes()
            .map(|(name, values)| (name.to_string(), to_set(values)))
            .collect();
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .add(entry.dn.as_str(), attrs)
            .await
            .and_then(|r| r.success());
        result.map(|_| ()).map_err(|e| self.map_error(&entry.dn, e))
    }

    async fn modify(&mut self, dn: &Dn, mods: Vec<Modification>) -> Result<()> {
        let mods: Vec<Mod<String>> = mods.iter().map(to_ldap_mod).collect();
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .modify(dn.as_str(), mods)
            .await
            .and_then(|r| r.success());
        result.map(|_| ()).map_err(|e| self.map_error(dn, e))
    }

    async fn delete_entry(&mut self, dn: &Dn) -> Result<()> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .delete(dn.as_str())
            .await
            .and_then(|r| r.success());
        result.map(|_| ()).map_err(|e| self.map_error(dn, e))
    }

    async fn unbind(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            tracing::debug!("Unbind from {} failed: {}", self.host, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_url_and_redaction() {
        let config = DirectoryConfig::default();
        let settings = LdapSettings::from_config(&config, "Secret123".into());
        assert_eq!(settings.url_for("ipa1.example.com"), "ldaps://ipa1.example.com:636");
        assert!(!format!("{:?}", settings).contains("Secret123"));
    }

    #[test]
    fn test_modification_mapping() {
        match to_ldap_mod(&Modification::clear("nsDS5ReplicaUpdateSchedule")) {
            Mod::Delete(attr, values) => {
                assert_eq!(attr, "nsDS5ReplicaUpdateSchedule");
                assert!(values.is_empty());
            }
            _ => panic!("expected a delete"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connectivity_error() {
        let mut config = DirectoryConfig::default();
        config.scheme = "ldap".into();
        config.port = 1;
        config.connect_timeout_secs = 1;
        let connector = LdapConnector::new(LdapSettings::from_config(&config, String::new()));
        let err = connector.connect("127.0.0.1").await.err().unwrap();
        assert!(err.is_connectivity());
    }
}
