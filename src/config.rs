//! replicactl Configuration
//!
//! This module provides configuration structures for the replication
//! topology manager. Every section is optional; a missing file means
//! defaults plus whatever the command line supplies.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main replicactl configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicaCtlConfig {
    /// Local node configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Directory connection configuration
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Polling limits for server-side tasks
    #[serde(default)]
    pub polling: PollingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Starting host (defaults to the local host name)
    #[serde(default)]
    pub host: Option<String>,

    /// Kerberos realm of the deployment
    #[serde(default)]
    pub realm: Option<String>,

    /// Base DN of the domain suffix (derived from the realm when absent)
    #[serde(default)]
    pub basedn: Option<String>,
}

/// Directory connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// URI scheme, either "ldap" or "ldaps"
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Directory port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upgrade plain connections with StartTLS
    #[serde(default)]
    pub starttls: bool,

    /// Verify server certificates
    #[serde(default = "default_true")]
    pub tls_verify: bool,

    /// Bind DN used for every session
    #[serde(default = "default_bind_dn")]
    pub bind_dn: String,

    /// File holding the bind password (optional)
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-operation timeout in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

/// Polling limits for asynchronous server-side work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Maximum wait for a total update (re-initialize) in seconds
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// Maximum wait for an incremental update in seconds
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,

    /// Maximum wait for a CLEANALLRUV or fixup task in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_scheme() -> String {
    "ldaps".to_string()
}

fn default_port() -> u16 {
    636
}

fn default_true() -> bool {
    true
}

fn default_bind_dn() -> String {
    "cn=Directory Manager".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_init_timeout() -> u64 {
    3600
}

fn default_update_timeout() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    3600
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            port: default_port(),
            starttls: false,
            tls_verify: true,
            bind_dn: default_bind_dn(),
            password_file: None,
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            init_timeout_secs: default_init_timeout(),
            update_timeout_secs: default_update_timeout(),
            task_timeout_secs: default_task_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PollingConfig {
    /// Get poll interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl DirectoryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Build the connection URL for a host
    pub fn url_for(&self, host: &str) -> String {
        format!("{}://{}:{}", self.scheme, host, self.port)
    }
}

impl ReplicaCtlConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ReplicaCtlConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.directory.scheme != "ldap" && self.directory.scheme != "ldaps" {
            return Err(crate::Error::Config(format!(
                "directory.scheme must be 'ldap' or 'ldaps', got '{}'",
                self.directory.scheme
            )));
        }

        if self.directory.bind_dn.is_empty() {
            return Err(crate::Error::Config("directory.bind_dn cannot be empty".into()));
        }

        if self.polling.interval_ms == 0 {
            return Err(crate::Error::Config("polling.interval_ms must be positive".into()));
        }

        if self.node.realm.is_none() && self.node.basedn.is_none() {
            return Err(crate::Error::Config(
                "either node.realm or node.basedn must be set".into(),
            ));
        }

        Ok(())
    }

    /// Base DN of the domain suffix
    pub fn basedn(&self) -> crate::Result<String> {
        if let Some(basedn) = &self.node.basedn {
            return Ok(basedn.clone());
        }
        match &self.node.realm {
            Some(realm) => Ok(realm_to_suffix(realm)),
            None => Err(crate::Error::Config(
                "either node.realm or node.basedn must be set".into(),
            )),
        }
    }

    /// Read the bind password from the configured file, if any
    pub fn password_from_file(&self) -> crate::Result<Option<String>> {
        match &self.directory.password_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Ok(Some(content.trim_end_matches(['\r', '\n']).to_string()))
            }
            None => Ok(None),
        }
    }
}

/// Convert a realm or DNS domain into a base DN: `EXAMPLE.COM` -> `dc=example,dc=com`
pub fn realm_to_suffix(realm: &str) -> String {
    realm
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| format!("dc={}", part.to_lowercase()))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
host = "ipa1.example.com"
realm = "EXAMPLE.COM"

[directory]
scheme = "ldap"
port = 389
starttls = true

[polling]
interval_ms = 250
task_timeout_secs = 60
"#;

        let config = ReplicaCtlConfig::from_str(toml).unwrap();
        assert_eq!(config.node.host.as_deref(), Some("ipa1.example.com"));
        assert_eq!(config.basedn().unwrap(), "dc=example,dc=com");
        assert_eq!(config.directory.url_for("ipa2.example.com"), "ldap://ipa2.example.com:389");
        assert_eq!(config.polling.interval(), Duration::from_millis(250));
        assert_eq!(config.polling.update_timeout(), Duration::from_secs(30));
        assert_eq!(config.directory.bind_dn, "cn=Directory Manager");
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let toml = r#"
[node]
basedn = "dc=example,dc=com"

[directory]
scheme = "http"
"#;
        assert!(ReplicaCtlConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_requires_realm_or_basedn() {
        assert!(ReplicaCtlConfig::from_str("").is_err());
    }

    #[test]
    fn test_password_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Secret123").unwrap();

        let mut config = ReplicaCtlConfig::default();
        config.node.basedn = Some("dc=example,dc=com".into());
        config.directory.password_file = Some(file.path().to_path_buf());
        assert_eq!(config.password_from_file().unwrap().as_deref(), Some("Secret123"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicaCtlConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.directory.port, 636);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_realm_to_suffix() {
        assert_eq!(realm_to_suffix("IPA.TEST"), "dc=ipa,dc=test");
    }
}
