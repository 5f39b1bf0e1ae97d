//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for runtime settings.  It
//! is built from three layers, lowest precedence first:
//!
//! 1. [`BridgeConfig::default`]
//! 2. an optional TOML file ([`ConfigFile`])
//! 3. command-line flags / environment variables (applied in `main.rs`)
//!
//! # File format
//!
//! ```toml
//! [service]
//! name = "com.example.appsvc"
//! package_family = "Example.Bridge_8wekyb3d8bbwe"
//! address = "127.0.0.1:24900"
//! connect_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every field has a serde default, so a partial file (or an empty one) is
//! valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The service address is not a valid `ip:port`.
    #[error("invalid service address '{0}'")]
    InvalidAddress(String),

    /// A required value is empty.
    #[error("config value '{0}' must not be empty")]
    Empty(&'static str),

    /// The connect timeout is zero.
    #[error("connect timeout must be greater than zero")]
    ZeroTimeout,
}

/// Identifies the app service the bridge opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    /// App-service name registered by the providing package.
    pub service_name: String,
    /// Package family name of the providing package.
    pub package_family_name: String,
}

/// All runtime configuration for the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// App-service name to open.
    pub service_name: String,

    /// Package family name that provides the service.
    pub package_family_name: String,

    /// Address of the app-service host (used by the TCP transport).
    pub service_addr: SocketAddr,

    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,

    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl BridgeConfig {
    /// The service the bridge opens on connect.
    pub fn service_target(&self) -> ServiceTarget {
        ServiceTarget {
            service_name: self.service_name.clone(),
            package_family_name: self.package_family_name.clone(),
        }
    }

    /// Checks values that have no sensible empty or zero form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Empty`] for an empty service name or package
    /// family name, and [`ConfigError::ZeroTimeout`] for a zero connect
    /// timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Empty("service.name"));
        }
        if self.package_family_name.trim().is_empty() {
            return Err(ConfigError::Empty("service.package_family"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    /// | Field               | Default                          |
    /// |---------------------|----------------------------------|
    /// | service_name        | `com.example.appsvc`             |
    /// | package_family_name | `Example.Bridge_8wekyb3d8bbwe`   |
    /// | service_addr        | `127.0.0.1:24900`                |
    /// | connect_timeout     | 10 seconds                       |
    /// | log_level           | `info`                           |
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            package_family_name: default_package_family(),
            service_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVICE_PORT)),
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            log_level: default_log_level(),
        }
    }
}

// ── File schema ───────────────────────────────────────────────────────────────

/// On-disk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[service]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_package_family")]
    pub package_family: String,
    #[serde(default = "default_service_address")]
    pub address: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// `[logging]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `tracing` level or filter directive, e.g. `"debug"` or `"appsvc_bridge=trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

const DEFAULT_SERVICE_PORT: u16 = 24900;

fn default_service_name() -> String {
    "com.example.appsvc".to_string()
}
fn default_package_family() -> String {
    "Example.Bridge_8wekyb3d8bbwe".to_string()
}
fn default_service_address() -> String {
    format!("127.0.0.1:{DEFAULT_SERVICE_PORT}")
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            package_family: default_package_family(),
            address: default_service_address(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConfigFile {
    /// Parses a config file from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a config file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Converts the file schema into a validated [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] for an unparsable address and
    /// the errors of [`BridgeConfig::validate`].
    pub fn into_bridge_config(self) -> Result<BridgeConfig, ConfigError> {
        let service_addr = self
            .service
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.service.address.clone()))?;
        let config = BridgeConfig {
            service_name: self.service.name,
            package_family_name: self.service.package_family,
            service_addr,
            connect_timeout: Duration::from_secs(self.service.connect_timeout_secs),
            log_level: self.logging.level,
        };
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_service_port_is_24900() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.service_addr.port(), 24900);
        assert_eq!(cfg.service_addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_default_connect_timeout_is_10s() {
        assert_eq!(BridgeConfig::default().connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        // Arrange / Act
        let cfg = ConfigFile::from_toml_str("")
            .unwrap()
            .into_bridge_config()
            .unwrap();

        // Assert
        assert_eq!(cfg, BridgeConfig::default());
    }

    #[test]
    fn test_partial_file_overrides_only_given_fields() {
        let text = r#"
            [service]
            name = "com.contoso.render"
            connect_timeout_secs = 3
        "#;

        let cfg = ConfigFile::from_toml_str(text)
            .unwrap()
            .into_bridge_config()
            .unwrap();

        assert_eq!(cfg.service_name, "com.contoso.render");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.package_family_name, "Example.Bridge_8wekyb3d8bbwe");
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let text = "[service]\naddress = \"not-an-address\"\n";

        let result = ConfigFile::from_toml_str(text).unwrap().into_bridge_config();

        assert!(matches!(result, Err(ConfigError::InvalidAddress(a)) if a == "not-an-address"));
    }

    #[test]
    fn test_empty_service_name_is_rejected() {
        let text = "[service]\nname = \"  \"\n";

        let result = ConfigFile::from_toml_str(text).unwrap().into_bridge_config();

        assert!(matches!(result, Err(ConfigError::Empty("service.name"))));
    }

    #[test]
    fn test_zero_connect_timeout_is_rejected() {
        let text = "[service]\nconnect_timeout_secs = 0\n";

        let result = ConfigFile::from_toml_str(text).unwrap().into_bridge_config();

        assert!(matches!(result, Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn test_validate_rejects_zero_timeout_set_in_code() {
        let cfg = BridgeConfig {
            connect_timeout: Duration::ZERO,
            ..BridgeConfig::default()
        };

        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(
            ConfigFile::from_toml_str("[service"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_reads_file_from_disk() {
        // Arrange
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();

        // Act
        let cfg = ConfigFile::load(file.path()).unwrap();

        // Assert
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = ConfigFile::load(&dir.path().join("absent.toml"));

        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_service_target_copies_names() {
        let target = BridgeConfig::default().service_target();
        assert_eq!(target.service_name, "com.example.appsvc");
        assert_eq!(target.package_family_name, "Example.Bridge_8wekyb3d8bbwe");
    }
}
