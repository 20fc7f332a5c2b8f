//! Configuration for the certkeeper daemon.
//!
//! Configuration is written in KDL:
//!
//! ```kdl
//! certificate {
//!     enabled #true
//!     identifier "203.0.113.7"
//!     email "ops@example.com"
//!     base-path "/etc/certkeeper/ip_cert"
//! }
//!
//! renewal {
//!     check-interval-secs 21600
//!     renew-threshold-secs 259200
//!     max-retries 12
//!     retry-interval-secs 1800
//! }
//!
//! state-file "/var/lib/certkeeper/renewal_state.json"
//!
//! issuer {
//!     command "/usr/local/bin/issue-ip-cert" "--http-01"
//! }
//!
//! proxy {
//!     pid-file "/run/xray.pid"
//!     reload-url "http://127.0.0.1:10085/reload"
//! }
//!
//! alerts {
//!     webhook "https://hooks.example.com/certkeeper"
//! }
//!
//! host-listener {
//!     privileged-port 80
//!     listening #false
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};
use validator::{Validate, ValidationErrors};

pub mod kdl;
pub mod renewal;
pub mod validate;

pub use renewal::RenewalConfig;

/// Default location of the persisted renewal state
pub const DEFAULT_STATE_FILE: &str = "/var/lib/certkeeper/renewal_state.json";

/// Default certificate base path (`<base>.crt` / `<base>.key`)
pub const DEFAULT_CERT_BASE: &str = "/etc/certkeeper/cert";

/// Top-level daemon configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub certificate: CertificateSettings,
    pub renewal: RenewalConfig,
    pub state_file: StateFile,
    pub issuer: IssuerConfig,
    pub proxy: ProxyConfig,
    pub alerts: AlertsConfig,
    pub host_listener: HostListenerConfig,
}

/// What certificate to keep valid, and where it lives
#[derive(Debug, Clone, Validate)]
pub struct CertificateSettings {
    /// Feature switch; a disabled daemon only records check times
    pub enabled: bool,

    /// IP address or domain the certificate is issued for
    #[validate(length(min = 1, message = "identifier must not be empty"))]
    pub identifier: String,

    /// ACME account contact
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,

    /// Certificate base path; files are `<base>.crt` and `<base>.key`
    pub base_path: PathBuf,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            identifier: String::new(),
            email: String::new(),
            base_path: PathBuf::from(DEFAULT_CERT_BASE),
        }
    }
}

impl CertificateSettings {
    /// Path of the PEM certificate
    pub fn cert_path(&self) -> PathBuf {
        with_suffix(&self.base_path, "crt")
    }

    /// Path of the PEM private key
    pub fn key_path(&self) -> PathBuf {
        with_suffix(&self.base_path, "key")
    }
}

/// Append `.suffix` to a base path without replacing an existing extension
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

/// Location of the persisted renewal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile(pub PathBuf);

impl Default for StateFile {
    fn default() -> Self {
        Self(PathBuf::from(DEFAULT_STATE_FILE))
    }
}

/// External issuance command
#[derive(Debug, Clone, Default)]
pub struct IssuerConfig {
    /// Program and arguments; empty means no issuer is configured
    pub command: Vec<String>,
}

/// The proxy process that consumes the certificate
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// File holding the proxy's PID
    pub pid_file: Option<PathBuf>,
    /// Endpoint accepting a POST to reload configuration
    pub reload_url: Option<String>,
    /// Program and arguments that restart the proxy
    pub restart_command: Vec<String>,
    /// Wait before confirming the proxy survived a reload
    pub verify_delay: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            reload_url: None,
            restart_command: Vec::new(),
            verify_delay: Duration::from_secs(2),
        }
    }
}

/// Operator alerting
#[derive(Debug, Clone, Default)]
pub struct AlertsConfig {
    /// Webhook receiving alert JSON; alerts are only logged when unset
    pub webhook: Option<String>,
}

/// The host application's own listener on the challenge port
#[derive(Debug, Clone)]
pub struct HostListenerConfig {
    /// Port the HTTP-01 challenge server needs
    pub privileged_port: u16,
    /// Whether the host is configured to listen on that port
    pub listening: bool,
    /// Command that makes the host stop listening
    pub pause_command: Vec<String>,
    /// Command that makes the host listen again
    pub resume_command: Vec<String>,
}

impl Default for HostListenerConfig {
    fn default() -> Self {
        Self {
            privileged_port: 80,
            listening: false,
            pause_command: Vec::new(),
            resume_command: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading configuration file");

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config = Self::from_kdl(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;

        info!(
            path = %path.display(),
            enabled = config.certificate.enabled,
            identifier = %config.certificate.identifier,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from KDL text
    pub fn from_kdl(content: &str) -> Result<Self> {
        kdl::parse_config(content)
    }

    /// Check field constraints.
    ///
    /// Certificate settings are only checked when the feature is enabled.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        self.renewal.validate()?;
        if self.certificate.enabled {
            self.certificate.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_and_key_paths() {
        let settings = CertificateSettings {
            base_path: PathBuf::from("/etc/certkeeper/ip_203.0.113.7"),
            ..Default::default()
        };
        assert_eq!(
            settings.cert_path(),
            PathBuf::from("/etc/certkeeper/ip_203.0.113.7.crt")
        );
        assert_eq!(
            settings.key_path(),
            PathBuf::from("/etc/certkeeper/ip_203.0.113.7.key")
        );
    }

    #[test]
    fn test_disabled_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_enabled_config_requires_email() {
        let config = Config {
            certificate: CertificateSettings {
                enabled: true,
                identifier: "203.0.113.7".into(),
                email: "not-an-email".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("email"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("certkeeper.kdl");
        fs::write(
            &path,
            r#"
            certificate {
                enabled #true
                identifier "203.0.113.7"
                email "ops@example.com"
            }
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.certificate.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file("/nonexistent/certkeeper.kdl").unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration file"));
    }
}
