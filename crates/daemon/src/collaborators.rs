//! Interfaces the lifecycle core consumes and exposes.
//!
//! Everything outside the core (settings storage, the ACME client, the
//! alerting channel, the host application's own listener and the proxy
//! process) is reached through these traits and injected at construction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use certkeeper_common::{AlertSeverity, CertResult};

/// Persisted settings of the certificate feature
pub trait SettingsProvider: Send + Sync {
    /// Whether automatic renewal is switched on
    fn is_enabled(&self) -> CertResult<bool>;

    /// IP address or domain to certify
    fn identifier(&self) -> CertResult<String>;

    /// ACME account contact
    fn email(&self) -> CertResult<String>;

    /// Base path; the pair lives at `<base>.crt` / `<base>.key`
    fn cert_base_path(&self) -> CertResult<PathBuf>;
}

/// A certificate freshly written by the issuance service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub expiry: DateTime<Utc>,
}

/// The ACME client, consumed as an opaque operation
#[async_trait]
pub trait IssuanceService: Send + Sync {
    /// Obtain a certificate for `identifier` and write it to disk
    async fn issue_certificate(&self, identifier: &str, email: &str)
        -> CertResult<IssuedCertificate>;

    /// Expiry of the certificate the service last issued for `identifier`
    async fn get_certificate_info(&self, identifier: &str) -> CertResult<DateTime<Utc>>;
}

/// Operator notification channel
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send_alert(&self, title: &str, message: &str, severity: AlertSeverity)
        -> CertResult<()>;
}

/// The host application's own listener on the privileged port
#[async_trait]
pub trait HostListenerController: Send + Sync {
    async fn pause(&self) -> CertResult<()>;

    async fn resume(&self) -> CertResult<()>;

    /// Configured intent, not the live socket state
    fn is_configured_to_listen_on_privileged_port(&self) -> bool;
}

/// PID and owning user of the proxy process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub owner_uid: u32,
}

/// Supervisor of the external proxy process
#[async_trait]
pub trait ProxyProcessController: Send + Sync {
    fn is_running(&self) -> bool;

    fn process_identity(&self) -> CertResult<ProcessIdentity>;

    /// Ask the process to reload its configuration (SIGHUP on Unix)
    fn send_reload_signal(&self) -> CertResult<()>;

    /// Ask the process to reload through its management API
    async fn request_api_reload(&self) -> CertResult<()>;

    /// Full restart, for platforms without a signal reload
    async fn restart(&self) -> CertResult<()>;
}

/// Privileges of the current process, behind a seam for tests
pub trait PermissionProbe: Send + Sync {
    fn effective_uid(&self) -> u32;

    /// CAP_KILL in the effective capability set
    fn has_kill_capability(&self) -> bool;
}

/// Called by whoever just wrote a new certificate pair
#[async_trait]
pub trait CertificateObserver: Send + Sync {
    async fn on_certificate_renewed(&self, cert_path: &Path, key_path: &Path) -> CertResult<()>;
}
