//! Concrete collaborators used by the `certkeeper` binary.
//!
//! Each adapter maps one collaborator interface onto something the host
//! provides: an external command, a pid file, a webhook.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn};

use certkeeper_common::{AlertSeverity, CertError, CertResult};
use certkeeper_config::{CertificateSettings, HostListenerConfig, ProxyConfig};
use certkeeper_config::with_suffix;

use crate::cert_info::read_expiry;
use crate::collaborators::{
    AlertChannel, HostListenerController, IssuanceService, IssuedCertificate, ProcessIdentity,
    ProxyProcessController, SettingsProvider,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `argv` and collect its output. `argv[0]` is the program.
async fn run_command<I, K, V>(argv: &[String], envs: I) -> std::io::Result<Output>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let (program, args) = argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;

    trace!(program = %program, args = ?args, "Running command");
    Command::new(program)
        .args(args)
        .envs(envs)
        .kill_on_drop(true)
        .output()
        .await
}

fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, stderr)
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Settings taken from the configuration file at startup
#[derive(Debug, Clone)]
pub struct StaticSettings {
    certificate: CertificateSettings,
}

impl StaticSettings {
    pub fn new(certificate: CertificateSettings) -> Self {
        Self { certificate }
    }
}

impl SettingsProvider for StaticSettings {
    fn is_enabled(&self) -> CertResult<bool> {
        Ok(self.certificate.enabled)
    }

    fn identifier(&self) -> CertResult<String> {
        if self.certificate.identifier.is_empty() {
            return Err(CertError::Settings("certificate identifier is not set".to_string()));
        }
        Ok(self.certificate.identifier.clone())
    }

    fn email(&self) -> CertResult<String> {
        if self.certificate.email.is_empty() {
            return Err(CertError::Settings("certificate email is not set".to_string()));
        }
        Ok(self.certificate.email.clone())
    }

    fn cert_base_path(&self) -> CertResult<PathBuf> {
        Ok(self.certificate.base_path.clone())
    }
}

// ============================================================================
// Issuance
// ============================================================================

/// Issuance bookkeeping written next to the certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    /// When the certificate expires
    pub expires: DateTime<Utc>,
    /// When the certificate was issued
    pub issued: DateTime<Utc>,
    /// Identifier the certificate covers
    pub identifier: String,
    /// Program that issued it
    #[serde(default)]
    pub issuer: Option<String>,
}

/// Issues certificates by running an external ACME client.
///
/// The command receives `CERTKEEPER_IDENTIFIER`, `CERTKEEPER_EMAIL`,
/// `CERTKEEPER_CERT_PATH` and `CERTKEEPER_KEY_PATH` and must write the pair
/// to those paths before exiting with status 0.
#[derive(Debug, Clone)]
pub struct CommandIssuer {
    command: Vec<String>,
    base_path: PathBuf,
}

impl CommandIssuer {
    pub fn new(command: Vec<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            base_path: base_path.into(),
        }
    }

    fn meta_path(&self) -> PathBuf {
        with_suffix(&self.base_path, "meta.json")
    }

    /// Load the metadata sidecar, if any
    pub fn load_meta(&self) -> CertResult<Option<CertificateMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            trace!(path = %path.display(), "No certificate metadata");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let meta = serde_json::from_str(&content).map_err(|e| {
            CertError::State(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(meta))
    }

    fn save_meta(&self, meta: &CertificateMeta) -> CertResult<()> {
        let path = self.meta_path();
        let content = serde_json::to_string_pretty(meta)
            .map_err(|e| CertError::State(format!("failed to serialize metadata: {}", e)))?;
        crate::files::write_atomic(&path, content.as_bytes(), 0o644)?;
        debug!(path = %path.display(), "Saved certificate metadata");
        Ok(())
    }
}

#[async_trait]
impl IssuanceService for CommandIssuer {
    async fn issue_certificate(
        &self,
        identifier: &str,
        email: &str,
    ) -> CertResult<IssuedCertificate> {
        if self.command.is_empty() {
            return Err(CertError::Settings("no issuer command configured".to_string()));
        }

        let cert_path = with_suffix(&self.base_path, "crt");
        let key_path = with_suffix(&self.base_path, "key");

        info!(identifier = %identifier, program = %self.command[0], "Requesting certificate");

        let envs = [
            ("CERTKEEPER_IDENTIFIER", OsStr::new(identifier)),
            ("CERTKEEPER_EMAIL", OsStr::new(email)),
            ("CERTKEEPER_CERT_PATH", cert_path.as_os_str()),
            ("CERTKEEPER_KEY_PATH", key_path.as_os_str()),
        ];
        let output = run_command(&self.command, envs)
            .await
            .map_err(|e| CertError::CaRefused(format!("failed to run issuer: {}", e)))?;

        if !output.status.success() {
            return Err(CertError::CaRefused(describe_failure(&output)));
        }

        let expiry = read_expiry(&cert_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            {
                warn!(path = %key_path.display(), error = %e, "Failed to restrict key permissions");
            }
        }

        let meta = CertificateMeta {
            expires: expiry,
            issued: Utc::now(),
            identifier: identifier.to_string(),
            issuer: Path::new(&self.command[0])
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        };
        if let Err(e) = self.save_meta(&meta) {
            warn!(error = %e, "Failed to save certificate metadata");
        }

        Ok(IssuedCertificate {
            cert_path,
            key_path,
            expiry,
        })
    }

    async fn get_certificate_info(&self, identifier: &str) -> CertResult<DateTime<Utc>> {
        let meta = self
            .load_meta()?
            .ok_or_else(|| CertError::State("no issuance metadata".to_string()))?;

        if meta.identifier != identifier {
            return Err(CertError::State(format!(
                "metadata is for {}, not {}",
                meta.identifier, identifier
            )));
        }
        Ok(meta.expires)
    }
}

// ============================================================================
// Proxy process
// ============================================================================

/// Controls a proxy process found through its pid file
#[derive(Debug, Clone)]
pub struct PidFileProxy {
    pid_file: Option<PathBuf>,
    reload_url: Option<String>,
    restart_command: Vec<String>,
    http: reqwest::Client,
}

impl PidFileProxy {
    pub fn new(config: &ProxyConfig) -> CertResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CertError::Settings(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            pid_file: config.pid_file.clone(),
            reload_url: config.reload_url.clone(),
            restart_command: config.restart_command.clone(),
            http,
        })
    }

    fn pid(&self) -> CertResult<nix::unistd::Pid> {
        let path = self
            .pid_file
            .as_ref()
            .ok_or_else(|| CertError::Settings("no proxy pid-file configured".to_string()))?;
        let content = std::fs::read_to_string(path)?;
        let pid: i32 = content.trim().parse().map_err(|_| {
            CertError::Settings(format!("{} does not contain a pid", path.display()))
        })?;
        Ok(nix::unistd::Pid::from_raw(pid))
    }
}

#[async_trait]
impl ProxyProcessController for PidFileProxy {
    fn is_running(&self) -> bool {
        use nix::errno::Errno;

        match self.pid() {
            // Signal 0 checks existence; EPERM means it exists but is not ours
            Ok(pid) => matches!(nix::sys::signal::kill(pid, None), Ok(()) | Err(Errno::EPERM)),
            Err(e) => {
                trace!(error = %e, "Proxy pid unavailable");
                false
            }
        }
    }

    fn process_identity(&self) -> CertResult<ProcessIdentity> {
        use std::os::unix::fs::MetadataExt;

        let pid = self.pid()?;
        let meta = std::fs::metadata(format!("/proc/{}", pid))?;
        Ok(ProcessIdentity {
            pid: pid.as_raw(),
            owner_uid: meta.uid(),
        })
    }

    fn send_reload_signal(&self) -> CertResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};

        let pid = self.pid()?;
        match kill(pid, Signal::SIGHUP) {
            Ok(()) => {
                debug!(pid = %pid, "Sent SIGHUP to proxy");
                Ok(())
            }
            Err(Errno::EPERM) => Err(CertError::PermissionDenied(format!(
                "not permitted to signal process {}",
                pid
            ))),
            Err(e) => Err(CertError::ReloadFailed(format!(
                "failed to signal process {}: {}",
                pid, e
            ))),
        }
    }

    async fn request_api_reload(&self) -> CertResult<()> {
        let url = self
            .reload_url
            .as_deref()
            .ok_or_else(|| CertError::ReloadFailed("no reload API configured".to_string()))?;

        self.http
            .post(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CertError::ReloadFailed(format!("POST {} failed: {}", url, e)))?;

        debug!(url = %url, "Proxy reload API accepted request");
        Ok(())
    }

    async fn restart(&self) -> CertResult<()> {
        if self.restart_command.is_empty() {
            return Err(CertError::ReloadFailed("no restart command configured".to_string()));
        }

        let output = run_command(&self.restart_command, std::iter::empty::<(&str, &str)>())
            .await
            .map_err(|e| CertError::ReloadFailed(format!("failed to run restart command: {}", e)))?;
        if !output.status.success() {
            return Err(CertError::ReloadFailed(format!(
                "restart command {}",
                describe_failure(&output)
            )));
        }

        info!("Proxy restarted");
        Ok(())
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    title: &'a str,
    message: &'a str,
    severity: AlertSeverity,
}

/// POSTs alerts as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookAlerts {
    url: String,
    http: reqwest::Client,
}

impl WebhookAlerts {
    pub fn new(url: impl Into<String>) -> CertResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CertError::Settings(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookAlerts {
    async fn send_alert(
        &self,
        title: &str,
        message: &str,
        severity: AlertSeverity,
    ) -> CertResult<()> {
        let payload = AlertPayload {
            title,
            message,
            severity,
        };

        self.http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CertError::Io(std::io::Error::other(format!("webhook failed: {}", e))))?;

        debug!(title = %title, %severity, "Alert delivered");
        Ok(())
    }
}

/// Writes alerts to the log when no webhook is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerts;

#[async_trait]
impl AlertChannel for LogAlerts {
    async fn send_alert(
        &self,
        title: &str,
        message: &str,
        severity: AlertSeverity,
    ) -> CertResult<()> {
        match severity {
            AlertSeverity::Critical => error!(alert = %title, "{}", message),
            AlertSeverity::Warning => warn!(alert = %title, "{}", message),
            AlertSeverity::Info => info!(alert = %title, "{}", message),
        }
        Ok(())
    }
}

// ============================================================================
// Host listener
// ============================================================================

/// Host listener driven by configured pause/resume commands
#[derive(Debug, Clone)]
pub struct CommandHostListener {
    listening: bool,
    pause_command: Vec<String>,
    resume_command: Vec<String>,
}

impl CommandHostListener {
    pub fn new(config: &HostListenerConfig) -> Self {
        Self {
            listening: config.listening,
            pause_command: config.pause_command.clone(),
            resume_command: config.resume_command.clone(),
        }
    }

    async fn run(&self, what: &str, command: &[String]) -> CertResult<()> {
        if command.is_empty() {
            debug!(action = what, "No host listener command configured");
            return Ok(());
        }

        let output = run_command(command, std::iter::empty::<(&str, &str)>()).await?;
        if !output.status.success() {
            return Err(CertError::Io(std::io::Error::other(format!(
                "host {} command {}",
                what,
                describe_failure(&output)
            ))));
        }
        debug!(action = what, "Host listener command succeeded");
        Ok(())
    }
}

#[async_trait]
impl HostListenerController for CommandHostListener {
    async fn pause(&self) -> CertResult<()> {
        self.run("pause", &self.pause_command).await
    }

    async fn resume(&self) -> CertResult<()> {
        self.run("resume", &self.resume_command).await
    }

    fn is_configured_to_listen_on_privileged_port(&self) -> bool {
        self.listening
    }
}
