//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use certkeeper_common::{AlertSeverity, CertError, CertIdentifier, CertResult};
use certkeeper_config::{with_suffix, RenewalConfig};
use certkeeper_daemon::{
    generate_self_signed, AlertChannel, CertificateObserver, HostListenerController,
    IssuanceService, IssuedCertificate, PermissionProbe, ProcessIdentity, ProxyProcessController,
    SettingsProvider,
};

/// Renewal config with millisecond backoff so retry tests run quickly
pub fn fast_renewal_config(max_retries: u32) -> RenewalConfig {
    RenewalConfig {
        max_retries,
        retry_interval: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        startup_delay: Duration::from_millis(10),
        issue_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// A loopback port with nothing listening on it
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Write a self-signed pair for `identifier` at `<base>.crt` / `<base>.key`
pub fn write_pair(base: &Path, identifier: &str, validity_days: i64) -> (PathBuf, PathBuf) {
    let pair = generate_self_signed(&CertIdentifier::parse(identifier), validity_days).unwrap();
    let cert = with_suffix(base, "crt");
    let key = with_suffix(base, "key");
    std::fs::write(&cert, pair.cert_pem).unwrap();
    std::fs::write(&key, pair.key_pem).unwrap();
    (cert, key)
}

// ============================================================================
// Settings
// ============================================================================

pub struct MockSettings {
    pub enabled: bool,
    pub identifier: String,
    pub base_path: PathBuf,
}

impl MockSettings {
    pub fn new(identifier: &str, base_path: PathBuf) -> Self {
        Self {
            enabled: true,
            identifier: identifier.to_string(),
            base_path,
        }
    }
}

impl SettingsProvider for MockSettings {
    fn is_enabled(&self) -> CertResult<bool> {
        Ok(self.enabled)
    }
    fn identifier(&self) -> CertResult<String> {
        Ok(self.identifier.clone())
    }
    fn email(&self) -> CertResult<String> {
        Ok("ops@example.com".to_string())
    }
    fn cert_base_path(&self) -> CertResult<PathBuf> {
        Ok(self.base_path.clone())
    }
}

// ============================================================================
// Issuance
// ============================================================================

/// Scripted issuer: pops one result per call, then repeats `default`
pub struct MockIssuer {
    pub expiry: Mutex<Option<DateTime<Utc>>>,
    pub script: Mutex<VecDeque<CertResult<()>>>,
    pub fail_by_default: bool,
    pub delay: Duration,
    pub base_path: PathBuf,
    pub calls: AtomicU32,
}

impl MockIssuer {
    pub fn new(base_path: PathBuf, expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            expiry: Mutex::new(expiry),
            script: Mutex::new(VecDeque::new()),
            fail_by_default: false,
            delay: Duration::ZERO,
            base_path,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_failing(mut self) -> Self {
        self.fail_by_default = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, result: CertResult<()>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssuanceService for MockIssuer {
    async fn issue_certificate(
        &self,
        _identifier: &str,
        _email: &str,
    ) -> CertResult<IssuedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.script.lock().pop_front();
        let outcome = match scripted {
            Some(result) => result,
            None if self.fail_by_default => {
                Err(CertError::CaRefused("rate limited: too many certificates".into()))
            }
            None => Ok(()),
        };
        outcome?;

        let expiry = Utc::now() + chrono::Duration::days(90);
        *self.expiry.lock() = Some(expiry);
        Ok(IssuedCertificate {
            cert_path: with_suffix(&self.base_path, "crt"),
            key_path: with_suffix(&self.base_path, "key"),
            expiry,
        })
    }

    async fn get_certificate_info(&self, _identifier: &str) -> CertResult<DateTime<Utc>> {
        (*self.expiry.lock())
            .ok_or_else(|| CertError::State("no certificate issued".into()))
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Default)]
pub struct RecordingAlerts {
    pub sent: Mutex<Vec<(String, String, AlertSeverity)>>,
}

impl RecordingAlerts {
    pub fn count(&self, severity: AlertSeverity) -> usize {
        self.sent.lock().iter().filter(|(_, _, s)| *s == severity).count()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(t, _, _)| t.clone()).collect()
    }
}

#[async_trait]
impl AlertChannel for RecordingAlerts {
    async fn send_alert(
        &self,
        title: &str,
        message: &str,
        severity: AlertSeverity,
    ) -> CertResult<()> {
        self.sent
            .lock()
            .push((title.to_string(), message.to_string(), severity));
        Ok(())
    }
}

// ============================================================================
// Host listener
// ============================================================================

/// Host listener that may own a real socket on the arbitrated port.
///
/// `pause` drops the socket after `release_after`, or never when `None`.
pub struct MockHostListener {
    pub configured: bool,
    pub socket: Mutex<Option<std::net::TcpListener>>,
    pub release_after: Option<Duration>,
    pub pauses: AtomicU32,
    pub resumes: AtomicU32,
}

impl MockHostListener {
    pub fn new(configured: bool) -> Self {
        Self {
            configured,
            socket: Mutex::new(None),
            release_after: None,
            pauses: AtomicU32::new(0),
            resumes: AtomicU32::new(0),
        }
    }

    pub fn holding(mut self, socket: std::net::TcpListener, release_after: Option<Duration>) -> Self {
        self.socket = Mutex::new(Some(socket));
        self.release_after = release_after;
        self
    }

    pub fn pauses(&self) -> u32 {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> u32 {
        self.resumes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostListenerController for MockHostListener {
    async fn pause(&self) -> CertResult<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        if let Some(after) = self.release_after {
            let socket = self.socket.lock().take();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                drop(socket);
            });
        }
        Ok(())
    }

    async fn resume(&self) -> CertResult<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_configured_to_listen_on_privileged_port(&self) -> bool {
        self.configured
    }
}

// ============================================================================
// Proxy process and permissions
// ============================================================================

pub struct MockProxy {
    pub running: AtomicBool,
    /// Process exits when it receives a reload
    pub dies_on_reload: bool,
    pub owner_uid: u32,
    pub signal_result: Mutex<CertResult<()>>,
    pub api_result: Mutex<CertResult<()>>,
    pub signals: AtomicU32,
    pub api_calls: AtomicU32,
    pub restarts: AtomicU32,
}

impl MockProxy {
    pub fn new(owner_uid: u32) -> Self {
        Self {
            running: AtomicBool::new(true),
            dies_on_reload: false,
            owner_uid,
            signal_result: Mutex::new(Ok(())),
            api_result: Mutex::new(Ok(())),
            signals: AtomicU32::new(0),
            api_calls: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    fn after_reload(&self) {
        if self.dies_on_reload {
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

fn clone_result(result: &CertResult<()>) -> CertResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(CertError::ReloadFailed(e.to_string())),
    }
}

#[async_trait]
impl ProxyProcessController for MockProxy {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn process_identity(&self) -> CertResult<ProcessIdentity> {
        Ok(ProcessIdentity {
            pid: 4242,
            owner_uid: self.owner_uid,
        })
    }

    fn send_reload_signal(&self) -> CertResult<()> {
        self.signals.fetch_add(1, Ordering::SeqCst);
        let result = clone_result(&self.signal_result.lock());
        if result.is_ok() {
            self.after_reload();
        }
        result
    }

    async fn request_api_reload(&self) -> CertResult<()> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        let result = clone_result(&self.api_result.lock());
        if result.is_ok() {
            self.after_reload();
        }
        result
    }

    async fn restart(&self) -> CertResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct StaticProbe {
    pub euid: u32,
    pub cap_kill: bool,
}

impl PermissionProbe for StaticProbe {
    fn effective_uid(&self) -> u32 {
        self.euid
    }
    fn has_kill_capability(&self) -> bool {
        self.cap_kill
    }
}

// ============================================================================
// Observer
// ============================================================================

#[derive(Default)]
pub struct RecordingObserver {
    pub renewed: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl RecordingObserver {
    pub fn count(&self) -> usize {
        self.renewed.lock().len()
    }
}

#[async_trait]
impl CertificateObserver for RecordingObserver {
    async fn on_certificate_renewed(&self, cert_path: &Path, key_path: &Path) -> CertResult<()> {
        self.renewed
            .lock()
            .push((cert_path.to_path_buf(), key_path.to_path_buf()));
        Ok(())
    }
}

