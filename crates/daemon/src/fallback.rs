//! Self-signed fallback when renewal keeps failing.
//!
//! The controller keeps the endpoint on *some* certificate and the operator
//! informed. It counts failed attempts, escalates when the installed
//! certificate is about to lapse, and on request installs a short-lived
//! self-signed pair for the configured identifier.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, RsaKeySize, SanType,
};
use tracing::{debug, error, info, warn};

use certkeeper_common::{AlertSeverity, CertError, CertIdentifier, CertResult};
use certkeeper_config::with_suffix;

use crate::cert_info::read_expiry;
use crate::collaborators::{AlertChannel, CertificateObserver, SettingsProvider};
use crate::files::{backup_pair, write_pair_atomic};

/// Validity of a generated fallback certificate
pub const FALLBACK_VALIDITY_DAYS: i64 = 30;

/// Remaining validity below which a failed attempt escalates
pub const ESCALATION_WINDOW_HOURS: i64 = 24;

/// The certificate currently installed for the identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRecord {
    pub path: PathBuf,
    pub identifier: String,
    pub expiry: DateTime<Utc>,
}

/// PEM output of [`generate_self_signed`]
#[derive(Debug, Clone)]
pub struct SelfSignedPair {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Generate a self-signed server certificate for `identifier`.
///
/// 2048-bit RSA key, one SAN matching the identifier, `serverAuth` usage,
/// valid from now (whole seconds) for `validity_days`.
pub fn generate_self_signed(
    identifier: &CertIdentifier,
    validity_days: i64,
) -> CertResult<SelfSignedPair> {
    let gen_err = |e: rcgen::Error| CertError::Generation(e.to_string());

    let key_pair =
        KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048).map_err(gen_err)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identifier.to_string());
    dn.push(DnType::OrganizationName, "certkeeper fallback");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![match identifier {
        CertIdentifier::Ip(ip) => SanType::IpAddress(*ip),
        CertIdentifier::Dns(name) => SanType::DnsName(name.clone().try_into().map_err(gen_err)?),
    }];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];

    let not_before = time::OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let not_after = not_before + time::Duration::days(validity_days);
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params.self_signed(&key_pair).map_err(gen_err)?;

    let to_chrono = |t: time::OffsetDateTime| {
        DateTime::<Utc>::from_timestamp(t.unix_timestamp(), 0)
            .ok_or_else(|| CertError::Generation("validity out of range".to_string()))
    };

    Ok(SelfSignedPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_before: to_chrono(not_before)?,
        not_after: to_chrono(not_after)?,
    })
}

/// Tracks renewal failures and installs the self-signed fallback
pub struct FallbackController {
    settings: Arc<dyn SettingsProvider>,
    alerts: Arc<dyn AlertChannel>,
    observer: Option<Arc<dyn CertificateObserver>>,
    consecutive_failures: AtomicU32,
    in_fallback_mode: AtomicBool,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl FallbackController {
    pub fn new(settings: Arc<dyn SettingsProvider>, alerts: Arc<dyn AlertChannel>) -> Self {
        Self {
            settings,
            alerts,
            observer: None,
            consecutive_failures: AtomicU32::new(0),
            in_fallback_mode: AtomicBool::new(false),
            last_success: Mutex::new(None),
        }
    }

    /// Propagate installed fallback pairs (proxy reload, TLS store refresh)
    pub fn with_observer(mut self, observer: Arc<dyn CertificateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Seed the last success time, e.g. from persisted state
    pub fn with_last_success(self, last_success: Option<DateTime<Utc>>) -> Self {
        *self.last_success.lock() = last_success;
        self
    }

    /// Whether a self-signed certificate is currently serving
    pub fn is_degraded(&self) -> bool {
        self.in_fallback_mode.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock()
    }

    /// The installed certificate, as far as the filesystem tells.
    ///
    /// A missing or unreadable file reports an expiry of "now".
    pub fn current_record(&self) -> CertResult<FallbackRecord> {
        let identifier = self.settings.identifier()?;
        let path = with_suffix(&self.settings.cert_base_path()?, "crt");
        let expiry = match read_expiry(&path) {
            Ok(expiry) => expiry,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No readable certificate installed");
                Utc::now()
            }
        };
        Ok(FallbackRecord {
            path,
            identifier,
            expiry,
        })
    }

    /// Record one failed issuance attempt.
    ///
    /// Sends a critical alert when the installed certificate has less than
    /// a day left. Alert delivery failures are logged only.
    pub async fn on_renewal_failed(&self, err: &CertError, attempt: u32) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        let record = match self.current_record() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Cannot inspect installed certificate after failed attempt");
                return;
            }
        };

        let remaining = record.expiry - Utc::now();
        if remaining >= Duration::hours(ESCALATION_WINDOW_HOURS) {
            debug!(
                attempt,
                failures,
                remaining_hours = remaining.num_hours(),
                "Renewal attempt failed, certificate still has time"
            );
            return;
        }

        let last_success = self
            .last_success()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let message = format!(
            "Certificate for {} expires in {}h (at {}).\n\
             Renewal attempt {} failed: {} [{}]\n\
             Consecutive failures: {}\n\
             Last successful renewal: {}",
            record.identifier,
            remaining.num_hours().max(0),
            record.expiry.to_rfc3339(),
            attempt,
            err,
            err.code(),
            failures,
            last_success,
        );

        error!(
            identifier = %record.identifier,
            attempt,
            failures,
            remaining_hours = remaining.num_hours(),
            "Certificate close to expiry and renewal failing"
        );

        if let Err(e) = self
            .alerts
            .send_alert("Certificate Expiring", &message, AlertSeverity::Critical)
            .await
        {
            warn!(error = %e, "Failed to send expiry alert");
        }
    }

    /// Install a self-signed certificate for the configured identifier.
    ///
    /// Existing files are backed up first (best effort). `Ok` means the
    /// fallback is active and the service still has a certificate.
    pub async fn trigger_fallback(&self) -> CertResult<FallbackRecord> {
        let identifier = CertIdentifier::parse(&self.settings.identifier()?);
        if identifier.is_empty() {
            return Err(CertError::Settings("no certificate identifier configured".to_string()));
        }

        let base = self.settings.cert_base_path()?;
        let cert_path = with_suffix(&base, "crt");
        let key_path = with_suffix(&base, "key");

        warn!(
            identifier = %identifier,
            ip = identifier.is_ip(),
            "Generating self-signed fallback certificate"
        );

        let gen_identifier = identifier.clone();
        let pair = tokio::task::spawn_blocking(move || {
            generate_self_signed(&gen_identifier, FALLBACK_VALIDITY_DAYS)
        })
        .await
        .map_err(|e| CertError::Generation(format!("generator task failed: {}", e)))??;

        let backups = backup_pair(&cert_path, &key_path);

        write_pair_atomic(
            &cert_path,
            pair.cert_pem.as_bytes(),
            &key_path,
            pair.key_pem.as_bytes(),
        )?;

        self.in_fallback_mode.store(true, Ordering::SeqCst);

        error!(
            identifier = %identifier,
            cert_path = %cert_path.display(),
            expires = %pair.not_after,
            backups = backups.len(),
            "Self-signed fallback certificate installed"
        );

        let message = format!(
            "Automatic renewal for {} failed {} time(s) in a row.\n\
             A self-signed certificate valid until {} is now installed at {}.\n\
             Clients will see certificate warnings until renewal succeeds.",
            identifier,
            self.consecutive_failures(),
            pair.not_after.to_rfc3339(),
            cert_path.display(),
        );
        if let Err(e) = self
            .alerts
            .send_alert("Fallback Certificate Activated", &message, AlertSeverity::Critical)
            .await
        {
            warn!(error = %e, "Failed to send fallback alert");
        }

        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_certificate_renewed(&cert_path, &key_path).await {
                warn!(error = %e, "Failed to propagate fallback certificate");
            }
        }

        Ok(FallbackRecord {
            path: cert_path,
            identifier: identifier.to_string(),
            expiry: pair.not_after,
        })
    }

    /// Leave fallback mode after a successful renewal
    pub fn record_success(&self) {
        let was_degraded = self.in_fallback_mode.swap(false, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_success.lock() = Some(Utc::now());

        if was_degraded {
            info!("Renewal succeeded, leaving fallback mode");
        }
    }
}

impl std::fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackController")
            .field("consecutive_failures", &self.consecutive_failures())
            .field("in_fallback_mode", &self.is_degraded())
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}
