//! Certificate validation
//!
//! Inspects the configured certificate: existence, expiry and SAN coverage.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;
use std::path::Path;

/// Fields of an X.509 certificate the lifecycle cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names and IP addresses from the SAN extension, in order
    pub subject_alt_names: Vec<String>,
}

impl CertificateDetails {
    /// Whether the SAN extension lists `identifier`
    pub fn covers(&self, identifier: &str) -> bool {
        self.subject_alt_names
            .iter()
            .any(|san| san.eq_ignore_ascii_case(identifier))
    }
}

/// Validate the configured certificate
pub fn validate_certificate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let settings = &config.certificate;

    if !settings.enabled {
        return result;
    }

    let cert_path = settings.cert_path();
    let key_path = settings.key_path();

    if !cert_path.exists() {
        // First run: the first check will issue one
        result.add_warning(ValidationWarning::new(format!(
            "Certificate not found: {:?} (will be issued on first check)",
            cert_path
        )));
        return result;
    }

    if !key_path.exists() {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Private key not found: {:?}", key_path),
        ));
        return result;
    }

    let details = match inspect_certificate(&cert_path) {
        Ok(details) => details,
        Err(e) => {
            result.add_error(e);
            return result;
        }
    };

    let now = Utc::now();
    if details.not_after < now {
        result.add_warning(ValidationWarning::new(format!(
            "Certificate expired: {:?} (expired at {})",
            cert_path, details.not_after
        )));
    } else {
        let threshold = Duration::from_std(config.renewal.renew_threshold)
            .unwrap_or_else(|_| Duration::days(3));
        if details.not_after - now < threshold {
            result.add_warning(ValidationWarning::new(format!(
                "Certificate expires soon: {:?} (expires at {}, renewal is due)",
                cert_path, details.not_after
            )));
        }
    }

    if !settings.identifier.is_empty() && !details.covers(&settings.identifier) {
        result.add_warning(ValidationWarning::new(format!(
            "Certificate {:?} does not cover identifier '{}' (SANs: {})",
            cert_path,
            settings.identifier,
            details.subject_alt_names.join(", ")
        )));
    }

    result
}

/// Read a PEM certificate file and extract its validity and SANs
pub fn inspect_certificate(cert_path: &Path) -> Result<CertificateDetails, ValidationError> {
    use std::fs;

    let cert_pem = fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", cert_path, e),
        )
    })?;

    let blocks = pem::parse_many(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", cert_path, e),
        )
    })?;

    // The leaf comes first in a chain file
    let leaf = blocks
        .iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .ok_or_else(|| {
            ValidationError::new(
                ErrorCategory::Certificate,
                format!("No certificate found in {:?}", cert_path),
            )
        })?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    let to_datetime = |ts: i64| {
        DateTime::<Utc>::from_timestamp(ts, 0).ok_or_else(|| {
            ValidationError::new(
                ErrorCategory::Certificate,
                format!("Certificate {:?} has an out-of-range validity date", cert_path),
            )
        })
    };
    let not_before = to_datetime(cert.validity().not_before.timestamp())?;
    let not_after = to_datetime(cert.validity().not_after.timestamp())?;

    let mut subject_alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => {
                    subject_alt_names.push(dns.to_string());
                }
                x509_parser::extensions::GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        subject_alt_names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    Ok(CertificateDetails {
        not_before,
        not_after,
        subject_alt_names,
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
