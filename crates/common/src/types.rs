//! Value types exchanged between lifecycle components.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Severity attached to operator alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Freshness of the installed certificate. Recomputed on every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    /// Certificate file the information describes
    pub path: PathBuf,
    /// `notAfter` of the certificate
    pub expiry: DateTime<Utc>,
}

impl CertificateInfo {
    /// Remaining validity relative to `now` (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expiry - now
    }
}

/// Ownership snapshot of the challenge port. Never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    /// Something listens on the port, or the host is configured to
    pub occupied: bool,
    /// The host application is configured to listen on the port
    pub owned_by_panel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_validity() {
        let now = Utc::now();
        let info = CertificateInfo {
            path: PathBuf::from("/etc/certkeeper/ip.crt"),
            expiry: now + Duration::days(2),
        };
        assert_eq!(info.remaining(now), Duration::days(2));
        assert!(info.remaining(now + Duration::days(3)) < Duration::zero());
    }

    #[test]
    fn test_severity_serializes_uppercase() {
        let json = serde_json::to_string(&AlertSeverity::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        assert_eq!(AlertSeverity::Warning.to_string(), "WARNING");
    }
}
