//! Certificate identifier newtype.
//!
//! A certificate is issued for exactly one identifier: either an IP address
//! or a DNS name. Keeping the distinction in the type lets the fallback
//! generator emit the right SAN entry kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// The IP address or DNS name a certificate is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum CertIdentifier {
    /// IP certificate (HTTP-01 against the bare address)
    Ip(IpAddr),
    /// Domain certificate
    Dns(String),
}

impl CertIdentifier {
    /// Parse an identifier, preferring the IP interpretation.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => CertIdentifier::Ip(ip),
            Err(_) => CertIdentifier::Dns(trimmed.to_ascii_lowercase()),
        }
    }

    /// Whether this identifier is an IP address
    pub fn is_ip(&self) -> bool {
        matches!(self, CertIdentifier::Ip(_))
    }

    /// Whether the identifier is empty (an unset DNS name)
    pub fn is_empty(&self) -> bool {
        matches!(self, CertIdentifier::Dns(name) if name.is_empty())
    }
}

impl fmt::Display for CertIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertIdentifier::Ip(ip) => write!(f, "{}", ip),
            CertIdentifier::Dns(name) => write!(f, "{}", name),
        }
    }
}

impl From<String> for CertIdentifier {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for CertIdentifier {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<CertIdentifier> for String {
    fn from(id: CertIdentifier) -> Self {
        id.to_string()
    }
}
