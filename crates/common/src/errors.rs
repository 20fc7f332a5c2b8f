//! Certificate lifecycle error taxonomy.
//!
//! Every error carries a stable code (`CERT_E0xx`) so alerts and log lines
//! can be correlated across releases regardless of message wording.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the certificate lifecycle.
pub type CertResult<T> = Result<T, CertError>;

/// Errors produced by the certificate lifecycle components.
#[derive(Debug, Error)]
pub enum CertError {
    /// The host listener did not release the challenge port in time
    #[error("port {port} is still occupied after pausing the host listener")]
    Port80Occupied { port: u16 },

    /// A process other than the host application holds the challenge port
    #[error("port {port} is occupied by an external process")]
    Port80External { port: u16 },

    /// Issuance did not complete within its deadline
    #[error("certificate issuance timed out after {0:?}")]
    CaTimeout(Duration),

    /// The issuance service reported a failure
    #[error("certificate issuance failed: {0}")]
    CaRefused(String),

    /// All renewal attempts of a cycle failed
    #[error("renewal failed after {attempts} attempts: {last_error}")]
    RenewalFailed { attempts: u32, last_error: String },

    /// Neither a signal nor an API reload reached the proxy process
    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    /// Renewal failed but a self-signed certificate is now serving
    #[error("fallback activated: self-signed certificate installed for {identifier}")]
    FallbackActivated { identifier: String },

    /// The proxy process cannot be signalled by this process
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A settings value is missing or unreadable
    #[error("settings error: {0}")]
    Settings(String),

    /// A certificate or key could not be parsed
    #[error("invalid certificate {path}: {reason}")]
    InvalidCertificate { path: String, reason: String },

    /// Self-signed certificate generation failed
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// The persisted renewal state could not be read or written
    #[error("renewal state error: {0}")]
    State(String),

    /// The operation was cancelled by shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertError {
    /// Stable error code for alerts and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            CertError::Port80Occupied { .. } => "CERT_E001",
            CertError::Port80External { .. } => "CERT_E002",
            CertError::CaTimeout(_) => "CERT_E003",
            CertError::CaRefused(_) => "CERT_E004",
            CertError::InvalidCertificate { .. } => "CERT_E006",
            CertError::RenewalFailed { .. } => "CERT_E007",
            CertError::ReloadFailed(_) => "CERT_E008",
            CertError::FallbackActivated { .. } => "CERT_E009",
            CertError::PermissionDenied(_) => "CERT_E010",
            CertError::Settings(_) => "CERT_E011",
            CertError::Generation(_) => "CERT_E012",
            CertError::State(_) => "CERT_E013",
            CertError::Cancelled => "CERT_E014",
            CertError::Io(_) => "CERT_E015",
        }
    }

    /// Whether the renewal loop should try again after this error.
    ///
    /// An external occupant of the challenge port, a settings problem or a
    /// shutdown will not resolve itself during a backoff sleep.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CertError::Port80External { .. } | CertError::Settings(_) | CertError::Cancelled
        )
    }

    /// True for the degraded-but-secured outcome of a fallback.
    pub fn is_degraded(&self) -> bool {
        matches!(self, CertError::FallbackActivated { .. })
    }

    /// Build a `ReloadFailed` that names both the signal and the API cause.
    pub fn combined_reload(signal_err: &CertError, api_err: &CertError) -> Self {
        CertError::ReloadFailed(format!(
            "signal reload failed ({signal_err}) and API reload failed ({api_err})"
        ))
    }
}
