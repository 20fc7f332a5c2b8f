//! Common types shared by the certkeeper crates.
//!
//! - [`CertError`]: the error taxonomy for the certificate lifecycle, with
//!   stable error codes for alerts and logs
//! - [`CertIdentifier`]: the IP address or DNS name a certificate is issued for
//! - Value types exchanged between components ([`CertificateInfo`],
//!   [`PortStatus`], [`AlertSeverity`])

pub mod errors;
pub mod ids;
pub mod types;

pub use errors::{CertError, CertResult};
pub use ids::CertIdentifier;
pub use types::{AlertSeverity, CertificateInfo, PortStatus};
