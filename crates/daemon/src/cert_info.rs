//! Certificate freshness lookup.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;

use certkeeper_common::{CertError, CertResult, CertificateInfo};
use certkeeper_config::validate::inspect_certificate;
use certkeeper_config::with_suffix;

use crate::collaborators::{IssuanceService, SettingsProvider};

/// Expiry of the certificate file at `path`
pub fn read_expiry(path: &Path) -> CertResult<DateTime<Utc>> {
    inspect_certificate(path)
        .map(|details| details.not_after)
        .map_err(|e| CertError::InvalidCertificate {
            path: path.display().to_string(),
            reason: e.message,
        })
}

/// Ask the issuance service first, then fall back to parsing the file.
pub async fn current_certificate_info(
    settings: &dyn SettingsProvider,
    issuer: &dyn IssuanceService,
) -> CertResult<CertificateInfo> {
    let identifier = settings.identifier()?;
    let cert_path = with_suffix(&settings.cert_base_path()?, "crt");

    match issuer.get_certificate_info(&identifier).await {
        Ok(expiry) => {
            return Ok(CertificateInfo {
                path: cert_path,
                expiry,
            })
        }
        Err(e) => {
            debug!(
                identifier = %identifier,
                error = %e,
                "Issuer has no record, reading certificate file"
            );
        }
    }

    let expiry = read_expiry(&cert_path)?;
    Ok(CertificateInfo {
        path: cert_path,
        expiry,
    })
}
