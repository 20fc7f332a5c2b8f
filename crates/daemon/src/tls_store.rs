//! In-process TLS certificate store with hot swap.
//!
//! Handshakes read the current `Arc<CertifiedKey>` under a read lock;
//! [`TlsCertStore::reload`] parses the new pair first and then swaps the
//! pointer under the write lock. A handshake sees the old or the new
//! certificate, never a mix.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, info, warn};

use certkeeper_common::{AlertSeverity, CertError, CertResult};

use crate::collaborators::AlertChannel;

fn invalid(path: &Path, reason: impl Into<String>) -> CertError {
    CertError::InvalidCertificate {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Load a PEM certificate chain and private key into a rustls `CertifiedKey`
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> CertResult<CertifiedKey> {
    let cert_file = File::open(cert_path).map_err(|e| invalid(cert_path, e.to_string()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| invalid(cert_path, e.to_string()))?;
    if certs.is_empty() {
        return Err(invalid(cert_path, "no certificates found"));
    }

    let key_file = File::open(key_path).map_err(|e| invalid(key_path, e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| invalid(key_path, e.to_string()))?
        .ok_or_else(|| invalid(key_path, "no private key found"))?;

    let signing_key =
        aws_lc_rs::sign::any_supported_type(&key).map_err(|e| invalid(key_path, e.to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Serves the currently active certificate to TLS handshakes
pub struct TlsCertStore {
    current: RwLock<Option<Arc<CertifiedKey>>>,
    alerts: Option<Arc<dyn AlertChannel>>,
}

impl TlsCertStore {
    /// Empty store; handshakes fail until the first successful reload
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            alerts: None,
        }
    }

    /// Send an informational alert after each reload
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertChannel>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Currently served certificate
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.current.read().clone()
    }

    /// Replace the served certificate with the pair on disk.
    ///
    /// On a parse error the previous certificate stays in place.
    pub fn reload(&self, cert_path: &Path, key_path: &Path) -> CertResult<()> {
        let loaded = Arc::new(load_certified_key(cert_path, key_path)?);

        let previous = {
            let mut current = self.current.write();
            current.replace(loaded)
        };

        info!(
            cert_path = %cert_path.display(),
            replaced = previous.is_some(),
            "TLS certificate reloaded"
        );

        self.spawn_update_notice(cert_path);
        Ok(())
    }

    fn spawn_update_notice(&self, cert_path: &Path) {
        let Some(alerts) = self.alerts.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, skipping certificate update notice");
            return;
        };

        let message = format!("TLS listener now serves {}", cert_path.display());
        handle.spawn(async move {
            if let Err(e) = alerts
                .send_alert("Certificate Updated", &message, AlertSeverity::Info)
                .await
            {
                warn!(error = %e, "Failed to send certificate update notice");
            }
        });
    }

    /// rustls server configuration resolving through this store
    pub fn server_config(self: &Arc<Self>) -> CertResult<ServerConfig> {
        let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| CertError::InvalidCertificate {
                path: "<tls config>".to_string(),
                reason: e.to_string(),
            })?
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>);
        Ok(config)
    }
}

impl Default for TlsCertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvesServerCert for TlsCertStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

impl std::fmt::Debug for TlsCertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCertStore")
            .field("loaded", &self.current.read().is_some())
            .field("has_alerts", &self.alerts.is_some())
            .finish()
    }
}
