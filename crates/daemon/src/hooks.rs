//! Fan-out of "new certificate written" to every consumer.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use certkeeper_common::{AlertSeverity, CertError, CertResult};

use crate::collaborators::{AlertChannel, CertificateObserver};
use crate::reload::HotReloadNotifier;
use crate::tls_store::TlsCertStore;

/// Refreshes the TLS store and reloads the proxy.
///
/// Failures are logged and alerted but never roll back the files on disk.
/// The first failure is returned to the caller.
pub struct ReloadFanout {
    alerts: Arc<dyn AlertChannel>,
    notifier: Option<Arc<HotReloadNotifier>>,
    tls_store: Option<Arc<TlsCertStore>>,
}

impl ReloadFanout {
    pub fn new(alerts: Arc<dyn AlertChannel>) -> Self {
        Self {
            alerts,
            notifier: None,
            tls_store: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<HotReloadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_tls_store(mut self, store: Arc<TlsCertStore>) -> Self {
        self.tls_store = Some(store);
        self
    }

    async fn report(&self, title: &str, err: &CertError) {
        let message = format!(
            "{} [{}]\nThe new certificate is on disk and will be used once the process reloads.",
            err,
            err.code()
        );
        if let Err(e) = self
            .alerts
            .send_alert(title, &message, AlertSeverity::Warning)
            .await
        {
            warn!(error = %e, "Failed to send reload alert");
        }
    }
}

#[async_trait]
impl CertificateObserver for ReloadFanout {
    async fn on_certificate_renewed(&self, cert_path: &Path, key_path: &Path) -> CertResult<()> {
        let mut first_error = None;

        if let Some(store) = &self.tls_store {
            if let Err(e) = store.reload(cert_path, key_path) {
                warn!(error = %e, "Failed to reload TLS certificate store");
                self.report("TLS Certificate Reload Failed", &e).await;
                first_error.get_or_insert(e);
            }
        }

        if let Some(notifier) = &self.notifier {
            match notifier.notify(cert_path, key_path).await {
                Ok(()) => info!("Proxy picked up the new certificate"),
                Err(e) => {
                    warn!(error = %e, code = e.code(), "Failed to reload proxy");
                    self.report("Proxy Reload Failed", &e).await;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
