//! Hot reload of the external proxy process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use certkeeper_common::{AlertSeverity, CertError, CertResult};

use super::permission::diagnose;
use super::strategy::ReloadStrategy;
use crate::collaborators::{AlertChannel, PermissionProbe, ProxyProcessController};

/// Default wait before confirming the proxy survived a reload
pub const DEFAULT_VERIFY_DELAY: Duration = Duration::from_secs(2);

/// Pushes a newly written certificate into the running proxy
pub struct HotReloadNotifier {
    proxy: Arc<dyn ProxyProcessController>,
    probe: Arc<dyn PermissionProbe>,
    alerts: Option<Arc<dyn AlertChannel>>,
    strategy: ReloadStrategy,
    verify_delay: Duration,
}

impl HotReloadNotifier {
    pub fn new(proxy: Arc<dyn ProxyProcessController>, probe: Arc<dyn PermissionProbe>) -> Self {
        let notifier = Self {
            proxy,
            probe,
            alerts: None,
            strategy: ReloadStrategy::detect(),
            verify_delay: DEFAULT_VERIFY_DELAY,
        };
        notifier.log_initial_permission();
        notifier
    }

    pub fn with_strategy(mut self, strategy: ReloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    /// Alert on signal permission denial
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertChannel>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn strategy(&self) -> ReloadStrategy {
        self.strategy
    }

    // Informational only; permission is re-checked on every reload
    fn log_initial_permission(&self) {
        match self.proxy.process_identity() {
            Ok(identity) => {
                let permission = diagnose(self.probe.as_ref(), identity.owner_uid);
                info!(
                    pid = identity.pid,
                    owner_uid = identity.owner_uid,
                    ?permission,
                    strategy = %self.strategy,
                    "Hot reload notifier ready"
                );
            }
            Err(e) => {
                debug!(error = %e, strategy = %self.strategy, "Proxy process not inspectable yet");
            }
        }
    }

    /// Make the proxy pick up the pair at `cert_path` / `key_path`.
    pub async fn notify(&self, cert_path: &Path, key_path: &Path) -> CertResult<()> {
        check_readable(cert_path).await?;
        check_readable(key_path).await?;

        if !self.proxy.is_running() {
            return Err(CertError::ReloadFailed(
                "proxy process is not running".to_string(),
            ));
        }

        info!(
            strategy = %self.strategy,
            cert_path = %cert_path.display(),
            "Reloading proxy with new certificate"
        );

        match self.strategy {
            ReloadStrategy::Signal => self.signal_reload().await?,
            ReloadStrategy::Restart => self.proxy.restart().await.map_err(|e| {
                CertError::ReloadFailed(format!("restart failed: {}", e))
            })?,
            ReloadStrategy::Api => self.proxy.request_api_reload().await.map_err(|e| {
                CertError::ReloadFailed(format!("API reload failed: {}", e))
            })?,
        }

        self.verify_alive().await
    }

    /// SIGHUP when permitted, the management API otherwise
    async fn signal_reload(&self) -> CertResult<()> {
        let signal_result = match self.check_signal_permission().await {
            Ok(()) => self.proxy.send_reload_signal(),
            Err(e) => Err(e),
        };

        let signal_err = match signal_result {
            Ok(()) => {
                debug!("Reload signal delivered");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(error = %signal_err, "Signal reload unavailable, trying API reload");

        match self.proxy.request_api_reload().await {
            Ok(()) => {
                info!("Proxy reloaded through its API");
                Ok(())
            }
            Err(api_err) => Err(CertError::combined_reload(&signal_err, &api_err)),
        }
    }

    async fn check_signal_permission(&self) -> CertResult<()> {
        let identity = self.proxy.process_identity().map_err(|e| {
            CertError::PermissionDenied(format!("cannot inspect proxy process: {}", e))
        })?;

        if diagnose(self.probe.as_ref(), identity.owner_uid).is_allowed() {
            return Ok(());
        }

        let err = CertError::PermissionDenied(format!(
            "uid {} may not signal proxy process {} owned by uid {}",
            self.probe.effective_uid(),
            identity.pid,
            identity.owner_uid
        ));

        if let Some(alerts) = &self.alerts {
            let message = format!(
                "{}. Falling back to the reload API; run certkeeper as the proxy user \
                 or grant CAP_KILL to restore signal reloads.",
                err
            );
            if let Err(e) = alerts
                .send_alert("Proxy Signal Permission Denied", &message, AlertSeverity::Warning)
                .await
            {
                warn!(error = %e, "Failed to send permission alert");
            }
        }

        Err(err)
    }

    async fn verify_alive(&self) -> CertResult<()> {
        tokio::time::sleep(self.verify_delay).await;

        if self.proxy.is_running() {
            info!("Proxy reloaded and still running");
            Ok(())
        } else {
            Err(CertError::ReloadFailed(
                "proxy process exited after reload".to_string(),
            ))
        }
    }
}

async fn check_readable(path: &Path) -> CertResult<()> {
    tokio::fs::File::open(path)
        .await
        .map(|_| ())
        .map_err(|e| CertError::InvalidCertificate {
            path: path.display().to_string(),
            reason: format!("not readable: {}", e),
        })
}

impl std::fmt::Debug for HotReloadNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadNotifier")
            .field("strategy", &self.strategy)
            .field("verify_delay", &self.verify_delay)
            .field("has_alerts", &self.alerts.is_some())
            .finish()
    }
}
