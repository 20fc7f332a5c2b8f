//! Background certificate renewal scheduler
//!
//! Periodically checks certificate freshness and, when renewal is due,
//! drives port arbitration, issuance, hot reload and fallback through a
//! bounded retry loop. Progress is persisted so restarts neither lose
//! failure counts nor trigger a burst of renewals.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certkeeper_common::{AlertSeverity, CertError, CertResult};
use certkeeper_config::RenewalConfig;

use crate::cert_info::current_certificate_info;
use crate::collaborators::{
    AlertChannel, CertificateObserver, IssuanceService, IssuedCertificate, SettingsProvider,
};
use crate::fallback::FallbackController;
use crate::ports::PortArbiter;
use crate::state::{RenewalState, StateStore};

/// Top-level renewal control loop
pub struct RenewalScheduler {
    config: RenewalConfig,
    state: Arc<StateStore>,
    settings: Arc<dyn SettingsProvider>,
    issuer: Arc<dyn IssuanceService>,
    alerts: Arc<dyn AlertChannel>,
    arbiter: Arc<PortArbiter>,
    fallback: Arc<FallbackController>,
    observer: Option<Arc<dyn CertificateObserver>>,
    /// Held for the whole of an in-flight renewal
    in_flight: Mutex<()>,
    shutdown: CancellationToken,
}

impl RenewalScheduler {
    pub fn new(
        config: RenewalConfig,
        state: Arc<StateStore>,
        settings: Arc<dyn SettingsProvider>,
        issuer: Arc<dyn IssuanceService>,
        alerts: Arc<dyn AlertChannel>,
        arbiter: Arc<PortArbiter>,
        fallback: Arc<FallbackController>,
    ) -> Self {
        Self {
            config,
            state,
            settings,
            issuer,
            alerts,
            arbiter,
            fallback,
            observer: None,
            in_flight: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Notified after every successful issuance
    pub fn with_observer(mut self, observer: Arc<dyn CertificateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &RenewalConfig {
        &self.config
    }

    /// Persisted state as of now
    pub fn state(&self) -> RenewalState {
        self.state.snapshot()
    }

    /// Spawn the periodic loop onto the current runtime
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Run the renewal loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let state = self.state.snapshot();

        if state.is_renewing {
            // Left behind by a process that died mid-renewal
            warn!("Clearing stale in-flight renewal flag");
            if let Err(e) = self.state.update(|s| s.is_renewing = false) {
                warn!(error = %e, "Failed to clear stale renewal flag");
            }
        }

        let since_last_check = state
            .last_check_time
            .and_then(|t| (Utc::now() - t).to_std().ok());
        let delay = self.config.initial_delay(since_last_check);

        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            initial_delay_secs = delay.as_secs(),
            consecutive_fails = state.consecutive_fails,
            "Starting certificate renewal scheduler"
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Renewal scheduler stopped before first check");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        // First tick fires immediately
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            debug!("Running scheduled certificate check");
            match self.check_and_renew().await {
                Ok(()) => {}
                Err(e) if e.is_degraded() => {
                    warn!(error = %e, "Serving self-signed fallback certificate");
                }
                Err(CertError::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, code = e.code(), "Certificate check failed");
                }
            }
        }

        info!("Renewal scheduler stopped");
    }

    /// Check freshness once and renew if due.
    ///
    /// Returns immediately (successfully) when a renewal is already in
    /// flight; concurrent calls are not queued.
    pub async fn check_and_renew(&self) -> CertResult<()> {
        let Ok(_in_flight) = self.in_flight.try_lock() else {
            debug!("Renewal already in progress, skipping check");
            return Ok(());
        };

        let now = Utc::now();
        if let Err(e) = self.state.update(|s| s.last_check_time = Some(now)) {
            warn!(error = %e, "Failed to record check time");
        }

        if !self.settings.is_enabled()? {
            debug!("Automatic certificate renewal is disabled");
            return Ok(());
        }

        let threshold = chrono::Duration::from_std(self.config.renew_threshold)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        match current_certificate_info(self.settings.as_ref(), self.issuer.as_ref()).await {
            Ok(info) => {
                let remaining = info.remaining(now);
                if remaining >= threshold {
                    debug!(
                        path = %info.path.display(),
                        remaining_hours = remaining.num_hours(),
                        "Certificate is still valid"
                    );
                    return Ok(());
                }
                info!(
                    path = %info.path.display(),
                    expiry = %info.expiry,
                    remaining_hours = remaining.num_hours(),
                    "Certificate needs renewal"
                );
            }
            Err(e) => {
                warn!(error = %e, "Cannot read current certificate, renewing");
            }
        }

        self.attempt_renew_with_retry().await
    }

    async fn attempt_renew_with_retry(&self) -> CertResult<()> {
        if let Err(e) = self.state.update(|s| s.is_renewing = true) {
            // Bookkeeping only; renewal goes ahead
            warn!(error = %e, "Failed to record renewal start");
        }

        let result = self.retry_loop().await;

        let succeeded = result.is_ok();
        if let Err(e) = self.state.update(|s| {
            s.is_renewing = false;
            if succeeded {
                s.last_renewal_time = Some(Utc::now());
                s.consecutive_fails = 0;
            }
        }) {
            error!(error = %e, "Failed to persist renewal outcome");
        }

        result
    }

    /// Up to `max_retries` issuance cycles with linear, capped backoff
    async fn retry_loop(&self) -> CertResult<()> {
        let identifier = self.settings.identifier()?;
        let email = self.settings.email()?;
        let max_retries = self.config.max_retries;
        let mut last_error: Option<CertError> = None;

        for attempt in 0..max_retries {
            let backoff = self.config.backoff(attempt);
            if !backoff.is_zero() {
                info!(
                    attempt = attempt + 1,
                    max_retries,
                    backoff_secs = backoff.as_secs(),
                    "Waiting before next renewal attempt"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(CertError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            match self.renew_once(&identifier, &email).await {
                Ok(issued) => {
                    info!(
                        identifier = %identifier,
                        attempt = attempt + 1,
                        expires = %issued.expiry,
                        "Certificate renewed"
                    );
                    self.on_success(&issued).await;
                    return Ok(());
                }
                Err(CertError::Cancelled) => return Err(CertError::Cancelled),
                Err(e) if !e.is_retryable() => {
                    return Err(self.abort(&identifier, attempt + 1, e).await);
                }
                Err(e) => {
                    warn!(
                        identifier = %identifier,
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        code = e.code(),
                        "Renewal attempt failed"
                    );
                    if matches!(e, CertError::CaRefused(_) | CertError::CaTimeout(_)) {
                        self.fallback.on_renewal_failed(&e, attempt + 1).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        self.escalate(&identifier, last_error).await
    }

    /// One acquire / issue / release cycle. Release always runs.
    async fn renew_once(&self, identifier: &str, email: &str) -> CertResult<IssuedCertificate> {
        self.arbiter.acquire(&self.shutdown).await?;

        let timeout = self.config.issue_timeout;
        let result =
            match tokio::time::timeout(timeout, self.issuer.issue_certificate(identifier, email))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(CertError::CaTimeout(timeout)),
            };

        if let Err(e) = self.arbiter.release().await {
            warn!(error = %e, "Failed to release challenge port");
        }

        result
    }

    async fn on_success(&self, issued: &IssuedCertificate) {
        if let Err(e) = self.state.update(|s| s.consecutive_fails = 0) {
            warn!(error = %e, "Failed to reset failure count");
        }
        self.fallback.record_success();

        if let Some(observer) = &self.observer {
            if let Err(e) = observer
                .on_certificate_renewed(&issued.cert_path, &issued.key_path)
                .await
            {
                // The new pair is valid on disk regardless
                warn!(error = %e, "Reload after renewal failed");
            }
        }
    }

    /// A non-retryable error ends the cycle without fallback.
    ///
    /// The cycle did not exhaust its retries, so `consecutive_fails` is
    /// left alone.
    async fn abort(&self, identifier: &str, attempt: u32, err: CertError) -> CertError {
        warn!(
            identifier = %identifier,
            attempt,
            error = %err,
            code = err.code(),
            "Renewal aborted, error is not retryable"
        );

        let message = format!(
            "Renewal for {} stopped after attempt {}: {} [{}]\n\
             The next scheduled check will try again.",
            identifier,
            attempt,
            err,
            err.code()
        );
        if let Err(e) = self
            .alerts
            .send_alert("Certificate Renewal Aborted", &message, AlertSeverity::Warning)
            .await
        {
            warn!(error = %e, "Failed to send renewal alert");
        }

        err
    }

    /// Retries exhausted: count the cycle and install the fallback
    async fn escalate(&self, identifier: &str, last_error: Option<CertError>) -> CertResult<()> {
        let attempts = self.config.max_retries;
        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());

        error!(
            identifier = %identifier,
            attempts,
            last_error = %last_error,
            "All renewal attempts failed, activating fallback"
        );

        match self.state.update(|s| s.consecutive_fails += 1) {
            Ok(state) => debug!(consecutive_fails = state.consecutive_fails, "Recorded failed cycle"),
            Err(e) => warn!(error = %e, "Failed to record renewal failure"),
        }

        match self.fallback.trigger_fallback().await {
            Ok(record) => Err(CertError::FallbackActivated {
                identifier: record.identifier,
            }),
            Err(e) => {
                error!(error = %e, "Fallback certificate could not be installed");
                Err(CertError::RenewalFailed {
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// Stop the loop, wait for an in-flight renewal, write a final snapshot.
    ///
    /// Waits as long as the in-flight attempt takes; callers bound it with
    /// their own timeout.
    pub async fn stop(&self) -> CertResult<()> {
        info!("Stopping renewal scheduler");
        self.shutdown.cancel();

        let _in_flight = self.in_flight.lock().await;
        let state = self.state.update(|s| s.is_renewing = false)?;

        info!(
            consecutive_fails = state.consecutive_fails,
            "Renewal scheduler state saved"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.config.check_interval)
            .field("max_retries", &self.config.max_retries)
            .field("has_observer", &self.observer.is_some())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

