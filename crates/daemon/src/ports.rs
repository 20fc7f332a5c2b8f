//! Challenge port arbitration.
//!
//! The HTTP-01 challenge server needs the privileged port for a few seconds.
//! The host application may normally listen there; an unrelated process may
//! too. [`PortArbiter`] pauses the host when it is the owner and refuses to
//! touch anyone else.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use certkeeper_common::{CertError, CertResult, PortStatus};

use crate::collaborators::HostListenerController;

/// Dial timeout of the liveness probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Polls after pausing the host listener
pub const RELEASE_POLL_ATTEMPTS: u32 = 5;

/// Interval between release polls
pub const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Arbitrates the challenge port between the host listener and the ACME
/// challenge server. Holds no listener state of its own.
pub struct PortArbiter {
    host: Arc<dyn HostListenerController>,
    port: u16,
    probe_timeout: Duration,
}

impl PortArbiter {
    pub fn new(host: Arc<dyn HostListenerController>, port: u16) -> Self {
        Self {
            host,
            port,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// Override the probe dial timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Port being arbitrated
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Live probe: is something accepting connections on the port?
    ///
    /// Only "connection refused" counts as free. A dial timeout (loopback
    /// traffic dropped by a firewall) falls back to a bind attempt.
    pub async fn probe(&self) -> bool {
        let dial = TcpStream::connect(("127.0.0.1", self.port));
        match tokio::time::timeout(self.probe_timeout, dial).await {
            Ok(Ok(_stream)) => {
                trace!(port = self.port, "Probe connected, port occupied");
                true
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                trace!(port = self.port, "Probe refused, port free");
                false
            }
            Ok(Err(e)) => {
                debug!(port = self.port, error = %e, "Probe failed, treating port as occupied");
                true
            }
            Err(_) => {
                debug!(
                    port = self.port,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Probe timed out, trying to bind"
                );
                match TcpListener::bind(("0.0.0.0", self.port)).await {
                    Ok(_listener) => false,
                    Err(e) => {
                        debug!(port = self.port, error = %e, "Bind failed, port occupied");
                        true
                    }
                }
            }
        }
    }

    /// Combine the live probe with the host's configured intent.
    ///
    /// The configuration is the source of truth for ownership even when the
    /// host has not bound its socket yet.
    pub async fn check_status(&self) -> PortStatus {
        let configured = self.host.is_configured_to_listen_on_privileged_port();
        let live = self.probe().await;

        let status = PortStatus {
            occupied: live || configured,
            owned_by_panel: configured,
        };
        debug!(
            port = self.port,
            live,
            configured,
            occupied = status.occupied,
            "Checked challenge port status"
        );
        status
    }

    /// Make the port available to the challenge server.
    ///
    /// Fails with `Port80External` when a third party holds it, and with
    /// `Port80Occupied` when the paused host does not let go in time. Every
    /// failure path after a pause resumes the host listener.
    pub async fn acquire(&self, cancel: &CancellationToken) -> CertResult<()> {
        let status = self.check_status().await;

        if !status.occupied {
            debug!(port = self.port, "Challenge port is free");
            return Ok(());
        }

        if !status.owned_by_panel {
            warn!(port = self.port, "Challenge port is held by an external process");
            return Err(CertError::Port80External { port: self.port });
        }

        info!(port = self.port, "Pausing host listener for certificate challenge");
        self.host.pause().await?;

        for poll in 1..=RELEASE_POLL_ATTEMPTS {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.resume_after_failure().await;
                    return Err(CertError::Cancelled);
                }
                _ = tokio::time::sleep(RELEASE_POLL_INTERVAL) => {}
            }

            if !self.probe().await {
                debug!(port = self.port, poll, "Host listener released the port");
                return Ok(());
            }
            trace!(port = self.port, poll, "Port still occupied");
        }

        warn!(
            port = self.port,
            polls = RELEASE_POLL_ATTEMPTS,
            "Host listener did not release the port"
        );
        self.resume_after_failure().await;
        Err(CertError::Port80Occupied { port: self.port })
    }

    /// Hand the port back to the host, if it is configured to listen.
    ///
    /// Safe to call whether or not `acquire` succeeded.
    pub async fn release(&self) -> CertResult<()> {
        if !self.host.is_configured_to_listen_on_privileged_port() {
            trace!(port = self.port, "Host does not listen on the port, nothing to release");
            return Ok(());
        }

        info!(port = self.port, "Resuming host listener");
        self.host.resume().await
    }

    async fn resume_after_failure(&self) {
        if let Err(e) = self.host.resume().await {
            // The acquisition error is what the caller needs to see
            warn!(port = self.port, error = %e, "Failed to resume host listener");
        }
    }
}

impl std::fmt::Debug for PortArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortArbiter")
            .field("port", &self.port)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}
