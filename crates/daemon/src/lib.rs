//! Certkeeper: certificate lifecycle orchestration.
//!
//! Keeps a server's TLS certificate valid. The [`RenewalScheduler`] checks
//! freshness periodically and renews through an external ACME client,
//! borrowing the challenge port from the host application via
//! [`PortArbiter`]. New certificates reach a running proxy through the
//! [`HotReloadNotifier`] and an in-process TLS listener through the
//! [`TlsCertStore`]. When renewal keeps failing, the [`FallbackController`]
//! installs a self-signed certificate and alerts the operator.
//!
//! All external systems are reached through the traits in
//! [`collaborators`]; [`adapters`] holds the implementations the binary uses.
//!
//! The `certkeeper` binary hot-reloads an external proxy only. A host that
//! terminates TLS itself embeds this crate, attaches a [`TlsCertStore`] to
//! the [`ReloadFanout`] it hands to the scheduler and fallback controller,
//! and serves from [`TlsCertStore::server_config`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use certkeeper_daemon::adapters::LogAlerts;
//! use certkeeper_daemon::{CertificateObserver, ReloadFanout, TlsCertStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(TlsCertStore::new());
//! let fanout: Arc<dyn CertificateObserver> =
//!     Arc::new(ReloadFanout::new(Arc::new(LogAlerts)).with_tls_store(store.clone()));
//! let tls_config = Arc::new(store.server_config()?);
//! # let _ = (fanout, tls_config);
//! # Ok(())
//! # }
//! ```
//!
//! Process control (signals, `/proc`, file modes) is unix-only.

#[cfg(not(unix))]
compile_error!("certkeeper-daemon supports unix platforms only");

pub mod adapters;
pub mod cert_info;
pub mod collaborators;
pub mod fallback;
pub mod files;
pub mod hooks;
pub mod ports;
pub mod reload;
pub mod scheduler;
pub mod state;
pub mod tls_store;

pub use collaborators::{
    AlertChannel, CertificateObserver, HostListenerController, IssuanceService, IssuedCertificate,
    PermissionProbe, ProcessIdentity, ProxyProcessController, SettingsProvider,
};
pub use fallback::{generate_self_signed, FallbackController, FallbackRecord};
pub use hooks::ReloadFanout;
pub use ports::PortArbiter;
pub use reload::{HotReloadNotifier, ReloadStrategy};
pub use scheduler::RenewalScheduler;
pub use state::{RenewalState, StateStore};
pub use tls_store::TlsCertStore;
