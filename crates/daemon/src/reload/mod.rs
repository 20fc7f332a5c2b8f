//! Propagating certificate changes into running processes.

mod notifier;
mod permission;
mod strategy;

pub use notifier::{HotReloadNotifier, DEFAULT_VERIFY_DELAY};
pub use permission::{diagnose, parse_cap_eff, ProcessPermissionProbe, SignalPermission};
pub use strategy::ReloadStrategy;
