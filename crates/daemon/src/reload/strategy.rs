//! Reload mechanism selection.

use std::fmt;

/// How a new certificate is pushed into the running proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStrategy {
    /// SIGHUP, with the management API as fallback
    Signal,
    /// Full process restart
    Restart,
    /// Management API only
    Api,
}

impl ReloadStrategy {
    /// Signal where the platform has one, restart elsewhere
    pub fn detect() -> Self {
        if cfg!(unix) {
            ReloadStrategy::Signal
        } else {
            ReloadStrategy::Restart
        }
    }
}

impl fmt::Display for ReloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadStrategy::Signal => f.write_str("signal"),
            ReloadStrategy::Restart => f.write_str("restart"),
            ReloadStrategy::Api => f.write_str("api"),
        }
    }
}
