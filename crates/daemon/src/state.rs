//! Persisted renewal state.
//!
//! A small JSON record that survives restarts. This process is its only
//! writer; every mutation goes through [`StateStore::update`], which holds a
//! mutex across the read-modify-write and the atomic file replacement.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use certkeeper_common::{CertError, CertResult};

use crate::files::write_atomic;

/// Renewal bookkeeping, persisted at every check and attempt boundary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalState {
    /// Start of the most recent freshness check
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,
    /// Most recent successful issuance
    #[serde(default)]
    pub last_renewal_time: Option<DateTime<Utc>>,
    /// Exhausted or aborted retry cycles since the last success
    #[serde(default)]
    pub consecutive_fails: u32,
    /// True only while a renewal attempt is in flight in this process
    #[serde(default)]
    pub is_renewing: bool,
}

/// File-backed store for [`RenewalState`]
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<RenewalState>,
}

impl StateStore {
    /// Open the store, loading the file if present.
    ///
    /// A missing file is a first run and yields zero values.
    pub fn open(path: impl Into<PathBuf>) -> CertResult<Self> {
        let path = path.into();
        let state = Self::read(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn read(path: &Path) -> CertResult<RenewalState> {
        if !path.exists() {
            info!(path = %path.display(), "No renewal state found, starting fresh");
            return Ok(RenewalState::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CertError::State(format!("failed to read {}: {}", path.display(), e))
        })?;
        let state: RenewalState = serde_json::from_str(&content).map_err(|e| {
            CertError::State(format!("failed to parse {}: {}", path.display(), e))
        })?;

        debug!(
            path = %path.display(),
            consecutive_fails = state.consecutive_fails,
            is_renewing = state.is_renewing,
            "Loaded renewal state"
        );
        Ok(state)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> RenewalState {
        self.state.lock().clone()
    }

    /// Apply `f` and persist the result. Returns the new state.
    ///
    /// The in-memory state is only changed when the write succeeds.
    pub fn update(&self, f: impl FnOnce(&mut RenewalState)) -> CertResult<RenewalState> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        f(&mut next);

        let json = serde_json::to_string_pretty(&next)
            .map_err(|e| CertError::State(format!("failed to serialize state: {}", e)))?;
        write_atomic(&self.path, json.as_bytes(), 0o644).map_err(|e| {
            CertError::State(format!("failed to write {}: {}", self.path.display(), e))
        })?;

        trace!(path = %self.path.display(), "Persisted renewal state");
        *guard = next.clone();
        Ok(next)
    }
}
