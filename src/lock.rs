//! Cross-process exclusion for migration runs.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LockError;

/// File name of the lock record inside the state directory.
pub const LOCK_FILE: &str = "migration.lock";

/// Locks older than this are assumed to belong to a crashed run.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Acquisition time, epoch milliseconds.
    pub timestamp: i64,
    pub version: String,
}

impl LockRecord {
    fn for_this_process() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: Utc::now().timestamp_millis(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis().saturating_sub(self.timestamp);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }
}

/// Holds `<state_dir>/migration.lock` for the duration of a run.
///
/// The lock is released by [`LockManager::release`] or when the manager is
/// dropped, so every exit path of the run gives it back.
pub struct LockManager {
    path: PathBuf,
    stale_after: Duration,
    held: bool,
}

impl LockManager {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(LOCK_FILE),
            stale_after: DEFAULT_STALE_AFTER,
            held: false,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn acquire(&mut self) -> Result<(), LockError> {
        if self.held {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        match self.try_create()? {
            None => Ok(()),
            Some(existing) => {
                let stale = match &existing {
                    Some(record) => record.age() > self.stale_after,
                    None => true,
                };
                if !stale {
                    return Err(contention(existing.as_ref()));
                }

                match &existing {
                    Some(record) => warn!(
                        pid = record.pid,
                        age_secs = record.age().as_secs(),
                        path = %self.path.display(),
                        "reclaiming stale migration lock"
                    ),
                    None => warn!(path = %self.path.display(), "reclaiming unreadable migration lock"),
                }
                self.remove_file()?;

                match self.try_create()? {
                    None => Ok(()),
                    Some(winner) => Err(contention(winner.as_ref())),
                }
            }
        }
    }

    /// Deletes the lock file if this instance holds it. Repeated calls are no-ops.
    pub fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        self.remove_file()?;
        debug!(path = %self.path.display(), "released migration lock");
        Ok(())
    }

    /// Reads the current lock record, if any.
    pub fn read_record(&self) -> Result<Option<LockRecord>, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|source| LockError::Malformed {
                    path: self.path.clone(),
                    source,
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Removes the lock file regardless of who owns it. Returns whether one existed.
    pub fn force_remove(&mut self) -> Result<bool, LockError> {
        let existed = self.path.exists();
        self.remove_file()?;
        self.held = false;
        Ok(existed)
    }

    /// Creates the lock file exclusively. On contention returns the record
    /// found on disk (`None` inside when it could not be parsed).
    fn try_create(&mut self) -> Result<Option<Option<LockRecord>>, LockError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let record = LockRecord::for_this_process();
                let body = serde_json::to_vec(&record).map_err(|source| LockError::Malformed {
                    path: self.path.clone(),
                    source,
                })?;
                file.write_all(&body)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| self.io_err(e))?;
                self.held = true;
                debug!(pid = record.pid, path = %self.path.display(), "acquired migration lock");
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match self.read_record() {
                Ok(Some(record)) => Ok(Some(Some(record))),
                // Vanished between the create and the read.
                Ok(None) => self.try_create(),
                Err(LockError::Malformed { .. }) => Ok(Some(None)),
                Err(e) => Err(e),
            },
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn remove_file(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release migration lock");
        }
    }
}

fn contention(record: Option<&LockRecord>) -> LockError {
    LockError::AlreadyInProgress {
        pid: record.map_or(0, |r| r.pid),
        age_secs: record.map_or(0, |r| r.age().as_secs()),
    }
}
