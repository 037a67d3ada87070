//! Cross-process machines lock.
//!
//! Driver provisioning and certificate generation share directories under
//! the storage root, so every mutating operation takes one exclusive advisory
//! lock keyed on the machines directory, whichever profile it targets.
//! The lock is an OS file lock (`flock`) on `<root>/machines.lock`, polled
//! until the timeout elapses.
//!
//! [`MachinesLock`] releases on drop, so every exit path of the guarded
//! section (early return, `?`, panic) unlocks.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{HostError, Result};

/// What to lock and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSpec {
    pub path: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl LockSpec {
    /// The lock guarding the shared machines directory.
    pub fn machines(settings: &Settings) -> Self {
        Self {
            path: settings.paths.machines_lock(),
            timeout: settings.lock_timeout,
            poll_interval: settings.lock_poll_interval,
        }
    }
}

/// Held machines lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct MachinesLock {
    file: File,
    path: PathBuf,
    name: String,
    acquired_at: Instant,
}

impl MachinesLock {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for MachinesLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to unlock machines lock");
        }
        info!(
            name = %self.name,
            held_for = ?self.acquired_at.elapsed(),
            "releasing machines lock"
        );
    }
}

/// Take the machines lock on behalf of the operation on `name`.
///
/// Waits up to `spec.timeout`; on expiry returns [`HostError::LockTimeout`].
pub async fn acquire(spec: &LockSpec, name: &str) -> Result<MachinesLock> {
    info!(name = %name, path = %spec.path.display(), timeout = ?spec.timeout, "acquiring machines lock");

    let file = open_lock_file(&spec.path).map_err(HostError::Fatal)?;
    let start = Instant::now();

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(name = %name, waited = ?start.elapsed(), "acquired machines lock");
                return Ok(MachinesLock {
                    file,
                    path: spec.path.clone(),
                    name: name.to_string(),
                    acquired_at: Instant::now(),
                });
            }
            Err(e) if is_contended(&e) => {
                debug!(name = %name, "machines lock is held elsewhere, waiting");
            }
            Err(e) => {
                return Err(HostError::fatal(
                    anyhow::Error::new(e)
                        .context(format!("lock {}", spec.path.display())),
                ));
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= spec.timeout {
            return Err(HostError::LockTimeout { path: spec.path.clone(), timeout: spec.timeout });
        }
        tokio::time::sleep(spec.poll_interval.min(spec.timeout - elapsed)).await;
    }
}

fn open_lock_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create lock directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
