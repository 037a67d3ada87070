//! Local storage layout for nodehost.
//!
//! Everything the lifecycle controller touches on the local machine lives
//! under a single storage root:
//!
//! - Root:      `$NODEHOST_HOME` or `~/.nodehost/`
//! - Machines:  `<root>/machines/`        (owned by the host store)
//! - Lock:      `<root>/machines.lock`    (guards every mutating operation)
//! - Certs:     `<root>/certs/`
//! - Logs:      XDG data dir or `~/Library/Logs/nodehost/` on macOS

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

const APP_NAME: &str = "nodehost";
const HOME_ENV: &str = "NODEHOST_HOME";

/// Resolved storage paths derived from one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Storage root. Auth material and the host store hang off this.
    pub root: PathBuf,
    /// Shared machines directory. The machines lock is keyed on this path.
    pub machines: PathBuf,
    /// Client certificates used for engine TLS.
    pub certs: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            machines: root.join("machines"),
            certs: root.join("certs"),
            root,
        }
    }

    /// Resolve from `NODEHOST_HOME`, falling back to `~/.nodehost`.
    pub fn resolve() -> Option<Self> {
        storage_root().map(Self::new)
    }

    /// Path of the lock file guarding the machines directory.
    pub fn machines_lock(&self) -> PathBuf {
        self.machines.with_extension("lock")
    }

    /// Create the root and certs directories if they are missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.machines, &self.certs] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

/// The storage root, honouring `NODEHOST_HOME`.
pub fn storage_root() -> Option<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    let home = std::env::var("HOME").ok().map(PathBuf::from)?;
    Some(home.join(format!(".{APP_NAME}")))
}

/// Directory used for the optional log file.
pub fn log_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok().map(PathBuf::from)?;
    Some(resolve_log_dir(&home))
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_root() {
        let paths = StoragePaths::new("/srv/nodehost");
        assert_eq!(paths.machines, PathBuf::from("/srv/nodehost/machines"));
        assert_eq!(paths.certs, PathBuf::from("/srv/nodehost/certs"));
        assert_eq!(paths.machines_lock(), PathBuf::from("/srv/nodehost/machines.lock"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(tmp.path().join("root"));

        paths.ensure().expect("ensure should succeed");

        assert!(paths.root.is_dir());
        assert!(paths.machines.is_dir());
        assert!(paths.certs.is_dir());
    }
}
