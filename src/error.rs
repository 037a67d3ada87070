//! Error taxonomy for host lifecycle operations.
//!
//! Every public operation returns [`HostError`]. Callers decide on retries by
//! inspecting [`HostError::is_retriable`]; nothing in this crate retries on its
//! own. Advisory failures (clock measurement, directory creation, orphan
//! cleanup, best-effort power-off) never reach this type, they are logged at
//! the point they occur.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::host::LifecycleState;

/// Error returned by the host lifecycle operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The named host is not known to the store or its backend.
    #[error("machine {name:?} does not exist")]
    DoesNotExist { name: String },

    /// Another invocation held the machines lock for longer than the timeout.
    #[error("timed out after {timeout:?} waiting for machines lock {}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// The driver name has no registry entry, or the operation has no
    /// strategy for it.
    #[error("unsupported/missing driver: {driver}")]
    UnsupportedDriver { driver: String },

    /// A network interface exists (or was named) but carries no IPv4 address.
    #[error("error finding IPv4 address for {interface}")]
    AddressNotFound { interface: String },

    /// A sub-step failed in a way a caller may reasonably retry.
    #[error("{0:#}")]
    Retriable(anyhow::Error),

    /// A sub-step failed; the error carries the context of which one.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl HostError {
    /// Wrap an error so callers know a retry may succeed.
    pub fn retriable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retriable(err.into())
    }

    /// Wrap an error that should abort the operation.
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable(_))
    }

    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Self::DoesNotExist { .. })
    }
}

/// Error reported by a backend driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The host is already in the state the action would move it to.
    #[error("machine is already {state}")]
    AlreadyInState { state: LifecycleState },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = HostError> = std::result::Result<T, E>;
