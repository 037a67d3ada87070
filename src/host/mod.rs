//! Host management for nodehost.
//!
//! Drives one cluster host through its lifecycle over interchangeable
//! backends, serialised across processes by the machines lock.
//!
//! ```text
//! start_host(ctx, store, cfg)
//!     └─► lock::acquire(machines.lock)            (held until return)
//!             ├─► create_host / load + driver.start
//!             └─► configure_host
//!                     ├─► runner::select_runner → mkdir required dirs
//!                     ├─► Provisioner::provision / configure_auth
//!                     └─► clock::ensure_synced_guest_clock
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EngineOptions, Settings};
use crate::error::DriverError;

pub mod clock;
pub mod driver;
pub mod info;
pub mod lifecycle;
pub mod lock;
pub mod network;
pub mod notify;
pub mod runner;

use clock::{Clock, SystemClock};
use driver::{Driver, DriverKind, DriverRegistry, Provisioner};
use network::NetworkResolver;
use notify::{Notifier, TracingNotifier};
use runner::{CommandRunner, ContainerRuntime, DockerCli};

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Lifecycle state as reported by the backend.
///
/// Always re-derived from the driver; never cached between operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// The store has no record of the host.
    None,
    Running,
    Paused,
    Starting,
    Stopping,
    Stopped,
    /// The backend reported a failure or a state it could not classify.
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "Nonexistent",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Starting => "Starting",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Where the host's TLS material lives on the local machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthOptions {
    pub cert_dir: PathBuf,
    pub store_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOptions {
    pub auth: AuthOptions,
    pub engine: EngineOptions,
}

/// A persisted host record plus its live driver handle.
///
/// Owned by the [`driver::HostStore`]; operations only borrow it for their
/// own duration.
pub struct Host {
    pub name: String,
    pub driver_name: String,
    /// Opaque driver state as serialised by the store.
    pub raw_driver: Vec<u8>,
    pub host_options: HostOptions,
    pub driver: Box<dyn Driver>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("driver_name", &self.driver_name)
            .field("host_options", &self.host_options)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Capability flags of the backend that serves this host.
    pub fn kind(&self) -> DriverKind {
        DriverKind::from_name(self.driver.driver_name())
    }

    /// Start the backend unless it is already running.
    pub async fn start(&self) -> Result<(), DriverError> {
        if self.driver.get_state().await? == LifecycleState::Running {
            return Err(DriverError::AlreadyInState { state: LifecycleState::Running });
        }
        self.driver.start().await
    }

    /// Stop the backend unless it is already stopped.
    pub async fn stop(&self) -> Result<(), DriverError> {
        if self.driver.get_state().await? == LifecycleState::Stopped {
            return Err(DriverError::AlreadyInState { state: LifecycleState::Stopped });
        }
        self.driver.stop().await
    }
}

/// Commands run against a host go over its remote shell.
#[async_trait]
impl CommandRunner for Host {
    async fn run(&self, cmd: &str) -> anyhow::Result<String> {
        let client = self.driver.create_ssh_client().await?;
        client.run(cmd).await
    }
}

// ---------------------------------------------------------------------------
// Operation context
// ---------------------------------------------------------------------------

/// Everything an operation needs besides the host store.
///
/// Built once per invocation and passed explicitly; there is no process-wide
/// configuration lookup.
#[derive(Clone)]
pub struct HostContext {
    pub settings: Settings,
    pub registry: Arc<dyn DriverRegistry>,
    pub provisioner: Arc<dyn Provisioner>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub resolver: NetworkResolver,
    /// Runtime behind container-backed hosts.
    pub containers: Arc<dyn ContainerRuntime>,
}

impl HostContext {
    pub fn new(
        settings: Settings,
        registry: Arc<dyn DriverRegistry>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            settings,
            registry,
            provisioner,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
            resolver: NetworkResolver::system(),
            containers: Arc::new(DockerCli::default()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_resolver(mut self, resolver: NetworkResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_container_runtime(mut self, containers: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = containers;
        self
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use lifecycle::{
    check_if_host_exists_and_load, create_ssh_shell, delete_host, get_host_docker_env,
    get_host_driver_ip, get_host_status, get_vm_host_ip, is_host_running, start_host, stop_host,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_state_has_distinct_string() {
        assert_eq!(LifecycleState::None.to_string(), "Nonexistent");
        assert_eq!(LifecycleState::Running.to_string(), "Running");
        assert_eq!(LifecycleState::Stopped.to_string(), "Stopped");
    }
}
