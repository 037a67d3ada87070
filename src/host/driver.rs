//! Backend capability interface and the seams around it.
//!
//! A backend is reached through three collaborators, none of which this
//! crate implements for real backends:
//!
//! - [`Driver`]: per-host handle for state, power and address queries.
//! - [`DriverRegistry`]: maps a driver name to a [`DriverDescriptor`] that
//!   knows how to turn a [`MachineConfig`] into the backend's config blob.
//! - [`HostStore`]: persists [`Host`] records and rebuilds their drivers.
//!
//! Behaviour that differs per backend is expressed once, as [`Capabilities`]
//! on [`DriverKind`], instead of name comparisons at each call site.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::MachineConfig;
use crate::error::DriverError;
use crate::host::network::{GatewayStrategy, HYPERKIT_GATEWAY, KVM2_GATEWAY};
use crate::host::runner::{CommandRunner, SshRunner};
use crate::host::{Host, LifecycleState};

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Connection parameters for a host's remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key; `None` defers to the local ssh agent/config.
    pub key_path: Option<PathBuf>,
}

/// Operations every backend supports.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry name of the backend, e.g. `kvm2`.
    fn driver_name(&self) -> &str;

    async fn get_state(&self) -> Result<LifecycleState, DriverError>;

    async fn start(&self) -> Result<(), DriverError>;

    async fn stop(&self) -> Result<(), DriverError>;

    async fn remove(&self) -> Result<(), DriverError>;

    /// Address of the guest as the backend reports it.
    async fn get_ip(&self) -> Result<String, DriverError>;

    /// Where the guest's remote shell listens.
    async fn ssh_params(&self) -> Result<SshParams>;

    /// Remote shell client for backends reachable over ssh.
    async fn create_ssh_client(&self) -> Result<Arc<dyn CommandRunner>> {
        let params = self.ssh_params().await.context("ssh connection parameters")?;
        Ok(Arc::new(SshRunner::new(params)))
    }
}

// ---------------------------------------------------------------------------
// Driver kinds and their capabilities
// ---------------------------------------------------------------------------

/// Known backend kinds. Unknown names are carried as [`DriverKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Test backend; commands against it always fail.
    Mock,
    /// Bare metal: the local machine is the host.
    None,
    /// Container-as-VM.
    Docker,
    Kvm2,
    HyperKit,
    HyperV,
    VirtualBox,
    Vmware,
    VmwareFusion,
    Parallels,
    Other(String),
}

/// Per-kind behaviour switches consulted by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Commands run on the local machine; no auth or clock setup.
    pub bare_metal: bool,
    /// Commands run via container exec; reachable on the fixed bind address.
    pub container_backed: bool,
    /// Commands are never really run.
    pub mock: bool,
    /// The native stop can hang; power off over ssh first.
    pub ssh_poweroff_before_stop: bool,
    /// Scheduled for removal; users get a notice on create.
    pub deprecated: bool,
    pub gateway: GatewayStrategy,
}

impl Capabilities {
    const VM: Self = Self {
        bare_metal: false,
        container_backed: false,
        mock: false,
        ssh_poweroff_before_stop: false,
        deprecated: false,
        gateway: GatewayStrategy::Unsupported,
    };
}

impl DriverKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "mock" => Self::Mock,
            "none" => Self::None,
            "docker" => Self::Docker,
            "kvm2" => Self::Kvm2,
            "hyperkit" => Self::HyperKit,
            "hyperv" => Self::HyperV,
            "virtualbox" => Self::VirtualBox,
            "vmware" => Self::Vmware,
            "vmwarefusion" => Self::VmwareFusion,
            "parallels" => Self::Parallels,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Mock => "mock",
            Self::None => "none",
            Self::Docker => "docker",
            Self::Kvm2 => "kvm2",
            Self::HyperKit => "hyperkit",
            Self::HyperV => "hyperv",
            Self::VirtualBox => "virtualbox",
            Self::Vmware => "vmware",
            Self::VmwareFusion => "vmwarefusion",
            Self::Parallels => "parallels",
            Self::Other(name) => name,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Mock => Capabilities { mock: true, ..Capabilities::VM },
            Self::None => Capabilities { bare_metal: true, ..Capabilities::VM },
            Self::Docker => Capabilities { container_backed: true, ..Capabilities::VM },
            Self::Kvm2 => Capabilities {
                gateway: GatewayStrategy::Fixed(KVM2_GATEWAY),
                ..Capabilities::VM
            },
            Self::HyperKit => Capabilities {
                gateway: GatewayStrategy::Fixed(HYPERKIT_GATEWAY),
                ..Capabilities::VM
            },
            Self::HyperV => Capabilities {
                ssh_poweroff_before_stop: true,
                gateway: GatewayStrategy::SerializedSwitch,
                ..Capabilities::VM
            },
            Self::VirtualBox => Capabilities {
                gateway: GatewayStrategy::ControlTool,
                ..Capabilities::VM
            },
            Self::Vmware => Capabilities {
                gateway: GatewayStrategy::HostOnlySubnet,
                ..Capabilities::VM
            },
            Self::VmwareFusion => Capabilities { deprecated: true, ..Capabilities::VM },
            Self::Parallels | Self::Other(_) => Capabilities::VM,
        }
    }

    pub fn is_bare_metal(&self) -> bool {
        self.capabilities().bare_metal
    }

    pub fn is_container_backed(&self) -> bool {
        self.capabilities().container_backed
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed address that container-backed hosts publish their ports on.
pub const CONTAINER_BIND_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type ConfigFn = dyn Fn(&MachineConfig) -> serde_json::Value + Send + Sync;

/// Registry entry for one backend.
#[derive(Clone)]
pub struct DriverDescriptor {
    pub name: String,
    config: Arc<ConfigFn>,
}

impl DriverDescriptor {
    /// `config` builds the backend's config document. It must carry the
    /// machine name under `MachineName` so the store can key the new host.
    pub fn new(
        name: impl Into<String>,
        config: impl Fn(&MachineConfig) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), config: Arc::new(config) }
    }

    pub fn kind(&self) -> DriverKind {
        DriverKind::from_name(&self.name)
    }

    /// Serialised backend config for `cfg`.
    pub fn configure(&self, cfg: &MachineConfig) -> Result<Vec<u8>> {
        serde_json::to_vec(&(self.config)(cfg)).context("marshal")
    }
}

impl fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDescriptor").field("name", &self.name).finish_non_exhaustive()
    }
}

pub trait DriverRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<DriverDescriptor>;
}

/// Registry backed by an in-memory table, filled at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    drivers: BTreeMap<String, DriverDescriptor>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: DriverDescriptor) -> &mut Self {
        self.drivers.insert(descriptor.name.clone(), descriptor);
        self
    }
}

impl DriverRegistry for StaticRegistry {
    fn lookup(&self, name: &str) -> Option<DriverDescriptor> {
        self.drivers.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Host store and provisioner
// ---------------------------------------------------------------------------

/// Persistence for host records.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn load(&self, name: &str) -> Result<Host>;

    /// Build (but do not persist) a host for `driver_name` from its config blob.
    async fn new_host(&self, driver_name: &str, raw_driver: Vec<u8>) -> Result<Host>;

    /// Ask the backend to create the host, then record it.
    async fn create(&self, host: &mut Host) -> Result<()>;

    async fn save(&self, host: &Host) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;
}

/// Guest-side engine installation and TLS setup.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Install and configure the container engine using
    /// `host.host_options.engine`.
    async fn provision(&self, host: &Host) -> Result<()>;

    /// Generate and install the engine's TLS material.
    async fn configure_auth(&self, host: &Host) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_kind() {
        for name in [
            "mock", "none", "docker", "kvm2", "hyperkit", "hyperv", "virtualbox", "vmware",
            "vmwarefusion", "parallels", "qemu2",
        ] {
            assert_eq!(DriverKind::from_name(name).name(), name);
        }
        assert_eq!(DriverKind::from_name("qemu2"), DriverKind::Other("qemu2".to_string()));
    }

    #[test]
    fn capability_flags_per_kind() {
        assert!(DriverKind::None.is_bare_metal());
        assert!(!DriverKind::None.is_container_backed());
        assert!(DriverKind::Docker.is_container_backed());
        assert!(DriverKind::Mock.capabilities().mock);
        assert!(DriverKind::HyperV.capabilities().ssh_poweroff_before_stop);
        assert!(!DriverKind::Kvm2.capabilities().ssh_poweroff_before_stop);
        assert!(DriverKind::VmwareFusion.capabilities().deprecated);
        assert_eq!(
            DriverKind::Kvm2.capabilities().gateway,
            GatewayStrategy::Fixed(Ipv4Addr::new(192, 168, 39, 1))
        );
        assert_eq!(
            DriverKind::from_name("qemu2").capabilities().gateway,
            GatewayStrategy::Unsupported
        );
    }

    #[test]
    fn descriptor_configure_serialises_config_document() {
        let d = DriverDescriptor::new("kvm2", |cfg: &MachineConfig| {
            serde_json::json!({ "MachineName": cfg.name, "CPU": cfg.cpus })
        });
        let cfg = MachineConfig { name: "p1".to_string(), cpus: 4, ..Default::default() };

        let raw = d.configure(&cfg).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        assert_eq!(doc["MachineName"], "p1");
        assert_eq!(doc["CPU"], 4);
        assert_eq!(d.kind(), DriverKind::Kvm2);
    }

    #[test]
    fn static_registry_lookup() {
        let mut reg = StaticRegistry::new();
        reg.register(DriverDescriptor::new("none", |_| serde_json::json!({})));

        assert!(reg.lookup("none").is_some());
        assert!(reg.lookup("kvm2").is_none());
    }
}
