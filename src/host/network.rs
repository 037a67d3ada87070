//! Host ↔ guest address resolution.
//!
//! [`NetworkResolver::resolve_gateway_ip`] computes the address on the local
//! machine that a guest uses to reach it (and that the local machine uses as
//! the gateway into the guest network). How that address is found depends on
//! the backend's [`GatewayStrategy`]:
//!
//! - `Fixed`: a well-known virtual switch address. No lookup at all.
//! - `SerializedSwitch`: the switch name is scraped out of the host's raw
//!   driver data, and the address of `vEthernet (<switch>)` is used.
//! - `ControlTool`: the backend's control tool reports the host-only adapter,
//!   and that interface's address is used.
//! - `HostOnlySubnet`: the guest's own address with the last octet set to 1.
//!
//! Interface lookups and the control tool sit behind [`InterfaceLookup`] and
//! [`VmInfoTool`] so the scraping can be swapped out without touching callers.

use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HostError, Result};
use crate::host::Host;

/// Gateway of the default libvirt network used by kvm2 guests.
pub const KVM2_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 39, 1);

/// Gateway of the vmnet shared network used by hyperkit guests.
pub const HYPERKIT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 1);

/// How a backend's gateway address is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStrategy {
    Fixed(Ipv4Addr),
    SerializedSwitch,
    ControlTool,
    HostOnlySubnet,
    Unsupported,
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Local network interface addresses.
pub trait InterfaceLookup: Send + Sync {
    /// First IPv4 address bound to the interface called `name`.
    fn ipv4_for_interface(&self, name: &str) -> Result<Ipv4Addr>;
}

/// Interfaces of this machine.
///
/// Unix asks `getifaddrs(3)`. Windows has no such call for the friendly
/// adapter names (`vEthernet (Default Switch)`), so PowerShell's
/// `Get-NetIPAddress` is asked instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

#[cfg(unix)]
impl InterfaceLookup for SystemInterfaces {
    fn ipv4_for_interface(&self, name: &str) -> Result<Ipv4Addr> {
        use std::net::SocketAddrV4;

        let addrs = nix::ifaddrs::getifaddrs()
            .context("enumerate network interfaces")
            .map_err(HostError::Fatal)?;

        for ifaddr in addrs.filter(|a| a.interface_name == name) {
            let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                continue;
            };
            let ip = *SocketAddrV4::from(*sin).ip();
            debug!(interface = %name, ip = %ip, "found interface address");
            return Ok(ip);
        }

        Err(HostError::AddressNotFound { interface: name.to_string() })
    }
}

#[cfg(windows)]
impl InterfaceLookup for SystemInterfaces {
    fn ipv4_for_interface(&self, name: &str) -> Result<Ipv4Addr> {
        let out = std::process::Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-Command", &get_net_ip_address_script(name)])
            .output()
            .context("failed to spawn `powershell.exe`")
            .map_err(HostError::Fatal)?;

        // A missing alias is reported on stderr and leaves stdout empty.
        match first_ipv4_line(&String::from_utf8_lossy(&out.stdout)) {
            Some(ip) => {
                debug!(interface = %name, ip = %ip, "found interface address");
                Ok(ip)
            }
            None => Err(HostError::AddressNotFound { interface: name.to_string() }),
        }
    }
}

#[cfg(not(any(unix, windows)))]
impl InterfaceLookup for SystemInterfaces {
    fn ipv4_for_interface(&self, name: &str) -> Result<Ipv4Addr> {
        Err(HostError::AddressNotFound { interface: name.to_string() })
    }
}

/// PowerShell that prints the IPv4 addresses of one adapter, one per line.
#[cfg_attr(not(windows), allow(dead_code))]
fn get_net_ip_address_script(alias: &str) -> String {
    format!(
        "Get-NetIPAddress -InterfaceAlias '{}' -AddressFamily IPv4 -ErrorAction SilentlyContinue \
         | ForEach-Object {{ $_.IPAddress }}",
        alias.replace('\'', "''")
    )
}

#[cfg_attr(not(windows), allow(dead_code))]
fn first_ipv4_line(stdout: &str) -> Option<Ipv4Addr> {
    stdout.lines().find_map(|l| l.trim().parse().ok())
}

/// Side channel into a backend's control tool.
#[async_trait]
pub trait VmInfoTool: Send + Sync {
    /// Machine-readable description of the VM called `name`.
    async fn show_vm_info(&self, name: &str) -> anyhow::Result<String>;
}

/// VirtualBox's `VBoxManage`.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    pub path: String,
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self { path: "VBoxManage".to_string() }
    }
}

#[async_trait]
impl VmInfoTool for VBoxManage {
    async fn show_vm_info(&self, name: &str) -> anyhow::Result<String> {
        let out = Command::new(&self.path)
            .args(["showvminfo", name, "--machinereadable"])
            .output()
            .await
            .with_context(|| format!("failed to spawn `{}`", self.path))?;
        if !out.status.success() {
            anyhow::bail!(
                "`{} showvminfo {name}` exited with {}: {}",
                self.path,
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct NetworkResolver {
    interfaces: Arc<dyn InterfaceLookup>,
    vm_info: Arc<dyn VmInfoTool>,
}

impl NetworkResolver {
    pub fn new(interfaces: Arc<dyn InterfaceLookup>, vm_info: Arc<dyn VmInfoTool>) -> Self {
        Self { interfaces, vm_info }
    }

    /// Resolver backed by this machine's interfaces and tools.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemInterfaces), Arc::new(VBoxManage::default()))
    }

    /// Address to use for host → guest and guest → host traffic.
    pub async fn resolve_gateway_ip(&self, host: &Host) -> Result<Ipv4Addr> {
        let kind = host.kind();
        let ip = match kind.capabilities().gateway {
            GatewayStrategy::Fixed(ip) => ip,
            GatewayStrategy::SerializedSwitch => {
                let switch = extract_hyperv_switch(&host.raw_driver).ok_or_else(|| {
                    HostError::fatal(anyhow!("no VSwitch found in driver data for {}", host.name))
                })?;
                let iface = format!("vEthernet ({switch})");
                self.interfaces.ipv4_for_interface(&iface).map_err(|e| {
                    HostError::fatal(anyhow::Error::new(e).context(format!("ip for interface ({switch})")))
                })?
            }
            GatewayStrategy::ControlTool => {
                let out = self
                    .vm_info
                    .show_vm_info(&host.name)
                    .await
                    .context("vboxmanage")
                    .map_err(HostError::Fatal)?;
                let iface = extract_hostonly_adapter(&out).ok_or_else(|| {
                    HostError::fatal(anyhow!("no host-only adapter reported for {}", host.name))
                })?;
                self.interfaces.ipv4_for_interface(&iface).map_err(|e| {
                    HostError::fatal(anyhow::Error::new(e).context("getting VM/host IP address"))
                })?
            }
            GatewayStrategy::HostOnlySubnet => {
                let raw = host
                    .driver
                    .get_ip()
                    .await
                    .map_err(|e| HostError::fatal(anyhow::Error::new(e).context("getting VM IP address")))?;
                let vm_ip: Ipv4Addr = raw.trim().parse().map_err(|e| {
                    HostError::fatal(anyhow::Error::new(e).context(format!("VM IP {raw:?} is not IPv4")))
                })?;
                first_address_in_subnet(vm_ip)
            }
            GatewayStrategy::Unsupported => {
                return Err(HostError::UnsupportedDriver { driver: kind.to_string() });
            }
        };

        info!(name = %host.name, driver = %kind, ip = %ip, "resolved host gateway address");
        Ok(ip)
    }
}

// ---------------------------------------------------------------------------
// Extraction helpers
// ---------------------------------------------------------------------------

static HYPERV_SWITCH_REGEX: OnceLock<Regex> = OnceLock::new();
static HOSTONLY_ADAPTER_REGEX: OnceLock<Regex> = OnceLock::new();

// Neither pattern matches across a line break.
fn hyperv_switch_regex() -> &'static Regex {
    HYPERV_SWITCH_REGEX.get_or_init(|| Regex::new(r#""VSwitch": "(.*?)","#).expect("Invalid regex"))
}

fn hostonly_adapter_regex() -> &'static Regex {
    HOSTONLY_ADAPTER_REGEX.get_or_init(|| Regex::new(r#"hostonlyadapter2="(.*?)""#).expect("Invalid regex"))
}

/// Virtual switch name from serialised hyperv driver data
/// (`"VSwitch": "<name>",`).
pub fn extract_hyperv_switch(raw_driver: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw_driver);
    hyperv_switch_regex().captures(&text).map(|c| c[1].to_string())
}

/// Host-only adapter from `VBoxManage showvminfo --machinereadable` output.
pub fn extract_hostonly_adapter(vm_info: &str) -> Option<String> {
    hostonly_adapter_regex().captures(vm_info).map(|c| c[1].to_string())
}

/// `a.b.c.d` → `a.b.c.1`.
pub fn first_address_in_subnet(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 1)
}
