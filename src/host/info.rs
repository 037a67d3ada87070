//! Local machine facts shown while a host is being created.
//!
//! Everything here is informational. Probe failures skip the message they
//! would have fed; they never fail an operation.

use std::path::Path;

use anyhow::{Result, bail};
use sysinfo::{Disks, System};
use tracing::{error, info, warn};

use crate::config::MachineConfig;
use crate::host::driver::DriverKind;
use crate::host::notify::{Event, Notifier};
use crate::host::runner::CommandRunner;

const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Snapshot of the local machine's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub cpus: usize,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

fn megs(bytes: u64) -> u64 {
    bytes / 1024 / 1024
}

/// Size of the filesystem holding `target`: the mount point that is the
/// longest prefix of it. Container hosts often hide their overlay root, in
/// which case the largest listed filesystem stands in.
fn disk_holding(mounts: &[(&Path, u64)], target: &Path) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| target.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .or_else(|| mounts.iter().max_by_key(|(_, total)| *total))
        .map(|(_, total)| *total)
}

/// CPU count, total memory and the size of the filesystem holding `/`.
pub fn get_host_info() -> Result<HostInfo> {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let cpus = sys.cpus().len();
    if cpus == 0 {
        warn!("unable to get CPU info");
        bail!("no CPUs reported");
    }
    let memory = sys.total_memory();
    if memory == 0 {
        warn!("unable to get mem info");
        bail!("no memory reported");
    }

    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<_> = disks.iter().map(|d| (d.mount_point(), d.total_space())).collect();
    let Some(disk) = disk_holding(&mounts, Path::new("/")) else {
        warn!("unable to get disk info");
        bail!("no filesystems reported");
    };

    Ok(HostInfo { cpus, memory_mb: megs(memory), disk_mb: megs(disk) })
}

/// `PRETTY_NAME` from an os-release document.
pub fn parse_os_release(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let value = line.trim().strip_prefix("PRETTY_NAME=")?;
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Announce the local distribution (bare-metal hosts).
pub fn show_local_os_release(notifier: &dyn Notifier) {
    let text = match std::fs::read_to_string(OS_RELEASE_PATH) {
        Ok(t) => t,
        Err(e) => {
            error!(path = OS_RELEASE_PATH, error = %e, "read os-release");
            return;
        }
    };
    match parse_os_release(&text) {
        Some(pretty) => notifier.notify(Event::Provisioner, &[("pretty_name", pretty)]),
        None => error!(path = OS_RELEASE_PATH, "os-release has no PRETTY_NAME"),
    }
}

/// Log the guest distribution, read over `runner`.
pub async fn show_remote_os_release(runner: &dyn CommandRunner) {
    let text = match runner.run(&format!("cat {OS_RELEASE_PATH}")).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %format!("{e:#}"), "get guest os-release");
            return;
        }
    };
    match parse_os_release(&text) {
        Some(pretty) => info!("Provisioned with {pretty}"),
        None => error!("guest os-release has no PRETTY_NAME"),
    }
}

/// Event describing the machine about to be created, if the probe allows.
pub fn host_info_event(
    cfg: &MachineConfig,
    probe: impl FnOnce() -> Result<HostInfo>,
) -> Option<(Event, Vec<(&'static str, String)>)> {
    let kind = DriverKind::from_name(&cfg.vm_driver);
    let caps = kind.capabilities();

    if caps.bare_metal {
        let info = probe().ok()?;
        return Some((
            Event::StartingNone,
            vec![
                ("number_of_cpus", info.cpus.to_string()),
                ("memory_size", info.memory_mb.to_string()),
                ("disk_size", info.disk_mb.to_string()),
            ],
        ));
    }

    if caps.container_backed {
        let info = probe().ok()?;
        return Some((
            Event::StartingVm,
            vec![
                ("driver_name", cfg.vm_driver.clone()),
                ("number_of_cpus", cfg.cpus.to_string()),
                ("number_of_host_cpus", info.cpus.to_string()),
                ("memory_size", cfg.memory_mb.to_string()),
                ("host_memory_size", info.memory_mb.to_string()),
            ],
        ));
    }

    Some((
        Event::StartingVm,
        vec![
            ("driver_name", cfg.vm_driver.clone()),
            ("number_of_cpus", cfg.cpus.to_string()),
            ("memory_size", cfg.memory_mb.to_string()),
            ("disk_size", cfg.disk_size_mb.to_string()),
        ],
    ))
}

pub fn show_host_info(notifier: &dyn Notifier, cfg: &MachineConfig) {
    if let Some((event, payload)) = host_info_event(cfg, get_host_info) {
        notifier.notify(event, &payload);
    }
}
