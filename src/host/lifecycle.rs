//! Host lifecycle controller.
//!
//! ```text
//!   NonExistent ──start_host──► (create) ──► Running ◄──start_host── Stopped
//!        ▲                                      │                      ▲
//!        └────────────── delete_host ◄──────────┴──── stop_host ───────┘
//! ```
//!
//! States are always read back from the driver; nothing here caches them.
//! Mutating operations (`start_host`, `delete_host`) run under the machines
//! lock for their whole duration.
//!
//! Failure classes:
//!
//! | failure                              | surfaced as                     |
//! |--------------------------------------|---------------------------------|
//! | lock timeout                         | [`HostError::LockTimeout`]      |
//! | already in target state              | success                         |
//! | host missing on delete               | [`HostError::DoesNotExist`]     |
//! | clock measurement, mkdir, power-off  | logged only                     |
//! | clock correction                     | [`HostError::Fatal`]            |
//! | auth configuration, stop             | [`HostError::Retriable`]        |
//! | everything else                      | [`HostError::Fatal`]            |

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use anyhow::{Context, anyhow};
use tracing::{debug, info, warn};

use crate::config::{DOCKER_DAEMON_PORT, EngineOptions, MachineConfig};
use crate::error::{DriverError, HostError, Result};
use crate::host::clock::ensure_synced_guest_clock;
use crate::host::driver::{CONTAINER_BIND_ADDR, DriverKind, HostStore};
use crate::host::info::{show_host_info, show_local_os_release, show_remote_os_release};
use crate::host::lock::{self, LockSpec};
use crate::host::notify::Event;
use crate::host::runner::{self, CommandRunner, SshRunner};
use crate::host::{Host, HostContext, LifecycleState};

/// Directories every guest must have before bootstrapping.
pub const REQUIRED_DIRECTORIES: &[&str] = &[
    "/etc/kubernetes/addons",
    "/etc/kubernetes/manifests",
    "/var/tmp/minikube",
    "/var/lib/minikube",
    "/var/lib/minikube/certs",
    "/var/lib/minikube/images",
    "/var/lib/minikube/binaries",
];

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// Create the host described by `cfg`, or resume it if it already exists.
pub async fn start_host(ctx: &HostContext, store: &dyn HostStore, cfg: &MachineConfig) -> Result<Host> {
    // Driver boot and certificate generation are not safe to run concurrently.
    let _lock = lock::acquire(&LockSpec::machines(&ctx.settings), &cfg.name).await?;

    let exists = store
        .exists(&cfg.name)
        .await
        .with_context(|| format!("exists: {}", cfg.name))
        .map_err(HostError::Fatal)?;

    let mut host = if !exists {
        info!(name = %cfg.name, driver = %cfg.vm_driver, "machine does not exist, provisioning new machine");
        debug!(config = ?cfg, "provisioning machine");
        create_host(ctx, store, cfg).await?
    } else {
        info!(name = %cfg.name, "skipping create, using existing machine configuration");
        resume_host(ctx, store, cfg).await?
    };

    let engine = EngineOptions::from_config(cfg);
    info!(engine = ?engine, "engine options");

    ctx.notifier.notify(Event::Waiting, &[("profile_name", cfg.name.clone())]);
    configure_host(ctx, &mut host, &engine).await?;
    Ok(host)
}

async fn resume_host(ctx: &HostContext, store: &dyn HostStore, cfg: &MachineConfig) -> Result<Host> {
    let host = store
        .load(&cfg.name)
        .await
        .context("Error loading existing host. Please try deleting it, then start again.")
        .map_err(HostError::Fatal)?;

    if cfg.name == ctx.settings.default_machine_name {
        ctx.notifier.notify(Event::Tip, &[("profile_name", cfg.name.clone())]);
    }

    let state = host
        .driver
        .get_state()
        .await
        .context("Error getting state for host")
        .map_err(HostError::Fatal)?;
    info!(name = %cfg.name, state = %state, "machine state");

    let payload = [("driver_name", cfg.vm_driver.clone()), ("profile_name", cfg.name.clone())];
    if state == LifecycleState::Running {
        ctx.notifier.notify(Event::Running, &payload);
        return Ok(host);
    }

    ctx.notifier.notify(Event::Restarting, &payload);
    match host.start().await {
        Ok(()) | Err(DriverError::AlreadyInState { state: LifecycleState::Running }) => {}
        Err(e) => return Err(HostError::fatal(anyhow::Error::new(e).context("start"))),
    }
    store.save(&host).await.context("save").map_err(HostError::Fatal)?;
    Ok(host)
}

async fn create_host(ctx: &HostContext, store: &dyn HostStore, cfg: &MachineConfig) -> Result<Host> {
    let caps = DriverKind::from_name(&cfg.vm_driver).capabilities();

    if caps.deprecated && ctx.settings.show_driver_deprecation_notification {
        ctx.notifier.notify(Event::Deprecation, &[("driver_name", cfg.vm_driver.clone())]);
    }
    show_host_info(ctx.notifier.as_ref(), cfg);

    let descriptor = ctx
        .registry
        .lookup(&cfg.vm_driver)
        .ok_or_else(|| HostError::UnsupportedDriver { driver: cfg.vm_driver.clone() })?;
    let data = descriptor.configure(cfg).map_err(HostError::Fatal)?;

    let mut host = store
        .new_host(&cfg.vm_driver, data)
        .await
        .context("new host")
        .map_err(HostError::Fatal)?;

    ctx.settings.paths.ensure().map_err(HostError::Fatal)?;
    let root = &ctx.settings.paths.root;
    host.host_options.auth.cert_dir = root.clone();
    host.host_options.auth.store_path = root.clone();
    host.host_options.engine = EngineOptions::from_config(cfg);

    store.create(&mut host).await.context("create").map_err(HostError::Fatal)?;

    if let Err(e) = create_required_directories(&host).await {
        warn!(name = %host.name, error = %format!("{e:#}"), "required directories");
    }

    if caps.bare_metal {
        show_local_os_release(ctx.notifier.as_ref());
    } else if !caps.container_backed {
        let runner = runner::select_runner(&host).await?;
        show_remote_os_release(runner.as_ref()).await;
        // New guests get their clock fixed up front.
        ensure_synced_guest_clock(runner.as_ref(), ctx.clock.as_ref())
            .await
            .map_err(HostError::Fatal)?;
    }

    store.save(&host).await.context("save").map_err(HostError::Fatal)?;
    Ok(host)
}

/// Post-boot setup shared by the create and resume paths.
async fn configure_host(ctx: &HostContext, host: &mut Host, engine: &EngineOptions) -> Result<()> {
    let start = Instant::now();
    info!(name = %host.name, driver = %host.driver_name, "configuring host");

    let result = configure_host_steps(ctx, host, engine).await;
    info!(name = %host.name, elapsed = ?start.elapsed(), ok = result.is_ok(), "configure host finished");
    result
}

async fn configure_host_steps(ctx: &HostContext, host: &mut Host, engine: &EngineOptions) -> Result<()> {
    if let Err(e) = create_required_directories(host).await {
        warn!(name = %host.name, error = %format!("{e:#}"), "required directories");
    }

    if !engine.env.is_empty() {
        host.host_options.engine.env = engine.env.clone();
        ctx.notifier.notify(Event::Provisioning, &[("profile_name", host.name.clone())]);
        ctx.provisioner
            .provision(host)
            .await
            .context("provision")
            .map_err(HostError::Fatal)?;
    }

    let kind = host.kind();
    if kind.is_bare_metal() {
        info!(driver = %kind, "local driver, skipping auth/time setup");
        return Ok(());
    }

    info!(driver = %kind, "configuring auth");
    ctx.provisioner
        .configure_auth(host)
        .await
        .context("Error configuring auth on host")
        .map_err(HostError::Retriable)?;

    let runner = runner::select_runner(host).await?;
    ensure_synced_guest_clock(runner.as_ref(), ctx.clock.as_ref())
        .await
        .map_err(HostError::Fatal)
}

/// `sudo mkdir -p` every entry of [`REQUIRED_DIRECTORIES`] on the guest.
pub async fn create_required_directories(host: &Host) -> anyhow::Result<()> {
    if host.kind().capabilities().mock {
        info!(name = %host.name, "skipping required directories for mock driver");
        return Ok(());
    }
    info!(dirs = ?REQUIRED_DIRECTORIES, "creating required directories");

    let runner = runner::select_runner(host).await.context("command runner")?;
    let cmd = format!("sudo mkdir -p {}", REQUIRED_DIRECTORIES.join(" "));
    runner
        .run(&cmd)
        .await
        .with_context(|| format!("sudo mkdir ({})", host.driver_name))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stop / delete
// ---------------------------------------------------------------------------

/// Stop the named host. Stopping a stopped host succeeds.
pub async fn stop_host(ctx: &HostContext, store: &dyn HostStore, name: &str) -> Result<()> {
    let start = Instant::now();
    info!(name = %name, "stopping host");

    let host = store.load(name).await.context("load").map_err(HostError::Fatal)?;

    ctx.notifier.notify(
        Event::Stopping,
        &[("profile_name", name.to_string()), ("driver_name", host.driver_name.clone())],
    );
    if host.kind().capabilities().ssh_poweroff_before_stop {
        info!(driver = %host.driver_name, "native stop can hang, shutting down over ssh first");
        if let Err(e) = try_ssh_power_off(ctx, &host).await {
            warn!(name = %name, error = %format!("{e:#}"), "ssh power off");
        }
    }

    let result = match host.stop().await {
        Ok(()) => Ok(()),
        Err(DriverError::AlreadyInState { state: LifecycleState::Stopped }) => {
            info!(name = %name, "host already stopped");
            Ok(())
        }
        Err(e) => {
            info!(name = %name, error = %e, "host stop failed");
            Err(HostError::retriable(anyhow::Error::new(e).context(format!("Stop: {name}"))))
        }
    };
    info!(name = %name, elapsed = ?start.elapsed(), "stop host finished");
    result
}

/// Power the guest off over its remote shell, if it is running.
///
/// `poweroff` drops the connection, so its result is only logged.
async fn try_ssh_power_off(ctx: &HostContext, host: &Host) -> anyhow::Result<()> {
    let state = host.driver.get_state().await.context("unable to get state")?;
    if state != LifecycleState::Running {
        info!(name = %host.name, state = %state, "host is not running, skipping power off");
        return Ok(());
    }

    ctx.notifier.notify(Event::Shutdown, &[("profile_name", host.name.clone())]);
    let result = host.run("sudo poweroff").await;
    info!(result = ?result, "poweroff result");
    Ok(())
}

/// Delete the named host and its store record.
pub async fn delete_host(ctx: &HostContext, store: &dyn HostStore, name: &str) -> Result<()> {
    let _lock = lock::acquire(&LockSpec::machines(&ctx.settings), name).await?;

    let loaded = store.load(name).await;
    if loaded.is_err() {
        // The store lost track of it; a container of that name may still exist.
        runner::delete_orphaned_container(ctx.containers.as_ref(), name).await;
    }

    let state = match host_state(store, name).await {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(name = %name, error = %e, "unable to get host status");
            ctx.notifier.notify(Event::Warning, &[("name", name.to_string())]);
            None
        }
    };
    if state == Some(LifecycleState::None) {
        return Err(HostError::DoesNotExist { name: name.to_string() });
    }

    let host = loaded.context("load").map_err(HostError::Fatal)?;

    if host.kind().capabilities().ssh_poweroff_before_stop {
        match try_ssh_power_off(ctx, &host).await {
            Ok(()) => ctx.notifier.notify(Event::DeletingHost, &[("driver", host.driver_name.clone())]),
            Err(e) => info!(name = %name, error = %format!("{e:#}"), "unable to power off host"),
        }
    }

    ctx.notifier.notify(
        Event::DeletingHost,
        &[("profile_name", name.to_string()), ("driver_name", host.driver_name.clone())],
    );
    host.driver
        .remove()
        .await
        .context("host remove")
        .map_err(HostError::Fatal)?;
    store.remove(name).await.context("api remove").map_err(HostError::Fatal)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Backend state of the named host, [`LifecycleState::None`] if unknown.
pub async fn host_state(store: &dyn HostStore, name: &str) -> Result<LifecycleState> {
    let exists = store
        .exists(name)
        .await
        .with_context(|| format!("{name} exists"))
        .map_err(HostError::Fatal)?;
    if !exists {
        return Ok(LifecycleState::None);
    }

    let host = store.load(name).await.context("load").map_err(HostError::Fatal)?;
    host.driver.get_state().await.context("state").map_err(HostError::Fatal)
}

pub async fn get_host_status(store: &dyn HostStore, name: &str) -> Result<String> {
    host_state(store, name).await.map(|s| s.to_string())
}

/// Whether the named host reports [`LifecycleState::Running`].
pub async fn is_host_running(store: &dyn HostStore, name: &str) -> bool {
    match host_state(store, name).await {
        Ok(LifecycleState::Running) => true,
        Ok(state) => {
            warn!(name = %name, state = %state, "host is not running");
            false
        }
        Err(e) => {
            warn!(name = %name, error = %e, "host status returned error");
            false
        }
    }
}

pub async fn check_if_host_exists_and_load(store: &dyn HostStore, name: &str) -> Result<Host> {
    info!(name = %name, "checking if machine exists");
    let exists = store
        .exists(name)
        .await
        .with_context(|| format!("Error checking that machine exists: {name}"))
        .map_err(HostError::Fatal)?;
    if !exists {
        return Err(HostError::DoesNotExist { name: name.to_string() });
    }

    store
        .load(name)
        .await
        .with_context(|| format!("loading machine {name:?}"))
        .map_err(HostError::Fatal)
}

/// Address of the named host as seen from the local machine.
pub async fn get_host_driver_ip(store: &dyn HostStore, name: &str) -> Result<IpAddr> {
    let host = check_if_host_exists_and_load(store, name).await?;

    let ip = host.driver.get_ip().await.context("getting IP").map_err(HostError::Fatal)?;
    if host.kind().is_container_backed() {
        return Ok(IpAddr::V4(CONTAINER_BIND_ADDR));
    }
    ip.trim()
        .parse()
        .map_err(|_| HostError::fatal(anyhow!("parsing IP: {ip}")))
}

/// Address used for host → guest and guest → host traffic.
pub async fn get_vm_host_ip(ctx: &HostContext, host: &Host) -> Result<Ipv4Addr> {
    ctx.resolver.resolve_gateway_ip(host).await
}

/// Environment for pointing a docker client at the engine inside the host.
pub async fn get_host_docker_env(
    ctx: &HostContext,
    store: &dyn HostStore,
    name: &str,
) -> Result<BTreeMap<String, String>> {
    let host = check_if_host_exists_and_load(store, name).await?;

    let (ip, port) = if host.kind().is_container_backed() {
        // The engine's port is published on a runtime-chosen host port.
        let port = ctx
            .containers
            .host_port(&host.name, DOCKER_DAEMON_PORT)
            .await
            .with_context(|| format!("get hostbind port for {DOCKER_DAEMON_PORT}"))
            .map_err(HostError::Fatal)?;
        (CONTAINER_BIND_ADDR.to_string(), port)
    } else {
        let ip = host
            .driver
            .get_ip()
            .await
            .context("Error getting ip from host")
            .map_err(HostError::Fatal)?;
        (ip.trim().to_string(), DOCKER_DAEMON_PORT)
    };

    Ok(BTreeMap::from([
        ("DOCKER_TLS_VERIFY".to_string(), "1".to_string()),
        ("DOCKER_HOST".to_string(), format!("tcp://{}", join_host_port(&ip, port))),
        ("DOCKER_CERT_PATH".to_string(), ctx.settings.paths.certs.display().to_string()),
    ]))
}

/// `host:port`, bracketing IPv6 literals.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Interactive remote shell on the named host. `args`, if any, are run
/// instead of a login shell.
pub async fn create_ssh_shell(store: &dyn HostStore, name: &str, args: &[String]) -> Result<()> {
    let host = check_if_host_exists_and_load(store, name).await?;

    let state = host.driver.get_state().await.context("state").map_err(HostError::Fatal)?;
    if state != LifecycleState::Running {
        return Err(HostError::fatal(anyhow!("{name:?} is not running")));
    }

    let params = host
        .driver
        .ssh_params()
        .await
        .context("Creating ssh client")
        .map_err(HostError::Fatal)?;
    SshRunner::new(params).shell(args).await.map_err(HostError::Fatal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_directories_cover_images_and_binaries() {
        assert!(REQUIRED_DIRECTORIES.contains(&"/var/lib/minikube/images"));
        assert!(REQUIRED_DIRECTORIES.contains(&"/var/lib/minikube/binaries"));
        assert!(REQUIRED_DIRECTORIES.iter().all(|d| d.starts_with('/')));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(join_host_port("192.168.39.20", 2376), "192.168.39.20:2376");
        assert_eq!(join_host_port("fe80::1", 2376), "[fe80::1]:2376");
    }
}
