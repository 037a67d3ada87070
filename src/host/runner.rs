//! Command execution channels.
//!
//! Every command the lifecycle controller runs on a host goes through a
//! [`CommandRunner`]. Which one depends on the backend:
//!
//! | backend            | runner                  | transport                     |
//! |--------------------|-------------------------|-------------------------------|
//! | mock               | [`FakeCommandRunner`]   | none, every command fails     |
//! | bare metal         | [`ExecRunner`]          | local `/bin/bash -c`          |
//! | container-backed   | [`ContainerExecRunner`] | `docker exec <name>`          |
//! | everything else    | [`SshRunner`]           | `ssh user@host -p port`       |
//!
//! All transports shell out through `tokio::process::Command`. None of them
//! imposes a timeout; `ssh` is given a connect timeout only.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::HostError;
use crate::host::Host;
use crate::host::driver::SshParams;

/// Container runtime binary used for container-backed hosts.
pub const OCI_BINARY: &str = "docker";

/// SSH options shared by every ssh invocation.
///
/// * `StrictHostKeyChecking=no` / `UserKnownHostsFile=/dev/null`: guest host
///   keys change whenever a host is recreated.
/// * `BatchMode=yes`: fail instead of prompting for a password.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=10",
];

/// Runs a shell command on a host and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// Runner for the mock backend. Nothing is executed; every command fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeCommandRunner;

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, cmd: &str) -> Result<String> {
        bail!("unconfigured fake runner cannot run {cmd:?}")
    }
}

/// Runs commands on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, cmd: &str) -> Result<String> {
        run_command("/bin/bash", &["-c".to_string(), cmd.to_string()], cmd).await
    }
}

/// Runs commands inside a named container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExecRunner {
    pub container: String,
    pub oci_binary: String,
}

impl ContainerExecRunner {
    pub fn new(container: impl Into<String>) -> Self {
        Self { container: container.into(), oci_binary: OCI_BINARY.to_string() }
    }

    fn args(&self, cmd: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            "--privileged".to_string(),
            self.container.clone(),
            "/bin/bash".to_string(),
            "-c".to_string(),
            cmd.to_string(),
        ]
    }
}

#[async_trait]
impl CommandRunner for ContainerExecRunner {
    async fn run(&self, cmd: &str) -> Result<String> {
        run_command(&self.oci_binary, &self.args(cmd), cmd).await
    }
}

/// Runs commands over the system `ssh` client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshRunner {
    params: SshParams,
}

impl SshRunner {
    pub fn new(params: SshParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SshParams {
        &self.params
    }

    /// ssh arguments up to (not including) the remote command.
    fn base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        if let Some(key) = &self.params.key_path {
            args.extend([
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-i".to_string(),
                key.display().to_string(),
            ]);
        }
        args.extend([
            "-p".to_string(),
            self.params.port.to_string(),
            format!("{}@{}", self.params.user, self.params.host),
        ]);
        args
    }

    /// Open an interactive session, inheriting this process's stdio.
    /// `args`, if any, are run instead of a login shell.
    pub async fn shell(&self, args: &[String]) -> Result<()> {
        let mut argv = vec!["-t".to_string()];
        argv.extend(self.base_args());
        argv.extend(args.iter().cloned());

        let status = Command::new("ssh")
            .args(&argv)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .context("failed to spawn `ssh` for interactive shell")?;

        if !status.success() {
            bail!("ssh session exited with status {}", status.code().unwrap_or(-1));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, cmd: &str) -> Result<String> {
        let mut args = self.base_args();
        args.push(cmd.to_string());
        run_command("ssh", &args, cmd).await
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Best available runner for `host`.
///
/// Failing to build a remote shell client is fatal for the caller's
/// operation and is not retried here.
pub async fn select_runner(host: &Host) -> Result<Arc<dyn CommandRunner>, HostError> {
    let caps = host.kind().capabilities();

    if caps.mock {
        error!(name = %host.name, "returning unconfigured fake runner, commands will fail");
        return Ok(Arc::new(FakeCommandRunner));
    }
    if caps.bare_metal {
        return Ok(Arc::new(ExecRunner));
    }
    if caps.container_backed {
        return Ok(Arc::new(ContainerExecRunner::new(host.name.clone())));
    }

    host.driver
        .create_ssh_client()
        .await
        .context("getting ssh client for bootstrapper")
        .map_err(HostError::Fatal)
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

/// Management side of the container runtime behind container-backed hosts.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Force-remove the container `name` and its volumes.
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Host port the runtime bound to `container_port/tcp` of `name`.
    async fn host_port(&self, name: &str, container_port: u16) -> Result<u16>;
}

/// The `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    pub binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self { binary: OCI_BINARY.to_string() }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn remove_container(&self, name: &str) -> Result<()> {
        let args = ["rm", "-f", "-v", name].map(String::from);
        run_command(&self.binary, &args, "remove container").await?;
        Ok(())
    }

    async fn host_port(&self, name: &str, container_port: u16) -> Result<u16> {
        let args = ["inspect".to_string(), "-f".to_string(), port_template(container_port), name.to_string()];
        let out = run_command(&self.binary, &args, "inspect port binding").await?;
        out.trim()
            .parse()
            .with_context(|| format!("parse host port binding {:?} for {container_port}", out.trim()))
    }
}

fn port_template(container_port: u16) -> String {
    format!("{{{{(index (index .NetworkSettings.Ports \"{container_port}/tcp\") 0).HostPort}}}}")
}

/// Remove a container that the store no longer knows about.
/// Best effort: failures are only logged.
pub async fn delete_orphaned_container(runtime: &dyn ContainerRuntime, name: &str) {
    match runtime.remove_container(name).await {
        Ok(()) => info!(name = %name, "found stale container and successfully cleaned it up"),
        Err(e) => debug!(name = %name, error = %format!("{e:#}"), "no orphaned container removed"),
    }
}

// ---------------------------------------------------------------------------
// Process helper
// ---------------------------------------------------------------------------

/// Spawn an external command, wait for it, and map non-zero exit to `Err`.
async fn run_command(program: &str, args: &[String], label: &str) -> Result<String> {
    debug!(program, label, "running command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to spawn `{program}` for: {label}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "`{program}` failed (exit {}) during: {label}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
