//! Machine configuration and process settings.
//!
//! [`MachineConfig`] is the immutable description of the host a profile wants;
//! it is produced by the caller (usually from a profile file) and only read
//! here. [`Settings`] replaces process-wide lookups: it is built once and
//! threaded into every operation through [`crate::host::HostContext`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths::StoragePaths;

/// Service CIDR always trusted as an insecure registry by the guest engine.
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// Script the provisioner uses to install the container engine.
pub const DEFAULT_ENGINE_INSTALL_URL: &str = "https://get.docker.com";

/// Port the guest container engine listens on for TLS clients.
pub const DOCKER_DAEMON_PORT: u16 = 2376;

const SETTINGS_FILE: &str = "settings.toml";

/// Desired shape of a host, keyed by profile name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Profile name; unique key of the host in the store.
    pub name: String,
    /// Backend driver name, e.g. `kvm2`, `hyperv`, `docker`, `none`.
    pub vm_driver: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_size_mb: u64,
    /// Boot image location handed to the driver config.
    pub iso_url: String,
    /// `KEY=VALUE` entries exported to the guest container engine.
    pub docker_env: Vec<String>,
    /// Arbitrary flags passed to the guest container engine.
    pub docker_opt: Vec<String>,
    pub insecure_registry: Vec<String>,
    pub registry_mirror: Vec<String>,
}

impl MachineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parse machine config")
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read machine config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }
}

/// Options for the container engine running inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub env: Vec<String>,
    pub insecure_registry: Vec<String>,
    pub registry_mirror: Vec<String>,
    pub arbitrary_flags: Vec<String>,
    pub install_url: String,
}

impl EngineOptions {
    pub fn from_config(cfg: &MachineConfig) -> Self {
        let mut insecure_registry = vec![DEFAULT_SERVICE_CIDR.to_string()];
        insecure_registry.extend(cfg.insecure_registry.iter().cloned());

        Self {
            env: cfg.docker_env.clone(),
            insecure_registry,
            registry_mirror: cfg.registry_mirror.clone(),
            arbitrary_flags: cfg.docker_opt.clone(),
            install_url: DEFAULT_ENGINE_INSTALL_URL.to_string(),
        }
    }
}

/// Explicit settings for one invocation of the lifecycle controller.
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: StoragePaths,
    /// How long to wait for the machines lock before giving up.
    pub lock_timeout: Duration,
    /// Delay between attempts to take the machines lock.
    pub lock_poll_interval: Duration,
    pub show_driver_deprecation_notification: bool,
    /// Profile name used when none is given; reusing it prints a tip.
    pub default_machine_name: String,
}

impl Settings {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_MACHINE_NAME: &'static str = "minikube";

    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: StoragePaths::new(storage_root),
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: Self::DEFAULT_LOCK_POLL_INTERVAL,
            show_driver_deprecation_notification: true,
            default_machine_name: Self::DEFAULT_MACHINE_NAME.to_string(),
        }
    }

    /// Settings rooted at the resolved storage root.
    pub fn from_env() -> Result<Self> {
        let paths = StoragePaths::resolve()
            .context("cannot resolve storage root: neither NODEHOST_HOME nor HOME is set")?;
        Ok(Self::new(paths.root))
    }

    /// [`Settings::from_env`] overlaid with `<root>/settings.toml`, if present.
    pub fn load() -> Result<Self> {
        let settings = Self::from_env()?;
        let file = settings.paths.root.join(SETTINGS_FILE);
        match std::fs::read_to_string(&file) {
            Ok(raw) => settings
                .merge_toml_str(&raw)
                .with_context(|| format!("settings file {}", file.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(settings),
            Err(e) => Err(e).with_context(|| format!("read {}", file.display())),
        }
    }

    /// Overlay a TOML settings document on top of `self`.
    ///
    /// Every key is optional; absent keys keep their current value.
    pub fn merge_toml_str(mut self, raw: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(raw).context("parse settings")?;
        if let Some(root) = file.storage_root {
            self.paths = StoragePaths::new(root);
        }
        if let Some(secs) = file.lock_timeout_secs {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.lock_poll_interval_ms {
            self.lock_poll_interval = Duration::from_millis(ms);
        }
        if let Some(show) = file.show_driver_deprecation_notification {
            self.show_driver_deprecation_notification = show;
        }
        if let Some(name) = file.default_machine_name {
            self.default_machine_name = name;
        }
        Ok(self)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    storage_root: Option<PathBuf>,
    lock_timeout_secs: Option<u64>,
    lock_poll_interval_ms: Option<u64>,
    show_driver_deprecation_notification: Option<bool>,
    default_machine_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_options_prepend_service_cidr() {
        let cfg = MachineConfig {
            insecure_registry: vec!["registry.local:5000".to_string()],
            docker_env: vec!["HTTP_PROXY=http://proxy:3128".to_string()],
            docker_opt: vec!["log-level=debug".to_string()],
            registry_mirror: vec!["https://mirror.gcr.io".to_string()],
            ..Default::default()
        };

        let e = EngineOptions::from_config(&cfg);

        assert_eq!(e.insecure_registry, vec!["10.96.0.0/12", "registry.local:5000"]);
        assert_eq!(e.env, cfg.docker_env);
        assert_eq!(e.arbitrary_flags, cfg.docker_opt);
        assert_eq!(e.registry_mirror, cfg.registry_mirror);
        assert_eq!(e.install_url, "https://get.docker.com");
    }

    #[test]
    fn machine_config_from_toml_fills_defaults() {
        let cfg = MachineConfig::from_toml_str(
            r#"
name = "p1"
vm_driver = "kvm2"
cpus = 2
memory_mb = 2048
"#,
        )
        .unwrap();

        assert_eq!(cfg.name, "p1");
        assert_eq!(cfg.vm_driver, "kvm2");
        assert_eq!(cfg.cpus, 2);
        assert_eq!(cfg.disk_size_mb, 0);
        assert!(cfg.docker_env.is_empty());
    }

    #[test]
    fn settings_defaults() {
        let s = Settings::new("/tmp/nh");
        assert_eq!(s.lock_timeout, Duration::from_secs(600));
        assert_eq!(s.paths.machines, PathBuf::from("/tmp/nh/machines"));
        assert!(s.show_driver_deprecation_notification);
        assert_eq!(s.default_machine_name, "minikube");
    }

    #[test]
    fn settings_merge_overrides_only_present_keys() {
        let s = Settings::new("/tmp/nh")
            .merge_toml_str("lock_timeout_secs = 5\nshow_driver_deprecation_notification = false\n")
            .unwrap();
        assert_eq!(s.lock_timeout, Duration::from_secs(5));
        assert!(!s.show_driver_deprecation_notification);
        assert_eq!(s.lock_poll_interval, Settings::DEFAULT_LOCK_POLL_INTERVAL);
        assert_eq!(s.paths.root, PathBuf::from("/tmp/nh"));
    }

    #[test]
    fn settings_merge_rejects_unknown_keys() {
        assert!(Settings::new("/tmp/nh").merge_toml_str("lock_timeout = 5").is_err());
    }
}
