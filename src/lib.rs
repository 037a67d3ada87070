//! nodehost: lifecycle management for a single local cluster host.
//!
//! A host is a VM, a container, or the local machine itself, reached through
//! one of several interchangeable backends. The [`host`] module drives it
//! through create, start, stop and delete, serialised across processes by a
//! file lock under the storage root.

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod paths;

pub use config::{EngineOptions, MachineConfig, Settings};
pub use error::{DriverError, HostError};
pub use host::{
    Host, HostContext, LifecycleState, check_if_host_exists_and_load, create_ssh_shell,
    delete_host, get_host_docker_env, get_host_driver_ip, get_host_status, get_vm_host_ip,
    is_host_running, start_host, stop_host,
};
