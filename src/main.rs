//! nodehost: diagnostics for the local machine and for guests reachable
//! over ssh.
//!
//! The lifecycle operations themselves are a library API; backends, the host
//! store and the provisioner are supplied by the embedding program. This
//! binary only exercises the pieces that need none of them.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use nodehost::Settings;
use nodehost::logging::{self, LogConfig};
use nodehost::host::clock::{Clock, SystemClock, ensure_synced_guest_clock, guest_clock_delta};
use nodehost::host::driver::SshParams;
use nodehost::host::info::get_host_info;
use nodehost::host::runner::SshRunner;

#[derive(Parser, Debug)]
#[command(name = "nodehost", version, about = "Local cluster host diagnostics")]
struct Args {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print CPU, memory and disk of the local machine.
    Info,

    /// Measure the clock skew of an ssh-reachable guest.
    Clock {
        #[arg(long)]
        host: String,

        #[arg(long, default_value_t = 22)]
        port: u16,

        #[arg(long, default_value = "docker")]
        user: String,

        /// Private key to authenticate with.
        #[arg(long)]
        key: Option<PathBuf>,

        /// Correct the guest clock if it is outside tolerance.
        #[arg(long)]
        fix: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let _log_guard = logging::init(&LogConfig::from_env(level));

    match args.command {
        Command::Info => {
            let settings = Settings::load()?;
            println!("Storage root: {}", settings.paths.root.display());
            println!("Machines lock: {}", settings.paths.machines_lock().display());

            let info = get_host_info()?;
            println!("CPUs:   {}", info.cpus);
            println!("Memory: {} MB", info.memory_mb);
            println!("Disk:   {} MB", info.disk_mb);
        }
        Command::Clock { host, port, user, key, fix } => {
            let runner = SshRunner::new(SshParams { host, port, user, key_path: key });
            let delta = guest_clock_delta(&runner, SystemClock.now()).await?;
            println!("guest clock delta: {:.3}s", delta.num_milliseconds() as f64 / 1000.0);
            if fix {
                ensure_synced_guest_clock(&runner, &SystemClock).await?;
            }
        }
    }
    Ok(())
}
