use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use consmon_db::{Store, StoreConfig, DEFAULT_DB_CONFIG_PATH};
use tracing::warn;

use crate::exit::{db_error, CliError, CliResult, FAILURE};

pub mod dce;
pub mod dte;

/// Default platform directory carrying `udevprefix.conf`.
const DEFAULT_PLATFORM_DIR: &str = "/usr/share/sonic/platform";

/// Attempts to reach the store before giving up with exit code 2.
const STORE_CONNECT_ATTEMPTS: u32 = 3;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the console-server side: one filtering proxy per configured
    /// console port.
    Dce(DceArgs),
    /// Run the managed-device side: periodic heartbeat sender.
    Dte(DteArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Dce(args) => dce::run(args),
        Command::Dte(args) => dte::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DceArgs {
    /// Database topology file.
    #[arg(long, value_name = "FILE", default_value = DEFAULT_DB_CONFIG_PATH)]
    pub db_config: PathBuf,

    /// Platform directory containing udevprefix.conf.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_PLATFORM_DIR)]
    pub platform_dir: PathBuf,

    /// Directory for the published PTY symlinks.
    #[arg(long, value_name = "DIR", default_value = "/dev")]
    pub dev_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct DteArgs {
    /// UART device (name under /dev or absolute path). Defaults to the
    /// console= entry in /proc/cmdline.
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Baud rate override.
    #[arg(long, value_name = "BAUD")]
    pub baud: Option<u32>,

    /// Database topology file.
    #[arg(long, value_name = "FILE", default_value = DEFAULT_DB_CONFIG_PATH)]
    pub db_config: PathBuf,
}

/// Install the process-wide signal discipline: SIGINT/SIGTERM trip the
/// returned stop flag, SIGHUP is ignored (configuration comes from the
/// store, not signals).
pub fn install_signal_handlers() -> CliResult<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(FAILURE, format!("signal handler setup failed: {err}")))?;

    // SAFETY: replacing the SIGHUP disposition with SIG_IGN touches no
    // Rust-managed state and happens before any worker threads exist.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGHUP,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    Ok(stop)
}

/// Connect to a logical database, retrying briefly before the process
/// gives up with a configuration error.
pub fn connect_store(cfg: &StoreConfig, name: &str) -> CliResult<Store> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match Store::open(cfg, name) {
            Ok(store) => return Ok(store),
            Err(err) if attempt < STORE_CONNECT_ATTEMPTS => {
                warn!(db = name, attempt, %err, "store connect failed, retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(err) => return Err(db_error("store unavailable", err)),
        }
    }
}
