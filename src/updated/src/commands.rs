//! CLI definitions and dispatch.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hmp_update_core::config::UpdateConfig;
use hmp_update_core::error::ErrorCode;
use hmp_update_core::event::ModuleUpdateStatus;
use hmp_update_runtime::{DeviceMounter, FileParamStore, ModuleUpdateService, SysinfoProbe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Set by the signal handler to request a graceful shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// HMP module update daemon.
#[derive(Parser)]
#[command(name = "hmp-updated", version, about)]
pub struct Cli {
    /// Configuration file (JSON, or YAML by extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Mount every module and heal failed ones until stopped (default)
    Run,
    /// Run the boot-time module check once and exit
    Check,
    /// Install an hmp directory
    Install {
        /// Directory holding pack.info and the module packages
        path: PathBuf,
    },
    /// Remove the installed generations of an hmp
    Uninstall { name: String },
    /// Show the effective generation of every hmp, or of one
    Info { name: Option<String> },
    /// Print and clear the recorded update results
    Results,
    /// Report a mount outcome observed outside the daemon
    Report {
        name: String,
        /// The factory generation was mounted
        #[arg(long)]
        preinstalled: bool,
        /// At least one image failed to mount
        #[arg(long)]
        failed: bool,
    },
}

pub fn dispatch(cli: Cli) -> Result<()> {
    let service = open_service(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&service),
        Command::Check => {
            if !service.check_all_modules() {
                bail!("some modules failed to mount");
            }
            Ok(())
        }
        Command::Install { path } => expect_success("install", service.install_one(&path)),
        Command::Uninstall { name } => expect_success("uninstall", service.uninstall_one(&name)),
        Command::Info { name } => {
            let packages = service.get_package_info(name.as_deref().unwrap_or(""))?;
            println!("{}", serde_json::to_string_pretty(&packages)?);
            Ok(())
        }
        Command::Results => {
            for record in service.take_results()? {
                println!("{}", record.to_line());
            }
            Ok(())
        }
        Command::Report {
            name,
            preinstalled,
            failed,
        } => {
            let mut status = ModuleUpdateStatus::new(name);
            status.is_pre_installed = preinstalled;
            status.is_all_mount_success = !failed;
            service.report_status(&status)?;
            Ok(())
        }
    }
}

fn open_service(config_path: Option<&Path>) -> Result<ModuleUpdateService> {
    let config = match config_path {
        Some(path) => UpdateConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => UpdateConfig::default(),
    };

    let params = FileParamStore::open(&config.param_store_path)
        .with_context(|| format!("opening {}", config.param_store_path.display()))?;
    let mounter = DeviceMounter::new(config.loop_device.clone(), config.mount.clone());

    let service = ModuleUpdateService::new(
        config,
        Arc::new(mounter),
        Arc::new(params),
        Arc::new(SysinfoProbe::new()),
    )?;
    Ok(service)
}

fn expect_success(operation: &str, code: ErrorCode) -> Result<()> {
    println!("{}: {}", operation, code.label());
    if code != ErrorCode::Success {
        bail!("{} failed with code {}", operation, code.as_i32());
    }
    Ok(())
}

fn run(service: &ModuleUpdateService) -> Result<()> {
    register_signal_handlers()?;
    tracing::info!(version = hmp_update_runtime::VERSION, "hmp-updated starting");

    if !service.check_all_modules() {
        tracing::warn!("Boot-time check finished with failures");
    }
    service.start_runtime()?;

    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("Shutdown requested");
    service.shutdown();
    Ok(())
}

fn register_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(shutdown_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("installing {} handler", signal))?;
    }
    Ok(())
}

extern "C" fn shutdown_handler(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_run() {
        let cli = Cli::try_parse_from(["hmp-updated"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_install_with_config() {
        let cli =
            Cli::try_parse_from(["hmp-updated", "install", "/data/demo", "--config", "/etc/u.yaml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/u.yaml")));
        assert!(matches!(
            cli.command,
            Some(Command::Install { path }) if path == Path::new("/data/demo")
        ));
    }

    #[test]
    fn test_parse_report_flags() {
        let cli = Cli::try_parse_from(["hmp-updated", "report", "demo", "--failed"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Report { ref name, preinstalled: false, failed: true }) if name == "demo"
        ));
    }
}
