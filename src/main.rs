//! labcam: serve laboratory cameras over the network, one process per device.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

use labcam::device::DeviceRegistry;
use labcam::error::exit_code;
use labcam::server::{DeviceServer, LaunchSpec, ProcessLauncher, ServerSupervisor};
use labcam::utils::{self, ExitFlag};
use labcam::Settings;

#[derive(Parser)]
#[command(name = "labcam", version, about)]
struct Cli {
    /// trace, debug, info, warn or error. Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve every device listed in CONFIG
    Serve { config: PathBuf },

    /// Serve a single device; started by `serve`
    #[command(hide = true)]
    Device {
        #[arg(long)]
        spec: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Serve { config } => serve(config, cli.log_level).await?,
        Command::Device { spec } => device(&spec, cli.log_level).await?,
    };
    std::process::exit(code);
}

async fn serve(path: PathBuf, log_level: Option<String>) -> Result<i32> {
    let settings = Settings::load(&path)?;
    let level = log_level.unwrap_or_else(|| settings.server.log_level.clone());
    utils::init_tracing(&level);
    info!(config = %path.display(), devices = settings.devices.len(), "labcam launching");

    let registry = Arc::new(DeviceRegistry::with_builtin());
    let launcher = Arc::new(ProcessLauncher::current(level)?);
    let supervisor = ServerSupervisor::new(settings, registry, launcher);
    tokio::spawn(watch_signals(supervisor.exit_flag()));

    tokio::task::spawn_blocking(move || supervisor.run()).await??;
    info!("labcam shutting down");
    Ok(exit_code::OK)
}

async fn device(spec: &str, log_level: Option<String>) -> Result<i32> {
    let spec: LaunchSpec =
        serde_json::from_str(spec).map_err(|e| eyre!("malformed launch spec: {e}"))?;
    let level = log_level.unwrap_or_else(|| spec.server.log_level.clone());
    utils::init_tracing(&level);

    let exit = Arc::new(ExitFlag::new());
    tokio::spawn(watch_signals(exit.clone()));
    watch_stdin(exit.clone())?;

    let server = DeviceServer::new(spec, Arc::new(DeviceRegistry::with_builtin()), exit);
    let code = match tokio::task::spawn_blocking(move || server.run()).await? {
        Ok(()) => exit_code::OK,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    Ok(code)
}

/// The supervisor closes our stdin to ask us to exit.
fn watch_stdin(exit: Arc<ExitFlag>) -> Result<()> {
    thread::Builder::new()
        .name("stdin-watch".into())
        .spawn(move || {
            let _ = std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink());
            info!("stdin closed, exiting");
            exit.set();
        })?;
    Ok(())
}

async fn watch_signals(exit: Arc<ExitFlag>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("termination requested");
    exit.set();
}
