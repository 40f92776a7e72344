//! `remote-kernel <config.toml> [connection-file]`
//!
//! Loads the launch configuration (file, then `RKERNEL_*` overrides),
//! starts the kernel and supervises it until the remote side exits.
//! SIGINT is forwarded to the kernel; SIGTERM and SIGHUP stop it.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use remote_kernel::config::env::EnvConfig;
use remote_kernel::config::file;
use remote_kernel::signals;
use remote_kernel::{LaunchConfig, Launcher, RemoteError, Result, SupervisorState, logging};

#[derive(Debug, Parser)]
#[command(name = "remote-kernel")]
#[command(version, about = "Run a Jupyter kernel on an SSH host or batch-scheduler node")]
struct Cli {
    /// Launch configuration (TOML)
    config: PathBuf,

    /// Jupyter connection file to merge client fields into
    connection_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match file::resolve(Some(&cli.config), &EnvConfig::default()) {
        Ok(config) => config,
        Err(e) => {
            logging::init(false);
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.verbose);

    match run(&config, cli.connection_file.as_deref()).await {
        Ok(state) => {
            tracing::info!(%state, "remote kernel finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "remote kernel failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &LaunchConfig, connection_file: Option<&Path>) -> Result<SupervisorState> {
    let (mut signals, handle) =
        signals::listen().map_err(|e| RemoteError::io("installing signal handlers", e))?;

    let interrupted = async {
        match signals.recv().await {
            Some(signal) => tracing::warn!(?signal, "signal received while launching"),
            None => std::future::pending::<()>().await,
        }
    };
    let launched = Launcher::default()
        .launch_until(config, connection_file, interrupted)
        .await;
    let mut kernel = match launched {
        Ok(kernel) => kernel,
        Err(RemoteError::Cancelled) => return Ok(SupervisorState::Stopped),
        Err(e) => return Err(e),
    };
    tracing::info!(host = %kernel.host(), id = %kernel.kernel_id(), "supervising");

    let state = kernel.run(&mut signals).await;
    handle.shutdown();
    state
}
