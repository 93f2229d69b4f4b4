//! svcd daemon entry point.
//!
//! `svcd` runs the daemon. `svcd run <program> [args...]` runs the daemon
//! around one local command registered under the hostname from the
//! workspace file, and exits with the command's exit code.

use std::sync::Arc;

use env_logger::Env;
use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use svcd::runner::CommandRunner;
use svcd::{daemon, Config, MappingRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting svcd with config: {:?}", cfg);

    let token = CancellationToken::new();
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((cmd, rest)) if cmd == "run" => {
            let Some((program, program_args)) = rest.split_first() else {
                anyhow::bail!("usage: svcd run <program> [args...]");
            };
            let code = run_command(cfg, program, program_args, token).await?;
            std::process::exit(code);
        }
        Some((cmd, _)) => anyhow::bail!("unknown command {:?}", cmd),
        None => serve(cfg, token).await,
    }
}

async fn serve(cfg: Config, token: CancellationToken) -> anyhow::Result<()> {
    let mut daemon_handle = tokio::spawn(daemon::run(cfg, token.clone()));

    // Graceful Shutdown
    tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            token.cancel();
            daemon_handle.await??;
        }
        res = &mut daemon_handle => res??,
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn run_command(
    cfg: Config,
    program: &str,
    args: &[String],
    token: CancellationToken,
) -> anyhow::Result<i32> {
    let registry = Arc::new(MappingRegistry::with_event_buffer(cfg.registry.event_buffer));
    let runner = CommandRunner::from_dir(Arc::clone(&registry), std::env::current_dir()?)?;

    let subsystems = daemon::start(cfg, registry, token.clone()).await;
    let daemon_handle = {
        // A failing daemon takes the command down with it.
        let token = token.clone();
        tokio::spawn(async move {
            let res = subsystems.wait().await;
            token.cancel();
            res
        })
    };
    {
        let token = token.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down...");
                    token.cancel();
                }
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
        });
    }

    let status = runner.run(program, args, token.child_token()).await;
    token.cancel();
    daemon_handle.await??;

    let status = status?;
    info!("{} exited with {}", program, status);
    Ok(status.code().unwrap_or(1))
}
