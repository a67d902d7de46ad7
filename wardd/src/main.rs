//! Ward daemon entry point.
//!
//! `wardd supervisor` runs the host-wide orchestrator; it spawns
//! `wardd wallet-worker --wallet <xpub>` children on demand, one per
//! wallet with pending work.

use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use ward_common::{config::Config, logger, shutdown::ShutdownChannel, task::Task};
use ward_node_client::NodeClient;
use ward_store::Store;
use ward_worker::{supervisor::Supervisor, wallet_worker::run_wallet_worker};

/// Custodial wallet orchestration daemon.
#[derive(FromArgs)]
struct Args {
    #[argh(subcommand)]
    cmd: Cmd,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Cmd {
    Supervisor(SupervisorCmd),
    WalletWorker(WalletWorkerCmd),
}

/// Run the supervisor: recovery, queue polling, wallet worker spawning.
#[derive(FromArgs)]
#[argh(subcommand, name = "supervisor")]
struct SupervisorCmd {}

/// Run a worker bound to a single wallet.
#[derive(FromArgs)]
#[argh(subcommand, name = "wallet-worker")]
struct WalletWorkerCmd {
    /// wallet xpub_van identifier
    #[argh(option)]
    wallet: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; env vars may come from the environment.
    let _ = dotenvy::dotenv();
    logger::init();

    let args: Args = argh::from_env();
    let config = Arc::new(Config::from_env().context("Invalid configuration")?);

    let shutdown = ShutdownChannel::new();
    spawn_signal_listener(shutdown.clone());

    let store = Store::connect(&config).await?;
    let node = Arc::new(NodeClient::from_config(&config));

    match args.cmd {
        Cmd::Supervisor(SupervisorCmd {}) => {
            store.run_migrations().await?;
            info!("API URL: {url}", url = config.api_url);
            Supervisor::new(store, node, config).run(shutdown).await
        }
        Cmd::WalletWorker(WalletWorkerCmd { wallet }) => {
            run_wallet_worker(Arc::new(store), node, config, wallet, shutdown).await
        }
    }
}

/// Translate SIGTERM / SIGINT into a shutdown signal for every loop.
fn spawn_signal_listener(shutdown: ShutdownChannel) {
    Task::spawn("signal listener", async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(e) => {
                tracing::error!("Failed to install SIGINT handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        shutdown.send();
    })
    .detach();
}
