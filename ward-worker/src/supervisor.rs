//! The supervisor: one per host.
//!
//! Polls the store for wallets with pending jobs or active watchers and
//! keeps one wallet-worker OS process alive per such wallet, capped at
//! `MAX_WALLET_PROCESSES`. Dead children are reaped every poll; on
//! shutdown every child gets SIGTERM, a grace period, then SIGKILL.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use ward_common::{config::Config, shutdown::ShutdownChannel, task::Task};
use ward_node_client::NodeClient;
use ward_store::Store;

use crate::withdrawal::WithdrawalProcessor;

/// How long children get to exit after SIGTERM before being killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Supervisor {
    store: Store,
    node: Arc<NodeClient>,
    config: Arc<Config>,
    /// Live wallet workers, keyed by xpub_van.
    children: HashMap<String, Child>,
}

impl Supervisor {
    pub fn new(store: Store, node: Arc<NodeClient>, config: Arc<Config>) -> Self {
        Self {
            store,
            node,
            config,
            children: HashMap::new(),
        }
    }

    /// Main orchestrator loop. Returns after a shutdown signal once every
    /// child has been terminated.
    pub async fn run(mut self, shutdown: ShutdownChannel) -> Result<()> {
        info!(
            "Starting supervisor (poll interval: {poll:?}, process cap: {cap})",
            poll = self.config.poll_interval,
            cap = self.config.max_wallet_processes,
        );

        if self.node.health_check().await {
            info!("Node API connection successful");
        } else {
            warn!("Node API health check failed (may be normal during node startup)");
        }

        if self.config.enable_recovery {
            if let Err(e) = self
                .store
                .recover_active_watchers(self.config.max_refresh_retries)
                .await
            {
                error!("Failed to recover active watchers on startup: {e:#}");
            }
        }

        // Withdrawals interrupted by the previous shutdown resume in the
        // background; each one picks up from its persisted status.
        let processor = WithdrawalProcessor::new(
            Arc::new(self.store.clone()),
            self.node.clone(),
            self.config.clone(),
        );
        let resume_shutdown = shutdown.clone();
        Task::spawn("withdrawal resume", async move {
            match processor.resume_pending(&resume_shutdown).await {
                Ok(0) => {}
                Ok(n) => info!("Resumed {n} withdrawal(s)"),
                Err(e) => error!("Failed to resume withdrawals: {e:#}"),
            }
        })
        .detach();

        let mut poll_timer = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                () = shutdown.recv() => break,
                _ = poll_timer.tick() => {}
            }

            self.reap_children();

            match self.wallets_needing_processing().await {
                Ok(wallets) => self.spawn_missing_workers(wallets),
                // The loop survives store hiccups; next tick tries again.
                Err(e) => error!("Error checking for wallets with pending work: {e:#}"),
            }
        }

        self.shutdown_children().await;
        info!("Supervisor stopped");
        Ok(())
    }

    /// Wallets with pending jobs or active watchers.
    async fn wallets_needing_processing(&self) -> Result<BTreeSet<String>> {
        let mut wallets: BTreeSet<String> =
            self.store.pending_job_wallets().await?.into_iter().collect();
        wallets.extend(self.store.watcher_wallets().await?);
        Ok(wallets)
    }

    /// Drop entries whose process has exited.
    fn reap_children(&mut self) {
        self.children.retain(|xpub_van, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Wallet worker for {xpub_van} exited: {status}");
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!("Failed to poll wallet worker for {xpub_van}: {e}");
                false
            }
        });
    }

    fn spawn_missing_workers(&mut self, wallets: BTreeSet<String>) {
        let running: BTreeSet<String> = self.children.keys().cloned().collect();
        let capacity_left = self
            .config
            .max_wallet_processes
            .saturating_sub(self.children.len());
        let (to_spawn, deferred) = select_wallets_to_spawn(wallets, &running, capacity_left);

        for xpub_van in deferred {
            warn!(
                "Maximum process limit reached ({cap}), deferring wallet {xpub_van}",
                cap = self.config.max_wallet_processes
            );
        }

        for xpub_van in to_spawn {
            match spawn_wallet_worker(&xpub_van) {
                Ok(child) => {
                    info!(
                        "Spawned wallet worker for {xpub_van} \
                         (active: {active}/{cap})",
                        active = self.children.len() + 1,
                        cap = self.config.max_wallet_processes,
                    );
                    self.children.insert(xpub_van, child);
                }
                Err(e) => error!("Failed to spawn wallet worker for {xpub_van}: {e:#}"),
            }
        }
    }

    /// SIGTERM every child, wait up to [`SHUTDOWN_GRACE`], then SIGKILL
    /// the stragglers.
    async fn shutdown_children(&mut self) {
        if self.children.is_empty() {
            return;
        }
        info!(
            "Terminating {n} wallet worker process(es)",
            n = self.children.len()
        );

        for (xpub_van, child) in &self.children {
            let Some(pid) = child.id() else { continue };
            debug!("Sending SIGTERM to wallet worker for {xpub_van}");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                error!("Failed to signal wallet worker for {xpub_van}: {e}");
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.children.is_empty() && tokio::time::Instant::now() < deadline {
            self.reap_children();
            if self.children.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        for (xpub_van, child) in self.children.iter_mut() {
            warn!("Force killing wallet worker for {xpub_van}");
            if let Err(e) = child.start_kill() {
                error!("Failed to kill wallet worker for {xpub_van}: {e}");
            }
        }
        self.children.clear();
        info!("All wallet worker processes terminated");
    }
}

/// Split the wallets needing processing into (spawn now, deferred by cap).
/// Wallets with a live worker are dropped entirely.
fn select_wallets_to_spawn(
    wallets: BTreeSet<String>,
    running: &BTreeSet<String>,
    capacity_left: usize,
) -> (Vec<String>, Vec<String>) {
    let mut to_spawn = Vec::new();
    let mut deferred = Vec::new();
    for xpub_van in wallets {
        if running.contains(&xpub_van) {
            continue;
        }
        if to_spawn.len() < capacity_left {
            to_spawn.push(xpub_van);
        } else {
            deferred.push(xpub_van);
        }
    }
    (to_spawn, deferred)
}

/// Launch `wardd wallet-worker --wallet <xpub_van>` as a child process.
fn spawn_wallet_worker(xpub_van: &str) -> Result<Child> {
    let exe = std::env::current_exe().context("Failed to resolve current executable")?;
    Command::new(exe)
        .args(["wallet-worker", "--wallet", xpub_van])
        .spawn()
        .context("Failed to spawn wallet worker process")
}
