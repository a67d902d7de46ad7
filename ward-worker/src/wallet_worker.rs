//! The per-wallet worker loop.
//!
//! One process serves exactly one wallet: it drains the wallet's pending
//! jobs, then runs each of its active watchers to a terminal outcome,
//! strictly sequentially. Confining a wallet to a single worker is the
//! correctness anchor for the node, which is not reentrant-safe; the
//! supervisor guarantees at most one worker per wallet exists.

use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{error, info};
use ward_common::{config::Config, shutdown::ShutdownChannel};
use ward_node_client::NodeApi;

use crate::{job_processor::process_job, traits::QueueStore, transfer_watcher::TransferWatcher};

/// Run the worker loop for one wallet until shutdown or idle timeout.
pub async fn run_wallet_worker<S: QueueStore, N: NodeApi>(
    store: Arc<S>,
    node: Arc<N>,
    config: Arc<Config>,
    xpub_van: String,
    shutdown: ShutdownChannel,
) -> Result<()> {
    info!(
        "Starting wallet worker for {xpub_van} \
         (idle timeout: {idle:?}, poll interval: {poll:?})",
        idle = config.wallet_worker_idle_timeout,
        poll = config.wallet_worker_poll_interval,
    );

    let mut last_work = Instant::now();

    loop {
        if shutdown.try_recv() {
            break;
        }
        let mut did_work = false;

        // Drain pending jobs, oldest first.
        loop {
            if shutdown.try_recv() {
                break;
            }
            let job = match store.dequeue_job_for_wallet(&xpub_van).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to dequeue job for {xpub_van}: {e:#}");
                    break;
                }
            };
            did_work = true;
            process_job(&store, &node, &config, &job, &shutdown).await;
        }

        // Serve every active watcher, each to completion, sequentially.
        if !shutdown.try_recv() {
            match store.active_watchers_for_wallet(&xpub_van).await {
                Ok(watchers) => {
                    if !watchers.is_empty() {
                        info!(
                            "Wallet {xpub_van}: {n} active watcher(s)",
                            n = watchers.len()
                        );
                    }
                    for watcher in watchers {
                        if shutdown.try_recv() {
                            break;
                        }
                        did_work = true;
                        let recipient_id = watcher.recipient_id.clone();
                        let transfer_watcher = TransferWatcher::new(
                            store.clone(),
                            node.clone(),
                            config.clone(),
                            watcher.wallet,
                            watcher.recipient_id,
                            watcher.asset_id,
                        );
                        if let Err(e) = transfer_watcher.run(&shutdown).await {
                            error!("Error processing watcher {recipient_id}: {e:#}");
                        }
                    }
                }
                Err(e) => error!("Failed to list watchers for {xpub_van}: {e:#}"),
            }
        }

        if did_work {
            last_work = Instant::now();
        } else if last_work.elapsed() >= config.wallet_worker_idle_timeout {
            info!(
                "Wallet {xpub_van}: no work for {elapsed:?}, terminating",
                elapsed = last_work.elapsed()
            );
            break;
        }

        tokio::select! {
            () = shutdown.recv() => break,
            () = tokio::time::sleep(config.wallet_worker_poll_interval) => {}
        }
    }

    info!("Wallet worker for {xpub_van} stopped");
    Ok(())
}

#[cfg(test)]
mod test {
    use ward_store::{JobStatus, JobTrigger};

    use super::*;
    use crate::test_support::{test_config, test_job, test_wallet, MemStore, MockNode};

    #[tokio::test(start_paused = true)]
    async fn drains_jobs_then_idles_out() {
        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let config = Arc::new(test_config());
        let shutdown = ShutdownChannel::new();
        let wallet = test_wallet();

        let mut job = test_job(&wallet, JobTrigger::Manual);
        job.status = JobStatus::Pending;
        store.seed_job(&job).await;

        run_wallet_worker(
            store.clone(),
            node.clone(),
            config,
            wallet.xpub_vanilla.clone(),
            shutdown,
        )
        .await
        .unwrap();

        // The job was processed and the worker exited on idle timeout.
        assert_eq!(store.job_status(job.job_id).await, Some(JobStatus::Completed));
        assert_eq!(node.refresh_calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn serves_watchers_to_completion() {
        use ward_common::time;
        use ward_node_client::models::{Transfer, TransferKind, TransferStatus};

        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let config = Arc::new(test_config());
        let shutdown = ShutdownChannel::new();
        let wallet = test_wallet();

        store
            .seed_watcher(&wallet, "r1", Some("rgb:aaa"), time::now_secs() + 3_600)
            .await;
        node.set_transfers(
            Some("rgb:aaa"),
            vec![Transfer {
                idx: 1,
                batch_transfer_idx: Some(4),
                created_at: 0,
                updated_at: 0,
                status: TransferStatus::Settled,
                kind: TransferKind::ReceiveBlind,
                txid: Some("txid-settled".to_owned()),
                recipient_id: Some("r1".to_owned()),
                expiration: None,
                transport_endpoints: Vec::new(),
            }],
        )
        .await;

        run_wallet_worker(
            store.clone(),
            node,
            config,
            wallet.xpub_vanilla.clone(),
            shutdown,
        )
        .await
        .unwrap();

        // The settled transfer terminated its watcher; nothing remains.
        assert!(store
            .get_watcher(&wallet.xpub_vanilla, "r1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .active_watchers_for_wallet(&wallet.xpub_vanilla)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let config = Arc::new(test_config());
        let shutdown = ShutdownChannel::new();
        shutdown.send();

        run_wallet_worker(
            store,
            node.clone(),
            config,
            "xpub-any".to_owned(),
            shutdown,
        )
        .await
        .unwrap();

        assert_eq!(node.refresh_calls().await, 0);
    }
}
