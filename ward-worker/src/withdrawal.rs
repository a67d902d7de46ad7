//! The multi-stage withdrawal orchestrator.
//!
//! A withdrawal closes the wallet's outbound Lightning channels, waits for
//! the released funds to materialize on-chain, then sweeps them to the
//! requested destination. Every step persists its progress before moving
//! on, so `process_withdrawal` may be re-invoked after a crash and resumes
//! from the recorded status. Steps are either observational or tolerated
//! on repeat by the node (a double close is rejected, and nothing is
//! retried past `BROADCASTED`), which is what makes the resume safe.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;
use ward_common::{
    config::Config, constants::SWEEP_FEE_ESTIMATE_SATS, shutdown::ShutdownChannel, time,
    wallet::WalletIdentity,
};
use ward_node_client::{
    models::{Assignment, Channel, CloseChannelRequest, SendAssetRequest, SendBtcRequest},
    NodeApi,
};
use ward_store::{Withdrawal, WithdrawalSource, WithdrawalStatus};

use crate::traits::{QueueStore, WithdrawalStore};

/// What is being withdrawn and where it goes. Splitting the flows at the
/// type level keeps the BTC-only fields (address, sats amount) and the
/// asset-only fields (invoice, asset amount) from bleeding into each other.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "flow")]
pub enum WithdrawalFlow {
    Btc {
        address: String,
        /// `None` sweeps the whole spendable balance.
        amount_sats: Option<u64>,
    },
    Asset {
        rgb_invoice: String,
        asset_id: String,
        amount: u64,
    },
}

/// A withdrawal request as received from the edge, post-validation.
#[derive(Clone, Debug, Serialize)]
pub struct WithdrawRequest {
    pub flow: WithdrawalFlow,
    pub fee_rate: u64,
    pub deduct_fee_from_amount: bool,
}

/// Result of [`begin_withdrawal`].
#[derive(Clone, Debug)]
pub struct BeginWithdrawal {
    pub withdrawal_id: Uuid,
    pub status: WithdrawalStatus,
    /// `true` when the idempotency key matched an existing withdrawal.
    pub existing: bool,
}

/// Derive the idempotency key for a request: the sha256 of its canonical
/// JSON, bound to the wallet. Identical requests always produce identical
/// keys, so replays return the original withdrawal.
pub fn idempotency_key(wallet: &WalletIdentity, req: &WithdrawRequest) -> String {
    let canonical = serde_json::to_string(&(wallet, req))
        .expect("Serializing a withdraw request cannot fail");
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(2 * digest.len());
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("withdraw_{hex}")
}

/// Register a withdrawal, or return the existing one for a replayed
/// request. The caller is responsible for driving
/// [`WithdrawalProcessor::process_withdrawal`] afterwards.
pub async fn begin_withdrawal<W: WithdrawalStore>(
    store: &W,
    wallet: &WalletIdentity,
    req: &WithdrawRequest,
) -> Result<BeginWithdrawal> {
    let key = idempotency_key(wallet, req);
    if let Some(existing) = store.get_withdrawal_by_idempotency_key(&key).await? {
        info!(
            "Withdrawal request matched existing {id} (status: {status})",
            id = existing.withdrawal_id,
            status = existing.status,
        );
        return Ok(BeginWithdrawal {
            withdrawal_id: existing.withdrawal_id,
            status: existing.status,
            existing: true,
        });
    }

    let withdrawal_id = Uuid::new_v4();
    let now = time::now_secs();
    let (address_or_invoice, asset_id, asset_amount, amount_sats_requested) = match &req.flow {
        WithdrawalFlow::Btc {
            address,
            amount_sats,
        } => (address.clone(), None, None, amount_sats.map(|a| a as i64)),
        WithdrawalFlow::Asset {
            rgb_invoice,
            asset_id,
            amount,
        } => (
            rgb_invoice.clone(),
            Some(asset_id.clone()),
            Some(*amount as i64),
            None,
        ),
    };

    let withdrawal = Withdrawal {
        withdrawal_id,
        idempotency_key: key,
        wallet: wallet.clone(),
        address_or_invoice,
        asset_id,
        asset_amount,
        source: WithdrawalSource::ChannelsOnly,
        amount_sats_requested,
        amount_sats_sent: None,
        fee_rate: req.fee_rate as i64,
        deduct_fee_from_amount: req.deduct_fee_from_amount,
        fee_sats: None,
        baseline_balance_sats: None,
        balance_wait_started_at: None,
        channel_ids_to_close: Vec::new(),
        close_txids: Vec::new(),
        sweep_txid: None,
        status: WithdrawalStatus::Requested,
        error_code: None,
        error_message: None,
        retryable: false,
        attempt_count: 0,
        last_attempt_at: None,
        created_at: now,
        updated_at: now,
    };
    store.insert_withdrawal(&withdrawal).await?;
    info!("Created withdrawal {withdrawal_id}");
    Ok(BeginWithdrawal {
        withdrawal_id,
        status: WithdrawalStatus::Requested,
        existing: false,
    })
}

/// Channels whose liquidity must be reclaimed for this withdrawal: for BTC,
/// the plain channels with outbound sats; for an asset, the channels
/// carrying that asset with outbound asset units.
pub fn channels_to_close<'c>(
    channels: &'c [Channel],
    asset_id: Option<&str>,
) -> Vec<&'c Channel> {
    channels
        .iter()
        .filter(|channel| match asset_id {
            None =>
                channel.asset_id.is_none()
                    && channel.outbound_balance_msat.unwrap_or(0) > 0,
            Some(asset_id) =>
                channel.asset_id.as_deref() == Some(asset_id)
                    && channel.asset_outbound_amount.unwrap_or(0) > 0,
        })
        .collect()
}

/// Direct BTC send, used by the edge for plain (non-channel) withdrawals.
pub async fn withdraw_btc<N: NodeApi>(
    node: &N,
    wallet: &WalletIdentity,
    address: &str,
    amount_sats: u64,
    fee_rate: u64,
) -> Result<String> {
    let req = SendBtcRequest {
        amount: amount_sats,
        address: address.to_owned(),
        fee_rate,
        skip_sync: false,
    };
    let txid = node
        .send_btc(wallet, &req)
        .await
        .context("BTC withdrawal send failed")?;
    Ok(txid)
}

/// Asset withdrawal via an RGB invoice: decode, send, then locate the
/// resulting transfer's batch index (used to seed a watcher). A missing
/// batch index is tolerated; the send already happened.
pub async fn withdraw_asset<N: NodeApi>(
    node: &N,
    wallet: &WalletIdentity,
    rgb_invoice: &str,
    asset_id: &str,
    amount: u64,
    fee_rate: u64,
) -> Result<(String, Option<i64>)> {
    let decoded = node
        .decode_rgb_invoice(wallet, rgb_invoice)
        .await
        .context("Failed to decode RGB invoice")?;

    let req = SendAssetRequest {
        asset_id: asset_id.to_owned(),
        assignment: Assignment::Fungible { value: amount },
        recipient_id: decoded.recipient_id,
        donation: false,
        fee_rate,
        min_confirmations: 1,
        transport_endpoints: decoded.transport_endpoints,
        skip_sync: false,
    };
    let txid = node
        .send_asset(wallet, &req)
        .await
        .context("Asset withdrawal send failed")?;

    let batch_transfer_idx = match node.list_transfers(wallet, Some(asset_id)).await {
        Ok(transfers) => transfers
            .iter()
            .find(|tr| tr.txid.as_deref() == Some(txid.as_str()))
            .and_then(|tr| tr.batch_transfer_idx),
        Err(e) => {
            warn!("Could not locate batch_transfer_idx for txid {txid}: {e}");
            None
        }
    };
    if batch_transfer_idx.is_none() {
        warn!("No batch_transfer_idx found for txid {txid}; continuing without watcher");
    }
    Ok((txid, batch_transfer_idx))
}

/// Outcome of a single state-machine step.
enum Step {
    /// State advanced; reload the row and keep going.
    Advance,
    /// Waiting on the outside world; sleep and re-check.
    Wait(Duration),
    /// Terminal (or parked); stop processing.
    Done,
}

pub struct WithdrawalProcessor<W, N> {
    store: Arc<W>,
    node: Arc<N>,
    config: Arc<Config>,
}

impl<W: WithdrawalStore + QueueStore, N: NodeApi> WithdrawalProcessor<W, N> {
    pub fn new(store: Arc<W>, node: Arc<N>, config: Arc<Config>) -> Self {
        Self {
            store,
            node,
            config,
        }
    }

    /// Drive a withdrawal from its persisted status to a terminal state.
    /// Reentrant: safe to call again after a crash or restart.
    pub async fn process_withdrawal(
        &self,
        withdrawal_id: Uuid,
        shutdown: &ShutdownChannel,
    ) -> Result<()> {
        info!("Processing withdrawal {withdrawal_id}");
        let result = self.drive(withdrawal_id, shutdown).await;
        if let Err(e) = result {
            error!("Withdrawal {withdrawal_id} processing error: {e:#}");
            self.fail(withdrawal_id, "PROCESSING_ERROR", &format!("{e:#}"), true)
                .await;
        }
        Ok(())
    }

    /// Resume every non-terminal withdrawal; called once at startup.
    pub async fn resume_pending(&self, shutdown: &ShutdownChannel) -> Result<usize> {
        let pending = self.store.resumable_withdrawals().await?;
        let count = pending.len();
        for withdrawal in pending {
            if shutdown.try_recv() {
                break;
            }
            info!(
                "Resuming withdrawal {id} from status {status}",
                id = withdrawal.withdrawal_id,
                status = withdrawal.status,
            );
            self.process_withdrawal(withdrawal.withdrawal_id, shutdown)
                .await?;
        }
        Ok(count)
    }

    async fn drive(&self, withdrawal_id: Uuid, shutdown: &ShutdownChannel) -> Result<()> {
        loop {
            if shutdown.try_recv() {
                return Ok(());
            }
            let Some(mut withdrawal) = self.store.get_withdrawal(withdrawal_id).await? else {
                error!("Withdrawal {withdrawal_id} not found");
                return Ok(());
            };

            let step = match withdrawal.status {
                WithdrawalStatus::Requested => self.step_requested(&mut withdrawal).await?,
                WithdrawalStatus::ClosingChannels =>
                    self.step_close_channels(&mut withdrawal).await?,
                WithdrawalStatus::WaitingCloseConfirmations =>
                    self.step_wait_close(&mut withdrawal).await?,
                WithdrawalStatus::WaitingBalanceUpdate =>
                    self.step_wait_balance(&withdrawal).await?,
                WithdrawalStatus::SweepingOutputs => self.step_sweep(&mut withdrawal).await?,
                WithdrawalStatus::Broadcasted => {
                    // Confirmation tracking is not wired up yet; a broadcast
                    // is treated as confirmed.
                    self.store
                        .update_withdrawal_status(
                            withdrawal_id,
                            WithdrawalStatus::Confirmed,
                            None,
                            None,
                            false,
                        )
                        .await?;
                    info!("Withdrawal {withdrawal_id} completed");
                    Step::Advance
                }
                WithdrawalStatus::Confirmed | WithdrawalStatus::Failed => Step::Done,
            };

            match step {
                Step::Advance => continue,
                Step::Wait(delay) => {
                    tokio::select! {
                        () = shutdown.recv() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Step::Done => return Ok(()),
            }
        }
    }

    /// REQUESTED: snapshot the baseline balance and pick the channels to
    /// close. No channels means the funds are already on-chain, so skip
    /// straight to sweeping.
    async fn step_requested(&self, w: &mut Withdrawal) -> Result<Step> {
        let balance = self.node.get_btc_balance(&w.wallet).await?;
        let baseline = balance.vanilla.spendable;
        info!(
            "Withdrawal {id}: baseline balance {baseline} sats",
            id = w.withdrawal_id
        );
        w.baseline_balance_sats = Some(baseline as i64);
        self.store.save_withdrawal(w).await?;

        let channels = self.node.list_channels(&w.wallet).await?;
        let to_close = channels_to_close(&channels, w.asset_id.as_deref());
        info!(
            "Withdrawal {id}: {n} channel(s) to close",
            id = w.withdrawal_id,
            n = to_close.len()
        );

        if to_close.is_empty() {
            self.store
                .update_withdrawal_status(
                    w.withdrawal_id,
                    WithdrawalStatus::SweepingOutputs,
                    None,
                    None,
                    false,
                )
                .await?;
        } else {
            w.channel_ids_to_close = to_close
                .iter()
                .map(|channel| channel.channel_id.clone())
                .collect();
            self.store.save_withdrawal(w).await?;
            self.store
                .update_withdrawal_status(
                    w.withdrawal_id,
                    WithdrawalStatus::ClosingChannels,
                    None,
                    None,
                    false,
                )
                .await?;
        }
        Ok(Step::Advance)
    }

    /// CLOSING_CHANNELS: cooperatively close every recorded channel. Any
    /// close failure fails the withdrawal (retryable); a channel with no
    /// resolvable peer is skipped. Held under the wallet advisory lock so
    /// no watcher refresh interleaves with the closes.
    async fn step_close_channels(&self, w: &mut Withdrawal) -> Result<Step> {
        let xpub_van = w.wallet.xpub_vanilla.clone();
        if !self
            .store
            .acquire_wallet_lock(&xpub_van, self.config.wallet_lock_ttl)
            .await?
        {
            return Ok(Step::Wait(self.config.close_poll_interval));
        }
        let result = self.close_channels_locked(w).await;
        if let Err(e) = self.store.release_wallet_lock(&xpub_van).await {
            error!("Failed to release wallet lock for {xpub_van}: {e:#}");
        }
        result
    }

    async fn close_channels_locked(&self, w: &mut Withdrawal) -> Result<Step> {
        let mut close_txids = Vec::new();
        for channel_id in &w.channel_ids_to_close {
            let channels = self.node.list_channels(&w.wallet).await?;
            let Some(peer_pubkey) = channels
                .iter()
                .find(|channel| &channel.channel_id == channel_id)
                .and_then(|channel| channel.peer_pubkey.clone())
            else {
                warn!(
                    "Withdrawal {id}: no peer_pubkey for channel {channel_id}, skipping",
                    id = w.withdrawal_id
                );
                continue;
            };

            let req = CloseChannelRequest {
                channel_id: channel_id.clone(),
                peer_pubkey,
                force: false,
            };
            info!(
                "Withdrawal {id}: closing channel {channel_id}",
                id = w.withdrawal_id
            );
            if let Err(e) = self.node.close_channel(&w.wallet, &req).await {
                error!(
                    "Withdrawal {id}: error closing channel {channel_id}: {e}",
                    id = w.withdrawal_id
                );
                self.fail(w.withdrawal_id, "CHANNEL_CLOSE_FAILED", &e.to_string(), true)
                    .await;
                return Ok(Step::Done);
            }

            // Refresh so the node registers the close right away; a failed
            // refresh only delays observation.
            if let Err(e) = self.node.refresh_wallet(&w.wallet).await {
                warn!("Withdrawal {id}: post-close refresh failed: {e}", id = w.withdrawal_id);
            }

            // The node doesn't return the closing txid from a cooperative
            // close; the channel id stands in for it.
            close_txids.push(channel_id.clone());
        }

        w.close_txids = close_txids;
        self.store.save_withdrawal(w).await?;
        self.store
            .update_withdrawal_status(
                w.withdrawal_id,
                WithdrawalStatus::WaitingCloseConfirmations,
                None,
                None,
                false,
            )
            .await?;
        Ok(Step::Advance)
    }

    /// WAITING_CLOSE_CONFIRMATIONS: a channel counts as closed once it
    /// disappears from the channel list or reports Closing/Closed.
    async fn step_wait_close(&self, w: &mut Withdrawal) -> Result<Step> {
        let channels = self.node.list_channels(&w.wallet).await?;
        let all_closed = w.channel_ids_to_close.iter().all(|channel_id| {
            channels
                .iter()
                .find(|channel| &channel.channel_id == channel_id)
                .map(Channel::is_closing_or_closed)
                .unwrap_or(true)
        });

        if !all_closed {
            info!(
                "Withdrawal {id}: still waiting for channel closures",
                id = w.withdrawal_id
            );
            return Ok(Step::Wait(self.config.close_poll_interval));
        }

        w.balance_wait_started_at = Some(time::now_secs());
        self.store.save_withdrawal(w).await?;
        self.store
            .update_withdrawal_status(
                w.withdrawal_id,
                WithdrawalStatus::WaitingBalanceUpdate,
                None,
                None,
                false,
            )
            .await?;
        Ok(Step::Advance)
    }

    /// WAITING_BALANCE_UPDATE: refresh and poll the spendable balance until
    /// it exceeds the baseline, or time out.
    async fn step_wait_balance(&self, w: &Withdrawal) -> Result<Step> {
        let now = time::now_secs();
        let wait_started_at = w.balance_wait_started_at.unwrap_or(w.updated_at);
        let elapsed = now - wait_started_at;
        let timeout = self.config.balance_wait_timeout.as_secs() as i64;

        if elapsed >= timeout {
            warn!(
                "Withdrawal {id}: timed out waiting for balance update ({elapsed}s)",
                id = w.withdrawal_id
            );
            self.fail(
                w.withdrawal_id,
                "BALANCE_UPDATE_TIMEOUT",
                &format!(
                    "Balance did not increase after {elapsed}s. \
                     Channel close may still be pending."
                ),
                true,
            )
            .await;
            return Ok(Step::Done);
        }

        if let Err(e) = self.node.refresh_wallet(&w.wallet).await {
            warn!("Withdrawal {id}: refresh failed: {e}", id = w.withdrawal_id);
        }

        let balance = self.node.get_btc_balance(&w.wallet).await?;
        let current = balance.vanilla.spendable as i64;
        let baseline = w.baseline_balance_sats.unwrap_or(0);
        info!(
            "Withdrawal {id}: balance {current} sats (baseline {baseline})",
            id = w.withdrawal_id
        );

        if current > baseline {
            self.store
                .update_withdrawal_status(
                    w.withdrawal_id,
                    WithdrawalStatus::SweepingOutputs,
                    None,
                    None,
                    false,
                )
                .await?;
            Ok(Step::Advance)
        } else {
            Ok(Step::Wait(self.config.balance_poll_interval))
        }
    }

    /// SWEEPING_OUTPUTS: send the funds to their destination and record the
    /// broadcast. A send failure fails the withdrawal (retryable); nothing
    /// is ever re-sent past this point. Held under the wallet advisory
    /// lock, like every destructive wallet operation.
    async fn step_sweep(&self, w: &mut Withdrawal) -> Result<Step> {
        let xpub_van = w.wallet.xpub_vanilla.clone();
        if !self
            .store
            .acquire_wallet_lock(&xpub_van, self.config.wallet_lock_ttl)
            .await?
        {
            return Ok(Step::Wait(self.config.balance_poll_interval));
        }
        let result = self.sweep_locked(w).await;
        if let Err(e) = self.store.release_wallet_lock(&xpub_van).await {
            error!("Failed to release wallet lock for {xpub_van}: {e:#}");
        }
        result
    }

    async fn sweep_locked(&self, w: &mut Withdrawal) -> Result<Step> {
        let send_result = match w.asset_id.clone() {
            None => self.sweep_btc(w).await,
            Some(asset_id) => {
                let rgb_invoice = w.address_or_invoice.clone();
                let amount = w.asset_amount.unwrap_or(0) as u64;
                withdraw_asset(
                    self.node.as_ref(),
                    &w.wallet,
                    &rgb_invoice,
                    &asset_id,
                    amount,
                    w.fee_rate as u64,
                )
                .await
                .map(|(txid, _batch_idx)| txid)
            }
        };

        let txid = match send_result {
            Ok(txid) => txid,
            Err(e) => {
                error!(
                    "Withdrawal {id}: error sweeping outputs: {e:#}",
                    id = w.withdrawal_id
                );
                self.fail(w.withdrawal_id, "SWEEP_FAILED", &format!("{e:#}"), true)
                    .await;
                return Ok(Step::Done);
            }
        };

        info!(
            "Withdrawal {id}: broadcasted sweep {txid}",
            id = w.withdrawal_id
        );
        w.sweep_txid = Some(txid);
        self.store.save_withdrawal(w).await?;
        self.store
            .update_withdrawal_status(
                w.withdrawal_id,
                WithdrawalStatus::Broadcasted,
                None,
                None,
                false,
            )
            .await?;
        Ok(Step::Advance)
    }

    async fn sweep_btc(&self, w: &mut Withdrawal) -> Result<String> {
        let balance = self.node.get_btc_balance(&w.wallet).await?;
        let spendable = balance.vanilla.spendable;

        let mut amount_sats = match w.amount_sats_requested {
            Some(requested) => requested as u64,
            None => {
                info!(
                    "Withdrawal {id}: no amount specified, sweeping max {spendable} sats",
                    id = w.withdrawal_id
                );
                spendable
            }
        };

        if w.deduct_fee_from_amount {
            amount_sats = amount_sats.saturating_sub(SWEEP_FEE_ESTIMATE_SATS);
            w.fee_sats = Some(SWEEP_FEE_ESTIMATE_SATS as i64);
        } else {
            w.fee_sats = None;
        }

        let req = SendBtcRequest {
            amount: amount_sats,
            address: w.address_or_invoice.clone(),
            fee_rate: w.fee_rate as u64,
            skip_sync: false,
        };
        let txid = self.node.send_btc(&w.wallet, &req).await?;
        w.amount_sats_sent = Some(amount_sats as i64);
        Ok(txid)
    }

    /// Record a failure; best effort, the row keeps its previous status if
    /// even this write fails.
    async fn fail(&self, withdrawal_id: Uuid, code: &str, message: &str, retryable: bool) {
        if let Err(e) = self
            .store
            .update_withdrawal_status(
                withdrawal_id,
                WithdrawalStatus::Failed,
                Some(code),
                Some(message),
                retryable,
            )
            .await
        {
            error!("Failed to record withdrawal {withdrawal_id} failure: {e:#}");
        }
    }
}
