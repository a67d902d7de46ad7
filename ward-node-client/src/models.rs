//! Wire models for the wallet node API.
//!
//! Field names mirror the node's JSON exactly; optional fields default so
//! the client tolerates older node builds omitting them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ward_common::constants::RGB_INVOICE_DURATION_SECS;

// --- Transfers --- //

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    WaitingCounterparty,
    WaitingConfirmations,
    Settled,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Issuance,
    ReceiveBlind,
    ReceiveWitness,
    Send,
    Inflation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferTransportEndpoint {
    pub endpoint: String,
    pub transport_type: String,
    pub used: bool,
}

/// A node-tracked receive / send operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transfer {
    pub idx: i64,
    #[serde(default)]
    pub batch_transfer_idx: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: TransferStatus,
    pub kind: TransferKind,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub transport_endpoints: Vec<TransferTransportEndpoint>,
}

impl Transfer {
    /// A transfer is terminal once the node will never change it again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TransferStatus::Settled | TransferStatus::Failed)
    }

    /// Only blind receives carry a meaningful expiration: the counterparty
    /// never showed up within the invoice window.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.kind == TransferKind::ReceiveBlind
            && self.expiration.is_some_and(|expiration| expiration < now)
    }

    /// Whether this transfer may be actively failed at the node.
    ///
    /// Requires `WaitingCounterparty` with an elapsed expiration, and either
    /// a blind receive or an expiration a full invoice-lifetime in the past.
    pub fn can_cancel_at(&self, now: i64) -> bool {
        if self.status != TransferStatus::WaitingCounterparty {
            return false;
        }
        let Some(expiration) = self.expiration else {
            return false;
        };
        if expiration >= now {
            return false;
        }
        self.kind == TransferKind::ReceiveBlind
            || expiration + RGB_INVOICE_DURATION_SECS < now
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListTransfersRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListTransfersResponse {
    pub transfers: Vec<Transfer>,
}

// --- Refresh --- //

/// Per-transfer outcome of a wallet refresh, keyed by `batch_transfer_idx`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshResponse(pub HashMap<String, RefreshedTransfer>);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshedTransfer {
    #[serde(default)]
    pub updated_status: Option<TransferStatus>,
    #[serde(default)]
    pub failure: Option<RefreshFailure>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshFailure {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub details: Option<String>,
}

impl RefreshResponse {
    /// Failure details reported for the given batch transfer, if any.
    pub fn failure_details(&self, batch_transfer_idx: i64) -> Option<&str> {
        self.0
            .get(&batch_transfer_idx.to_string())
            .and_then(|refreshed| refreshed.failure.as_ref())
            .and_then(|failure| failure.details.as_deref())
    }
}

// --- Assets --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetBalance {
    pub settled: u64,
    pub future: u64,
    pub spendable: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub balance: Option<AssetBalance>,
}

/// The node groups assets by schema; the core only cares about the union.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListAssetsResponse {
    #[serde(default)]
    pub nia: Option<Vec<Asset>>,
    #[serde(default)]
    pub uda: Option<Vec<Asset>>,
    #[serde(default)]
    pub cfa: Option<Vec<Asset>>,
}

impl ListAssetsResponse {
    pub fn into_assets(self) -> Vec<Asset> {
        let mut assets = Vec::new();
        for group in [self.nia, self.uda, self.cfa] {
            assets.extend(group.into_iter().flatten());
        }
        assets
    }
}

// --- Balances --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BtcBalance {
    pub settled: u64,
    pub future: u64,
    pub spendable: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BtcBalanceResponse {
    pub vanilla: BtcBalance,
    pub colored: BtcBalance,
}

// --- Channels --- //

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Opening,
    Opened,
    Closing,
    Closed,
    /// Forward-compat: any status this build doesn't know about.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    #[serde(default)]
    pub funding_txid: Option<String>,
    #[serde(default)]
    pub peer_pubkey: Option<String>,
    pub status: ChannelStatus,
    #[serde(default)]
    pub outbound_balance_msat: Option<u64>,
    #[serde(default)]
    pub inbound_balance_msat: Option<u64>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub asset_outbound_amount: Option<u64>,
    #[serde(default)]
    pub asset_inbound_amount: Option<u64>,
}

impl Channel {
    /// Whether a close has been initiated or completed at the node.
    pub fn is_closing_or_closed(&self) -> bool {
        matches!(self.status, ChannelStatus::Closing | ChannelStatus::Closed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListChannelsResponse {
    pub channels: Vec<Channel>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub peer_pubkey_and_addr: String,
    pub capacity_sat: u64,
    #[serde(default)]
    pub push_msat: u64,
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_base_msat: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_proportional_millionths: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub temporary_channel_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseChannelRequest {
    pub channel_id: String,
    pub peer_pubkey: String,
    pub force: bool,
}

// --- Sends --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendBtcRequest {
    pub amount: u64,
    pub address: String,
    pub fee_rate: u64,
    pub skip_sync: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendBtcResponse {
    pub txid: String,
}

/// RGB value assignment for an asset send.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Assignment {
    Fungible { value: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendAssetRequest {
    pub asset_id: String,
    pub assignment: Assignment,
    pub recipient_id: String,
    pub donation: bool,
    pub fee_rate: u64,
    pub min_confirmations: u8,
    pub transport_endpoints: Vec<String>,
    pub skip_sync: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendAssetResponse {
    pub txid: String,
}

// --- Fail transfers --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailTransfersRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_transfer_idx: Option<i64>,
    pub no_asset_only: bool,
    pub skip_sync: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailTransfersResponse {
    pub transfers_changed: bool,
}

// --- Invoices --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodeRgbInvoiceRequest {
    pub invoice: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedRgbInvoice {
    pub recipient_id: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub expiration_timestamp: Option<i64>,
    #[serde(default)]
    pub transport_endpoints: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RgbInvoiceRequest {
    pub min_confirmations: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    pub witness: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RgbInvoice {
    pub invoice: String,
    pub recipient_id: String,
    #[serde(default)]
    pub expiration_timestamp: Option<i64>,
    #[serde(default)]
    pub batch_transfer_idx: Option<i64>,
}

// --- Transactions --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockTime {
    pub height: u32,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_type: String,
    pub txid: String,
    pub received: u64,
    pub sent: u64,
    pub fee: u64,
    #[serde(default)]
    pub confirmation_time: Option<BlockTime>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListTransactionsResponse {
    pub transactions: Vec<Transaction>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn transfer(status: TransferStatus, kind: TransferKind, expiration: Option<i64>) -> Transfer {
        Transfer {
            idx: 1,
            batch_transfer_idx: Some(7),
            created_at: 0,
            updated_at: 0,
            status,
            kind,
            txid: None,
            recipient_id: Some("r1".to_owned()),
            expiration,
            transport_endpoints: Vec::new(),
        }
    }

    #[test]
    fn terminal_statuses() {
        use TransferKind::*;
        use TransferStatus::*;
        assert!(transfer(Settled, Send, None).is_terminal());
        assert!(transfer(Failed, Send, None).is_terminal());
        assert!(!transfer(WaitingCounterparty, Send, None).is_terminal());
        assert!(!transfer(WaitingConfirmations, Send, None).is_terminal());
    }

    #[test]
    fn only_blind_receives_expire() {
        use TransferKind::*;
        use TransferStatus::*;
        let now = 1_000;
        assert!(transfer(WaitingCounterparty, ReceiveBlind, Some(now - 10)).is_expired_at(now));
        assert!(!transfer(WaitingCounterparty, ReceiveBlind, Some(now + 10)).is_expired_at(now));
        assert!(!transfer(WaitingCounterparty, ReceiveWitness, Some(now - 10)).is_expired_at(now));
        assert!(!transfer(WaitingCounterparty, ReceiveBlind, None).is_expired_at(now));
    }

    #[test]
    fn cancellation_predicate() {
        use TransferKind::*;
        use TransferStatus::*;
        let now = 1_000_000;

        // Blind receive past expiration: cancellable.
        assert!(transfer(WaitingCounterparty, ReceiveBlind, Some(now - 10)).can_cancel_at(now));
        // Expiration not yet elapsed: not cancellable.
        assert!(!transfer(WaitingCounterparty, ReceiveBlind, Some(now + 10)).can_cancel_at(now));
        // Wrong status: not cancellable even when expired.
        assert!(!transfer(WaitingConfirmations, ReceiveBlind, Some(now - 10)).can_cancel_at(now));
        // No expiration: never cancellable.
        assert!(!transfer(WaitingCounterparty, ReceiveBlind, None).can_cancel_at(now));

        // Witness receive needs a full invoice-lifetime past expiration.
        let barely_expired = now - 10;
        let long_expired = now - RGB_INVOICE_DURATION_SECS - 10;
        assert!(!transfer(WaitingCounterparty, ReceiveWitness, Some(barely_expired))
            .can_cancel_at(now));
        assert!(transfer(WaitingCounterparty, ReceiveWitness, Some(long_expired))
            .can_cancel_at(now));
    }

    #[test]
    fn refresh_response_failure_lookup() {
        let json = r#"{
            "3": { "updated_status": "Settled" },
            "7": { "failure": { "code": 2011, "details": "recipient unreachable" } }
        }"#;
        let resp: RefreshResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.failure_details(7), Some("recipient unreachable"));
        assert_eq!(resp.failure_details(3), None);
        assert_eq!(resp.failure_details(42), None);
    }

    #[test]
    fn transfer_deserializes_node_json() {
        let json = r#"{
            "idx": 4,
            "batch_transfer_idx": 4,
            "created_at": 1700000000,
            "updated_at": 1700000100,
            "status": "WaitingCounterparty",
            "kind": "ReceiveBlind",
            "recipient_id": "utxob:abcdef",
            "expiration": 1700086400,
            "transport_endpoints": [
                { "endpoint": "rpc://proxy", "transport_type": "JsonRpc", "used": false }
            ]
        }"#;
        let transfer: Transfer = serde_json::from_str(json).unwrap();
        assert_eq!(transfer.status, TransferStatus::WaitingCounterparty);
        assert_eq!(transfer.kind, TransferKind::ReceiveBlind);
        assert_eq!(transfer.recipient_id.as_deref(), Some("utxob:abcdef"));
        assert!(transfer.txid.is_none());
    }

    #[test]
    fn unknown_channel_status_decodes() {
        let json = r#"{
            "channel_id": "chan1",
            "peer_pubkey": "02abc",
            "status": "PendingSplice",
            "outbound_balance_msat": 500000
        }"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.status, ChannelStatus::Unknown);
        assert!(!channel.is_closing_or_closed());
    }

    #[test]
    fn assets_flatten_across_schemas() {
        let json = r#"{
            "nia": [ { "asset_id": "rgb:aaa", "ticker": "USDT", "precision": 0 } ],
            "cfa": [ { "asset_id": "rgb:bbb" } ]
        }"#;
        let resp: ListAssetsResponse = serde_json::from_str(json).unwrap();
        let assets = resp.into_assets();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].asset_id, "rgb:aaa");
        assert_eq!(assets[1].asset_id, "rgb:bbb");
    }

    #[test]
    fn fungible_assignment_wire_format() {
        let assignment = Assignment::Fungible { value: 42 };
        let json = serde_json::to_value(&assignment).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "Fungible", "value": 42 }));
    }
}
