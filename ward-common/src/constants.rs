//! Service-wide constants.

/// Lifetime of a freshly issued RGB invoice at the node.
///
/// A `WaitingCounterparty` transfer whose expiration lies more than this far
/// in the past is cancellable even when it is not a blind receive.
pub const RGB_INVOICE_DURATION_SECS: i64 = 86_400;

/// Flat estimate subtracted from the sweep amount when the withdrawal asks
/// to deduct the fee from the amount.
// TODO: replace with the node-side fee estimator endpoint once it ships.
pub const SWEEP_FEE_ESTIMATE_SATS: u64 = 1_000;
