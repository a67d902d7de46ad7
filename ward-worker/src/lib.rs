//! The orchestration core: supervisor, per-wallet workers, transfer
//! watchers, and the withdrawal state machine.
//!
//! Concurrency model: the supervisor owns one OS process per wallet, so all
//! operations on a single wallet are strictly serialized while different
//! wallets proceed in parallel. Inside a worker everything is cooperative
//! async on one task; suspension points are node HTTP calls, store
//! round-trips, and intentional sleeps. Long-running loops consult the
//! shared [`ShutdownChannel`] between ticks and never interrupt an
//! in-flight RPC.
//!
//! [`ShutdownChannel`]: ward_common::shutdown::ShutdownChannel

pub mod job_processor;
pub mod supervisor;
pub mod traits;
pub mod transfer_watcher;
pub mod wallet_worker;
pub mod withdrawal;

#[cfg(test)]
mod test_support;
