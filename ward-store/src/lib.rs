//! PostgreSQL-backed durable store for the ward orchestration core.
//!
//! Four tables carry the entire persisted state: `refresh_jobs` (the job
//! queue), `refresh_watchers` (long-lived transfer monitors),
//! `wallet_locks` (TTL-bounded advisory locks), and `withdrawals` (the
//! multi-stage withdrawal state machine's rows). All timestamps are
//! `TIMESTAMPTZ` and therefore UTC.
//!
//! Transactions follow the sqlx discipline: a [`sqlx::Transaction`] commits
//! on an explicit `commit()` and rolls back when dropped, so any `?` inside
//! a transaction scope leaves the database untouched.

pub mod jobs;
pub mod locks;
pub mod pool;
pub mod recovery;
pub mod watchers;
pub mod withdrawals;

pub use jobs::{JobStatus, JobTrigger, RefreshJob};
pub use pool::Store;
pub use watchers::{Watcher, WatcherStatus};
pub use withdrawals::{Withdrawal, WithdrawalSource, WithdrawalStatus};
