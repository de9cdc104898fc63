//! Points Ledger - internal points economy for a multi-level commerce platform
//!
//! Append-only ledger of per-user balances with atomic transfers, freezes,
//! a two-phase withdrawal audit and latency-bounded queries.
//!
//! # Modules
//!
//! - [`ledger`] - The ledger engine (store, accessor, components, facade)
//! - [`config`] - YAML application config
//! - [`logging`] - `tracing` subscriber setup
//! - [`db`] - PostgreSQL connection pool

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;

// Convenient re-exports at crate root
pub use ledger::{
    AccountBalance, BalanceView, EntryStatus, EntryType, LedgerEntry, LedgerError, LedgerPolicy,
    LedgerResult, LedgerStatistics, LedgerStore, MemoryLedgerStore, PgLedgerStore, PointsLedger,
    TransactionNo, TransactionPage, UserId,
};
