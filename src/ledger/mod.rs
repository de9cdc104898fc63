//! Points Ledger Engine
//!
//! Append-only ledger of per-user point balances. Every mutation is one
//! atomic posting against a [`LedgerStore`]: the touched accounts are locked
//! in ascending user-id order, each balance change goes through the
//! [Balance Accessor](accessor::adjust), and the entries are inserted under a
//! unique `transaction_no`.
//!
//! # Components
//! - [`accessor`]: `0 <= frozen <= balance` enforcement
//! - [`transfer`]: two-party transfers, batches, frozen settlement
//! - [`freeze`]: available <-> frozen moves
//! - [`funding`]: recharge and the withdrawal audit workflow
//! - [`query`]: listings with a latency ceiling and degraded fallback
//! - [`service`]: the [`PointsLedger`] facade
//!
//! # Example
//! ```ignore
//! let ledger = PointsLedger::in_memory(LedgerPolicy::default());
//! ledger.open_account(1).await?;
//! ledger.recharge(RechargeRequest::new(1, dec!(500), "bank_card")).await?;
//! ```

pub mod accessor;
pub mod error;
pub mod freeze;
pub mod funding;
pub mod policy;
pub mod query;
pub mod service;
pub mod state;
pub mod store;
pub mod transfer;
pub mod types;

pub use accessor::{BalanceDelta, MAX_LEDGER_AMOUNT, adjust};
pub use error::{LedgerError, LedgerResult};
pub use freeze::{FreezeController, HoldRequest};
pub use funding::{FundingWorkflow, RechargeRequest, WithdrawalAudit, WithdrawalRequest};
pub use policy::{DailyWindow, LedgerPolicy};
pub use query::{QueryService, QuerySettings, TransactionFilter};
pub use service::{Adjustment, PointsLedger};
pub use state::{EntryStatus, WithdrawalDecision};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use transfer::{BatchItemResult, BatchTransferItem, TransferEngine, TransferRequest};
pub use types::{
    AccountBalance, BalanceView, EntryType, Flow, LedgerEntry, LedgerStatistics, TransactionNo,
    TransactionPage, UserId,
};
