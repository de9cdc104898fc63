//! Freeze Controller
//!
//! Moves funds between available and frozen without changing the total
//! balance. Holds are tied to pending orders through `related_order_id`.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::accessor::BalanceDelta;
use super::error::LedgerResult;
use super::state::EntryStatus;
use super::store::{LedgerStore, NewEntry, Posting};
use super::transfer::order_metadata;
use super::types::{EntryType, TransactionNo, UserId};

/// Freeze or unfreeze request
#[derive(Debug, Clone, PartialEq)]
pub struct HoldRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub related_order_id: Option<String>,
    pub transaction_no: Option<TransactionNo>,
}

impl HoldRequest {
    pub fn new(user_id: UserId, amount: Decimal) -> Self {
        Self {
            user_id,
            amount,
            reason: None,
            related_order_id: None,
            transaction_no: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_order(mut self, related_order_id: impl Into<String>) -> Self {
        self.related_order_id = Some(related_order_id.into());
        self
    }

    pub fn with_transaction_no(mut self, transaction_no: TransactionNo) -> Self {
        self.transaction_no = Some(transaction_no);
        self
    }
}

/// Freeze Controller
pub struct FreezeController {
    store: Arc<dyn LedgerStore>,
}

impl FreezeController {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// `frozen += amount`; requires available >= amount
    pub async fn freeze(&self, req: HoldRequest) -> LedgerResult<TransactionNo> {
        self.hold(req, EntryType::Freeze).await
    }

    /// `frozen -= amount`; requires frozen >= amount
    pub async fn unfreeze(&self, req: HoldRequest) -> LedgerResult<TransactionNo> {
        self.hold(req, EntryType::Unfreeze).await
    }

    async fn hold(&self, req: HoldRequest, entry_type: EntryType) -> LedgerResult<TransactionNo> {
        let policy = self.store.load_policy().await?;
        let amount = policy.check_amount(req.amount)?;
        let transaction_no = TransactionNo::or_generate(req.transaction_no, entry_type);

        let delta = match entry_type {
            EntryType::Freeze => BalanceDelta::freeze(req.user_id, amount),
            _ => BalanceDelta::unfreeze(req.user_id, amount),
        };
        let entry = NewEntry {
            transaction_no: transaction_no.clone(),
            from_user_id: Some(req.user_id),
            to_user_id: req.user_id,
            amount,
            fee: Decimal::ZERO,
            entry_type,
            status: EntryStatus::Completed,
            snapshot_user: req.user_id,
            description: req.reason,
            metadata: order_metadata(req.related_order_id.as_deref()),
        };

        match self.store.commit(Posting::single(entry, vec![delta])).await {
            Ok(_) => {
                info!(
                    transaction_no = %transaction_no,
                    user_id = req.user_id,
                    amount = %amount,
                    related_order_id = ?req.related_order_id,
                    "{} committed", entry_type
                );
                Ok(transaction_no)
            }
            Err(e) => {
                warn!(
                    transaction_no = %transaction_no,
                    user_id = req.user_id,
                    amount = %amount,
                    code = e.code(),
                    "{} rejected: {}", entry_type, e
                );
                Err(e)
            }
        }
    }
}
