//! PointsLedger facade
//!
//! One handle over the store and the components built on it. Every
//! mutation returns the committed entry (and so its `transaction_no`).

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::accessor::BalanceDelta;
use super::error::{LedgerError, LedgerResult};
use super::freeze::{FreezeController, HoldRequest};
use super::funding::{FundingWorkflow, RechargeRequest, WithdrawalAudit, WithdrawalRequest};
use super::policy::LedgerPolicy;
use super::query::{QueryService, QuerySettings, TransactionFilter};
use super::state::EntryStatus;
use super::store::{LedgerStore, MemoryLedgerStore, NewEntry, Posting};
use super::transfer::{BatchItemResult, BatchTransferItem, TransferEngine, TransferRequest};
use super::types::{
    AccountBalance, BalanceView, EntryType, Flow, LedgerEntry, LedgerStatistics, TransactionNo,
    TransactionPage, UserId,
};

/// Administrative balance correction, recorded as a regular entry
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub user_id: UserId,
    pub balance_delta: Decimal,
    pub frozen_delta: Decimal,
    /// Credits need a platform-origin type (RECHARGE, REFUND, COMMISSION,
    /// REWARD); debits a spending type; pure frozen moves FREEZE/UNFREEZE
    pub entry_type: EntryType,
    pub description: Option<String>,
    pub transaction_no: Option<TransactionNo>,
}

pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
    transfers: TransferEngine,
    holds: FreezeController,
    funding: FundingWorkflow,
    queries: QueryService,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LedgerStore>, settings: QuerySettings) -> Self {
        info!(store = store.name(), "Points ledger initialized");
        Self {
            transfers: TransferEngine::new(store.clone()),
            holds: FreezeController::new(store.clone()),
            funding: FundingWorkflow::new(store.clone()),
            queries: QueryService::new(store.clone(), settings),
            store,
        }
    }

    /// Ledger over the in-process store
    pub fn in_memory(policy: LedgerPolicy) -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new(policy)), QuerySettings::default())
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    // === Accounts & policy ===

    pub async fn open_account(&self, user_id: UserId) -> LedgerResult<AccountBalance> {
        self.store.open_account(user_id).await
    }

    pub async fn policy(&self) -> LedgerResult<LedgerPolicy> {
        self.store.load_policy().await
    }

    /// Persist a new policy; takes effect on the next call
    pub async fn update_policy(&self, policy: &LedgerPolicy) -> LedgerResult<()> {
        self.store.save_policy(policy).await?;
        info!(
            min_transfer_amount = %policy.min_transfer_amount,
            max_transfer_amount = %policy.max_transfer_amount,
            daily_transfer_limit = %policy.daily_transfer_limit,
            transfer_fee_rate = %policy.transfer_fee_rate,
            "Ledger policy updated"
        );
        Ok(())
    }

    /// Apply a raw balance/frozen delta paired with its own entry
    pub async fn adjust(&self, adj: Adjustment) -> LedgerResult<LedgerEntry> {
        let policy = self.store.load_policy().await?;
        let (from_user_id, amount) = check_adjustment(&adj)?;
        let amount = policy.check_amount(amount)?;
        // both deltas obey the amount rules, not just the recorded one
        for delta in [adj.balance_delta, adj.frozen_delta] {
            if !delta.is_zero() {
                policy.check_amount(delta.abs())?;
            }
        }
        let transaction_no = TransactionNo::or_generate(adj.transaction_no.clone(), adj.entry_type);

        let entry = NewEntry {
            transaction_no: transaction_no.clone(),
            from_user_id,
            to_user_id: adj.user_id,
            amount,
            fee: Decimal::ZERO,
            entry_type: adj.entry_type,
            status: EntryStatus::Completed,
            snapshot_user: adj.user_id,
            description: adj.description.clone(),
            metadata: Some(serde_json::json!({
                "adjustment": {
                    "balance_delta": adj.balance_delta,
                    "frozen_delta": adj.frozen_delta,
                }
            })),
        };
        let delta = BalanceDelta::new(adj.user_id, adj.balance_delta, adj.frozen_delta);

        match self.store.commit(Posting::single(entry, vec![delta])).await {
            Ok(rows) => {
                let entry = rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| LedgerError::Storage("posting returned no rows".to_string()))?;
                info!(
                    transaction_no = %entry.transaction_no,
                    user_id = adj.user_id,
                    balance_delta = %adj.balance_delta,
                    frozen_delta = %adj.frozen_delta,
                    "Balance adjusted"
                );
                Ok(entry)
            }
            Err(e) => {
                warn!(
                    transaction_no = %transaction_no,
                    user_id = adj.user_id,
                    code = e.code(),
                    "Adjustment rejected: {}", e
                );
                Err(e)
            }
        }
    }

    // === Transfers ===

    pub async fn transfer(&self, req: TransferRequest) -> LedgerResult<LedgerEntry> {
        self.transfers.transfer(req).await
    }

    pub async fn batch_transfer(
        &self,
        items: Vec<BatchTransferItem>,
        entry_type: EntryType,
    ) -> Vec<BatchItemResult> {
        self.transfers.batch_transfer(items, entry_type).await
    }

    pub async fn settle_frozen(&self, req: TransferRequest) -> LedgerResult<LedgerEntry> {
        self.transfers.settle_frozen(req).await
    }

    // === Holds ===

    pub async fn freeze(&self, req: HoldRequest) -> LedgerResult<TransactionNo> {
        self.holds.freeze(req).await
    }

    pub async fn unfreeze(&self, req: HoldRequest) -> LedgerResult<TransactionNo> {
        self.holds.unfreeze(req).await
    }

    // === Recharge / withdrawal ===

    pub async fn recharge(&self, req: RechargeRequest) -> LedgerResult<LedgerEntry> {
        self.funding.recharge(req).await
    }

    pub async fn request_withdrawal(&self, req: WithdrawalRequest) -> LedgerResult<LedgerEntry> {
        self.funding.request_withdrawal(req).await
    }

    pub async fn audit_withdrawal(&self, audit: WithdrawalAudit) -> LedgerResult<LedgerEntry> {
        self.funding.audit_withdrawal(audit).await
    }

    pub async fn pending_withdrawals(&self, page: u32, per_page: u32) -> LedgerResult<TransactionPage> {
        self.funding.pending_withdrawals(page, per_page).await
    }

    // === Queries ===

    pub async fn get_transactions(
        &self,
        user_id: UserId,
        page: u32,
        per_page: u32,
        filter: TransactionFilter,
    ) -> LedgerResult<TransactionPage> {
        self.queries.get_transactions(user_id, page, per_page, filter).await
    }

    pub async fn get_balance(&self, user_id: UserId) -> LedgerResult<BalanceView> {
        self.queries.get_balance(user_id).await
    }

    pub async fn get_statistics(&self, user_id: UserId) -> LedgerResult<LedgerStatistics> {
        self.queries.get_statistics(user_id).await
    }

    pub async fn get_transaction(&self, transaction_no: &TransactionNo) -> LedgerResult<LedgerEntry> {
        self.queries.get_transaction(transaction_no).await
    }
}

/// Sender side and entry amount of an adjustment, or why its type is wrong
fn check_adjustment(adj: &Adjustment) -> LedgerResult<(Option<UserId>, Decimal)> {
    let zero = Decimal::ZERO;
    let flow = adj.entry_type.flow();
    let mismatch = || {
        LedgerError::InvalidEntryType(format!(
            "{} cannot record a balance delta of {} / frozen delta of {}",
            adj.entry_type, adj.balance_delta, adj.frozen_delta
        ))
    };

    if adj.balance_delta > zero {
        if !adj.entry_type.allows_system_origin() {
            return Err(mismatch());
        }
        Ok((None, adj.balance_delta))
    } else if adj.balance_delta < zero {
        if !matches!(flow, Flow::DebitOnly | Flow::Bidirectional) {
            return Err(mismatch());
        }
        Ok((Some(adj.user_id), -adj.balance_delta))
    } else if adj.frozen_delta > zero {
        if adj.entry_type != EntryType::Freeze {
            return Err(mismatch());
        }
        Ok((Some(adj.user_id), adj.frozen_delta))
    } else if adj.frozen_delta < zero {
        if adj.entry_type != EntryType::Unfreeze {
            return Err(mismatch());
        }
        Ok((Some(adj.user_id), -adj.frozen_delta))
    } else {
        Err(LedgerError::InvalidAmount("adjustment changes nothing".to_string()))
    }
}
