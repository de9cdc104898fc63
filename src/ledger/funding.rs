//! Recharge / Withdrawal Workflow
//!
//! Recharge is a one-sided platform credit. Withdrawal is two-phase:
//!
//! ```text
//! request_withdrawal ── FREEZE + WITHDRAW(PENDING) ──┐
//!                                                    │ audit_withdrawal
//!                       approve: balance -= x, frozen -= x → COMPLETED
//!                       reject:  UNFREEZE x               → CANCELLED
//! ```

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::accessor::BalanceDelta;
use super::error::{LedgerError, LedgerResult};
use super::state::{EntryStatus, WithdrawalDecision};
use super::store::{EntryQuery, LedgerStore, NewEntry, Posting, PostingLeg, Resolution};
use super::types::{EntryType, LedgerEntry, TransactionNo, TransactionPage, UserId};

const HOLD_SUFFIX: &str = "FZ";
const RELEASE_SUFFIX: &str = "UF";
const MAX_PER_PAGE: u32 = 100;

/// Platform credit after an external payment settled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RechargeRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    /// Payment method label supplied by the gateway collaborator
    pub method: String,
    pub description: Option<String>,
    pub operator_id: Option<UserId>,
    pub transaction_no: Option<TransactionNo>,
}

impl RechargeRequest {
    pub fn new(user_id: UserId, amount: Decimal, method: impl Into<String>) -> Self {
        Self {
            user_id,
            amount,
            method: method.into(),
            description: None,
            operator_id: None,
            transaction_no: None,
        }
    }

    pub fn with_transaction_no(mut self, transaction_no: TransactionNo) -> Self {
        self.transaction_no = Some(transaction_no);
        self
    }
}

/// Withdrawal request; `payout_info` is opaque to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub payout_info: serde_json::Value,
    pub note: Option<String>,
    pub transaction_no: Option<TransactionNo>,
}

impl WithdrawalRequest {
    pub fn new(user_id: UserId, amount: Decimal, payout_info: serde_json::Value) -> Self {
        Self {
            user_id,
            amount,
            payout_info,
            note: None,
            transaction_no: None,
        }
    }

    pub fn with_transaction_no(mut self, transaction_no: TransactionNo) -> Self {
        self.transaction_no = Some(transaction_no);
        self
    }
}

/// Auditor verdict on a pending withdrawal
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalAudit {
    pub transaction_no: TransactionNo,
    pub decision: WithdrawalDecision,
    pub note: Option<String>,
    pub auditor_id: UserId,
}

/// Recharge / Withdrawal Workflow
pub struct FundingWorkflow {
    store: Arc<dyn LedgerStore>,
}

impl FundingWorkflow {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// `balance += amount` from the platform; COMPLETED RECHARGE
    pub async fn recharge(&self, req: RechargeRequest) -> LedgerResult<LedgerEntry> {
        let policy = self.store.load_policy().await?;
        let amount = policy.check_amount(req.amount)?;
        let transaction_no = TransactionNo::or_generate(req.transaction_no, EntryType::Recharge);

        let entry = NewEntry {
            transaction_no: transaction_no.clone(),
            from_user_id: None,
            to_user_id: req.user_id,
            amount,
            fee: Decimal::ZERO,
            entry_type: EntryType::Recharge,
            status: EntryStatus::Completed,
            snapshot_user: req.user_id,
            description: req.description,
            metadata: Some(serde_json::json!({
                "method": req.method,
                "operator_id": req.operator_id,
            })),
        };

        let rows = self
            .store
            .commit(Posting::single(entry, vec![BalanceDelta::credit(req.user_id, amount)]))
            .await
            .inspect_err(|e| {
                warn!(
                    transaction_no = %transaction_no,
                    user_id = req.user_id,
                    amount = %amount,
                    code = e.code(),
                    "Recharge rejected: {}", e
                )
            })?;
        let entry = single_row(rows)?;

        info!(
            transaction_no = %entry.transaction_no,
            user_id = req.user_id,
            amount = %amount,
            balance_after = %entry.balance_after,
            "Recharge committed"
        );
        Ok(entry)
    }

    /// Freeze the amount and record a PENDING WITHDRAW, atomically
    ///
    /// The hold is written as a FREEZE entry numbered `<transaction_no>-FZ`.
    /// Returns the pending WITHDRAW entry.
    pub async fn request_withdrawal(&self, req: WithdrawalRequest) -> LedgerResult<LedgerEntry> {
        let policy = self.store.load_policy().await?;
        let amount = policy.check_amount(req.amount)?;
        if amount < policy.min_withdrawal_amount {
            return Err(LedgerError::LimitExceeded(format!(
                "withdrawal {} is below the minimum {}",
                amount, policy.min_withdrawal_amount
            )));
        }
        let transaction_no = TransactionNo::or_generate(req.transaction_no, EntryType::Withdraw);
        let user_id = req.user_id;

        let hold = NewEntry {
            transaction_no: transaction_no.derived(HOLD_SUFFIX),
            from_user_id: Some(user_id),
            to_user_id: user_id,
            amount,
            fee: Decimal::ZERO,
            entry_type: EntryType::Freeze,
            status: EntryStatus::Completed,
            snapshot_user: user_id,
            description: Some(format!("hold for withdrawal {}", transaction_no)),
            metadata: None,
        };
        let withdrawal = NewEntry {
            transaction_no: transaction_no.clone(),
            from_user_id: Some(user_id),
            to_user_id: user_id,
            amount,
            fee: Decimal::ZERO,
            entry_type: EntryType::Withdraw,
            status: EntryStatus::Pending,
            snapshot_user: user_id,
            description: req.note.clone(),
            metadata: Some(serde_json::json!({
                "payout_info": req.payout_info,
                "note": req.note,
            })),
        };
        let posting = Posting::single(hold, vec![BalanceDelta::freeze(user_id, amount)])
            .with_leg(withdrawal, Vec::new());

        let rows = self.store.commit(posting).await.inspect_err(|e| {
            warn!(
                transaction_no = %transaction_no,
                user_id,
                amount = %amount,
                code = e.code(),
                "Withdrawal request rejected: {}", e
            )
        })?;
        let entry = rows
            .into_iter()
            .find(|r| r.entry_type == EntryType::Withdraw)
            .ok_or_else(|| LedgerError::Storage("withdrawal row missing".to_string()))?;

        info!(
            transaction_no = %entry.transaction_no,
            user_id,
            amount = %amount,
            "Withdrawal requested"
        );
        Ok(entry)
    }

    /// Approve or reject a pending withdrawal; returns the updated row
    pub async fn audit_withdrawal(&self, audit: WithdrawalAudit) -> LedgerResult<LedgerEntry> {
        let current = self
            .store
            .entry(&audit.transaction_no)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(audit.transaction_no.to_string()))?;

        if current.entry_type != EntryType::Withdraw {
            return Err(LedgerError::InvalidState(format!(
                "{} is a {} entry, not a withdrawal",
                current.transaction_no, current.entry_type
            )));
        }
        if current.status != EntryStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "withdrawal {} is already {}",
                current.transaction_no, current.status
            )));
        }

        let owner = current.snapshot_owner();
        let amount = current.amount;
        let record = serde_json::json!({
            "decision": audit.decision.as_str(),
            "note": audit.note,
            "auditor_id": audit.auditor_id,
            "audited_at": Utc::now().to_rfc3339(),
        });

        let (deltas, follow_up) = match audit.decision {
            WithdrawalDecision::Approve => {
                (vec![BalanceDelta::consume_frozen(owner, amount)], Vec::new())
            }
            WithdrawalDecision::Reject => {
                let release = NewEntry {
                    transaction_no: current.transaction_no.derived(RELEASE_SUFFIX),
                    from_user_id: Some(owner),
                    to_user_id: owner,
                    amount,
                    fee: Decimal::ZERO,
                    entry_type: EntryType::Unfreeze,
                    status: EntryStatus::Completed,
                    snapshot_user: owner,
                    description: Some(format!("withdrawal {} rejected", current.transaction_no)),
                    metadata: None,
                };
                (
                    Vec::new(),
                    vec![PostingLeg {
                        entry: release,
                        deltas: vec![BalanceDelta::unfreeze(owner, amount)],
                    }],
                )
            }
        };

        let rows = self
            .store
            .resolve(Resolution {
                transaction_no: current.transaction_no.clone(),
                expected_type: EntryType::Withdraw,
                target_status: audit.decision.target_status(),
                deltas,
                follow_up,
                audit: Some(record),
            })
            .await
            .inspect_err(|e| {
                warn!(
                    transaction_no = %current.transaction_no,
                    auditor_id = audit.auditor_id,
                    decision = audit.decision.as_str(),
                    code = e.code(),
                    "Withdrawal audit failed: {}", e
                )
            })?;
        let updated = rows
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::Storage("resolution returned no rows".to_string()))?;

        info!(
            transaction_no = %updated.transaction_no,
            user_id = owner,
            amount = %amount,
            auditor_id = audit.auditor_id,
            status = %updated.status,
            "Withdrawal audited"
        );
        Ok(updated)
    }

    /// PENDING withdrawals, newest first (1-based pages)
    pub async fn pending_withdrawals(&self, page: u32, per_page: u32) -> LedgerResult<TransactionPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let query = EntryQuery {
            user_id: None,
            entry_type: Some(EntryType::Withdraw),
            status: Some(EntryStatus::Pending),
            date_from: None,
            date_to: None,
            limit: per_page,
            offset: u64::from(page - 1) * u64::from(per_page),
            count_total: true,
        };
        let result = self.store.query_entries(&query).await?;
        let total = result.total.unwrap_or(result.entries.len() as u64);
        Ok(TransactionPage {
            entries: result.entries,
            total,
            page,
            per_page,
            degraded: false,
        })
    }
}

fn single_row(rows: Vec<LedgerEntry>) -> LedgerResult<LedgerEntry> {
    rows.into_iter()
        .next()
        .ok_or_else(|| LedgerError::Storage("posting returned no rows".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::policy::LedgerPolicy;
    use crate::ledger::store::MemoryLedgerStore;
    use crate::ledger::types::AccountBalance;

    async fn workflow_with(balance: i64) -> (FundingWorkflow, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::default());
        store
            .seed_account(1, AccountBalance::new(Decimal::from(balance), Decimal::ZERO))
            .await;
        (FundingWorkflow::new(store.clone()), store)
    }

    fn audit(no: &TransactionNo, approve: bool) -> WithdrawalAudit {
        WithdrawalAudit {
            transaction_no: no.clone(),
            decision: WithdrawalDecision::from_approve(approve),
            note: Some("checked".to_string()),
            auditor_id: 77,
        }
    }

    #[tokio::test]
    async fn test_recharge() {
        let (flow, store) = workflow_with(0).await;
        let entry = flow
            .recharge(RechargeRequest::new(1, Decimal::from(300), "bank_card"))
            .await
            .unwrap();
        assert_eq!(entry.from_user_id, None);
        assert_eq!(entry.entry_type, EntryType::Recharge);
        assert_eq!(entry.balance_after, Decimal::from(300));
        assert_eq!(entry.metadata.as_ref().unwrap()["method"], "bank_card");
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, Decimal::from(300));
    }

    #[tokio::test]
    async fn test_recharge_beyond_ledger_capacity_is_refused() {
        use crate::ledger::accessor::MAX_LEDGER_AMOUNT;

        let (flow, store) = workflow_with(0).await;
        let err = flow
            .recharge(RechargeRequest::new(1, Decimal::MAX, "bank_card"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        flow.recharge(RechargeRequest::new(1, MAX_LEDGER_AMOUNT, "bank_card"))
            .await
            .unwrap();
        let err = flow
            .recharge(RechargeRequest::new(1, MAX_LEDGER_AMOUNT, "bank_card"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, MAX_LEDGER_AMOUNT);
    }

    #[tokio::test]
    async fn test_withdrawal_approved() {
        let (flow, store) = workflow_with(200).await;
        let pending = flow
            .request_withdrawal(WithdrawalRequest::new(
                1,
                Decimal::from(80),
                serde_json::json!({"bank": "ICBC", "account": "6222"}),
            ))
            .await
            .unwrap();
        assert_eq!(pending.status, EntryStatus::Pending);
        assert_eq!(
            store.account(1).await.unwrap().unwrap(),
            AccountBalance::new(Decimal::from(200), Decimal::from(80))
        );

        let done = flow.audit_withdrawal(audit(&pending.transaction_no, true)).await.unwrap();
        assert_eq!(done.status, EntryStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.balance_before, Decimal::from(200));
        assert_eq!(done.balance_after, Decimal::from(120));
        assert_eq!(done.metadata.as_ref().unwrap()["audit"]["auditor_id"], 77);
        assert_eq!(done.metadata.as_ref().unwrap()["payout_info"]["bank"], "ICBC");
        assert_eq!(
            store.account(1).await.unwrap().unwrap(),
            AccountBalance::new(Decimal::from(120), Decimal::ZERO)
        );
    }

    #[tokio::test]
    async fn test_withdrawal_rejected_restores_available() {
        let (flow, store) = workflow_with(200).await;
        let pending = flow
            .request_withdrawal(WithdrawalRequest::new(1, Decimal::from(80), serde_json::json!({})))
            .await
            .unwrap();

        let cancelled = flow.audit_withdrawal(audit(&pending.transaction_no, false)).await.unwrap();
        assert_eq!(cancelled.status, EntryStatus::Cancelled);
        let acct = store.account(1).await.unwrap().unwrap();
        assert_eq!(acct.available(), Decimal::from(200));
        assert_eq!(acct.frozen, Decimal::ZERO);

        let release = store
            .entry(&pending.transaction_no.derived("UF"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.entry_type, EntryType::Unfreeze);
    }

    #[tokio::test]
    async fn test_longest_supplied_number_keeps_derived_rows_in_bounds() {
        let (flow, store) = workflow_with(100).await;
        let no = TransactionNo::parse("W".repeat(TransactionNo::MAX_SUPPLIED_LEN)).unwrap();
        let pending = flow
            .request_withdrawal(
                WithdrawalRequest::new(1, Decimal::from(40), serde_json::json!({}))
                    .with_transaction_no(no.clone()),
            )
            .await
            .unwrap();
        assert_eq!(pending.transaction_no, no);
        flow.audit_withdrawal(audit(&no, false)).await.unwrap();

        for suffix in [HOLD_SUFFIX, RELEASE_SUFFIX] {
            let row = store.entry(&no.derived(suffix)).await.unwrap().unwrap();
            assert!(row.transaction_no.as_str().len() <= TransactionNo::MAX_LEN);
        }
    }

    #[tokio::test]
    async fn test_audit_twice_is_invalid_state() {
        let (flow, _) = workflow_with(100).await;
        let pending = flow
            .request_withdrawal(WithdrawalRequest::new(1, Decimal::from(10), serde_json::json!({})))
            .await
            .unwrap();
        flow.audit_withdrawal(audit(&pending.transaction_no, true)).await.unwrap();

        let err = flow
            .audit_withdrawal(audit(&pending.transaction_no, false))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_audit_rejects_unknown_and_wrong_type() {
        let (flow, _) = workflow_with(100).await;
        let err = flow
            .audit_withdrawal(audit(&TransactionNo::parse("WD-missing").unwrap(), true))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSACTION_NOT_FOUND");

        let recharge = flow
            .recharge(RechargeRequest::new(1, Decimal::from(5), "cash"))
            .await
            .unwrap();
        let err = flow
            .audit_withdrawal(audit(&recharge.transaction_no, true))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_withdrawal_needs_available_funds() {
        let (flow, store) = workflow_with(50).await;
        let err = flow
            .request_withdrawal(WithdrawalRequest::new(1, Decimal::from(80), serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(store.account(1).await.unwrap().unwrap().frozen, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_min_withdrawal_amount() {
        let store = Arc::new(MemoryLedgerStore::new(LedgerPolicy {
            min_withdrawal_amount: Decimal::from(10),
            ..Default::default()
        }));
        store
            .seed_account(1, AccountBalance::new(Decimal::from(100), Decimal::ZERO))
            .await;
        let flow = FundingWorkflow::new(store);
        let err = flow
            .request_withdrawal(WithdrawalRequest::new(1, Decimal::from(5), serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_pending_withdrawals() {
        let (flow, _) = workflow_with(100).await;
        let first = flow
            .request_withdrawal(WithdrawalRequest::new(1, Decimal::from(10), serde_json::json!({})))
            .await
            .unwrap();
        flow.request_withdrawal(WithdrawalRequest::new(1, Decimal::from(20), serde_json::json!({})))
            .await
            .unwrap();
        flow.audit_withdrawal(audit(&first.transaction_no, true)).await.unwrap();

        let page = flow.pending_withdrawals(1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].amount, Decimal::from(20));
    }
}
