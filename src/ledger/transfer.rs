//! Transfer Engine
//!
//! Validates and executes a two-party balance movement as one posting.
//!
//! # Validation order
//! 1. `amount > 0` (and within the policy's `amount_scale`)
//! 2. `from != to`
//! 3. entry type may move value between parties
//! 4. `min_transfer_amount <= amount <= max_transfer_amount`
//! 5. sender's daily outflow + amount <= `daily_transfer_limit` (under lock)
//! 6. sender available >= amount + fee (under lock)
//!
//! Platform-originated payouts (`from_user_id = None`) skip 4-6 and the fee.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::accessor::BalanceDelta;
use super::error::{LedgerError, LedgerResult};
use super::policy::LedgerPolicy;
use super::state::EntryStatus;
use super::store::{LedgerStore, NewEntry, Posting, PostingGuard};
use super::types::{EntryType, Flow, LedgerEntry, TransactionNo, UserId};

/// Suffix of the UNFREEZE leg written by [`TransferEngine::settle_frozen`]
const RELEASE_SUFFIX: &str = "UF";

/// Transfer request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// `None` = platform origin (REFUND, COMMISSION, REWARD only)
    pub from_user_id: Option<UserId>,
    pub to_user_id: UserId,
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub description: Option<String>,
    /// Opaque reference to the caller's order; never validated here
    pub related_order_id: Option<String>,
    /// Idempotency key; generated when absent
    pub transaction_no: Option<TransactionNo>,
}

impl TransferRequest {
    pub fn new(
        from_user_id: Option<UserId>,
        to_user_id: UserId,
        amount: Decimal,
        entry_type: EntryType,
    ) -> Self {
        Self {
            from_user_id,
            to_user_id,
            amount,
            entry_type,
            description: None,
            related_order_id: None,
            transaction_no: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
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

/// One line of a batch; the entry type is shared by the whole batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTransferItem {
    pub from_user_id: Option<UserId>,
    pub to_user_id: UserId,
    pub amount: Decimal,
    pub description: Option<String>,
    pub related_order_id: Option<String>,
    pub transaction_no: Option<TransactionNo>,
}

impl BatchTransferItem {
    fn into_request(self, entry_type: EntryType) -> TransferRequest {
        TransferRequest {
            from_user_id: self.from_user_id,
            to_user_id: self.to_user_id,
            amount: self.amount,
            entry_type,
            description: self.description,
            related_order_id: self.related_order_id,
            transaction_no: self.transaction_no,
        }
    }
}

/// Outcome of one batch line
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    /// Position in the submitted batch
    pub index: usize,
    pub outcome: LedgerResult<LedgerEntry>,
}

impl BatchItemResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Validated transfer, ready to be turned into a posting leg
struct PlannedTransfer {
    entry: NewEntry,
    deltas: Vec<BalanceDelta>,
    guard: Option<PostingGuard>,
}

/// `{"related_order_id": ...}` when an order reference is present
pub(crate) fn order_metadata(related_order_id: Option<&str>) -> Option<serde_json::Value> {
    related_order_id.map(|id| serde_json::json!({ "related_order_id": id }))
}

/// Transfer Engine
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Move `amount` from sender to receiver as one COMPLETED entry
    pub async fn transfer(&self, req: TransferRequest) -> LedgerResult<LedgerEntry> {
        let policy = self.store.load_policy().await?;
        let transaction_no = TransactionNo::or_generate(req.transaction_no.clone(), req.entry_type);

        let result = match plan_transfer(&policy, &req, transaction_no.clone()) {
            Ok(plan) => {
                let mut posting = Posting::single(plan.entry, plan.deltas);
                if let Some(guard) = plan.guard {
                    posting = posting.with_guard(guard);
                }
                self.store.commit(posting).await.and_then(first_row)
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(entry) => info!(
                transaction_no = %entry.transaction_no,
                from_user_id = ?entry.from_user_id,
                to_user_id = entry.to_user_id,
                amount = %entry.amount,
                fee = %entry.fee,
                entry_type = %entry.entry_type,
                "Transfer committed"
            ),
            Err(e) => warn!(
                transaction_no = %transaction_no,
                from_user_id = ?req.from_user_id,
                to_user_id = req.to_user_id,
                amount = %req.amount,
                code = e.code(),
                "Transfer rejected: {}", e
            ),
        }
        result
    }

    /// Execute each item independently; one failure never affects another
    pub async fn batch_transfer(
        &self,
        items: Vec<BatchTransferItem>,
        entry_type: EntryType,
    ) -> Vec<BatchItemResult> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let outcome = self.transfer(item.into_request(entry_type)).await;
            results.push(BatchItemResult { index, outcome });
        }

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        info!(
            entry_type = %entry_type,
            total,
            succeeded,
            failed = total - succeeded,
            "Batch transfer finished"
        );
        results
    }

    /// Release a hold and pay it out in one posting (order completion)
    ///
    /// Writes an UNFREEZE entry numbered `<transaction_no>-UF` followed by
    /// the transfer entry, and returns the transfer entry. The transfer is
    /// subject to every user-transfer rule; the released hold counts as
    /// available funds for it.
    pub async fn settle_frozen(&self, req: TransferRequest) -> LedgerResult<LedgerEntry> {
        let Some(from_user_id) = req.from_user_id else {
            return Err(LedgerError::InvalidEntryType(format!(
                "{} settlement requires a sender",
                req.entry_type
            )));
        };

        let policy = self.store.load_policy().await?;
        let transaction_no = TransactionNo::or_generate(req.transaction_no.clone(), req.entry_type);
        let plan = plan_transfer(&policy, &req, transaction_no.clone())?;

        let release = NewEntry {
            transaction_no: transaction_no.derived(RELEASE_SUFFIX),
            from_user_id: Some(from_user_id),
            to_user_id: from_user_id,
            amount: plan.entry.amount,
            fee: Decimal::ZERO,
            entry_type: EntryType::Unfreeze,
            status: EntryStatus::Completed,
            snapshot_user: from_user_id,
            description: Some(format!("release for {}", transaction_no)),
            metadata: order_metadata(req.related_order_id.as_deref()),
        };
        let amount = plan.entry.amount;
        let mut posting = Posting::single(release, vec![BalanceDelta::unfreeze(from_user_id, amount)])
            .with_leg(plan.entry, plan.deltas);
        if let Some(guard) = plan.guard {
            posting = posting.with_guard(guard);
        }

        let rows = self.store.commit(posting).await.inspect_err(|e| {
            warn!(
                transaction_no = %transaction_no,
                from_user_id,
                to_user_id = req.to_user_id,
                amount = %amount,
                code = e.code(),
                "Frozen settlement rejected: {}", e
            )
        })?;

        let entry = rows
            .into_iter()
            .nth(1)
            .ok_or_else(|| LedgerError::Storage("settlement returned no transfer row".to_string()))?;
        info!(
            transaction_no = %entry.transaction_no,
            from_user_id,
            to_user_id = entry.to_user_id,
            amount = %entry.amount,
            "Frozen funds settled"
        );
        Ok(entry)
    }
}

fn first_row(rows: Vec<LedgerEntry>) -> LedgerResult<LedgerEntry> {
    rows.into_iter()
        .next()
        .ok_or_else(|| LedgerError::Storage("posting returned no rows".to_string()))
}

/// Steps 1-4 of the validation order, then the posting shape
fn plan_transfer(
    policy: &LedgerPolicy,
    req: &TransferRequest,
    transaction_no: TransactionNo,
) -> LedgerResult<PlannedTransfer> {
    let amount = policy.check_amount(req.amount)?;

    if req.from_user_id == Some(req.to_user_id) {
        return Err(LedgerError::SelfTransferNotAllowed);
    }

    if req.entry_type.flow() != Flow::Bidirectional {
        return Err(LedgerError::InvalidEntryType(format!(
            "{} cannot be used for a transfer",
            req.entry_type
        )));
    }

    let metadata = order_metadata(req.related_order_id.as_deref());

    let Some(from_user_id) = req.from_user_id else {
        if !req.entry_type.allows_system_origin() {
            return Err(LedgerError::InvalidEntryType(format!(
                "{} requires a sender",
                req.entry_type
            )));
        }
        return Ok(PlannedTransfer {
            entry: NewEntry {
                transaction_no,
                from_user_id: None,
                to_user_id: req.to_user_id,
                amount,
                fee: Decimal::ZERO,
                entry_type: req.entry_type,
                status: EntryStatus::Completed,
                snapshot_user: req.to_user_id,
                description: req.description.clone(),
                metadata,
            },
            deltas: vec![BalanceDelta::credit(req.to_user_id, amount)],
            guard: None,
        });
    };

    policy.check_transfer_range(amount)?;

    let fee = policy.transfer_fee(amount);
    let mut deltas = vec![
        BalanceDelta::debit(from_user_id, amount + fee),
        BalanceDelta::credit(req.to_user_id, amount),
    ];
    if let Some(sink) = policy.fee_sink_user_id
        && fee > Decimal::ZERO
    {
        deltas.push(BalanceDelta::credit(sink, fee));
    }

    Ok(PlannedTransfer {
        entry: NewEntry {
            transaction_no,
            from_user_id: Some(from_user_id),
            to_user_id: req.to_user_id,
            amount,
            fee,
            entry_type: req.entry_type,
            status: EntryStatus::Completed,
            snapshot_user: from_user_id,
            description: req.description.clone(),
            metadata,
        },
        deltas,
        guard: Some(PostingGuard::DailyOutflow {
            user_id: from_user_id,
            since: policy.daily_window_start(Utc::now()),
            amount,
            limit: policy.daily_transfer_limit,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::MemoryLedgerStore;
    use crate::ledger::types::AccountBalance;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    async fn engine_with(
        policy: LedgerPolicy,
        accounts: &[(UserId, &str)],
    ) -> (TransferEngine, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new(policy));
        for (user, balance) in accounts {
            store
                .seed_account(*user, AccountBalance::new(dec(balance), Decimal::ZERO))
                .await;
        }
        (TransferEngine::new(store.clone()), store)
    }

    async fn balance_of(store: &MemoryLedgerStore, user: UserId) -> AccountBalance {
        store.account(user).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_transfer_with_burned_fee() {
        let policy = LedgerPolicy {
            transfer_fee_rate: dec("0.01"),
            ..Default::default()
        };
        let (engine, store) = engine_with(policy, &[(1, "500"), (2, "0")]).await;

        let entry = engine
            .transfer(TransferRequest::new(Some(1), 2, dec("100"), EntryType::Transfer))
            .await
            .unwrap();

        assert_eq!(entry.amount, dec("100"));
        assert_eq!(entry.fee, dec("1"));
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.balance_before, dec("500"));
        assert_eq!(entry.balance_after, dec("399"));
        assert_eq!(balance_of(&store, 1).await.balance, dec("399"));
        assert_eq!(balance_of(&store, 2).await.balance, dec("100"));
    }

    #[tokio::test]
    async fn test_fee_sink_receives_fee() {
        let policy = LedgerPolicy {
            transfer_fee_rate: dec("0.02"),
            fee_sink_user_id: Some(9),
            ..Default::default()
        };
        let (engine, store) = engine_with(policy, &[(1, "100"), (2, "0"), (9, "0")]).await;

        engine
            .transfer(TransferRequest::new(Some(1), 2, dec("50"), EntryType::Purchase))
            .await
            .unwrap();

        assert_eq!(balance_of(&store, 1).await.balance, dec("49"));
        assert_eq!(balance_of(&store, 2).await.balance, dec("50"));
        assert_eq!(balance_of(&store, 9).await.balance, dec("1"));
    }

    #[tokio::test]
    async fn test_validation_order() {
        let policy = LedgerPolicy {
            min_transfer_amount: dec("10"),
            ..Default::default()
        };
        let (engine, _) = engine_with(policy, &[(1, "100"), (2, "0")]).await;

        // amount is checked before self-transfer
        let err = engine
            .transfer(TransferRequest::new(Some(1), 1, Decimal::ZERO, EntryType::Transfer))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let err = engine
            .transfer(TransferRequest::new(Some(1), 1, dec("5"), EntryType::Transfer))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::SelfTransferNotAllowed);

        let err = engine
            .transfer(TransferRequest::new(Some(1), 2, dec("5"), EntryType::Transfer))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");

        let err = engine
            .transfer(TransferRequest::new(Some(1), 2, dec("500"), EntryType::Transfer))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn test_daily_limit() {
        let policy = LedgerPolicy {
            daily_transfer_limit: dec("100"),
            ..Default::default()
        };
        let (engine, store) = engine_with(policy, &[(1, "1000"), (2, "0")]).await;

        engine
            .transfer(TransferRequest::new(Some(1), 2, dec("70"), EntryType::Transfer))
            .await
            .unwrap();
        let err = engine
            .transfer(TransferRequest::new(Some(1), 2, dec("31"), EntryType::Transfer))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
        engine
            .transfer(TransferRequest::new(Some(1), 2, dec("30"), EntryType::Transfer))
            .await
            .unwrap();
        assert_eq!(balance_of(&store, 1).await.balance, dec("900"));
    }

    #[tokio::test]
    async fn test_system_origin_rules() {
        let (engine, store) = engine_with(LedgerPolicy::default(), &[(2, "0")]).await;

        let entry = engine
            .transfer(TransferRequest::new(None, 2, dec("25"), EntryType::Commission).with_order("ORD-7"))
            .await
            .unwrap();
        assert_eq!(entry.from_user_id, None);
        assert_eq!(entry.balance_before, Decimal::ZERO);
        assert_eq!(entry.balance_after, dec("25"));
        assert_eq!(entry.related_order_id(), Some("ORD-7"));
        assert_eq!(balance_of(&store, 2).await.balance, dec("25"));

        let err = engine
            .transfer(TransferRequest::new(None, 2, dec("25"), EntryType::Transfer))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ENTRY_TYPE");
    }

    #[tokio::test]
    async fn test_hold_types_are_not_transfers() {
        let (engine, _) = engine_with(LedgerPolicy::default(), &[(1, "100"), (2, "0")]).await;
        let err = engine
            .transfer(TransferRequest::new(Some(1), 2, dec("5"), EntryType::Freeze))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ENTRY_TYPE");
    }

    #[tokio::test]
    async fn test_batch_items_are_independent() {
        let (engine, store) = engine_with(LedgerPolicy::default(), &[(1, "100"), (2, "0"), (3, "0")]).await;
        let item = |to: UserId, amount: &str| BatchTransferItem {
            from_user_id: Some(1),
            to_user_id: to,
            amount: dec(amount),
            description: None,
            related_order_id: None,
            transaction_no: None,
        };

        let results = engine
            .batch_transfer(vec![item(2, "60"), item(3, "60"), item(3, "40")], EntryType::Reward)
            .await;

        assert!(results[0].is_ok());
        assert_eq!(
            results[1].outcome.as_ref().unwrap_err().code(),
            "INSUFFICIENT_FUNDS"
        );
        assert!(results[2].is_ok());
        assert_eq!(results[2].index, 2);
        assert_eq!(balance_of(&store, 1).await.balance, Decimal::ZERO);
        assert_eq!(balance_of(&store, 3).await.balance, dec("40"));
    }

    #[tokio::test]
    async fn test_settle_frozen_releases_and_pays() {
        let (engine, store) = engine_with(LedgerPolicy::default(), &[(2, "0")]).await;
        store
            .seed_account(1, AccountBalance::new(dec("100"), dec("80")))
            .await;

        let no = TransactionNo::parse("ORD-1-PAY").unwrap();
        let entry = engine
            .settle_frozen(
                TransferRequest::new(Some(1), 2, dec("80"), EntryType::Purchase)
                    .with_transaction_no(no.clone()),
            )
            .await
            .unwrap();

        assert_eq!(entry.transaction_no, no);
        assert_eq!(balance_of(&store, 1).await, AccountBalance::new(dec("20"), Decimal::ZERO));
        assert_eq!(balance_of(&store, 2).await.balance, dec("80"));

        let release = store
            .entry(&TransactionNo::parse("ORD-1-PAY-UF").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.entry_type, EntryType::Unfreeze);
    }

    #[tokio::test]
    async fn test_settle_frozen_requires_hold() {
        let (engine, store) = engine_with(LedgerPolicy::default(), &[(1, "100"), (2, "0")]).await;
        let err = engine
            .settle_frozen(TransferRequest::new(Some(1), 2, dec("10"), EntryType::Purchase))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(balance_of(&store, 1).await.balance, dec("100"));
    }
}
