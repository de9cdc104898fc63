//! Ledger Store
//!
//! Durable home of the account rows and the append-only entry journal.
//!
//! A store executes a whole [`Posting`] or [`Resolution`] as one
//! transaction: it locks every touched account in ascending user-id order,
//! runs the [Balance Accessor](super::accessor) over each leg, inserts the
//! entries (unique `transaction_no`) and commits. Any error leaves no trace.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::accessor::BalanceDelta;
use super::error::LedgerResult;
use super::policy::LedgerPolicy;
use super::state::EntryStatus;
use super::types::{
    AccountBalance, EntryType, LedgerEntry, LedgerStatistics, TransactionNo, UserId,
};

/// Entry to be inserted by a posting
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub transaction_no: TransactionNo,
    pub from_user_id: Option<UserId>,
    pub to_user_id: UserId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub entry_type: EntryType,
    pub status: EntryStatus,
    /// Account whose before/after balance is recorded on the row
    pub snapshot_user: UserId,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One entry plus the balance changes it accounts for
#[derive(Debug, Clone, PartialEq)]
pub struct PostingLeg {
    pub entry: NewEntry,
    pub deltas: Vec<BalanceDelta>,
}

/// Condition re-checked by the store once the account locks are held
#[derive(Debug, Clone, PartialEq)]
pub enum PostingGuard {
    /// `user_id`'s completed limit-counting outflow since `since`, plus
    /// `amount`, must not exceed `limit`
    DailyOutflow {
        user_id: UserId,
        since: DateTime<Utc>,
        amount: Decimal,
        limit: Decimal,
    },
}

impl PostingGuard {
    pub fn user_id(&self) -> UserId {
        match self {
            PostingGuard::DailyOutflow { user_id, .. } => *user_id,
        }
    }
}

/// Atomic unit of work: all legs commit or none do
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Posting {
    pub legs: Vec<PostingLeg>,
    pub guards: Vec<PostingGuard>,
}

impl Posting {
    pub fn single(entry: NewEntry, deltas: Vec<BalanceDelta>) -> Self {
        Self {
            legs: vec![PostingLeg { entry, deltas }],
            guards: Vec::new(),
        }
    }

    pub fn with_leg(mut self, entry: NewEntry, deltas: Vec<BalanceDelta>) -> Self {
        self.legs.push(PostingLeg { entry, deltas });
        self
    }

    pub fn with_guard(mut self, guard: PostingGuard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Accounts to lock, ascending
    pub fn lock_order(&self) -> Vec<UserId> {
        let mut users: BTreeSet<UserId> = BTreeSet::new();
        for leg in &self.legs {
            users.insert(leg.entry.snapshot_user);
            users.extend(leg.deltas.iter().map(|d| d.user_id));
        }
        users.extend(self.guards.iter().map(PostingGuard::user_id));
        users.into_iter().collect()
    }
}

/// Moves a PENDING entry to a terminal status
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub transaction_no: TransactionNo,
    pub expected_type: EntryType,
    pub target_status: EntryStatus,
    /// Balance changes that commit with the status change; when non-empty
    /// the resolved row's snapshot is re-taken at commit time
    pub deltas: Vec<BalanceDelta>,
    /// Compensating entries written in the same transaction
    pub follow_up: Vec<PostingLeg>,
    /// Merged into the row's metadata under `"audit"`
    pub audit: Option<serde_json::Value>,
}

impl Resolution {
    pub fn lock_order(&self, owner: UserId) -> Vec<UserId> {
        let mut users: BTreeSet<UserId> = BTreeSet::new();
        users.insert(owner);
        users.extend(self.deltas.iter().map(|d| d.user_id));
        for leg in &self.follow_up {
            users.insert(leg.entry.snapshot_user);
            users.extend(leg.deltas.iter().map(|d| d.user_id));
        }
        users.into_iter().collect()
    }
}

/// Filter for journal reads
#[derive(Debug, Clone, PartialEq)]
pub struct EntryQuery {
    /// Match rows where the user is sender or receiver
    pub user_id: Option<UserId>,
    pub entry_type: Option<EntryType>,
    pub status: Option<EntryStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u64,
    /// Run the COUNT(*) for pagination metadata
    pub count_total: bool,
}

impl EntryQuery {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            entry_type: None,
            status: None,
            date_from: None,
            date_to: None,
            limit: 20,
            offset: 0,
            count_total: true,
        }
    }

    /// In-memory predicate equivalent of the SQL filter
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.user_id.is_none_or(|u| entry.involves(u))
            && self.entry_type.is_none_or(|t| entry.entry_type == t)
            && self.status.is_none_or(|s| entry.status == s)
            && self.date_from.is_none_or(|from| entry.created_at >= from)
            && self.date_to.is_none_or(|to| entry.created_at <= to)
    }
}

/// Rows plus optional total count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPage {
    pub entries: Vec<LedgerEntry>,
    pub total: Option<u64>,
}

/// Storage backend for the ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Create the account row if missing (idempotent)
    async fn open_account(&self, user_id: UserId) -> LedgerResult<AccountBalance>;

    /// Latest committed balance/frozen pair
    async fn account(&self, user_id: UserId) -> LedgerResult<Option<AccountBalance>>;

    /// Current persisted policy
    async fn load_policy(&self) -> LedgerResult<LedgerPolicy>;

    /// Replace the persisted policy
    async fn save_policy(&self, policy: &LedgerPolicy) -> LedgerResult<()>;

    /// Execute a posting atomically, returning the inserted rows in leg order
    async fn commit(&self, posting: Posting) -> LedgerResult<Vec<LedgerEntry>>;

    /// Resolve a PENDING row, returning the updated row followed by any
    /// follow-up rows
    async fn resolve(&self, resolution: Resolution) -> LedgerResult<Vec<LedgerEntry>>;

    async fn entry(&self, transaction_no: &TransactionNo) -> LedgerResult<Option<LedgerEntry>>;

    /// Rows matching `query`, newest first
    async fn query_entries(&self, query: &EntryQuery) -> LedgerResult<EntryPage>;

    /// Sent/received aggregates; "today" starts at `today_start`
    async fn statistics(
        &self,
        user_id: UserId,
        today_start: DateTime<Utc>,
    ) -> LedgerResult<LedgerStatistics>;
}

/// Leg after the accessor ran: entry plus its commit-time snapshot
#[derive(Debug, Clone)]
pub(crate) struct AppliedLeg {
    pub entry: NewEntry,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
}

/// Run the Balance Accessor over `deltas` against the locked working copies
///
/// Returns the snapshot owner's balance before and after.
pub(crate) fn apply_deltas(
    working: &mut std::collections::BTreeMap<UserId, AccountBalance>,
    deltas: &[BalanceDelta],
    snapshot_user: UserId,
) -> LedgerResult<(Decimal, Decimal)> {
    use super::accessor::{adjust, merge_deltas};
    use super::error::LedgerError;

    let before = working
        .get(&snapshot_user)
        .map(|a| a.balance)
        .ok_or(LedgerError::AccountNotFound(snapshot_user))?;

    for (user_id, (balance_delta, frozen_delta)) in merge_deltas(deltas) {
        let current = *working
            .get(&user_id)
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        let next = adjust(user_id, current, balance_delta, frozen_delta)?;
        working.insert(user_id, next);
    }

    let after = working
        .get(&snapshot_user)
        .map(|a| a.balance)
        .unwrap_or(before);
    Ok((before, after))
}

/// Apply every leg in order; the first failure aborts the whole posting
pub(crate) fn apply_legs(
    working: &mut std::collections::BTreeMap<UserId, AccountBalance>,
    legs: Vec<PostingLeg>,
) -> LedgerResult<Vec<AppliedLeg>> {
    let mut applied = Vec::with_capacity(legs.len());
    for leg in legs {
        let (balance_before, balance_after) =
            apply_deltas(working, &leg.deltas, leg.entry.snapshot_user)?;
        applied.push(AppliedLeg {
            entry: leg.entry,
            balance_before,
            balance_after,
        });
    }
    Ok(applied)
}

/// Reject postings that reuse a transaction number among their own legs
pub(crate) fn check_distinct_numbers(legs: &[PostingLeg]) -> LedgerResult<()> {
    let mut seen: BTreeSet<&TransactionNo> = BTreeSet::new();
    for leg in legs {
        if !seen.insert(&leg.entry.transaction_no) {
            return Err(super::error::LedgerError::DuplicateTransaction(
                leg.entry.transaction_no.to_string(),
            ));
        }
    }
    Ok(())
}

pub(crate) fn leg_numbers(legs: &[PostingLeg]) -> impl Iterator<Item = &TransactionNo> {
    legs.iter().map(|leg| &leg.entry.transaction_no)
}

/// Whether an entry counts as value leaving `user_id`
pub(crate) fn is_outflow(entry: &LedgerEntry, user_id: UserId) -> bool {
    use super::types::Flow;
    entry.status == EntryStatus::Completed
        && entry.from_user_id == Some(user_id)
        && matches!(entry.entry_type.flow(), Flow::Bidirectional | Flow::DebitOnly)
}

/// Whether an entry counts as value arriving at `user_id`
pub(crate) fn is_inflow(entry: &LedgerEntry, user_id: UserId) -> bool {
    use super::types::Flow;
    entry.status == EntryStatus::Completed
        && entry.to_user_id == user_id
        && entry.from_user_id != Some(user_id)
        && matches!(entry.entry_type.flow(), Flow::Bidirectional | Flow::CreditOnly)
}

/// Attach the audit record to existing metadata
pub(crate) fn merge_audit(
    existing: Option<serde_json::Value>,
    audit: serde_json::Value,
) -> serde_json::Value {
    match existing {
        Some(serde_json::Value::Object(mut map)) => {
            map.insert("audit".to_string(), audit);
            serde_json::Value::Object(map)
        }
        Some(other) => serde_json::json!({ "original": other, "audit": audit }),
        None => serde_json::json!({ "audit": audit }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(no: &str, from: Option<UserId>, to: UserId) -> NewEntry {
        NewEntry {
            transaction_no: TransactionNo::parse(no).unwrap(),
            from_user_id: from,
            to_user_id: to,
            amount: Decimal::ONE,
            fee: Decimal::ZERO,
            entry_type: EntryType::Transfer,
            status: EntryStatus::Completed,
            snapshot_user: from.unwrap_or(to),
            description: None,
            metadata: None,
        }
    }

    #[test]
    fn test_lock_order_is_ascending_and_unique() {
        let posting = Posting::single(
            entry("T1", Some(42), 7),
            vec![
                BalanceDelta::debit(42, Decimal::ONE),
                BalanceDelta::credit(7, Decimal::ONE),
            ],
        )
        .with_leg(entry("T1-fee", Some(42), 3), vec![BalanceDelta::credit(3, Decimal::ONE)])
        .with_guard(PostingGuard::DailyOutflow {
            user_id: 42,
            since: Utc::now(),
            amount: Decimal::ONE,
            limit: Decimal::TEN,
        });

        assert_eq!(posting.lock_order(), vec![3, 7, 42]);
    }

    #[test]
    fn test_lock_order_same_for_both_directions() {
        let ab = Posting::single(
            entry("AB", Some(1), 2),
            vec![
                BalanceDelta::debit(1, Decimal::ONE),
                BalanceDelta::credit(2, Decimal::ONE),
            ],
        );
        let ba = Posting::single(
            entry("BA", Some(2), 1),
            vec![
                BalanceDelta::debit(2, Decimal::ONE),
                BalanceDelta::credit(1, Decimal::ONE),
            ],
        );
        assert_eq!(ab.lock_order(), ba.lock_order());
    }
}
