//! In-process ledger store
//!
//! Emulates the relational store's row locks with one async mutex per
//! account. Postings acquire the account mutexes as owned guards in
//! ascending user-id order, compute the new balances on working copies and
//! only then take the journal write lock to append and publish. Readers see
//! the last published balances and never wait on an account mutex. Used by
//! tests and by embedders that do not need durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{
    AppliedLeg, EntryPage, EntryQuery, LedgerStore, Posting, PostingGuard, Resolution, leg_numbers,
    apply_deltas, apply_legs, check_distinct_numbers, is_inflow, is_outflow, merge_audit,
};
use crate::ledger::error::{LedgerError, LedgerResult};
use crate::ledger::policy::LedgerPolicy;
use crate::ledger::state::EntryStatus;
use crate::ledger::types::{AccountBalance, LedgerEntry, LedgerStatistics, TransactionNo, UserId};

#[derive(Default)]
struct Journal {
    entries: Vec<LedgerEntry>,
    index: HashMap<TransactionNo, usize>,
}

impl Journal {
    fn daily_outflow(&self, user_id: UserId, since: DateTime<Utc>) -> Decimal {
        self.entries
            .iter()
            .filter(|e| {
                is_outflow(e, user_id)
                    && e.entry_type.counts_toward_daily_limit()
                    && e.created_at >= since
            })
            .map(|e| e.amount)
            .sum()
    }

    fn check_numbers_free<'a>(
        &self,
        mut numbers: impl Iterator<Item = &'a TransactionNo>,
    ) -> LedgerResult<()> {
        match numbers.find(|no| self.index.contains_key(*no)) {
            Some(dup) => Err(LedgerError::DuplicateTransaction(dup.to_string())),
            None => Ok(()),
        }
    }

    fn check_guards(&self, guards: &[PostingGuard]) -> LedgerResult<()> {
        for guard in guards {
            match guard {
                PostingGuard::DailyOutflow {
                    user_id,
                    since,
                    amount,
                    limit,
                } => {
                    let used = self.daily_outflow(*user_id, *since);
                    if used + amount > *limit {
                        return Err(LedgerError::LimitExceeded(format!(
                            "daily transfer limit {} reached: {} used, {} requested",
                            limit, used, amount
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, leg: AppliedLeg, now: DateTime<Utc>) -> LedgerEntry {
        let row = LedgerEntry {
            id: self.entries.len() as i64 + 1,
            transaction_no: leg.entry.transaction_no,
            from_user_id: leg.entry.from_user_id,
            to_user_id: leg.entry.to_user_id,
            amount: leg.entry.amount,
            fee: leg.entry.fee,
            entry_type: leg.entry.entry_type,
            status: leg.entry.status,
            balance_before: leg.balance_before,
            balance_after: leg.balance_after,
            description: leg.entry.description,
            metadata: leg.entry.metadata,
            created_at: now,
            completed_at: leg.entry.status.is_terminal().then_some(now),
        };
        self.index.insert(row.transaction_no.clone(), self.entries.len());
        self.entries.push(row.clone());
        row
    }
}

/// In-memory [`LedgerStore`]
pub struct MemoryLedgerStore {
    /// Writer-side rows; held for the length of a posting
    accounts: DashMap<UserId, Arc<Mutex<AccountBalance>>>,
    /// Last committed balances, served to readers
    published: DashMap<UserId, AccountBalance>,
    journal: RwLock<Journal>,
    policy: RwLock<LedgerPolicy>,
}

impl MemoryLedgerStore {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            accounts: DashMap::new(),
            published: DashMap::new(),
            journal: RwLock::new(Journal::default()),
            policy: RwLock::new(policy),
        }
    }

    /// Open an account with an opening balance (fixtures and migrations)
    pub async fn seed_account(&self, user_id: UserId, balance: AccountBalance) {
        let slot = self.slot_or_create(user_id);
        let mut row = slot.lock().await;
        *row = balance;
        self.published.insert(user_id, balance);
    }

    fn slot_or_create(&self, user_id: UserId) -> Arc<Mutex<AccountBalance>> {
        self.published.entry(user_id).or_default();
        self.accounts
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(AccountBalance::default())))
            .clone()
    }

    fn slot(&self, user_id: UserId) -> LedgerResult<Arc<Mutex<AccountBalance>>> {
        // clone the Arc so no DashMap shard guard is held across an await
        self.accounts
            .get(&user_id)
            .map(|r| r.value().clone())
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    /// Lock accounts in the given (ascending) order
    async fn lock_accounts(
        &self,
        order: &[UserId],
    ) -> LedgerResult<Vec<(UserId, OwnedMutexGuard<AccountBalance>)>> {
        let mut slots = Vec::with_capacity(order.len());
        for user_id in order {
            slots.push((*user_id, self.slot(*user_id)?));
        }

        let mut guards = Vec::with_capacity(slots.len());
        for (user_id, slot) in slots {
            tracing::debug!(user_id, "acquiring account lock");
            guards.push((user_id, slot.lock_owned().await));
        }
        Ok(guards)
    }

    fn working_copies(
        guards: &[(UserId, OwnedMutexGuard<AccountBalance>)],
    ) -> BTreeMap<UserId, AccountBalance> {
        guards.iter().map(|(u, g)| (*u, **g)).collect()
    }

    /// Write the new balances to the locked rows and publish them
    ///
    /// Called with the journal write lock held so readers never see entries
    /// without their balances.
    fn write_back(
        &self,
        guards: &mut [(UserId, OwnedMutexGuard<AccountBalance>)],
        working: &BTreeMap<UserId, AccountBalance>,
    ) {
        for (user_id, guard) in guards.iter_mut() {
            if let Some(next) = working.get(user_id) {
                **guard = *next;
                self.published.insert(*user_id, *next);
            }
        }
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new(LedgerPolicy::default())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_account(&self, user_id: UserId) -> LedgerResult<AccountBalance> {
        self.slot_or_create(user_id);
        self.account(user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    async fn account(&self, user_id: UserId) -> LedgerResult<Option<AccountBalance>> {
        Ok(self.published.get(&user_id).map(|r| *r.value()))
    }

    async fn load_policy(&self) -> LedgerResult<LedgerPolicy> {
        Ok(self.policy.read().await.clone())
    }

    async fn save_policy(&self, policy: &LedgerPolicy) -> LedgerResult<()> {
        policy.validate().map_err(LedgerError::InvalidState)?;
        *self.policy.write().await = policy.clone();
        Ok(())
    }

    async fn commit(&self, posting: Posting) -> LedgerResult<Vec<LedgerEntry>> {
        check_distinct_numbers(&posting.legs)?;
        // a replay is a duplicate whatever the balances look like now
        self.journal.read().await.check_numbers_free(leg_numbers(&posting.legs))?;

        let mut guards = self.lock_accounts(&posting.lock_order()).await?;
        let mut working = Self::working_copies(&guards);
        {
            let journal = self.journal.read().await;
            journal.check_numbers_free(leg_numbers(&posting.legs))?;
            journal.check_guards(&posting.guards)?;
        }

        let applied = apply_legs(&mut working, posting.legs)?;

        let mut journal = self.journal.write().await;
        // racing postings on other accounts may have taken a number meanwhile
        journal.check_numbers_free(applied.iter().map(|a| &a.entry.transaction_no))?;
        let now = Utc::now();
        let inserted = applied
            .into_iter()
            .map(|leg| journal.append(leg, now))
            .collect();

        self.write_back(&mut guards, &working);
        Ok(inserted)
    }

    async fn resolve(&self, resolution: Resolution) -> LedgerResult<Vec<LedgerEntry>> {
        check_distinct_numbers(&resolution.follow_up)?;

        let (owner, position) = {
            let journal = self.journal.read().await;
            let position = *journal
                .index
                .get(&resolution.transaction_no)
                .ok_or_else(|| {
                    LedgerError::TransactionNotFound(resolution.transaction_no.to_string())
                })?;
            (journal.entries[position].snapshot_owner(), position)
        };

        let mut guards = self.lock_accounts(&resolution.lock_order(owner)).await?;
        let mut working = Self::working_copies(&guards);

        // the owner's lock serialises every resolution of this row
        let current = {
            let journal = self.journal.read().await;
            let current = journal.entries[position].clone();
            if current.entry_type != resolution.expected_type {
                return Err(LedgerError::InvalidState(format!(
                    "{} is a {} entry, expected {}",
                    current.transaction_no, current.entry_type, resolution.expected_type
                )));
            }
            if !current.status.can_transition_to(resolution.target_status)
                || current.status != EntryStatus::Pending
            {
                return Err(LedgerError::InvalidState(format!(
                    "{} is {}, cannot move to {}",
                    current.transaction_no, current.status, resolution.target_status
                )));
            }
            journal.check_numbers_free(leg_numbers(&resolution.follow_up))?;
            current
        };

        let snapshot = if resolution.deltas.is_empty() {
            None
        } else {
            Some(apply_deltas(&mut working, &resolution.deltas, owner)?)
        };
        let applied = apply_legs(&mut working, resolution.follow_up)?;

        let mut journal = self.journal.write().await;
        journal.check_numbers_free(applied.iter().map(|a| &a.entry.transaction_no))?;

        let now = Utc::now();
        let mut updated = current;
        updated.status = resolution.target_status;
        updated.completed_at = Some(now);
        if let Some((before, after)) = snapshot {
            updated.balance_before = before;
            updated.balance_after = after;
        }
        if let Some(audit) = resolution.audit {
            updated.metadata = Some(merge_audit(updated.metadata.take(), audit));
        }
        journal.entries[position] = updated.clone();

        let mut rows = vec![updated];
        rows.extend(applied.into_iter().map(|leg| journal.append(leg, now)));

        self.write_back(&mut guards, &working);
        Ok(rows)
    }

    async fn entry(&self, transaction_no: &TransactionNo) -> LedgerResult<Option<LedgerEntry>> {
        let journal = self.journal.read().await;
        Ok(journal
            .index
            .get(transaction_no)
            .map(|&i| journal.entries[i].clone()))
    }

    async fn query_entries(&self, query: &EntryQuery) -> LedgerResult<EntryPage> {
        let journal = self.journal.read().await;
        let mut matched: Vec<&LedgerEntry> =
            journal.entries.iter().filter(|e| query.matches(e)).collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = query.count_total.then_some(matched.len() as u64);
        let entries = matched
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(EntryPage { entries, total })
    }

    async fn statistics(
        &self,
        user_id: UserId,
        today_start: DateTime<Utc>,
    ) -> LedgerResult<LedgerStatistics> {
        let journal = self.journal.read().await;
        let mut stats = LedgerStatistics {
            user_id,
            ..Default::default()
        };
        for entry in &journal.entries {
            let today = entry.created_at >= today_start;
            if is_outflow(entry, user_id) {
                stats.total_sent += entry.amount;
                if today {
                    stats.today_sent += entry.amount;
                }
            } else if is_inflow(entry, user_id) {
                stats.total_received += entry.amount;
                if today {
                    stats.today_received += entry.amount;
                }
            }
        }
        stats.net = stats.total_received - stats.total_sent;
        Ok(stats)
    }
}
