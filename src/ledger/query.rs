//! Query & Statistics Service
//!
//! Read-only. Transaction listings run under a latency ceiling; when the
//! primary query exceeds it the service answers with the degraded query
//! instead of failing:
//!
//! - only entries from the last `degraded_window_days` (30) days
//! - at most `degraded_row_cap` (50) rows, first page only
//! - no COUNT; `total` is the number of rows returned
//! - the page is marked `degraded: true`

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;

use super::error::{LedgerError, LedgerResult};
use super::policy::start_of_day;
use super::store::{EntryQuery, LedgerStore};
use super::types::{
    BalanceView, EntryType, LedgerEntry, LedgerStatistics, TransactionNo, TransactionPage, UserId,
};

/// Default latency ceiling (5 seconds)
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_PER_PAGE: u32 = 100;

/// Query ceiling and degraded-path shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub query_timeout_ms: u64,
    pub degraded_window_days: u32,
    pub degraded_row_cap: u32,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
            degraded_window_days: 30,
            degraded_row_cap: 50,
        }
    }
}

impl QuerySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Optional filters of a transaction listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub entry_type: Option<EntryType>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

/// Query & Statistics Service
pub struct QueryService {
    store: Arc<dyn LedgerStore>,
    settings: QuerySettings,
}

impl QueryService {
    pub fn new(store: Arc<dyn LedgerStore>, settings: QuerySettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Entries where the user is sender or receiver, newest first
    ///
    /// `page` is 1-based; `per_page` is clamped to `1..=100`.
    pub async fn get_transactions(
        &self,
        user_id: UserId,
        page: u32,
        per_page: u32,
        filter: TransactionFilter,
    ) -> LedgerResult<TransactionPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let query = EntryQuery {
            user_id: Some(user_id),
            entry_type: filter.entry_type,
            status: None,
            date_from: filter.date_from,
            date_to: filter.date_to,
            limit: per_page,
            offset: u64::from(page - 1) * u64::from(per_page),
            count_total: true,
        };

        match timeout(self.settings.timeout(), self.store.query_entries(&query)).await {
            Ok(result) => {
                let result = result?;
                let total = result.total.unwrap_or(result.entries.len() as u64);
                Ok(TransactionPage {
                    entries: result.entries,
                    total,
                    page,
                    per_page,
                    degraded: false,
                })
            }
            Err(_) => {
                warn!(
                    user_id,
                    page,
                    per_page,
                    timeout_ms = self.settings.query_timeout_ms,
                    "Transaction query exceeded its ceiling, serving degraded page"
                );
                self.degraded_transactions(user_id, filter).await
            }
        }
    }

    /// Last-N-days, capped, uncounted listing
    async fn degraded_transactions(
        &self,
        user_id: UserId,
        filter: TransactionFilter,
    ) -> LedgerResult<TransactionPage> {
        let window_start =
            Utc::now() - chrono::Duration::days(i64::from(self.settings.degraded_window_days));
        let date_from = match filter.date_from {
            Some(from) if from > window_start => from,
            _ => window_start,
        };
        let query = EntryQuery {
            user_id: Some(user_id),
            entry_type: filter.entry_type,
            status: None,
            date_from: Some(date_from),
            date_to: filter.date_to,
            limit: self.settings.degraded_row_cap,
            offset: 0,
            count_total: false,
        };

        let result = self.bounded(self.store.query_entries(&query)).await?;
        Ok(TransactionPage {
            total: result.entries.len() as u64,
            entries: result.entries,
            page: 1,
            per_page: self.settings.degraded_row_cap,
            degraded: true,
        })
    }

    /// Balance, frozen and available of one user
    pub async fn get_balance(&self, user_id: UserId) -> LedgerResult<BalanceView> {
        let account = self
            .bounded(self.store.account(user_id))
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        let policy = self.store.load_policy().await?;
        Ok(BalanceView {
            user_id,
            balance: account.balance,
            frozen: account.frozen,
            available: account.available(),
            above_review_threshold: policy.exceeds_review_threshold(account.balance),
        })
    }

    /// Sent/received totals; "today" is the current UTC calendar day
    pub async fn get_statistics(&self, user_id: UserId) -> LedgerResult<LedgerStatistics> {
        let today_start = start_of_day(Utc::now());
        self.bounded(self.store.statistics(user_id, today_start)).await
    }

    pub async fn get_transaction(&self, transaction_no: &TransactionNo) -> LedgerResult<LedgerEntry> {
        self.bounded(self.store.entry(transaction_no))
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(transaction_no.to_string()))
    }

    /// Run a read under the ceiling; exceeding it is `QueryTimeout`
    async fn bounded<F, T>(&self, future: F) -> LedgerResult<T>
    where
        F: Future<Output = LedgerResult<T>>,
    {
        match timeout(self.settings.timeout(), future).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::QueryTimeout(self.settings.query_timeout_ms)),
        }
    }
}
