//! PostgreSQL ledger store
//!
//! Every posting runs in one `sqlx` transaction. Account rows are locked
//! with `SELECT ... FOR UPDATE`, one statement per row in ascending user-id
//! order; `transaction_no` is protected by a UNIQUE constraint so a racing
//! retry fails the insert and rolls the whole posting back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

use super::{
    AppliedLeg, EntryPage, EntryQuery, LedgerStore, Posting, PostingGuard, Resolution,
    apply_deltas, apply_legs, check_distinct_numbers, merge_audit,
};
use crate::ledger::error::{LedgerError, LedgerResult};
use crate::ledger::policy::LedgerPolicy;
use crate::ledger::state::EntryStatus;
use crate::ledger::types::{
    AccountBalance, EntryType, Flow, LedgerEntry, LedgerStatistics, TransactionNo, UserId,
};

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_accounts (
    user_id     BIGINT PRIMARY KEY,
    balance     NUMERIC(24, 8) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    frozen      NUMERIC(24, 8) NOT NULL DEFAULT 0 CHECK (frozen >= 0 AND frozen <= balance),
    version     BIGINT NOT NULL DEFAULT 0,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id              BIGSERIAL PRIMARY KEY,
    transaction_no  VARCHAR(64) NOT NULL UNIQUE,
    from_user_id    BIGINT NULL,
    to_user_id      BIGINT NOT NULL,
    amount          NUMERIC(24, 8) NOT NULL CHECK (amount > 0),
    fee             NUMERIC(24, 8) NOT NULL DEFAULT 0,
    entry_type      SMALLINT NOT NULL,
    status          SMALLINT NOT NULL,
    balance_before  NUMERIC(24, 8) NOT NULL,
    balance_after   NUMERIC(24, 8) NOT NULL,
    description     TEXT NULL,
    metadata        TEXT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at    TIMESTAMPTZ NULL
)"#;

const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_settings (
    id          SMALLINT PRIMARY KEY,
    policy      TEXT NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

const CREATE_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_ledger_entries_from ON ledger_entries (from_user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_entries_to ON ledger_entries (to_user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_entries_status ON ledger_entries (status, entry_type, created_at DESC)",
];

const ENTRY_COLUMNS: &str = "id, transaction_no, from_user_id, to_user_id, amount, fee, entry_type, \
     status, balance_before, balance_after, description, metadata, created_at, completed_at";

const SETTINGS_ROW_ID: i16 = 1;

/// [`LedgerStore`] backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn init_schema(&self) -> LedgerResult<()> {
        tracing::info!("Initializing ledger schema...");
        for ddl in [CREATE_ACCOUNTS_TABLE, CREATE_ENTRIES_TABLE, CREATE_SETTINGS_TABLE] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        for ddl in CREATE_INDEXES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Persist `policy` unless one is already stored; returns the effective one
    pub async fn seed_policy(&self, policy: &LedgerPolicy) -> LedgerResult<LedgerPolicy> {
        policy.validate().map_err(LedgerError::InvalidState)?;
        let json = serde_json::to_string(policy)
            .map_err(|e| LedgerError::Storage(format!("encode policy: {}", e)))?;
        sqlx::query(
            "INSERT INTO ledger_settings (id, policy) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(SETTINGS_ROW_ID)
        .bind(json)
        .execute(&self.pool)
        .await?;
        self.load_policy().await
    }

    async fn lock_accounts(
        tx: &mut Transaction<'_, Postgres>,
        order: &[UserId],
    ) -> LedgerResult<BTreeMap<UserId, AccountBalance>> {
        let mut working = BTreeMap::new();
        for &user_id in order {
            tracing::debug!(user_id, "acquiring account row lock");
            let row = sqlx::query(
                "SELECT balance, frozen FROM ledger_accounts WHERE user_id = $1 FOR UPDATE",
            )
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
            working.insert(
                user_id,
                AccountBalance::new(row.try_get("balance")?, row.try_get("frozen")?),
            );
        }
        Ok(working)
    }

    async fn write_accounts(
        tx: &mut Transaction<'_, Postgres>,
        original: &BTreeMap<UserId, AccountBalance>,
        working: &BTreeMap<UserId, AccountBalance>,
    ) -> LedgerResult<()> {
        for (user_id, next) in working {
            if original.get(user_id) == Some(next) {
                continue;
            }
            sqlx::query(
                "UPDATE ledger_accounts
                 SET balance = $1, frozen = $2, version = version + 1, updated_at = NOW()
                 WHERE user_id = $3",
            )
            .bind(next.balance)
            .bind(next.frozen)
            .bind(*user_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn daily_outflow(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> LedgerResult<Decimal> {
        let types: Vec<i16> = EntryType::ALL
            .iter()
            .filter(|t| t.counts_toward_daily_limit())
            .map(EntryType::id)
            .collect();
        let used: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries
             WHERE from_user_id = $1 AND status = $2 AND entry_type = ANY($3) AND created_at >= $4",
        )
        .bind(user_id)
        .bind(EntryStatus::Completed.id())
        .bind(types)
        .bind(since)
        .fetch_one(&mut **tx)
        .await?;
        Ok(used)
    }

    async fn insert_leg(
        tx: &mut Transaction<'_, Postgres>,
        leg: AppliedLeg,
    ) -> LedgerResult<LedgerEntry> {
        let entry = leg.entry;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LedgerError::Storage(format!("encode metadata: {}", e)))?;

        let sql = format!(
            "INSERT INTO ledger_entries
                (transaction_no, from_user_id, to_user_id, amount, fee, entry_type, status,
                 balance_before, balance_after, description, metadata, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(),
                     CASE WHEN $12 THEN NOW() ELSE NULL END)
             RETURNING {}",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(entry.transaction_no.as_str())
            .bind(entry.from_user_id)
            .bind(entry.to_user_id)
            .bind(entry.amount)
            .bind(entry.fee)
            .bind(entry.entry_type.id())
            .bind(entry.status.id())
            .bind(leg.balance_before)
            .bind(leg.balance_after)
            .bind(&entry.description)
            .bind(metadata)
            .bind(entry.status.is_terminal())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| match LedgerError::from(e) {
                LedgerError::DuplicateTransaction(_) => {
                    LedgerError::DuplicateTransaction(entry.transaction_no.to_string())
                }
                other => other,
            })?;

        row_to_entry(&row)
    }

    async fn number_taken(&self, transaction_no: &TransactionNo) -> LedgerResult<bool> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM ledger_entries WHERE transaction_no = $1")
                .bind(transaction_no.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn open_account(&self, user_id: UserId) -> LedgerResult<AccountBalance> {
        sqlx::query("INSERT INTO ledger_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.account(user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    async fn account(&self, user_id: UserId) -> LedgerResult<Option<AccountBalance>> {
        let row = sqlx::query("SELECT balance, frozen FROM ledger_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(AccountBalance::new(
                row.try_get("balance")?,
                row.try_get("frozen")?,
            ))),
            None => Ok(None),
        }
    }

    async fn load_policy(&self) -> LedgerResult<LedgerPolicy> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT policy FROM ledger_settings WHERE id = $1")
                .bind(SETTINGS_ROW_ID)
                .fetch_optional(&self.pool)
                .await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| LedgerError::Storage(format!("decode policy: {}", e))),
            None => {
                tracing::warn!("ledger_settings is empty, using built-in policy defaults");
                Ok(LedgerPolicy::default())
            }
        }
    }

    async fn save_policy(&self, policy: &LedgerPolicy) -> LedgerResult<()> {
        policy.validate().map_err(LedgerError::InvalidState)?;
        let json = serde_json::to_string(policy)
            .map_err(|e| LedgerError::Storage(format!("encode policy: {}", e)))?;
        sqlx::query(
            "INSERT INTO ledger_settings (id, policy, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (id) DO UPDATE SET policy = EXCLUDED.policy, updated_at = NOW()",
        )
        .bind(SETTINGS_ROW_ID)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit(&self, posting: Posting) -> LedgerResult<Vec<LedgerEntry>> {
        check_distinct_numbers(&posting.legs)?;

        // fast path for retries; the UNIQUE constraint still decides races
        for leg in &posting.legs {
            if self.number_taken(&leg.entry.transaction_no).await? {
                return Err(LedgerError::DuplicateTransaction(
                    leg.entry.transaction_no.to_string(),
                ));
            }
        }

        let mut tx = self.pool.begin().await?;
        let original = Self::lock_accounts(&mut tx, &posting.lock_order()).await?;
        let mut working = original.clone();

        for guard in &posting.guards {
            match guard {
                PostingGuard::DailyOutflow {
                    user_id,
                    since,
                    amount,
                    limit,
                } => {
                    let used = Self::daily_outflow(&mut tx, *user_id, *since).await?;
                    if used + amount > *limit {
                        return Err(LedgerError::LimitExceeded(format!(
                            "daily transfer limit {} reached: {} used, {} requested",
                            limit, used, amount
                        )));
                    }
                }
            }
        }

        let applied = apply_legs(&mut working, posting.legs)?;
        Self::write_accounts(&mut tx, &original, &working).await?;

        let mut inserted = Vec::with_capacity(applied.len());
        for leg in applied {
            inserted.push(Self::insert_leg(&mut tx, leg).await?);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn resolve(&self, resolution: Resolution) -> LedgerResult<Vec<LedgerEntry>> {
        check_distinct_numbers(&resolution.follow_up)?;

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE transaction_no = $1 FOR UPDATE",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(resolution.transaction_no.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(resolution.transaction_no.to_string()))?;
        let current = row_to_entry(&row)?;

        if current.entry_type != resolution.expected_type {
            return Err(LedgerError::InvalidState(format!(
                "{} is a {} entry, expected {}",
                current.transaction_no, current.entry_type, resolution.expected_type
            )));
        }
        if current.status != EntryStatus::Pending
            || !current.status.can_transition_to(resolution.target_status)
        {
            return Err(LedgerError::InvalidState(format!(
                "{} is {}, cannot move to {}",
                current.transaction_no, current.status, resolution.target_status
            )));
        }

        for leg in &resolution.follow_up {
            if self.number_taken(&leg.entry.transaction_no).await? {
                return Err(LedgerError::DuplicateTransaction(
                    leg.entry.transaction_no.to_string(),
                ));
            }
        }

        let owner = current.snapshot_owner();
        let original = Self::lock_accounts(&mut tx, &resolution.lock_order(owner)).await?;
        let mut working = original.clone();

        let (balance_before, balance_after) = if resolution.deltas.is_empty() {
            (current.balance_before, current.balance_after)
        } else {
            apply_deltas(&mut working, &resolution.deltas, owner)?
        };
        let applied = apply_legs(&mut working, resolution.follow_up)?;

        let metadata = match resolution.audit {
            Some(audit) => Some(merge_audit(current.metadata.clone(), audit)),
            None => current.metadata.clone(),
        };
        let metadata = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LedgerError::Storage(format!("encode metadata: {}", e)))?;

        // CAS on status; the row lock makes this a formality
        let sql = format!(
            "UPDATE ledger_entries
             SET status = $1, completed_at = NOW(), balance_before = $2, balance_after = $3, metadata = $4
             WHERE id = $5 AND status = $6
             RETURNING {}",
            ENTRY_COLUMNS
        );
        let updated = sqlx::query(&sql)
            .bind(resolution.target_status.id())
            .bind(balance_before)
            .bind(balance_after)
            .bind(metadata)
            .bind(current.id)
            .bind(EntryStatus::Pending.id())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                LedgerError::InvalidState(format!("{} changed concurrently", current.transaction_no))
            })?;

        Self::write_accounts(&mut tx, &original, &working).await?;

        let mut rows = vec![row_to_entry(&updated)?];
        for leg in applied {
            rows.push(Self::insert_leg(&mut tx, leg).await?);
        }

        tx.commit().await?;
        Ok(rows)
    }

    async fn entry(&self, transaction_no: &TransactionNo) -> LedgerResult<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE transaction_no = $1",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(transaction_no.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_entries(&self, query: &EntryQuery) -> LedgerResult<EntryPage> {
        let mut select: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM ledger_entries", ENTRY_COLUMNS));
        push_filter(&mut select, query);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = select.build().fetch_all(&self.pool).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(row_to_entry(row)?);
        }

        let total = if query.count_total {
            let mut count: QueryBuilder<Postgres> =
                QueryBuilder::new("SELECT COUNT(*) FROM ledger_entries");
            push_filter(&mut count, query);
            let n: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;
            Some(n as u64)
        } else {
            None
        };

        Ok(EntryPage { entries, total })
    }

    async fn statistics(
        &self,
        user_id: UserId,
        today_start: DateTime<Utc>,
    ) -> LedgerResult<LedgerStatistics> {
        let outflow: Vec<i16> = types_with_flow(&[Flow::Bidirectional, Flow::DebitOnly]);
        let inflow: Vec<i16> = types_with_flow(&[Flow::Bidirectional, Flow::CreditOnly]);

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE from_user_id = $1 AND entry_type = ANY($2)), 0) AS total_sent,
                COALESCE(SUM(amount) FILTER (WHERE from_user_id = $1 AND entry_type = ANY($2) AND created_at >= $4), 0) AS today_sent,
                COALESCE(SUM(amount) FILTER (WHERE to_user_id = $1 AND from_user_id IS DISTINCT FROM $1 AND entry_type = ANY($3)), 0) AS total_received,
                COALESCE(SUM(amount) FILTER (WHERE to_user_id = $1 AND from_user_id IS DISTINCT FROM $1 AND entry_type = ANY($3) AND created_at >= $4), 0) AS today_received
            FROM ledger_entries
            WHERE status = $5 AND (from_user_id = $1 OR to_user_id = $1)
            "#,
        )
        .bind(user_id)
        .bind(outflow)
        .bind(inflow)
        .bind(today_start)
        .bind(EntryStatus::Completed.id())
        .fetch_one(&self.pool)
        .await?;

        let total_sent: Decimal = row.try_get("total_sent")?;
        let total_received: Decimal = row.try_get("total_received")?;
        Ok(LedgerStatistics {
            user_id,
            total_sent,
            total_received,
            today_sent: row.try_get("today_sent")?,
            today_received: row.try_get("today_received")?,
            net: total_received - total_sent,
        })
    }
}

fn types_with_flow(flows: &[Flow]) -> Vec<i16> {
    EntryType::ALL
        .iter()
        .filter(|t| flows.contains(&t.flow()))
        .map(EntryType::id)
        .collect()
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, query: &EntryQuery) {
    qb.push(" WHERE TRUE");
    if let Some(user_id) = query.user_id {
        qb.push(" AND (from_user_id = ")
            .push_bind(user_id)
            .push(" OR to_user_id = ")
            .push_bind(user_id)
            .push(")");
    }
    if let Some(entry_type) = query.entry_type {
        qb.push(" AND entry_type = ").push_bind(entry_type.id());
    }
    if let Some(status) = query.status {
        qb.push(" AND status = ").push_bind(status.id());
    }
    if let Some(from) = query.date_from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = query.date_to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
}

/// Convert database row to LedgerEntry
fn row_to_entry(row: &PgRow) -> LedgerResult<LedgerEntry> {
    let transaction_no: String = row.try_get("transaction_no")?;
    let transaction_no = TransactionNo::parse(transaction_no.clone())
        .ok_or_else(|| LedgerError::Storage(format!("Invalid transaction_no: {}", transaction_no)))?;

    let type_id: i16 = row.try_get("entry_type")?;
    let entry_type = EntryType::from_id(type_id)
        .ok_or_else(|| LedgerError::Storage(format!("Invalid entry_type: {}", type_id)))?;

    let status_id: i16 = row.try_get("status")?;
    let status = EntryStatus::from_id(status_id)
        .ok_or_else(|| LedgerError::Storage(format!("Invalid status: {}", status_id)))?;

    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = match metadata {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(transaction_no = %transaction_no, "unreadable metadata: {}", e);
                Some(serde_json::Value::String(raw))
            }
        },
        None => None,
    };

    Ok(LedgerEntry {
        id: row.try_get("id")?,
        transaction_no,
        from_user_id: row.try_get("from_user_id")?,
        to_user_id: row.try_get("to_user_id")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        entry_type,
        status,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        description: row.try_get("description")?,
        metadata,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
