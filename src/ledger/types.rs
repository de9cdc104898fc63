//! Ledger Core Types
//!
//! Identifiers, entry classification and the account/entry records shared by
//! every ledger component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::EntryStatus;

/// User identifier (primary key of the user entity owning the account)
pub type UserId = i64;

/// Transaction number - globally unique idempotency key of a ledger entry
///
/// Callers may supply their own; otherwise one is generated from the entry
/// type prefix and a ULID, so generated numbers sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionNo(String);

impl TransactionNo {
    /// Width of the `transaction_no` column
    pub const MAX_LEN: usize = 64;

    /// Longest caller-supplied number; leaves room for a `-XX` derived suffix
    pub const MAX_SUPPLIED_LEN: usize = Self::MAX_LEN - 3;

    /// Generate a fresh transaction number for an entry type
    pub fn generate(entry_type: EntryType) -> Self {
        Self(format!("{}{}", entry_type.prefix(), ulid::Ulid::new()))
    }

    /// Wrap a caller-supplied number
    ///
    /// Returns `None` for empty input or input longer than
    /// [`MAX_SUPPLIED_LEN`](Self::MAX_SUPPLIED_LEN).
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > Self::MAX_SUPPLIED_LEN {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// Caller-supplied number, or a generated one
    pub fn or_generate(supplied: Option<TransactionNo>, entry_type: EntryType) -> Self {
        supplied.unwrap_or_else(|| Self::generate(entry_type))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derived number for a secondary entry written in the same posting
    ///
    /// `suffix` is two characters, so the result always fits `MAX_LEN`.
    pub(crate) fn derived(&self, suffix: &'static str) -> Self {
        debug_assert_eq!(suffix.len(), 2);
        Self(format!("{}-{}", self.0, suffix))
    }
}

impl fmt::Display for TransactionNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TransactionNo {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How an entry type is allowed to move value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Only ever credits `to_user_id`; sender is the platform
    CreditOnly,
    /// Only ever debits the owner (`from_user_id == to_user_id`)
    DebitOnly,
    /// Debits a sender (user or platform) and credits a receiver
    Bidirectional,
    /// Moves value between available and frozen; total balance unchanged
    Hold,
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum EntryType {
    Purchase = 1,
    Transfer = 2,
    Recharge = 3,
    Withdraw = 4,
    Refund = 5,
    Commission = 6,
    Reward = 7,
    Freeze = 8,
    Unfreeze = 9,
}

impl EntryType {
    pub const ALL: [EntryType; 9] = [
        EntryType::Purchase,
        EntryType::Transfer,
        EntryType::Recharge,
        EntryType::Withdraw,
        EntryType::Refund,
        EntryType::Commission,
        EntryType::Reward,
        EntryType::Freeze,
        EntryType::Unfreeze,
    ];

    /// Direction table
    pub fn flow(&self) -> Flow {
        match self {
            EntryType::Recharge => Flow::CreditOnly,
            EntryType::Withdraw => Flow::DebitOnly,
            EntryType::Purchase
            | EntryType::Transfer
            | EntryType::Refund
            | EntryType::Commission
            | EntryType::Reward => Flow::Bidirectional,
            EntryType::Freeze | EntryType::Unfreeze => Flow::Hold,
        }
    }

    /// Whether the sender may be the platform (`from_user_id = None`)
    pub fn allows_system_origin(&self) -> bool {
        matches!(
            self,
            EntryType::Recharge | EntryType::Refund | EntryType::Commission | EntryType::Reward
        )
    }

    /// Whether a user-originated entry of this type counts toward the
    /// sender's daily transfer limit
    pub fn counts_toward_daily_limit(&self) -> bool {
        self.flow() == Flow::Bidirectional
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        EntryType::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Purchase => "PURCHASE",
            EntryType::Transfer => "TRANSFER",
            EntryType::Recharge => "RECHARGE",
            EntryType::Withdraw => "WITHDRAW",
            EntryType::Refund => "REFUND",
            EntryType::Commission => "COMMISSION",
            EntryType::Reward => "REWARD",
            EntryType::Freeze => "FREEZE",
            EntryType::Unfreeze => "UNFREEZE",
        }
    }

    /// Prefix of generated transaction numbers
    pub fn prefix(&self) -> &'static str {
        match self {
            EntryType::Purchase => "PU",
            EntryType::Transfer => "TR",
            EntryType::Recharge => "RC",
            EntryType::Withdraw => "WD",
            EntryType::Refund => "RF",
            EntryType::Commission => "CM",
            EntryType::Reward => "RW",
            EntryType::Freeze => "FZ",
            EntryType::Unfreeze => "UF",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        EntryType::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| format!("Invalid entry type: {}", s))
    }
}

impl TryFrom<i16> for EntryType {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        EntryType::from_id(value).ok_or(())
    }
}

/// Balance/frozen pair of one user account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub balance: Decimal,
    pub frozen: Decimal,
}

impl AccountBalance {
    pub fn new(balance: Decimal, frozen: Decimal) -> Self {
        Self { balance, frozen }
    }

    /// Spendable amount
    #[inline]
    pub fn available(&self) -> Decimal {
        self.balance - self.frozen
    }

    /// `balance >= 0`, `frozen >= 0`, `frozen <= balance`
    pub fn is_consistent(&self) -> bool {
        self.balance >= Decimal::ZERO
            && self.frozen >= Decimal::ZERO
            && self.frozen <= self.balance
    }
}

/// Client-facing balance view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    pub user_id: UserId,
    pub balance: Decimal,
    pub frozen: Decimal,
    pub available: Decimal,
    /// Balance exceeds the configured `freeze_threshold`; review policy is
    /// left to the caller
    pub above_review_threshold: bool,
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub transaction_no: TransactionNo,
    pub from_user_id: Option<UserId>,
    pub to_user_id: UserId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// User whose balance the snapshot describes
    pub fn snapshot_owner(&self) -> UserId {
        self.from_user_id.unwrap_or(self.to_user_id)
    }

    /// Whether `user_id` is on either side of the entry
    pub fn involves(&self, user_id: UserId) -> bool {
        self.to_user_id == user_id || self.from_user_id == Some(user_id)
    }

    /// Related order id stored in `metadata.related_order_id`, if any
    pub fn related_order_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("related_order_id"))
            .and_then(|v| v.as_str())
    }
}

/// Aggregated per-user statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStatistics {
    pub user_id: UserId,
    pub total_sent: Decimal,
    pub total_received: Decimal,
    pub today_sent: Decimal,
    pub today_received: Decimal,
    pub net: Decimal,
}

/// One page of query results
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub entries: Vec<LedgerEntry>,
    /// Total matching rows; in a degraded page this is `entries.len()`
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    /// The primary query exceeded its budget and the 30-day / 50-row
    /// degraded query answered instead
    pub degraded: bool,
}
