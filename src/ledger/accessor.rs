//! Balance Accessor
//!
//! The single place where a user's `balance`/`frozen` pair is recomputed.
//! Stores call [`adjust`] while holding the row lock and write the result
//! back in the same transaction as the ledger entry.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::error::{LedgerError, LedgerResult};
use super::types::{AccountBalance, UserId};

/// Largest balance or amount the ledger holds: 16 integer digits, the
/// capacity of the `NUMERIC(24, 8)` columns
pub const MAX_LEDGER_AMOUNT: Decimal = Decimal::from_parts(0x6FC0_FFFF, 0x0023_86F2, 0, false, 0);

/// Signed change to one account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceDelta {
    pub user_id: UserId,
    pub balance: Decimal,
    pub frozen: Decimal,
}

impl BalanceDelta {
    pub fn new(user_id: UserId, balance: Decimal, frozen: Decimal) -> Self {
        Self {
            user_id,
            balance,
            frozen,
        }
    }

    /// `balance += amount`
    pub fn credit(user_id: UserId, amount: Decimal) -> Self {
        Self::new(user_id, amount, Decimal::ZERO)
    }

    /// `balance -= amount` out of available funds
    pub fn debit(user_id: UserId, amount: Decimal) -> Self {
        Self::new(user_id, -amount, Decimal::ZERO)
    }

    /// `frozen += amount`
    pub fn freeze(user_id: UserId, amount: Decimal) -> Self {
        Self::new(user_id, Decimal::ZERO, amount)
    }

    /// `frozen -= amount`
    pub fn unfreeze(user_id: UserId, amount: Decimal) -> Self {
        Self::new(user_id, Decimal::ZERO, -amount)
    }

    /// `balance -= amount`, `frozen -= amount` (spend a hold)
    pub fn consume_frozen(user_id: UserId, amount: Decimal) -> Self {
        Self::new(user_id, -amount, -amount)
    }
}

/// Apply a delta to the locked row
///
/// Fails without side effects when the result would break
/// `0 <= frozen <= balance` or exceed [`MAX_LEDGER_AMOUNT`].
pub fn adjust(
    user_id: UserId,
    current: AccountBalance,
    balance_delta: Decimal,
    frozen_delta: Decimal,
) -> LedgerResult<AccountBalance> {
    let (Some(balance), Some(frozen)) = (
        current.balance.checked_add(balance_delta),
        current.frozen.checked_add(frozen_delta),
    ) else {
        return Err(ceiling_exceeded(user_id));
    };
    let next = AccountBalance::new(balance, frozen);

    if next.frozen < Decimal::ZERO {
        return Err(LedgerError::InvalidState(format!(
            "user {} releases {} but only {} is frozen",
            user_id, -frozen_delta, current.frozen
        )));
    }

    if next.balance < Decimal::ZERO || next.frozen > next.balance {
        // what the operation needed out of available funds
        let required = (-balance_delta).max(Decimal::ZERO) + frozen_delta.max(Decimal::ZERO)
            - (-frozen_delta).max(Decimal::ZERO);
        return Err(LedgerError::InsufficientFunds {
            user_id,
            available: current.available(),
            required: required.max(Decimal::ZERO),
        });
    }

    if next.balance > MAX_LEDGER_AMOUNT {
        return Err(ceiling_exceeded(user_id));
    }

    Ok(next)
}

fn ceiling_exceeded(user_id: UserId) -> LedgerError {
    LedgerError::LimitExceeded(format!(
        "balance of user {} would exceed {}",
        user_id, MAX_LEDGER_AMOUNT
    ))
}

/// Merge deltas per account, keyed in ascending user-id order
///
/// Iterating the result yields the global lock order, so two postings that
/// touch the same pair of accounts always lock them the same way round.
pub fn merge_deltas(deltas: &[BalanceDelta]) -> BTreeMap<UserId, (Decimal, Decimal)> {
    let mut merged: BTreeMap<UserId, (Decimal, Decimal)> = BTreeMap::new();
    for delta in deltas {
        let slot = merged
            .entry(delta.user_id)
            .or_insert((Decimal::ZERO, Decimal::ZERO));
        slot.0 += delta.balance;
        slot.1 += delta.frozen;
    }
    merged
}
