//! Ledger policy: persisted limits and fee settings.
//!
//! The policy lives in the store (`ledger_settings`) and is loaded on every
//! mutating call, so operators can change limits without a redeploy.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::accessor::MAX_LEDGER_AMOUNT;
use super::error::{LedgerError, LedgerResult};
use super::types::UserId;

/// Window the daily transfer limit is measured over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyWindow {
    /// Since 00:00 UTC of the current day
    #[default]
    CalendarDay,
    /// The last 24 hours
    Rolling24h,
}

/// Business policy applied by the transfer and withdrawal paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerPolicy {
    pub min_transfer_amount: Decimal,
    pub max_transfer_amount: Decimal,
    pub daily_transfer_limit: Decimal,
    /// Fraction of the amount withheld from the sender (0.01 = 1%)
    pub transfer_fee_rate: Decimal,
    /// Balances above this may be flagged for review by the caller
    pub freeze_threshold: Decimal,
    /// Account credited with transfer fees; fees are burned when unset
    pub fee_sink_user_id: Option<UserId>,
    pub daily_limit_window: DailyWindow,
    /// Maximum fractional digits of any amount
    pub amount_scale: u32,
    pub min_withdrawal_amount: Decimal,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            min_transfer_amount: Decimal::new(1, 2),
            max_transfer_amount: Decimal::from(1_000_000),
            daily_transfer_limit: Decimal::from(5_000_000),
            transfer_fee_rate: Decimal::ZERO,
            freeze_threshold: Decimal::from(1_000_000),
            fee_sink_user_id: None,
            daily_limit_window: DailyWindow::CalendarDay,
            amount_scale: 2,
            min_withdrawal_amount: Decimal::ZERO,
        }
    }
}

impl LedgerPolicy {
    /// Validate a policy before it is persisted or used
    pub fn validate(&self) -> Result<(), String> {
        if self.min_transfer_amount < Decimal::ZERO {
            return Err("min_transfer_amount must not be negative".to_string());
        }
        if self.max_transfer_amount < self.min_transfer_amount {
            return Err(format!(
                "max_transfer_amount {} is below min_transfer_amount {}",
                self.max_transfer_amount, self.min_transfer_amount
            ));
        }
        if self.daily_transfer_limit <= Decimal::ZERO {
            return Err("daily_transfer_limit must be positive".to_string());
        }
        if self.transfer_fee_rate < Decimal::ZERO || self.transfer_fee_rate >= Decimal::ONE {
            return Err(format!(
                "transfer_fee_rate {} must be in [0, 1)",
                self.transfer_fee_rate
            ));
        }
        if self.amount_scale > 8 {
            return Err(format!("amount_scale {} exceeds 8", self.amount_scale));
        }
        if self.min_withdrawal_amount < Decimal::ZERO {
            return Err("min_withdrawal_amount must not be negative".to_string());
        }
        Ok(())
    }

    /// Reject non-positive amounts, amounts above [`MAX_LEDGER_AMOUNT`] and
    /// amounts finer than `amount_scale`
    pub fn check_amount(&self, amount: Decimal) -> LedgerResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "{} must be greater than zero",
                amount
            )));
        }
        if amount > MAX_LEDGER_AMOUNT {
            return Err(LedgerError::InvalidAmount(format!(
                "{} exceeds the ledger maximum {}",
                amount, MAX_LEDGER_AMOUNT
            )));
        }
        let normalized = amount.normalize();
        if normalized.scale() > self.amount_scale {
            return Err(LedgerError::InvalidAmount(format!(
                "{} has more than {} decimal places",
                amount, self.amount_scale
            )));
        }
        Ok(normalized)
    }

    /// Per-transfer range check
    pub fn check_transfer_range(&self, amount: Decimal) -> LedgerResult<()> {
        if amount < self.min_transfer_amount {
            return Err(LedgerError::LimitExceeded(format!(
                "amount {} is below the minimum {}",
                amount, self.min_transfer_amount
            )));
        }
        if amount > self.max_transfer_amount {
            return Err(LedgerError::LimitExceeded(format!(
                "amount {} exceeds the maximum {}",
                amount, self.max_transfer_amount
            )));
        }
        Ok(())
    }

    /// Transfer fee, rounded half-up to `amount_scale`
    pub fn transfer_fee(&self, amount: Decimal) -> Decimal {
        if self.transfer_fee_rate.is_zero() {
            return Decimal::ZERO;
        }
        (amount * self.transfer_fee_rate)
            .round_dp_with_strategy(self.amount_scale, RoundingStrategy::MidpointAwayFromZero)
            .normalize()
    }

    /// Start of the window the daily limit is measured over
    pub fn daily_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.daily_limit_window {
            DailyWindow::Rolling24h => now - Duration::hours(24),
            DailyWindow::CalendarDay => start_of_day(now),
        }
    }

    pub fn exceeds_review_threshold(&self, balance: Decimal) -> bool {
        balance > self.freeze_threshold
    }
}

/// 00:00 UTC of the day containing `now`
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_default_policy_is_valid() {
        assert!(LedgerPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let policy = LedgerPolicy {
            min_transfer_amount: dec("10"),
            max_transfer_amount: dec("5"),
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let policy = LedgerPolicy {
            transfer_fee_rate: dec("1"),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_check_amount() {
        let policy = LedgerPolicy::default();
        assert!(policy.check_amount(Decimal::ZERO).is_err());
        assert!(policy.check_amount(dec("-1")).is_err());
        assert!(policy.check_amount(dec("0.001")).is_err());
        assert_eq!(policy.check_amount(dec("1.50")).unwrap(), dec("1.5"));
        assert_eq!(policy.check_amount(dec("100.000")).unwrap(), dec("100"));
        assert_eq!(policy.check_amount(Decimal::MAX).unwrap_err().code(), "INVALID_AMOUNT");
        assert!(policy.check_amount(MAX_LEDGER_AMOUNT).is_ok());
    }

    #[test]
    fn test_transfer_fee() {
        let policy = LedgerPolicy {
            transfer_fee_rate: dec("0.01"),
            ..Default::default()
        };
        assert_eq!(policy.transfer_fee(dec("100")), dec("1"));
        // 0.125 rounds half away from zero at scale 2
        assert_eq!(policy.transfer_fee(dec("12.5")), dec("0.13"));
        assert_eq!(LedgerPolicy::default().transfer_fee(dec("100")), Decimal::ZERO);
    }

    #[test]
    fn test_transfer_range() {
        let policy = LedgerPolicy {
            min_transfer_amount: dec("1"),
            max_transfer_amount: dec("1000"),
            ..Default::default()
        };
        assert!(policy.check_transfer_range(dec("1")).is_ok());
        assert!(policy.check_transfer_range(dec("1000")).is_ok());
        assert_eq!(
            policy.check_transfer_range(dec("0.5")).unwrap_err().code(),
            "LIMIT_EXCEEDED"
        );
        assert!(policy.check_transfer_range(dec("1000.01")).is_err());
    }

    #[test]
    fn test_daily_window_start() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 15, 30, 0).unwrap();
        let calendar = LedgerPolicy::default();
        assert_eq!(
            calendar.daily_window_start(now),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
        );

        let rolling = LedgerPolicy {
            daily_limit_window: DailyWindow::Rolling24h,
            ..Default::default()
        };
        assert_eq!(
            rolling.daily_window_start(now),
            Utc.with_ymd_and_hms(2024, 3, 4, 15, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_policy_json_roundtrip_keeps_decimals_exact() {
        let policy = LedgerPolicy {
            transfer_fee_rate: dec("0.015"),
            fee_sink_user_id: Some(1),
            ..Default::default()
        };
        let json = serde_json::to_string(&policy).unwrap();
        let back: LedgerPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
