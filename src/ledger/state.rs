//! Entry Status State Machine
//!
//! State IDs are stored as SMALLINT in `ledger_entries.status`.
//!
//! ```text
//! PENDING → PROCESSING → COMPLETED
//!    │           │
//!    │           ├─────→ FAILED
//!    └───────────┴─────→ CANCELLED
//! ```
//!
//! Terminal rows are never updated. The only row that legitimately leaves
//! PENDING after creation is a withdrawal request, driven by
//! [`WithdrawalDecision`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum EntryStatus {
    /// Recorded, awaiting an external decision (withdrawal audit)
    Pending = 0,

    /// Decision taken, settlement in progress
    Processing = 10,

    /// Terminal: value moved
    Completed = 20,

    /// Terminal: rejected by the system
    Failed = -10,

    /// Terminal: reversed by an operator (compensating entry posted)
    Cancelled = -20,
}

impl EntryStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Cancelled
        )
    }

    /// Allowed transitions
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Pending, EntryStatus::Processing)
                | (EntryStatus::Pending, EntryStatus::Completed)
                | (EntryStatus::Pending, EntryStatus::Cancelled)
                | (EntryStatus::Pending, EntryStatus::Failed)
                | (EntryStatus::Processing, EntryStatus::Completed)
                | (EntryStatus::Processing, EntryStatus::Failed)
                | (EntryStatus::Processing, EntryStatus::Cancelled)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(EntryStatus::Pending),
            10 => Some(EntryStatus::Processing),
            20 => Some(EntryStatus::Completed),
            -10 => Some(EntryStatus::Failed),
            -20 => Some(EntryStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Processing => "PROCESSING",
            EntryStatus::Completed => "COMPLETED",
            EntryStatus::Failed => "FAILED",
            EntryStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for EntryStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        EntryStatus::from_id(value).ok_or(())
    }
}

/// Auditor decision on a pending withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalDecision {
    /// Debit balance and frozen by the amount
    Approve,
    /// Release the hold (UNFREEZE)
    Reject,
}

impl WithdrawalDecision {
    pub fn from_approve(approve: bool) -> Self {
        if approve {
            WithdrawalDecision::Approve
        } else {
            WithdrawalDecision::Reject
        }
    }

    /// Status the withdrawal row moves to
    pub fn target_status(&self) -> EntryStatus {
        match self {
            WithdrawalDecision::Approve => EntryStatus::Completed,
            WithdrawalDecision::Reject => EntryStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalDecision::Approve => "APPROVE",
            WithdrawalDecision::Reject => "REJECT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(EntryStatus::Completed.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
        assert!(EntryStatus::Cancelled.is_terminal());

        assert!(!EntryStatus::Pending.is_terminal());
        assert!(!EntryStatus::Processing.is_terminal());
    }

    #[test]
    fn test_terminal_states_do_not_transition() {
        let all = [
            EntryStatus::Pending,
            EntryStatus::Processing,
            EntryStatus::Completed,
            EntryStatus::Failed,
            EntryStatus::Cancelled,
        ];
        for from in [
            EntryStatus::Completed,
            EntryStatus::Failed,
            EntryStatus::Cancelled,
        ] {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(EntryStatus::Pending.can_transition_to(EntryStatus::Completed));
        assert!(EntryStatus::Pending.can_transition_to(EntryStatus::Cancelled));
        assert!(!EntryStatus::Processing.can_transition_to(EntryStatus::Pending));
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in [
            EntryStatus::Pending,
            EntryStatus::Processing,
            EntryStatus::Completed,
            EntryStatus::Failed,
            EntryStatus::Cancelled,
        ] {
            assert_eq!(EntryStatus::from_id(state.id()), Some(state));
        }
        assert!(EntryStatus::from_id(999).is_none());
    }

    #[test]
    fn test_decision_targets() {
        assert_eq!(
            WithdrawalDecision::from_approve(true).target_status(),
            EntryStatus::Completed
        );
        assert_eq!(
            WithdrawalDecision::from_approve(false).target_status(),
            EntryStatus::Cancelled
        );
    }
}
