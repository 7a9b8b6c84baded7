use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a payment/settlement event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    Bank,
    MarketplaceSettlement,
    PaymentProcessor,
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionSource::Bank => write!(f, "bank"),
            TransactionSource::MarketplaceSettlement => write!(f, "marketplace_settlement"),
            TransactionSource::PaymentProcessor => write!(f, "payment_processor"),
        }
    }
}

impl FromStr for TransactionSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bank" => Ok(TransactionSource::Bank),
            "marketplace_settlement" => Ok(TransactionSource::MarketplaceSettlement),
            "payment_processor" => Ok(TransactionSource::PaymentProcessor),
            other => Err(format!("Unknown transaction source: '{other}'")),
        }
    }
}

/// Which import population an invoice belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceOrigin {
    Sales,
    Purchase,
    MarketplaceSettlement,
}

impl fmt::Display for InvoiceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvoiceOrigin::Sales => write!(f, "sales"),
            InvoiceOrigin::Purchase => write!(f, "purchase"),
            InvoiceOrigin::MarketplaceSettlement => write!(f, "marketplace_settlement"),
        }
    }
}

impl FromStr for InvoiceOrigin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sales" => Ok(InvoiceOrigin::Sales),
            "purchase" => Ok(InvoiceOrigin::Purchase),
            "marketplace_settlement" => Ok(InvoiceOrigin::MarketplaceSettlement),
            other => Err(format!("Unknown invoice origin: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Open,
    PartiallyPaid,
    Paid,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Open => write!(f, "open"),
            PaymentStatus::PartiallyPaid => write!(f, "partially_paid"),
            PaymentStatus::Paid => write!(f, "paid"),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PaymentStatus::Open),
            "partially_paid" => Ok(PaymentStatus::PartiallyPaid),
            "paid" => Ok(PaymentStatus::Paid),
            other => Err(format!("Unknown payment status: '{other}'")),
        }
    }
}

/// Per-transaction reconciliation state machine.
///
/// `Unmatched → InProgress → RuleMatched | HeuristicMatched | Ambiguous
/// | Excluded → Confirmed`; a reversal returns the transaction to
/// `Unmatched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Unmatched,
    InProgress,
    RuleMatched,
    HeuristicMatched,
    Ambiguous,
    Excluded,
    Confirmed,
}

impl MatchState {
    pub fn is_matched(self) -> bool {
        matches!(
            self,
            MatchState::RuleMatched | MatchState::HeuristicMatched | MatchState::Confirmed
        )
    }

    /// States an export run will pick up.
    pub fn is_exportable(self) -> bool {
        self.is_matched()
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchState::Unmatched => write!(f, "unmatched"),
            MatchState::InProgress => write!(f, "in_progress"),
            MatchState::RuleMatched => write!(f, "rule_matched"),
            MatchState::HeuristicMatched => write!(f, "heuristic_matched"),
            MatchState::Ambiguous => write!(f, "ambiguous"),
            MatchState::Excluded => write!(f, "excluded"),
            MatchState::Confirmed => write!(f, "confirmed"),
        }
    }
}

impl FromStr for MatchState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unmatched" => Ok(MatchState::Unmatched),
            "in_progress" => Ok(MatchState::InProgress),
            "rule_matched" => Ok(MatchState::RuleMatched),
            "heuristic_matched" => Ok(MatchState::HeuristicMatched),
            "ambiguous" => Ok(MatchState::Ambiguous),
            "excluded" => Ok(MatchState::Excluded),
            "confirmed" => Ok(MatchState::Confirmed),
            other => Err(format!("Unknown match state: '{other}'")),
        }
    }
}

/// How a history entry came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoRule,
    AutoHeuristic,
    Manual,
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::AutoRule => write!(f, "auto_rule"),
            Decision::AutoHeuristic => write!(f, "auto_heuristic"),
            Decision::Manual => write!(f, "manual"),
            Decision::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_rule" => Ok(Decision::AutoRule),
            "auto_heuristic" => Ok(Decision::AutoHeuristic),
            "manual" => Ok(Decision::Manual),
            "rejected" => Ok(Decision::Rejected),
            other => Err(format!("Unknown decision: '{other}'")),
        }
    }
}

/// German VAT brackets the export knows tax accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatBracket {
    Zero,
    Reduced7,
    Standard19,
}

impl VatBracket {
    /// Rounds a raw percentage to the nearest known bracket. Rates that
    /// are not close to any bracket yield `None`; the export then emits
    /// an empty tax account instead of inventing one.
    pub fn nearest(rate_percent: f64) -> Option<VatBracket> {
        match rate_percent {
            r if (-1.0..=1.0).contains(&r) => Some(VatBracket::Zero),
            r if (6.0..=8.0).contains(&r) => Some(VatBracket::Reduced7),
            r if (18.0..=20.0).contains(&r) => Some(VatBracket::Standard19),
            _ => None,
        }
    }

    pub fn percent(self) -> f64 {
        match self {
            VatBracket::Zero => 0.0,
            VatBracket::Reduced7 => 7.0,
            VatBracket::Standard19 => 19.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codec_round_trip() {
        for state in [
            MatchState::Unmatched,
            MatchState::InProgress,
            MatchState::RuleMatched,
            MatchState::HeuristicMatched,
            MatchState::Ambiguous,
            MatchState::Excluded,
            MatchState::Confirmed,
        ] {
            assert_eq!(state.to_string().parse::<MatchState>().unwrap(), state);
        }
    }

    #[test]
    fn vat_bracket_rounding() {
        assert_eq!(VatBracket::nearest(19.0), Some(VatBracket::Standard19));
        assert_eq!(VatBracket::nearest(18.6), Some(VatBracket::Standard19));
        assert_eq!(VatBracket::nearest(7.2), Some(VatBracket::Reduced7));
        assert_eq!(VatBracket::nearest(0.0), Some(VatBracket::Zero));
        assert_eq!(VatBracket::nearest(12.0), None);
    }

    #[test]
    fn matched_states() {
        assert!(MatchState::RuleMatched.is_matched());
        assert!(MatchState::Confirmed.is_matched());
        assert!(!MatchState::Ambiguous.is_matched());
        assert!(!MatchState::Excluded.is_matched());
    }
}
