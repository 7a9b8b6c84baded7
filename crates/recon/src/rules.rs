use chrono::NaiveDate;
use fibu_core::{InvoiceOrigin, TransactionSource};
use serde::{Deserialize, Serialize};

use crate::util::normalize_counterparty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Contains,
    Exact,
}

impl std::str::FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contains" => Ok(TriggerKind::Contains),
            "exact" => Ok(TriggerKind::Exact),
            other => Err(format!("Unknown trigger kind: '{other}'")),
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Contains => write!(f, "contains"),
            TriggerKind::Exact => write!(f, "exact"),
        }
    }
}

/// What a rule resolves to: either a direct account booking or a
/// restriction of the heuristic search to one invoice population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Account(String),
    Origin(InvoiceOrigin),
}

#[derive(Debug, Clone)]
pub struct MatchingRule {
    pub id: Option<i64>,
    pub pattern: String,
    pub kind: TriggerKind,
    /// When set, the rule only fires for transactions from this source.
    pub source_scope: Option<TransactionSource>,
    pub target: RuleTarget,
    pub confidence: f32,
    pub hit_count: i64,
    pub last_applied: Option<NaiveDate>,
}

impl MatchingRule {
    pub fn matches(&self, source: TransactionSource, counterparty_text: &str) -> bool {
        if let Some(scope) = self.source_scope {
            if scope != source {
                return false;
            }
        }
        let text = normalize_counterparty(counterparty_text);
        let pattern = normalize_counterparty(&self.pattern);
        match self.kind {
            TriggerKind::Contains => text.contains(&pattern),
            TriggerKind::Exact => text == pattern,
        }
    }
}

/// Immutable per-pass snapshot of the active rule set. Rules below the
/// confidence floor are left out entirely, so a demoted rule falls back
/// to heuristic matching without any special casing in the engine.
pub struct RuleSet {
    rules: Vec<MatchingRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<MatchingRule>, confidence_floor: f32) -> Self {
        rules.retain(|r| r.confidence >= confidence_floor);
        // Most trusted rule wins when several patterns overlap.
        rules.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn find_match(
        &self,
        source: TransactionSource,
        counterparty_text: &str,
    ) -> Option<&MatchingRule> {
        self.rules
            .iter()
            .find(|r| r.matches(source, counterparty_text))
    }
}

/// TOML shape for seed rules, exactly one of `target_account` /
/// `target_origin` must be set.
#[derive(Debug, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub kind: TriggerKind,
    pub source: Option<TransactionSource>,
    pub target_account: Option<String>,
    pub target_origin: Option<InvoiceOrigin>,
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<RuleSpec>,
}

impl RuleSpec {
    fn into_rule(self) -> Result<MatchingRule, String> {
        let target = match (self.target_account, self.target_origin) {
            (Some(account), None) => RuleTarget::Account(account),
            (None, Some(origin)) => RuleTarget::Origin(origin),
            _ => {
                return Err(format!(
                    "Rule '{}' must set exactly one of target_account / target_origin",
                    self.pattern
                ))
            }
        };
        Ok(MatchingRule {
            id: None,
            pattern: self.pattern,
            kind: self.kind,
            source_scope: self.source,
            target,
            confidence: self.confidence.clamp(0.0, 1.0),
            hit_count: 0,
            last_applied: None,
        })
    }
}

/// Parses a TOML rule table into plain rules (no floor applied yet).
pub fn rules_from_toml(toml_content: &str) -> Result<Vec<MatchingRule>, String> {
    let file: RuleFile =
        toml::from_str(toml_content).map_err(|e| format!("Failed to parse TOML: {e}"))?;
    file.rule.into_iter().map(RuleSpec::into_rule).collect()
}

/// Baseline rule set seeded at initialization. Aggregator payouts go to
/// their settlement populations, well-known fee lines to fixed accounts.
pub const DEFAULT_RULES: &str = r#"
[[rule]]
pattern = "amazon payment"
kind = "contains"
target_origin = "marketplace_settlement"
confidence = 0.95

[[rule]]
pattern = "paypal"
kind = "contains"
target_origin = "marketplace_settlement"
confidence = 0.9

[[rule]]
pattern = "kontofuehrung"
kind = "contains"
source = "bank"
target_account = "4970"
confidence = 0.9

[[rule]]
pattern = "deutsche post"
kind = "contains"
target_account = "4910"
confidence = 0.85
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, kind: TriggerKind, confidence: f32) -> MatchingRule {
        MatchingRule {
            id: None,
            pattern: pattern.to_string(),
            kind,
            source_scope: None,
            target: RuleTarget::Account("4980".to_string()),
            confidence,
            hit_count: 0,
            last_applied: None,
        }
    }

    #[test]
    fn contains_match_normalizes_case_and_punctuation() {
        let set = RuleSet::new(vec![rule("amazon payment", TriggerKind::Contains, 0.9)], 0.5);
        assert!(set
            .find_match(TransactionSource::Bank, "AMAZON PAYMENT EUROPE S.C.A.")
            .is_some());
    }

    #[test]
    fn exact_match_rejects_longer_text() {
        let set = RuleSet::new(vec![rule("paypal", TriggerKind::Exact, 0.9)], 0.5);
        assert!(set.find_match(TransactionSource::Bank, "PayPal").is_some());
        assert!(set
            .find_match(TransactionSource::Bank, "PayPal Europe")
            .is_none());
    }

    #[test]
    fn floor_excludes_demoted_rules() {
        let set = RuleSet::new(vec![rule("paypal", TriggerKind::Contains, 0.3)], 0.5);
        assert!(set.is_empty());
        assert!(set.find_match(TransactionSource::Bank, "paypal").is_none());
    }

    #[test]
    fn higher_confidence_rule_wins_overlap() {
        let mut weak = rule("amazon", TriggerKind::Contains, 0.6);
        weak.target = RuleTarget::Account("1111".to_string());
        let strong = rule("amazon payment", TriggerKind::Contains, 0.95);
        let set = RuleSet::new(vec![weak, strong], 0.5);
        let hit = set
            .find_match(TransactionSource::Bank, "Amazon Payment")
            .unwrap();
        assert_eq!(hit.target, RuleTarget::Account("4980".to_string()));
    }

    #[test]
    fn source_scope_limits_rule() {
        let mut r = rule("kontofuehrung", TriggerKind::Contains, 0.9);
        r.source_scope = Some(TransactionSource::Bank);
        let set = RuleSet::new(vec![r], 0.5);
        assert!(set
            .find_match(TransactionSource::Bank, "Kontoführungsentgelt")
            .is_none());
        assert!(set
            .find_match(TransactionSource::Bank, "Kontofuehrung Entgelt")
            .is_some());
        assert!(set
            .find_match(TransactionSource::PaymentProcessor, "Kontofuehrung")
            .is_none());
    }

    #[test]
    fn default_rules_parse() {
        let rules = rules_from_toml(DEFAULT_RULES).unwrap();
        assert_eq!(rules.len(), 4);
        assert!(rules
            .iter()
            .any(|r| r.target == RuleTarget::Origin(InvoiceOrigin::MarketplaceSettlement)));
    }

    #[test]
    fn rule_file_requires_exactly_one_target() {
        let bad = r#"
            [[rule]]
            pattern = "x"
            confidence = 0.5
        "#;
        assert!(rules_from_toml(bad).is_err());
    }
}
