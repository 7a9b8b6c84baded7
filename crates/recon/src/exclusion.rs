use fibu_core::InvoiceOrigin;
use serde::Deserialize;

use crate::util::normalize_counterparty;

/// One exclusion category: counterparties matching any pattern may only
/// be matched against invoices from the permitted origin population.
///
/// The canonical case: aggregator payout transactions must never be
/// credited against direct sales invoices, only against the invoices
/// generated to represent that payout.
#[derive(Debug, Clone, Deserialize)]
pub struct ExclusionCategory {
    pub name: String,
    pub patterns: Vec<String>,
    pub permitted_origin: InvoiceOrigin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExclusionPolicy {
    #[serde(default)]
    pub category: Vec<ExclusionCategory>,
}

/// Built-in policy applied when no policy file is configured.
pub const DEFAULT_POLICY: &str = r#"
[[category]]
name = "payment_aggregator"
patterns = ["amazon payment", "amazon pay", "paypal", "klarna"]
permitted_origin = "marketplace_settlement"
"#;

impl Default for ExclusionPolicy {
    fn default() -> Self {
        // The embedded default is a compile-checked constant; parsing it
        // cannot fail once the tests pass.
        ExclusionPolicy::from_toml(DEFAULT_POLICY).expect("default exclusion policy parses")
    }
}

impl ExclusionPolicy {
    pub fn from_toml(toml_content: &str) -> Result<Self, String> {
        toml::from_str(toml_content).map_err(|e| format!("Failed to parse TOML: {e}"))
    }

    pub fn empty() -> Self {
        ExclusionPolicy { category: vec![] }
    }

    /// Returns the category restricting this counterparty, if any.
    pub fn category_for(&self, counterparty: &str) -> Option<&ExclusionCategory> {
        let text = normalize_counterparty(counterparty);
        self.category.iter().find(|cat| {
            cat.patterns
                .iter()
                .any(|p| text.contains(&normalize_counterparty(p)))
        })
    }

    pub fn permitted_origin(&self, counterparty: &str) -> Option<InvoiceOrigin> {
        self.category_for(counterparty).map(|c| c.permitted_origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_restricts_aggregators() {
        let policy = ExclusionPolicy::default();
        assert_eq!(
            policy.permitted_origin("AMAZON PAYMENT EUROPE S.C.A."),
            Some(InvoiceOrigin::MarketplaceSettlement)
        );
        assert_eq!(
            policy.permitted_origin("PayPal (Europe) S.a r.l."),
            Some(InvoiceOrigin::MarketplaceSettlement)
        );
        assert_eq!(policy.permitted_origin("ACME GmbH"), None);
    }

    #[test]
    fn custom_policy_from_toml() {
        let policy = ExclusionPolicy::from_toml(
            r#"
            [[category]]
            name = "wholesale"
            patterns = ["metro"]
            permitted_origin = "purchase"
            "#,
        )
        .unwrap();
        assert_eq!(
            policy.permitted_origin("METRO Cash & Carry"),
            Some(InvoiceOrigin::Purchase)
        );
    }

    #[test]
    fn empty_policy_restricts_nothing() {
        assert_eq!(
            ExclusionPolicy::empty().permitted_origin("Amazon Payment"),
            None
        );
    }
}
