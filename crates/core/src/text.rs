/// Folds a counterparty string to lowercase alphanumeric words separated
/// by single spaces. Creditor mappings, rule patterns and learning all
/// key on this form, so "ACME  GmbH" and "acme gmbh" collide.
pub fn normalize_counterparty(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_punctuation_and_case() {
        assert_eq!(
            normalize_counterparty("ACME  GmbH & Co. KG"),
            "acme gmbh co kg"
        );
    }

    #[test]
    fn idempotent() {
        let once = normalize_counterparty("PayPal (Europe) S.a r.l.");
        assert_eq!(normalize_counterparty(&once), once);
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_counterparty("  ,, "), "");
    }
}
