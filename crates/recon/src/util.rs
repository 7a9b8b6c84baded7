pub use fibu_core::normalize_counterparty;

/// Case-insensitive substring check for order references. Very short
/// references match too easily, so anything under four characters is
/// never treated as a hit.
pub fn contains_reference(haystack: &str, reference: &str) -> bool {
    let reference = reference.trim();
    if reference.len() < 4 {
        return false;
    }
    haystack.to_lowercase().contains(&reference.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_match_is_case_insensitive() {
        assert!(contains_reference("Zahlung RE-2025-0042 Danke", "re-2025-0042"));
        assert!(!contains_reference("Zahlung RE-2025-0042", "RE-9"));
    }

    #[test]
    fn short_references_never_match() {
        assert!(!contains_reference("order 42", "42"));
    }
}
