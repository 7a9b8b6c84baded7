use fibu_recon::MatchConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Console configuration, loaded from a TOML file. Everything has a
/// default so an empty file (or no file) works.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database file; defaults to the platform data directory.
    pub database: Option<PathBuf>,
    pub matching: MatchConfig,
    /// Optional exclusion policy file replacing the built-in default.
    pub exclusion_policy: Option<PathBuf>,
    /// Optional rule seed file replacing the built-in default rules.
    pub rules: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, String> {
        toml::from_str(toml_content).map_err(|e| format!("Failed to parse config: {e}"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.matching.amount_tolerance_cents, 50);
        assert_eq!(config.matching.date_window.days_before, 7);
        assert_eq!(config.matching.date_window.days_after, 3);
        assert!(config.database.is_none());
    }

    #[test]
    fn thresholds_are_overridable() {
        let config = AppConfig::from_toml(
            r#"
            database = "/tmp/fibu.db"

            [matching]
            amount_tolerance_cents = 100
            tie_band = 0.05

            [matching.date_window]
            days_before = 14
            days_after = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.matching.amount_tolerance_cents, 100);
        assert_eq!(config.matching.tie_band, 0.05);
        assert_eq!(config.matching.date_window.days_before, 14);
    }
}
