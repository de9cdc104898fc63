use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::ledger::{LedgerPolicy, QuerySettings};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// hourly | daily | never
    pub rotation: String,
    /// PostgreSQL connection URL; the in-process store is used when unset
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Query ceiling and degraded-path shape
    #[serde(default)]
    pub ledger: QuerySettings,
    /// Seeds `ledger_settings` when no policy is stored yet
    #[serde(default)]
    pub policy: LedgerPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            acquire_timeout_secs: 5,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {}", config_path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        config
            .policy
            .validate()
            .map_err(|e| anyhow::anyhow!("policy: {}", e))?;
        if config.ledger.degraded_row_cap == 0 {
            anyhow::bail!("ledger.degraded_row_cap must be positive");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert!(config.postgres_url.is_none());
        assert_eq!(config.ledger, QuerySettings::default());
        assert_eq!(config.ledger.query_timeout_ms, 5000);
        assert_eq!(config.policy, LedgerPolicy::default());
        assert_eq!(config.database.max_connections, 20);
    }

    #[test]
    fn test_policy_block() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
ledger:
  query_timeout_ms: 2000
policy:
  transfer_fee_rate: "0.01"
  daily_transfer_limit: "20000"
  fee_sink_user_id: 1
  daily_limit_window: rolling24h
"#
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.ledger.query_timeout_ms, 2000);
        assert_eq!(config.ledger.degraded_row_cap, 50);
        assert_eq!(config.policy.transfer_fee_rate, Decimal::new(1, 2));
        assert_eq!(config.policy.daily_transfer_limit, Decimal::from(20_000));
        assert_eq!(config.policy.fee_sink_user_id, Some(1));
        assert_eq!(
            config.policy.daily_limit_window,
            crate::ledger::DailyWindow::Rolling24h
        );
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = format!("{}policy:\n  transfer_fee_rate: \"1.5\"\n", MINIMAL);
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }
}
