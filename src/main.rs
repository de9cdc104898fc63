//! Points Ledger bootstrap
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Logging  │───▶│ Postgres │───▶│  Policy  │
//! │  (YAML)  │    │(tracing) │    │ (schema) │    │  (seed)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `points_ledger [--env dev] [--balance <user_id>]`

use std::sync::Arc;

use anyhow::{Context, Result};

use points_ledger::config::AppConfig;
use points_ledger::db::Database;
use points_ledger::ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore, PointsLedger, UserId};

fn get_env() -> String {
    arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_balance_user() -> Result<Option<UserId>> {
    arg_value(&["--balance"])
        .map(|raw| raw.parse::<UserId>().with_context(|| format!("invalid user id: {}", raw)))
        .transpose()
}

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|pair| names.contains(&pair[0].as_str()))
        .map(|pair| pair[1].clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = points_ledger::logging::init_logging(&app_config);

    tracing::info!("Starting points ledger in {} mode", env);

    let store: Arc<dyn LedgerStore> = match &app_config.postgres_url {
        Some(url) => {
            let db = Database::connect(url, &app_config.database)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check failed")?;

            let store = PgLedgerStore::new(db.pool().clone());
            store.init_schema().await?;
            let policy = store.seed_policy(&app_config.policy).await?;
            tracing::info!(
                daily_transfer_limit = %policy.daily_transfer_limit,
                transfer_fee_rate = %policy.transfer_fee_rate,
                "Ledger policy loaded"
            );
            Arc::new(store)
        }
        None => {
            tracing::warn!("postgres_url not set, using the in-process store (not durable)");
            Arc::new(MemoryLedgerStore::new(app_config.policy.clone()))
        }
    };

    let ledger = PointsLedger::new(store, app_config.ledger);

    if let Some(user_id) = get_balance_user()? {
        let view = ledger.get_balance(user_id).await?;
        println!("{}", serde_json::to_string_pretty(&view)?);
        let stats = ledger.get_statistics(user_id).await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        let policy = ledger.policy().await?;
        println!("{}", serde_json::to_string_pretty(&policy)?);
    }

    tracing::info!("Points ledger ready");
    Ok(())
}
