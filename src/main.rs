//! custody_sentinel daemon
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │ ChainWatcher│──▶│    Ledger    │◀──│ ReorgGuard │
//! │ (per chain) │   │ (PostgreSQL) │   └────────────┘
//! └─────────────┘   └──────────────┘
//!                      ▲        ▲
//!              ┌───────┘        └────────┐
//!        ┌─────────────┐         ┌───────────────┐
//!        │ SweepEngine │         │SettlementQueue│
//!        └─────────────┘         └───────────────┘
//! ```
//!
//! Without arguments runs every component until Ctrl-C. One-shot admin
//! commands: `--sweep <chain>`, `--retry-sweeps <chain>`, `--payouts <limit>`,
//! `--migrate-settlement <token> <chain>`, `--stats`.

use anyhow::{Context, bail};
use std::sync::Arc;

use custody_sentinel::alert::{Alerter, TracingAlerter, WebhookAlerter};
use custody_sentinel::chain::ChainRegistry;
use custody_sentinel::config::AppConfig;
use custody_sentinel::core_types::Chain;
use custody_sentinel::db::Database;
use custody_sentinel::keys::{HdSigningProvider, SigningProvider};
use custody_sentinel::oracle::StaticPriceOracle;
use custody_sentinel::scheduler::SystemClock;
use custody_sentinel::service::{CustodyService, ServiceDeps};

fn get_env() -> String {
    arg_values("--env", 1)
        .or_else(|| arg_values("-e", 1))
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| "dev".to_string())
}

/// The `n` values following `flag`, if all present
fn arg_values(flag: &str, n: usize) -> Option<Vec<String>> {
    let args: Vec<String> = std::env::args().collect();
    let i = args.iter().position(|a| a == flag)?;
    let values = args.get(i + 1..i + 1 + n)?;
    Some(values.to_vec())
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

fn parse_chain(s: &str) -> anyhow::Result<Chain> {
    s.parse::<Chain>()
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("unknown chain '{}'", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).with_context(|| format!("loading config '{}'", env))?;
    let _log_guard = custody_sentinel::logging::init_logging(&app_config);
    let custody = app_config.custody.clone();
    custody.validate()?;

    tracing::info!(
        env = %env,
        version = env!("GIT_HASH"),
        chains = custody.chains.len(),
        "Starting custody_sentinel"
    );

    let Some(postgres_url) = app_config.postgres_url.as_deref() else {
        bail!("postgres_url is not configured");
    };
    let db = Database::connect(postgres_url)
        .await
        .context("connecting to PostgreSQL")?;
    let ledger = Arc::new(db.bootstrap().await.context("bootstrapping schema")?);

    let signer: Option<Arc<dyn SigningProvider>> =
        match HdSigningProvider::from_env(&custody.master_seed_env) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                tracing::warn!(
                    var = %custody.master_seed_env,
                    error = %e,
                    "Master seed unavailable, sweeps and payouts disabled"
                );
                None
            }
        };
    let chains = ChainRegistry::from_config(&custody, signer.clone())?;
    let alerter: Arc<dyn Alerter> = match &custody.alerts.webhook_url {
        Some(url) => Arc::new(WebhookAlerter::new(url.clone())?),
        None => Arc::new(TracingAlerter),
    };

    let service = CustodyService::new(
        custody.clone(),
        ServiceDeps {
            ledger,
            chains,
            signer,
            oracle: Arc::new(StaticPriceOracle::new(custody.prices.clone())),
            alerter,
            clock: Arc::new(SystemClock),
        },
    );

    if let Some(v) = arg_values("--sweep", 1) {
        let report = service.trigger_manual_sweep(parse_chain(&v[0])?).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if let Some(v) = arg_values("--retry-sweeps", 1) {
        let released = service.retry_failed_sweeps(parse_chain(&v[0])?).await?;
        println!("Released {} deposits from failed sweep batches", released);
        return Ok(());
    }
    if let Some(v) = arg_values("--payouts", 1) {
        let limit: usize = v[0].parse().context("--payouts expects a number")?;
        let created = service.create_due_payouts().await;
        if let Err(e) = &created {
            tracing::warn!(error = %e, "Payout creation skipped");
        }
        let report = service.process_payout_queue(limit).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if let Some(v) = arg_values("--migrate-settlement", 2) {
        let moved = service
            .migrate_settlement(&v[0], parse_chain(&v[1])?)
            .await?;
        println!("Migrated {} pending payouts", moved);
        return Ok(());
    }
    if has_flag("--stats") {
        let stats = serde_json::json!({
            "deposits": service.get_deposit_stats().await?,
            "sweeps": service.get_sweep_stats().await?,
            "reorg": service.get_reorg_checker_health(),
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    service.start().await;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Ctrl-C received, shutting down");
    service.shutdown().await;
    Ok(())
}
