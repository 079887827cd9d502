use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lirabot::config::AppConfig;
use lirabot::error::Result;
use lirabot::exchange::NullTransport;
use lirabot::orchestrator::CycleOrchestrator;
use lirabot::persistence::{SingleWriterLock, StateStore};
use lirabot::safety::RuntimeFlags;
use lirabot::strategy::TakeProfitStrategy;

fn init_logging(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lirabot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LIRABOT_CONFIG").ok())
        .unwrap_or_else(|| "lirabot.toml".to_string());

    let config = AppConfig::load_from(&config_path)?;
    let _log_guard = init_logging(&config);
    info!(config = %config_path, "lirabot starting");

    // Single writer per (db, account); a second instance refuses to start.
    let _lock = SingleWriterLock::acquire(
        &config.database.state_db_path,
        &config.agent.account_key,
    )?;

    let store = StateStore::open(&config.database.state_db_path).await?;
    let runtime = Arc::new(RwLock::new(RuntimeFlags::default()));
    // The live exchange adapter is injected here in deployment builds; the
    // offline transport keeps dry-run and observe-only operation honest.
    let transport = Arc::new(NullTransport);
    let strategy = Arc::new(TakeProfitStrategy::new());
    let clock = Arc::new(lirabot::clock::SystemClock::new());

    let mut orchestrator = CycleOrchestrator::new(
        config.clone(),
        store,
        transport,
        strategy,
        clock,
        runtime,
    )
    .await?;

    if !config.safety.stage_enabled {
        warn!("stage_enabled=false; exiting without running cycles");
        return Ok(());
    }

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.agent.cycle_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        interval_secs = config.agent.cycle_interval_secs,
        "cycle loop started"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = run_cycle(&mut orchestrator).await {
                    if err.is_fatal_for_cycle() {
                        error!(%err, "fatal cycle error; shutting down");
                        return Err(err.into());
                    }
                    warn!(%err, "cycle failed; next tick retries");
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received; finishing up");
                break;
            }
        }
    }

    info!("lirabot stopped");
    Ok(())
}

async fn run_cycle(orchestrator: &mut CycleOrchestrator) -> Result<()> {
    let outcome = orchestrator.run_one_cycle().await?;
    info!(
        cycle_id = %outcome.cycle_id,
        mode = %outcome.mode,
        duration_ms = outcome.duration_ms,
        "cycle outcome"
    );
    Ok(())
}
