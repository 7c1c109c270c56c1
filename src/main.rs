//! Delta Hedger - Main Entry Point
//!
//! Single long-running process: authenticate both venues, open the
//! configured pair, then reconcile on a fixed cadence until shutdown.

use anyhow::{bail, Context, Result};
use clap::Parser;
use delta_hedger::config::Config;
use delta_hedger::exchange::{BackpackClient, ExchangeAdapter, ParadexClient, Venue};
use delta_hedger::pair::{PairRegistry, PairState};
use delta_hedger::risk::{ProtectionConfig, RiskManager};
use delta_hedger::trading::{
    CoordinatorConfig, OrderCoordinator, PositionReconciler, ReconcilerConfig, TradingLoop,
};
use delta_hedger::utils::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Delta Hedger CLI
#[derive(Parser)]
#[command(name = "delta-hedger")]
#[command(version, about = "Delta-neutral dual-exchange position coordinator")]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();

    let config = Config::load()?;
    config.validate().context("invalid configuration")?;

    init_logging(&config.logging_level)?;

    info!("delta-hedger v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        order_size = %config.order_size,
        long = %config.long_exchange,
        short = %config.short_exchange,
        interval_minutes = config.loop_interval_minutes,
        take_profit_pct = %config.take_profit_percentage,
        stop_loss_pct = %config.stop_loss_percentage,
        "configuration loaded"
    );

    let adapters = build_adapters(&config)?;

    // Credentials are established once, before anything trades.
    for (venue, adapter) in &adapters {
        adapter
            .authenticate()
            .await
            .with_context(|| format!("authentication failed for {venue}"))?;
        info!(%venue, "authenticated");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(PairRegistry::new());
    let coordinator = Arc::new(OrderCoordinator::new(
        adapters.clone(),
        registry.clone(),
        clock.clone(),
        CoordinatorConfig {
            order_timeout: config.order_timeout(),
            max_order_retries: config.max_order_retries,
            retry_backoff: Duration::from_millis(500),
            drift_tolerance: config.drift_tolerance,
        },
    ));
    let risk = Arc::new(RiskManager::new(
        adapters.clone(),
        ProtectionConfig {
            take_profit_pct: config.take_profit_percentage,
            stop_loss_pct: config.stop_loss_percentage,
            ..ProtectionConfig::default()
        },
    ));
    let reconciler = Arc::new(PositionReconciler::new(
        adapters,
        registry,
        coordinator.clone(),
        risk,
        clock,
        ReconcilerConfig {
            staleness_threshold: config.staleness_threshold(),
            drift_tolerance: config.drift_tolerance,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    // The initial pair entry; from here on the reconciler owns it.
    match coordinator
        .open_pair(config.order_size, config.long_exchange, config.short_exchange)
        .await
    {
        Ok(pair) => {
            let state = pair.lock().await.state;
            match state {
                PairState::BothFilled => info!("initial pair established"),
                PairState::UnwindFailed => error!(
                    "initial pair entry left an unresolved leg, operator attention required"
                ),
                other => warn!(state = ?other, "initial pair did not fill"),
            }
        }
        Err(e) => error!(error = %e, "initial pair entry failed"),
    }

    let trading_loop = TradingLoop::new(reconciler, config.loop_interval());
    trading_loop.run(shutdown_rx).await?;

    info!("clean shutdown complete");
    Ok(())
}

/// Build the two live venue adapters from configured credentials.
fn build_adapters(config: &Config) -> Result<HashMap<Venue, Arc<dyn ExchangeAdapter>>> {
    if config.paradex_api_key.is_empty() || config.paradex_api_secret.is_empty() {
        bail!("PARADEX_API_KEY and PARADEX_API_SECRET must be set");
    }
    if config.backpack_api_key.is_empty() || config.backpack_api_secret.is_empty() {
        bail!("BACKPACK_API_KEY and BACKPACK_API_SECRET must be set");
    }

    let paradex = ParadexClient::new(&config.paradex_api_key, &config.paradex_api_secret)
        .context("building Paradex client")?;
    let backpack = BackpackClient::new(&config.backpack_api_key, &config.backpack_api_secret)
        .context("building Backpack client")?;

    let mut adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert(Venue::Paradex, Arc::new(paradex));
    adapters.insert(Venue::Backpack, Arc::new(backpack));
    Ok(adapters)
}

fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    // File appender for detailed logs
    std::fs::create_dir_all("logs")?;
    let file_appender = tracing_appender::rolling::hourly("logs", "delta-hedger.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(
                    format!("delta_hedger={level}")
                        .parse()
                        .context("invalid LOGGING_LEVEL")?,
                )
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}
