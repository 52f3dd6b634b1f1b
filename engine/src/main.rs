//! Process entry point (§6).
//!
//! Parses the CLI, loads and validates configuration, wires the bridge,
//! connection supervisor, and the four pipeline stages together, then
//! runs until `Ctrl-C` or a fatal error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tapeshock::bridge::session::VendorSession;
use tapeshock::bridge::Bridge;
use tapeshock::config::Config;
use tapeshock::extractor::TickerExtractor;
use tapeshock::registry::RequestRegistry;
use tapeshock::shutdown::Notifier;
use tapeshock::stages::detection::{DetectionParams, DetectionStage};
use tapeshock::stages::execution::{ExecutionStage, RiskParams};
use tapeshock::stages::news::NewsStage;
use tapeshock::stages::position_supervisor::PositionSupervisor;
use tapeshock::store::{InMemoryTradeStore, NdjsonTradeStore, TradeStore};
use tapeshock::{queue, telemetry};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "tapeshock", about = "News-driven equities shock-detection and execution engine")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "tapeshock.yaml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Load and validate configuration, construct every stage, but
    /// never call `bridge.connect` against a live session.
    #[arg(long)]
    dry_run: bool,
}

const REAP_INTERVAL: Duration = Duration::from_secs(5);

fn main() {
    let args = Args::parse();
    telemetry::init(&args.log_level);

    match run(args) {
        Ok(()) => {}
        Err(err) => {
            error!(%err, "fatal error");
            std::process::exit(err.exit_code().unwrap_or(1));
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> tapeshock::Result<()> {
    let config = Config::load(&args.config)?;
    info!(config = ?config, "configuration loaded");

    let store: Arc<dyn TradeStore> = match &config.store.path {
        Some(path) => Arc::new(NdjsonTradeStore::open(path)?),
        None => Arc::new(InMemoryTradeStore::new()),
    };

    let registry = RequestRegistry::new();
    let _reaper = registry.spawn_reaper(REAP_INTERVAL);

    let session: Box<dyn VendorSession> = build_session();
    let (bridge, worker) = Bridge::spawn(session, registry);

    if args.dry_run {
        build_stages(&bridge, &config, &store);
        info!("dry run complete: configuration valid, pipeline wiring constructed");
        return Ok(());
    }

    let (notifier, mut shutdown_complete_rx) = Notifier::new();

    let provider_code = config.news.provider_code.clone();
    let resume_bridge = bridge.clone();
    let on_sync: tapeshock::supervisor::ResumeHook = Arc::new(move || {
        resume_bridge.subscribe_news(&provider_code).map(|_| ())?;
        resume_bridge.resubscribe_quotes()
    });

    let supervisor = tapeshock::supervisor::ConnectionSupervisor::new(
        bridge.clone(),
        store.clone(),
        config.broker.host.clone(),
        config.broker.port,
        config.broker.client_id,
        on_sync,
    );
    let gate = supervisor.gate();

    let (news_shutdown, news_complete) = notifier.subscribe();
    let (detection_shutdown, detection_complete) = notifier.subscribe();
    let (execution_shutdown, execution_complete) = notifier.subscribe();
    let (position_shutdown, position_complete) = notifier.subscribe();
    let (supervisor_shutdown, supervisor_complete) = notifier.subscribe();

    let news_articles = bridge.subscribe_news(&config.news.provider_code)?;
    let extractor = TickerExtractor::new(config.extractor.url.clone());
    let news_stage = NewsStage::new(extractor);
    let (ticker_tx, ticker_rx) = queue::stage_channel();
    tokio::spawn(async move {
        news_stage.run(news_articles, ticker_tx, news_shutdown).await;
        drop(news_complete);
    });

    let detection_params = DetectionParams {
        price_mult: config.detection.price_mult,
        vol_mult: config.detection.vol_mult,
        cooldown: Duration::from_secs(config.detection.cooldown_sec),
    };
    let detection_stage = Arc::new(DetectionStage::new(bridge.clone(), detection_params));
    let (signal_tx, signal_rx) = queue::stage_channel();
    let detection_handles = detection_stage.spawn_workers(
        config.detection.worker_count,
        ticker_rx,
        signal_tx,
        detection_shutdown,
    );
    tokio::spawn(async move {
        for handle in detection_handles {
            let _ = handle.await;
        }
        drop(detection_complete);
    });

    let risk_params = RiskParams {
        per_trade_fraction: config.risk.per_trade_fraction,
        take_profit_pct: config.risk.take_profit_pct,
        max_hold: Duration::from_secs(config.risk.max_hold_sec as u64),
        primary_exchange: config.risk.primary_exchange.clone(),
    };
    let execution_stage = Arc::new(ExecutionStage::new(
        bridge.clone(),
        gate,
        store.clone(),
        risk_params,
    ));
    let (position_tx, position_rx) = queue::stage_channel();
    let execution_for_run = execution_stage.clone();
    tokio::spawn(async move {
        execution_for_run.run(signal_rx, position_tx, execution_shutdown).await;
        drop(execution_complete);
    });

    let position_supervisor = Arc::new(PositionSupervisor::new(
        bridge.clone(),
        execution_stage,
        store.clone(),
    ));
    tokio::spawn(async move {
        position_supervisor.run(position_rx, position_shutdown).await;
        drop(position_complete);
    });

    tokio::spawn(async move {
        supervisor.run(supervisor_shutdown).await;
        drop(supervisor_complete);
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| tapeshock::Error::Transport(e.to_string()))?;
    info!("shutdown signal received");
    notifier.shutdown();
    drop(notifier);
    let _ = shutdown_complete_rx.recv().await;

    bridge.disconnect()?;
    let _ = tokio::task::spawn_blocking(move || worker.join()).await;

    Ok(())
}

#[cfg(feature = "simulated-session")]
fn build_session() -> Box<dyn VendorSession> {
    Box::new(tapeshock::bridge::session::simulated::SimulatedSession::new())
}

#[cfg(not(feature = "simulated-session"))]
fn build_session() -> Box<dyn VendorSession> {
    compile_error!("no live VendorSession implementation is wired up; build with the default `simulated-session` feature");
}

/// Constructs every stage without running them, so `--dry-run` exercises
/// the same wiring code paths as a full run short of connecting.
fn build_stages(bridge: &Bridge, config: &Config, store: &Arc<dyn TradeStore>) {
    let _extractor = TickerExtractor::new(config.extractor.url.clone());
    let _detection_params = DetectionParams {
        price_mult: config.detection.price_mult,
        vol_mult: config.detection.vol_mult,
        cooldown: Duration::from_secs(config.detection.cooldown_sec),
    };
    let _detection_stage = DetectionStage::new(bridge.clone(), _detection_params);
    let _risk_params = RiskParams {
        per_trade_fraction: config.risk.per_trade_fraction,
        take_profit_pct: config.risk.take_profit_pct,
        max_hold: Duration::from_secs(config.risk.max_hold_sec as u64),
        primary_exchange: config.risk.primary_exchange.clone(),
    };
    let gate = tapeshock::supervisor::Gate::new();
    let _execution_stage = ExecutionStage::new(bridge.clone(), gate, store.clone(), _risk_params);
}
