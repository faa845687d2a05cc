// =============================================================================
// Meridian Intraday Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Paper mode with recovery pending. LIVE trading
// requires an explicit, typed confirmation through the control plane.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_bot::api::rest::{router, ApiContext};
use meridian_bot::app_state::AppState;
use meridian_bot::broker::http::HttpBroker;
use meridian_bot::broker::paper::PaperBroker;
use meridian_bot::broker::rate_limit::RateLimiter;
use meridian_bot::broker::{BrokerPort, ModalBroker};
use meridian_bot::bus::EventBus;
use meridian_bot::clock::{MarketHoursGate, SystemClock};
use meridian_bot::config::Config;
use meridian_bot::execution::ExecutionEngine;
use meridian_bot::leader::{run_leader_loop, LeaderLock};
use meridian_bot::market_data::{run_market_stream, run_synthetic_feed, MarketDataHub};
use meridian_bot::oco::OcoManager;
use meridian_bot::orchestrator::Orchestrator;
use meridian_bot::risk::RiskEngine;
use meridian_bot::store::models::AuditAction;
use meridian_bot::store::Store;
use meridian_bot::strategy::build_strategies;
use meridian_bot::supervisor::{ScanSupervisor, SupervisorState};
use meridian_bot::watcher::OrderWatcher;
use meridian_bot::{leader, metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment, logging, config ──────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Intraday Nexus starting up");

    let config = Arc::new(Config::load(
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian.json".to_string()),
    )?);
    let metrics_handle = metrics::install()?;

    // ── 2. Core state ─────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.sqlite_path)?);
    let bus = EventBus::default();
    let market = Arc::new(MarketDataHub::new(bus.clone()));
    let app = Arc::new(AppState::new(config.clone(), store.clone(), market.clone(), bus));

    info!(
        instance_id = %app.instance_id,
        config_sha = %app.config_sha,
        git_head = %app.git_head,
        "engine identity established"
    );

    // ── 3. Broker transports ──────────────────────────────────────────────
    let paper = Arc::new(PaperBroker::new());
    let gateway: Option<Arc<HttpBroker>> = if !config.broker.base_url.is_empty() {
        Some(Arc::new(HttpBroker::new(
            config.broker.api_key.clone(),
            config.broker.api_secret.clone(),
            config.broker.base_url.clone(),
            config.broker.order_stream_url.clone(),
        )))
    } else {
        warn!("no live broker gateway configured — PAPER only");
        None
    };
    let modal = ModalBroker::new(
        paper.clone(),
        gateway.clone().map(|g| g as Arc<dyn BrokerPort>),
    );

    // Live order event stream with the usual reconnect loop.
    if let Some(gateway) = gateway.clone() {
        let stream_app = app.clone();
        tokio::spawn(async move {
            loop {
                let beat_app = stream_app.clone();
                if let Err(e) = gateway.run_order_stream(move || beat_app.beat_order_stream()).await
                {
                    error!(error = %e, "order event stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── 4. Engines ────────────────────────────────────────────────────────
    let limiter = Arc::new(RateLimiter::new());
    let execution = Arc::new(ExecutionEngine::new(modal.clone(), store.clone(), limiter.clone()));
    let oco = Arc::new(OcoManager::new(store.clone(), execution.clone()));
    let gate = MarketHoursGate::from_config(&config)?;
    let risk = RiskEngine::from_config(&config);
    let strategies = build_strategies(&config.strategies);

    let orchestrator = Arc::new(Orchestrator::new(
        app.clone(),
        gate,
        Arc::new(SystemClock),
        risk,
        execution.clone(),
        oco,
        modal.clone(),
        limiter,
        strategies,
    ));

    // ── 5. Warm restart: PAPER + crash-safe OCO recovery before anything ──
    orchestrator.startup().await?;

    // ── 6. Market data ────────────────────────────────────────────────────
    if modal.has_live() && !config.broker.market_data_url.is_empty() {
        let url = config.broker.market_data_url.clone();
        let tokens: Vec<i64> = config.instruments.iter().map(|i| i.token).collect();
        let hub = market.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_market_stream(&url, &tokens, &hub).await {
                    error!(error = %e, "market data stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    } else {
        tokio::spawn(run_synthetic_feed(
            config.instruments.clone(),
            paper.clone(),
            market.clone(),
            tokio::time::Duration::from_millis(250),
        ));
    }

    // ── 7. Order watcher ──────────────────────────────────────────────────
    let watcher = Arc::new(OrderWatcher::new(
        app.clone(),
        orchestrator.clone(),
        modal.clone(),
    ));
    tokio::spawn(watcher.run());

    // ── 8. Leader lock ────────────────────────────────────────────────────
    let lock = LeaderLock::connect(
        &config.redis_url,
        config.leader_key.clone(),
        app.instance_id.clone(),
        config.lease_secs,
    )
    .await?;
    let release_handle = lock.clone();

    // No entries until leadership lands; the leader loop lifts this pause.
    orchestrator.pause(leader::LEADER_LOST_REASON).await;
    tokio::spawn(run_leader_loop(lock, app.clone(), orchestrator.clone()));

    // ── 9. Scan supervisor ────────────────────────────────────────────────
    let supervisor = Arc::new(ScanSupervisor::new(app.clone(), orchestrator.clone()));
    supervisor.start();

    // ── 10. Control plane ─────────────────────────────────────────────────
    let ctx = ApiContext {
        app: app.clone(),
        orchestrator: orchestrator.clone(),
        supervisor: supervisor.clone(),
        metrics: metrics_handle,
    };
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind control plane");
        info!(addr = %bind_addr, "control plane listening");
        axum::serve(listener, router(ctx)).await.expect("control plane failed");
    });

    info!("all subsystems running — ctrl-c to stop");

    // ── 11. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    supervisor.stop();
    // In-flight work drains for up to 5 s, then is abandoned.
    let drain_deadline = std::time::Instant::now() + tokio::time::Duration::from_secs(5);
    while supervisor.status().state != SupervisorState::Stopped
        && std::time::Instant::now() < drain_deadline
    {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    orchestrator.audit(AuditAction::EngineStop, serde_json::json!({}));
    if let Err(e) = release_handle.release().await {
        warn!(error = %e, "leader release failed on shutdown");
    }

    info!("Meridian shut down complete");
    Ok(())
}
