//! Matilda Runtime - server-side trading runtime
//!
//! 1. Loads configuration and the persisted runtime state
//! 2. Wires the configured providers (brokerage, decision, company profiles)
//! 3. Runs the tick scheduler in the background
//! 4. Serves the runtime HTTP API

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use matilda_runtime::providers::{AlpacaClient, FinnhubClient, OpenAiClient};
use matilda_runtime::runtime::now_ms;
use matilda_runtime::{app, Runtime, RuntimeConfig, StateHandle, StateStore, TickScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = RuntimeConfig::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    info!("Starting Matilda Runtime...");

    let store = StateStore::new(&config.state_path);
    let initial = store.load(now_ms()).await;
    info!(
        "Runtime state loaded from {:?} ({} watchlist symbols)",
        store.path(),
        initial.wallet.watchlist.len()
    );
    let state = StateHandle::spawn(initial, Some(store));

    let mut runtime = Runtime::new(config.clone(), state);
    if config.broker_configured() {
        runtime = runtime.with_broker(Arc::new(AlpacaClient::new(&config)?));
        info!("✓ Brokerage client initialized ({} feed)", config.alpaca_feed);
    } else {
        warn!("⚠ Brokerage credentials missing; trading and quotes disabled");
    }
    if config.decision_configured() {
        runtime = runtime.with_decision(Arc::new(OpenAiClient::new(&config)?));
        info!("✓ Decision provider initialized");
    } else {
        warn!("⚠ OPENAI_API_KEY missing; research and autobot disabled");
    }
    if config.profiles_configured() {
        runtime = runtime.with_profiles(Arc::new(FinnhubClient::new(
            &config.finnhub_api_key,
            config.http_timeout(),
        )?));
        info!("✓ Company profile provider initialized");
    }
    let runtime = Arc::new(runtime);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(TickScheduler::new(runtime.clone()).run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("🚀 Runtime listening on port {}", config.port);

    axum::serve(listener, app(runtime))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    Ok(())
}
