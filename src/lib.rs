//! Matilda Runtime Library
//!
//! Server-side runtime for a virtual trading wallet: research cache,
//! market discovery, autobot decision cycle, trade execution and client
//! reconciliation behind a small HTTP surface.

pub mod amount;
pub mod autobot;
pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod intent;
pub mod portfolio;
pub mod providers;
pub mod reconciler;
pub mod research;
pub mod runner;
pub mod runtime;
pub mod scout;
pub mod state;
pub mod store;
pub mod types;


use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// Re-export main types for convenience
pub use autobot::{CycleOutcome, Trigger};
pub use config::{AiSettings, Horizon, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use executor::{TradeExecutor, TradeOutcome, TradeSource};
pub use portfolio::{Position, Transaction, Wallet};
pub use providers::{DecisionProvider, MarketDataProvider, ProfileProvider};
pub use runner::TickScheduler;
pub use runtime::Runtime;
pub use state::{RuntimeState, RuntimeView};
pub use store::{StateHandle, StateStore};
pub use types::{ProposedAction, TradeSide};

/// Build the HTTP router
pub fn app(rt: Arc<Runtime>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/runtime/state", get(handlers::get_state))
        .route("/runtime/sync", post(handlers::sync))
        .route("/runtime/run", post(handlers::run))
        .route("/trades", post(handlers::submit_trade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(rt)
}
