//! End-to-end runtime harness
//!
//! Drives the autobot, scout, trade pipeline and reconciliation against
//! mocked providers and checks the resulting runtime state.


use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use matilda_runtime::autobot::{run_cycle, Trigger};
use matilda_runtime::handlers::{self, TradeRequest};
use matilda_runtime::portfolio::Position;
use matilda_runtime::reconciler::{self, SyncRequest};
use matilda_runtime::store::{StateHandle, StateStore};
use matilda_runtime::research;
use matilda_runtime::runner::TickScheduler;
use matilda_runtime::runtime::now_ms;
use matilda_runtime::types::{OrderStatus, ProposedAction, TradeSide};
use matilda_runtime::{
    scout, AiSettings, Runtime, RuntimeConfig, RuntimeError, RuntimeState, TradeSource,
};
use mock_providers::{MockBroker, MockDecision};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

fn runtime(state: RuntimeState, broker: &MockBroker, decision: &MockDecision) -> Arc<Runtime> {
    let handle = StateHandle::spawn(state, None);
    Arc::new(
        Runtime::new(RuntimeConfig::default(), handle)
            .with_broker(Arc::new(broker.clone()))
            .with_decision(Arc::new(decision.clone())),
    )
}

/// Fast order polling so fill scripts play out quickly
fn polling_runtime(state: RuntimeState, broker: &MockBroker) -> Arc<Runtime> {
    let config = RuntimeConfig {
        order_poll_interval_ms: 50,
        order_poll_timeout_secs: 1,
        ..RuntimeConfig::default()
    };
    let handle = StateHandle::spawn(state, None);
    Arc::new(Runtime::new(config, handle).with_broker(Arc::new(broker.clone())))
}

fn state_with_watchlist(symbols: &[&str], cash: i64) -> RuntimeState {
    let mut state = RuntimeState::new(1);
    state.wallet.watchlist = symbols.iter().map(|s| s.to_string()).collect();
    state.wallet.cash = Decimal::from(cash);
    state.normalize(1);
    state
}

fn buy(symbol: &str, shares: u64) -> ProposedAction {
    ProposedAction::Buy {
        symbol: Some(symbol.to_string()),
        shares,
        reason: "test".to_string(),
    }
}

fn sell(symbol: &str, shares: u64) -> ProposedAction {
    ProposedAction::Sell {
        symbol: Some(symbol.to_string()),
        shares,
        reason: "test".to_string(),
    }
}

#[tokio::test]
async fn test_empty_watchlist_makes_no_provider_calls() {
    let broker = MockBroker::new();
    let decision = MockDecision::new().with_plan("buy", vec![buy("AAPL", 1)]);
    let state = state_with_watchlist(&[], 1_000);
    assert!(state.wallet.watchlist.is_empty());
    let rt = runtime(state, &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(!outcome.ran);
    assert_eq!(outcome.reason.as_deref(), Some("empty-watchlist"));
    assert!(broker.calls().is_empty());
    assert!(decision.calls().is_empty());
}

#[tokio::test]
async fn test_buy_without_cash_becomes_hold() {
    let broker = MockBroker::new().with_cash(0);
    let decision = MockDecision::new().with_plan("buy XYZ", vec![buy("XYZ", 10)]);
    let rt = runtime(state_with_watchlist(&["AAPL"], 0), &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(outcome.ran);
    assert_eq!(outcome.recommendations.len(), 1);
    assert!(outcome.recommendations[0].action.is_hold());
    assert!(!outcome.recommendations[0].executed);
    assert!(broker.submitted().is_empty());
}

#[tokio::test]
async fn test_sell_without_shares_becomes_hold_naming_symbol() {
    let broker = MockBroker::new();
    let decision = MockDecision::new().with_plan("sell XYZ", vec![sell("XYZ", 5)]);
    let rt = runtime(state_with_watchlist(&["AAPL"], 1_000), &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    let action = &outcome.recommendations[0].action;
    assert!(action.is_hold());
    assert!(action.reason().contains("XYZ"));
    assert!(broker.submitted().is_empty());

    let state = rt.state.snapshot().await.unwrap();
    let recommended = state.autobot.latest_recommendation.unwrap();
    assert!(recommended.reason().contains("XYZ"));
}

#[tokio::test]
async fn test_market_closed_forces_hold_without_trading_calls() {
    let broker = MockBroker::new().closed("2026-10-19T09:30:00-04:00");
    let decision = MockDecision::new().with_plan("buy", vec![buy("AAPL", 1)]);
    let rt = runtime(state_with_watchlist(&["AAPL"], 10_000), &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(outcome.ran);
    assert_eq!(outcome.reason.as_deref(), Some("market-closed"));
    assert_eq!(broker.calls(), vec!["get_clock"]);
    assert!(decision.calls().is_empty());

    let state = rt.state.snapshot().await.unwrap();
    let hold = state.autobot.latest_recommendation.unwrap();
    assert!(hold.is_hold());
    assert!(hold.reason().contains("reopen at 2026-10-19T09:30:00-04:00"));
    assert!(state.autobot.last_run_at > 0);
}

#[tokio::test]
async fn test_clock_failure_is_an_error_not_a_hold() {
    let broker = MockBroker::new().clock_down();
    let decision = MockDecision::new().with_plan("buy", vec![buy("AAPL", 1)]);
    let rt = runtime(state_with_watchlist(&["AAPL"], 10_000), &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(outcome.ran);
    assert_eq!(broker.calls(), vec!["get_clock"]);
    assert!(decision.calls().is_empty());

    let state = rt.state.snapshot().await.unwrap();
    assert!(state.autobot.last_status.starts_with("Error"));
    assert!(state.autobot.last_error.contains("503"));
    assert!(state.autobot.latest_recommendation.is_none());
    assert!(state.autobot.last_run_at > 0);
}

#[tokio::test]
async fn test_scheduled_cycle_respects_enabled_flag() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["AAPL"], 1_000), &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Scheduled).await;

    assert!(!outcome.ran);
    assert_eq!(outcome.reason.as_deref(), Some("disabled"));
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_trigger_reports_busy() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["AAPL"], 1_000), &broker, &decision);

    let _held = rt.autobot_busy.try_acquire().unwrap();
    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(!outcome.ran);
    assert_eq!(outcome.reason.as_deref(), Some("busy"));
}

#[tokio::test]
async fn test_missing_broker_is_reported_as_status() {
    let handle = StateHandle::spawn(state_with_watchlist(&["AAPL"], 1_000), None);
    let rt = Runtime::new(RuntimeConfig::default(), handle);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(!outcome.ran);
    assert_eq!(outcome.reason.as_deref(), Some("broker-unavailable"));
    let state = rt.state.snapshot().await.unwrap();
    assert_eq!(state.autobot.last_status, "Brokerage is not configured");
}

#[tokio::test]
async fn test_cycle_executes_and_reloads_broker_truth() {
    let broker = MockBroker::new().with_cash(10_000).with_price("AAPL", 200);
    let decision = MockDecision::new().with_plan(
        "Buy AAPL, then try too much more",
        vec![buy("AAPL", 30), buy("AAPL", 100)],
    );
    let rt = runtime(state_with_watchlist(&["AAPL", "MSFT"], 10_000), &broker, &decision);

    let outcome = run_cycle(&rt, Trigger::Manual).await;

    assert!(outcome.ran);
    // Second action is re-validated against the cash left by the first
    assert_eq!(
        broker.submitted(),
        vec![
            ("AAPL".to_string(), TradeSide::Buy, 30),
            ("AAPL".to_string(), TradeSide::Buy, 20),
        ]
    );

    let state = rt.state.snapshot().await.unwrap();
    assert_eq!(state.wallet.cash, Decimal::ZERO);
    assert_eq!(state.wallet.shares_of("AAPL"), 50);
    assert_eq!(state.wallet.transactions.len(), 2);
    assert!(state.autobot.latest_auto_action.unwrap().executed);
    assert_eq!(decision.plan_contexts()[0].symbols.len(), 2);
}

#[tokio::test]
async fn test_open_order_conflict_blocks_submission() {
    let broker = MockBroker::new().with_open_order("AAPL", TradeSide::Buy, 10, 3);
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["AAPL"], 10_000), &broker, &decision);

    let err = rt
        .executor
        .execute(&rt, "aapl", TradeSide::Buy, 5, TradeSource::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Conflict { remaining: 7, .. }));
    assert!(broker.submitted().is_empty());

    // Opposite side is not blocked
    let broker_sell = MockBroker::new()
        .with_open_order("AAPL", TradeSide::Buy, 10, 3)
        .with_position("AAPL", 4, 90);
    let rt = runtime(state_with_watchlist(&["AAPL"], 10_000), &broker_sell, &decision);
    rt.executor
        .execute(&rt, "AAPL", TradeSide::Sell, 2, TradeSource::Manual)
        .await
        .unwrap();
    assert_eq!(broker_sell.submitted().len(), 1);
}

#[tokio::test]
async fn test_trade_handler_maps_conflict_to_409() {
    let broker = MockBroker::new().with_open_order("MSFT", TradeSide::Sell, 4, 0);
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["MSFT"], 10_000), &broker, &decision);

    let request = TradeRequest {
        symbol: "MSFT".to_string(),
        side: "sell".to_string(),
        qty: json!(1),
    };
    let err = handlers::submit_trade(State(rt.clone()), Json(request))
        .await
        .err()
        .unwrap();
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
    assert!(err.to_string().contains("4 shares unfilled"));
}

#[tokio::test]
async fn test_trade_handler_rejects_fractional_qty() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["MSFT"], 10_000), &broker, &decision);

    let request = TradeRequest {
        symbol: "MSFT".to_string(),
        side: "buy".to_string(),
        qty: json!("1.5"),
    };
    let err = handlers::submit_trade(State(rt), Json(request)).await.err().unwrap();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_sell_records_realized_pnl() {
    let broker = MockBroker::new()
        .with_price("AAPL", 120)
        .with_position("AAPL", 10, 100);
    let decision = MockDecision::new();
    let mut state = state_with_watchlist(&["AAPL"], 0);
    state.wallet.positions.insert(
        "AAPL".to_string(),
        Position {
            shares: 10,
            avg_cost: Decimal::from(100),
        },
    );
    let rt = runtime(state, &broker, &decision);

    let outcome = rt
        .executor
        .execute(&rt, "AAPL", TradeSide::Sell, 4, TradeSource::Manual)
        .await
        .unwrap();

    let tx = outcome.transaction.unwrap();
    assert_eq!(tx.realized_pnl, Some(Decimal::from(80)));
    let state = rt.state.snapshot().await.unwrap();
    assert_eq!(state.wallet.realized_pnl, Decimal::from(80));
    assert_eq!(state.wallet.shares_of("AAPL"), 6);
    assert_eq!(state.wallet.cash, broker.cash());
}

#[tokio::test]
async fn test_stale_client_cannot_clobber_server_trades() {
    let broker = MockBroker::new().with_price("AAPL", 100);
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["AAPL"], 100_000), &broker, &decision);

    let before = rt.state.snapshot().await.unwrap();
    rt.executor
        .execute(&rt, "AAPL", TradeSide::Buy, 3, TradeSource::Autobot)
        .await
        .unwrap();

    let request: SyncRequest = serde_json::from_value(json!({
        "clientHeartbeatAt": 1,
        "clientRuntimeUpdatedAt": before.updated_at,
        "wallet": { "cash": 100000, "watchlist": ["AAPL"] },
        "autobot": { "enabled": true }
    }))
    .unwrap();
    let view = reconciler::sync(&rt, request).await.unwrap();

    assert_eq!(view.state.wallet.shares_of("AAPL"), 3);
    assert!(view.state.autobot.enabled);
    assert!(view.server_side_autobot_active);
}

#[tokio::test]
async fn test_heartbeat_does_not_bump_updated_at() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let rt = runtime(state_with_watchlist(&["AAPL"], 1_000), &broker, &decision);
    let before = rt.state.snapshot().await.unwrap();

    let request: SyncRequest = serde_json::from_value(json!({
        "clientHeartbeatAt": 5,
        "clientRuntimeUpdatedAt": before.updated_at
    }))
    .unwrap();
    let view = reconciler::sync(&rt, request).await.unwrap();

    assert_eq!(view.state.updated_at, before.updated_at);
    assert!(view.state.last_client_heartbeat_at > 0);
}

#[tokio::test]
async fn test_scout_adds_positive_candidate() {
    let broker = MockBroker::new();
    // First core symbol missing from the default watchlist
    let decision = MockDecision::new().with_sentiment("AVGO", 35);
    let rt = runtime(RuntimeState::new(1), &broker, &decision);

    let message = scout::run_cycle(&rt).await.unwrap().unwrap();

    assert!(message.contains("AVGO"));
    let state = rt.state.snapshot().await.unwrap();
    assert!(state.wallet.watchlist.contains(&"AVGO".to_string()));
    assert_eq!(state.scout.last_symbol, "AVGO");
    assert_eq!(state.scout.recent_messages.len(), 2);
    assert!(state.refresh_meta.contains_key("AVGO"));
    assert!(decision.calls().contains(&"discover_hot_symbols"));
}

#[tokio::test]
async fn test_scout_rejects_non_positive_candidate() {
    let broker = MockBroker::new();
    let decision = MockDecision::new().with_sentiment("AVGO", -10);
    let rt = runtime(RuntimeState::new(1), &broker, &decision);
    let before = rt.state.snapshot().await.unwrap().wallet.watchlist;

    scout::run_cycle(&rt).await.unwrap();

    let state = rt.state.snapshot().await.unwrap();
    assert_eq!(state.wallet.watchlist, before);
    assert_eq!(state.scout.cursor, 9);
    assert!(state.scout.latest_message.contains("not positive"));
}

#[tokio::test]
async fn test_state_survives_persist_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime-state.json");
    let broker = MockBroker::new().with_price("AAPL", 150);
    let decision = MockDecision::new();

    let handle = StateHandle::spawn(RuntimeState::new(1), Some(StateStore::new(&path)));
    let rt = Runtime::new(RuntimeConfig::default(), handle)
        .with_broker(Arc::new(broker.clone()))
        .with_decision(Arc::new(decision.clone()));
    rt.executor
        .execute(&rt, "AAPL", TradeSide::Buy, 2, TradeSource::Manual)
        .await
        .unwrap();
    let live = rt.state.snapshot().await.unwrap();

    let reloaded = StateStore::new(&path).load(live.updated_at).await;
    assert_eq!(reloaded, live);

    let mut again = reloaded.clone();
    again.normalize(live.updated_at);
    assert_eq!(again, reloaded);
}

#[tokio::test]
async fn test_order_is_polled_until_filled() {
    let broker = MockBroker::new().with_price("AAPL", 100).with_fill_script(&[
        (0, OrderStatus::Accepted),
        (2, OrderStatus::PartiallyFilled),
        (5, OrderStatus::Filled),
    ]);
    let rt = polling_runtime(state_with_watchlist(&["AAPL"], 10_000), &broker);

    let outcome = rt
        .executor
        .execute(&rt, "AAPL", TradeSide::Buy, 5, TradeSource::Manual)
        .await
        .unwrap();

    assert_eq!(outcome.order.status, OrderStatus::Filled);
    assert_eq!(outcome.order.filled_qty, 5);
    assert_eq!(broker.polls(), 3);
    assert_eq!(outcome.transaction.unwrap().shares, 5);
    let state = rt.state.snapshot().await.unwrap();
    assert_eq!(state.wallet.shares_of("AAPL"), 5);
}

#[tokio::test]
async fn test_poll_timeout_keeps_last_status_and_partial_fill() {
    let broker = MockBroker::new()
        .with_price("AAPL", 100)
        .with_fill_script(&[(2, OrderStatus::PartiallyFilled)]);
    let rt = polling_runtime(state_with_watchlist(&["AAPL"], 10_000), &broker);

    let started = std::time::Instant::now();
    let outcome = rt
        .executor
        .execute(&rt, "AAPL", TradeSide::Buy, 5, TradeSource::Manual)
        .await
        .unwrap();

    assert!(started.elapsed() >= std::time::Duration::from_secs(1));
    assert_eq!(outcome.order.status, OrderStatus::PartiallyFilled);
    assert_eq!(outcome.order.remaining_qty(), 3);
    assert!(broker.polls() >= 2);
    let tx = outcome.transaction.unwrap();
    assert_eq!(tx.shares, 2);
    assert_eq!(tx.total, Decimal::from(200));

    let state = rt.state.snapshot().await.unwrap();
    assert_eq!(state.wallet.shares_of("AAPL"), 2);
    assert_eq!(state.wallet.transactions.len(), 1);
}

#[tokio::test]
async fn test_tick_runs_scout_before_autobot() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let mut state = state_with_watchlist(&["AAPL"], 1_000);
    state.autobot.enabled = true;
    state.ai_settings.ai_research_auto_refresh_enabled = false;
    let rt = runtime(state, &broker, &decision);

    TickScheduler::new(rt.clone()).tick_once().await;

    let calls = decision.calls();
    let scouted = calls.iter().position(|c| *c == "discover_hot_symbols").unwrap();
    let planned = calls.iter().position(|c| *c == "generate_plan").unwrap();
    assert!(scouted < planned);

    let state = rt.state.snapshot().await.unwrap();
    assert!(state.scout.last_run_at > 0);
    assert!(state.autobot.last_run_at > 0);
}

#[tokio::test]
async fn test_tick_skips_what_is_not_due() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let mut state = state_with_watchlist(&["AAPL"], 1_000);
    state.autobot.enabled = true;
    state.autobot.last_run_at = now_ms();
    state.scout.enabled = false;
    state.ai_settings.ai_research_auto_refresh_enabled = false;
    let rt = runtime(state, &broker, &decision);

    TickScheduler::new(rt.clone()).tick_once().await;

    assert!(decision.calls().is_empty());
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_auto_refresh_caches_overdue_symbol() {
    let broker = MockBroker::new();
    let decision = MockDecision::new().with_sentiment("AAPL", 40);
    let rt = runtime(state_with_watchlist(&["AAPL"], 1_000), &broker, &decision);

    let refreshed = research::auto_refresh_once(&rt).await.unwrap();
    assert_eq!(refreshed.as_deref(), Some("AAPL"));

    let state = rt.state.snapshot().await.unwrap();
    let entry = state.research_cache.get("AAPL", &AiSettings::default()).unwrap();
    assert_eq!(entry.profile.sentiment, 40);
    assert!(state.refresh_meta["AAPL"].last_updated_at > 0);

    // Just refreshed, so nothing is due
    assert_eq!(research::auto_refresh_once(&rt).await.unwrap(), None);
}

#[tokio::test]
async fn test_failed_refresh_stamps_attempt_and_cools_down() {
    let broker = MockBroker::new();
    let decision = MockDecision::new().failing_research();
    let rt = runtime(state_with_watchlist(&["AAPL"], 1_000), &broker, &decision);

    assert!(research::auto_refresh_once(&rt).await.is_err());

    let state = rt.state.snapshot().await.unwrap();
    let meta = state.refresh_meta["AAPL"];
    assert!(meta.last_attempt_at > 0);
    assert_eq!(meta.last_updated_at, 0);
    assert!(state.research_cache.is_empty());

    assert_eq!(research::auto_refresh_once(&rt).await.unwrap(), None);
    let attempts = decision
        .calls()
        .iter()
        .filter(|c| **c == "generate_research")
        .count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_hot_list_drops_core_and_untradable_symbols() {
    let broker = MockBroker::new().with_tradable(&["AAPL", "RKLB", "IONQ"]);
    let decision = MockDecision::new().with_hot(&["AAPL", "RKLB", "NOPE", "IONQ"]);

    let hot = scout::refresh_hot_list(&broker, &decision, "gpt-4.1-mini")
        .await
        .unwrap();

    assert_eq!(hot.symbols, vec!["RKLB", "IONQ"]);
}

#[tokio::test]
async fn test_hot_list_is_capped() {
    let symbols: Vec<String> = (0..40).map(|i| format!("HX{}", i)).collect();
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    let broker = MockBroker::new();
    let decision = MockDecision::new().with_hot(&refs);

    let hot = scout::refresh_hot_list(&broker, &decision, "gpt-4.1-mini")
        .await
        .unwrap();

    assert_eq!(hot.symbols.len(), 30);
    assert_eq!(hot.symbols[0], "HX0");
    assert_eq!(hot.symbols[29], "HX29");
}

#[tokio::test]
async fn test_stale_client_with_malformed_wallet_keeps_toggles() {
    let broker = MockBroker::new();
    let decision = MockDecision::new();
    let mut state = state_with_watchlist(&["AAPL"], 1_000);
    state.updated_at = 5_000;
    let rt = runtime(state, &broker, &decision);

    let request: SyncRequest = serde_json::from_value(json!({
        "clientRuntimeUpdatedAt": 1,
        "aiSettings": { "maxTradesPerCycle": 5 },
        "autobot": { "enabled": true },
        "wallet": { "positions": { "AAPL": { "shares": 1.5 } } }
    }))
    .unwrap();
    let view = reconciler::sync(&rt, request).await.unwrap();

    assert!(view.state.autobot.enabled);
    assert_eq!(view.state.ai_settings.max_trades_per_cycle, 5);
    assert!(view.state.wallet.positions.is_empty());
}
