//! Autobot decision cycle
//!
//! Builds the portfolio context, asks the decision provider for a plan and
//! pushes every proposed action through `validate_action` against the
//! state as it stands right before that action executes. Nothing the
//! provider says is trusted for control flow.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::amount::{from_f64, round2, shares_for_budget, truncate_text};
use crate::config::AiSettings;
use crate::error::Result;
use crate::executor::TradeSource;
use crate::runtime::{now_ms, Runtime};
use crate::state::{AutoAction, RuntimeState};
use crate::store::Persist;
use crate::types::{PlanContext, ProposedAction, ResearchAction, ResearchProfile, SymbolContext, TradeSide};

/// What started the cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// One plan action after validation, and what happened to it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleAction {
    pub action: ProposedAction,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleAction {
    fn not_executed(action: ProposedAction) -> Self {
        Self {
            action,
            executed: false,
            order_id: None,
            error: None,
        }
    }
}

/// Result of a cycle attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleOutcome {
    pub ran: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recommendations: Vec<CycleAction>,
}

impl CycleOutcome {
    fn skipped(reason: &str, status: impl Into<String>) -> Self {
        Self {
            ran: false,
            status: status.into(),
            reason: Some(reason.to_string()),
            recommendations: Vec::new(),
        }
    }
}

/// Research-driven stance on a symbol given current holdings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSignal {
    Buy,
    Add,
    Sell,
    Hold,
    Watch,
}

impl fmt::Display for PositionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionSignal::Buy => "BUY",
            PositionSignal::Add => "ADD",
            PositionSignal::Sell => "SELL",
            PositionSignal::Hold => "HOLD",
            PositionSignal::Watch => "WATCH",
        };
        write!(f, "{}", s)
    }
}

pub fn position_signal(
    profile: Option<&ResearchProfile>,
    held_shares: u64,
    settings: &AiSettings,
) -> PositionSignal {
    let Some(profile) = profile else {
        return if held_shares > 0 {
            PositionSignal::Hold
        } else {
            PositionSignal::Watch
        };
    };
    if held_shares == 0 {
        return match profile.action {
            ResearchAction::Buy => PositionSignal::Buy,
            _ => PositionSignal::Watch,
        };
    }
    match profile.action {
        ResearchAction::Sell
            if profile.confidence >= settings.sell_confidence_min
                && profile.sentiment <= settings.sell_sentiment_max =>
        {
            PositionSignal::Sell
        }
        ResearchAction::Buy
            if profile.confidence >= settings.add_confidence_min
                && profile.sentiment >= settings.add_sentiment_min =>
        {
            PositionSignal::Add
        }
        _ => PositionSignal::Hold,
    }
}

fn cached_profile<'a>(state: &'a RuntimeState, symbol: &str) -> Option<&'a ResearchProfile> {
    state
        .research_cache
        .get(symbol, &state.ai_settings)
        .map(|e| &e.profile)
}

/// sentiment + 0.35*confidence + 2*day% + (held ? 4 : 0) + (research ? 8 : -3)
pub fn heuristic_score(state: &RuntimeState, symbol: &str) -> f64 {
    let profile = cached_profile(state, symbol);
    let sentiment = profile.map(|p| p.sentiment as f64).unwrap_or(0.0);
    let confidence = profile.map(|p| p.confidence as f64).unwrap_or(0.0);
    let day_change = state
        .wallet
        .prices
        .get(symbol)
        .map(|q| q.day_change_pct())
        .unwrap_or(0.0);
    let held = if state.wallet.shares_of(symbol) > 0 { 4.0 } else { 0.0 };
    let research = if profile.is_some() { 8.0 } else { -3.0 };
    sentiment + 0.35 * confidence + 2.0 * day_change + held + research
}

fn is_quoted(state: &RuntimeState, symbol: &str) -> bool {
    state.wallet.watchlist.iter().any(|s| s == symbol)
        && state
            .wallet
            .prices
            .get(symbol)
            .map(|q| q.price > Decimal::ZERO)
            .unwrap_or(false)
}

/// Best quoted symbol to buy, or weakest held symbol to sell
pub fn pick_symbol(state: &RuntimeState, side: TradeSide) -> Option<String> {
    let candidates: Vec<&String> = match side {
        TradeSide::Buy => state
            .wallet
            .watchlist
            .iter()
            .filter(|s| is_quoted(state, s))
            .collect(),
        TradeSide::Sell => state
            .wallet
            .watchlist
            .iter()
            .filter(|s| state.wallet.shares_of(s) > 0)
            .collect(),
    };
    let mut best: Option<(&String, f64)> = None;
    for symbol in candidates {
        let score = heuristic_score(state, symbol);
        let better = match (best, side) {
            (None, _) => true,
            (Some((_, top)), TradeSide::Buy) => score > top,
            (Some((_, top)), TradeSide::Sell) => score < top,
        };
        if better {
            best = Some((symbol, score));
        }
    }
    best.map(|(s, _)| s.clone())
}

fn buy_size(state: &RuntimeState, symbol: &str, price: Decimal) -> u64 {
    let profile = cached_profile(state, symbol);
    let held = state.wallet.shares_of(symbol);
    let mut pct = profile.map(|p| p.buy_cash_pct).unwrap_or(0.08).clamp(0.01, 0.35);
    if position_signal(profile, held, &state.ai_settings) == PositionSignal::Add {
        pct = (pct * 0.6).clamp(0.01, 0.25);
    }
    let budget = round2(state.wallet.cash * from_f64(pct));
    shares_for_budget(budget, price)
}

fn sell_size(state: &RuntimeState, symbol: &str, held: u64) -> u64 {
    let trim = cached_profile(state, symbol)
        .map(|p| p.trim_position_pct)
        .unwrap_or(0.25)
        .clamp(0.05, 1.0);
    ((held as f64 * trim).floor() as u64).max(1)
}

fn reason_or(reason: &str, fallback: &str) -> String {
    if reason.trim().is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

/// Re-check a proposed action against ground truth
pub fn validate_action(state: &RuntimeState, proposed: &ProposedAction) -> ProposedAction {
    let wallet = &state.wallet;
    match proposed {
        ProposedAction::Hold { .. } => proposed.clone(),

        ProposedAction::Buy {
            symbol,
            shares,
            reason,
        } => {
            let resolved = symbol
                .as_ref()
                .filter(|s| is_quoted(state, s))
                .cloned()
                .or_else(|| pick_symbol(state, TradeSide::Buy));
            let Some(symbol) = resolved else {
                return ProposedAction::hold(symbol.clone(), "No quoted symbol available to buy.");
            };
            let Some(price) = wallet.prices.get(&symbol).map(|q| q.price) else {
                return ProposedAction::hold(Some(symbol.clone()), format!("No quote for {}.", symbol));
            };
            let affordable = shares_for_budget(wallet.cash, price);
            let wanted = if *shares > 0 {
                *shares
            } else {
                buy_size(state, &symbol, price)
            };
            let qty = wanted.min(affordable);
            if qty == 0 {
                return ProposedAction::hold(
                    Some(symbol.clone()),
                    format!(
                        "Cash {} cannot buy a share of {} at {}.",
                        wallet.cash, symbol, price
                    ),
                );
            }
            ProposedAction::Buy {
                symbol: Some(symbol),
                shares: qty,
                reason: reason_or(reason, "Buy signal."),
            }
        }

        ProposedAction::Sell {
            symbol,
            shares,
            reason,
        } => {
            let symbol = match symbol {
                Some(s) => s.clone(),
                None => match pick_symbol(state, TradeSide::Sell) {
                    Some(s) => s,
                    None => return ProposedAction::hold(None, "No held position to sell."),
                },
            };
            let held = wallet.shares_of(&symbol);
            if held == 0 {
                return ProposedAction::hold(
                    Some(symbol.clone()),
                    format!("No {} shares held; nothing to sell.", symbol),
                );
            }
            let wanted = if *shares > 0 {
                *shares
            } else {
                sell_size(state, &symbol, held)
            };
            ProposedAction::Sell {
                symbol: Some(symbol),
                shares: wanted.min(held),
                reason: reason_or(reason, "Sell signal."),
            }
        }
    }
}

/// Portfolio context for the decision provider
pub fn build_context(state: &RuntimeState, now: i64) -> PlanContext {
    let wallet = &state.wallet;
    let symbols = wallet
        .watchlist
        .iter()
        .filter_map(|symbol| {
            let quote = wallet.prices.get(symbol)?;
            let held = wallet.shares_of(symbol);
            let research = cached_profile(state, symbol).cloned();
            Some(SymbolContext {
                symbol: symbol.clone(),
                price: quote.price,
                last_close: quote.last_close,
                day_change_pct: quote.day_change_pct(),
                held_shares: held,
                avg_cost: wallet.positions.get(symbol).map(|p| p.avg_cost),
                locked: wallet.is_locked(symbol),
                signal: position_signal(research.as_ref(), held, &state.ai_settings).to_string(),
                research,
            })
        })
        .collect();
    PlanContext {
        generated_at: now,
        model: state.ai_settings.model.clone(),
        horizon: state.ai_settings.horizon,
        max_trades: state.ai_settings.max_trades_per_cycle as u32,
        cash: wallet.cash,
        realized_pnl: wallet.realized_pnl,
        unrealized_pnl: wallet.unrealized_pnl(),
        equity: wallet.equity(),
        symbols,
    }
}

/// Run one cycle. Never fails: errors are recorded into the autobot status.
pub async fn run_cycle(rt: &Runtime, trigger: Trigger) -> CycleOutcome {
    let Some(_busy) = rt.autobot_busy.try_acquire() else {
        debug!("Autobot cycle already running");
        return CycleOutcome::skipped("busy", "Autobot cycle already running.");
    };

    match cycle(rt, trigger).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Autobot cycle error: {}", e);
            let message = e.to_string();
            let recorded = message.clone();
            let now = now_ms();
            let result = rt
                .state
                .mutate(move |s| {
                    s.autobot.last_run_at = now;
                    s.autobot.set_status("Error");
                    s.autobot.set_error(&recorded);
                })
                .await;
            if let Err(e) = result {
                error!("Could not record autobot error: {}", e);
            }
            CycleOutcome {
                ran: true,
                status: "Error".to_string(),
                reason: Some(message),
                recommendations: Vec::new(),
            }
        }
    }
}

/// Record a skipped cycle so the status field explains it
async fn record_skip(rt: &Runtime, reason: &str, status: String) -> Result<CycleOutcome> {
    let now = now_ms();
    let recorded = status.clone();
    rt.state
        .mutate(move |s| {
            s.autobot.last_run_at = now;
            s.autobot.set_status(&recorded);
        })
        .await?;
    info!("Autobot skipped ({}): {}", reason, status);
    Ok(CycleOutcome::skipped(reason, status))
}

async fn cycle(rt: &Runtime, trigger: Trigger) -> Result<CycleOutcome> {
    let state = rt.state.snapshot().await?;
    if trigger == Trigger::Scheduled && !state.autobot.enabled {
        return Ok(CycleOutcome::skipped("disabled", "Autobot is disabled."));
    }
    if state.wallet.watchlist.is_empty() {
        return record_skip(rt, "empty-watchlist", "Watchlist is empty; nothing to trade.".to_string())
            .await;
    }
    let broker = match rt.broker() {
        Ok(broker) => broker,
        Err(e) => return record_skip(rt, "broker-unavailable", e.to_string()).await,
    };
    let decision = match rt.decision() {
        Ok(decision) => decision,
        Err(e) => return record_skip(rt, "decision-unavailable", e.to_string()).await,
    };

    let clock = broker.get_clock().await?;
    let now = now_ms();
    if !clock.is_open {
        let reopen = clock.next_open.unwrap_or_else(|| "the next session".to_string());
        let status = format!("Market closed. Holding until reopen at {}.", reopen);
        let hold = ProposedAction::hold(None, format!("Market closed; reopen at {}.", reopen));
        let recorded_hold = hold.clone();
        let recorded_status = status.clone();
        rt.state
            .mutate(move |s| {
                s.autobot.last_run_at = now;
                s.autobot.latest_thought = "Market closed.".to_string();
                s.autobot.latest_recommendation = Some(recorded_hold);
                s.autobot.set_status(&recorded_status);
                s.autobot.last_error.clear();
            })
            .await?;
        info!("Autobot holding: {}", status);
        return Ok(CycleOutcome {
            ran: true,
            status,
            reason: Some("market-closed".to_string()),
            recommendations: vec![CycleAction::not_executed(hold)],
        });
    }

    let quotes = broker.get_quotes(&state.wallet.watchlist).await?;
    let state = rt
        .state
        .apply(move |s| {
            s.wallet.apply_quotes(&quotes);
            (s.clone(), Persist::Quiet)
        })
        .await?;

    let max_actions = state.ai_settings.max_trades_per_cycle.max(1) as usize;
    let context = build_context(&state, now);
    let plan = decision.generate_plan(&context, max_actions).await?;
    debug!("Plan with {} actions: {}", plan.actions.len(), plan.thought);

    let mut proposed: Vec<ProposedAction> = plan.actions.into_iter().take(max_actions).collect();
    if proposed.is_empty() {
        proposed.push(ProposedAction::hold(None, "No actions proposed."));
    }

    let mut results: Vec<CycleAction> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    for raw in proposed {
        // Validate against the state left by the previous action's reload
        let current = rt.state.snapshot().await?;
        let action = validate_action(&current, &raw);
        let (symbol, side, shares) = match &action {
            ProposedAction::Buy {
                symbol: Some(s),
                shares,
                ..
            } => (s.clone(), TradeSide::Buy, *shares),
            ProposedAction::Sell {
                symbol: Some(s),
                shares,
                ..
            } => (s.clone(), TradeSide::Sell, *shares),
            _ => {
                results.push(CycleAction::not_executed(action));
                continue;
            }
        };

        match rt
            .executor
            .execute(rt, &symbol, side, shares, TradeSource::Autobot)
            .await
        {
            Ok(outcome) => results.push(CycleAction {
                action,
                executed: true,
                order_id: Some(outcome.order.id),
                error: None,
            }),
            Err(e) => {
                warn!("Autobot {} {} {} failed: {}", side, shares, symbol, e);
                errors.push(format!("{} {}: {}", side, symbol, e));
                results.push(CycleAction {
                    action,
                    executed: false,
                    order_id: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let executed = results.iter().filter(|r| r.executed).count();
    let status = if executed > 0 {
        format!("Executed {} of {} actions.", executed, results.len())
    } else if !errors.is_empty() {
        "Error".to_string()
    } else {
        let reason = results
            .first()
            .map(|r| r.action.reason().to_string())
            .unwrap_or_default();
        truncate_text(&format!("Holding. {}", reason), 180)
    };

    let thought = plan.thought;
    let recorded = results.clone();
    let recorded_status = status.clone();
    let recorded_error = errors.join("; ");
    rt.state
        .mutate(move |s| {
            s.autobot.last_run_at = now;
            s.autobot.latest_thought = truncate_text(&thought, 900);
            s.autobot.latest_recommendation = recorded
                .iter()
                .find(|r| !r.action.is_hold())
                .or_else(|| recorded.first())
                .map(|r| r.action.clone());
            if let Some(last) = recorded.iter().rev().find(|r| r.executed) {
                s.autobot.latest_auto_action = Some(AutoAction {
                    action: last.action.clone(),
                    executed: true,
                    at: now,
                    order_id: last.order_id.clone(),
                });
            }
            s.autobot.set_status(&recorded_status);
            s.autobot.set_error(&recorded_error);
        })
        .await?;

    info!("Autobot cycle complete: {}", status);
    Ok(CycleOutcome {
        ran: true,
        status,
        reason: None,
        recommendations: results,
    })
}
