//! Market discovery
//!
//! Walks a round-robin cursor over the core universe plus the hot list,
//! researches one symbol per cycle and proposes it for the watchlist.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::providers::{DecisionProvider, MarketDataProvider};
use crate::research::{fetch_research, RefreshMeta, ResearchEntry};
use crate::runtime::{now_ms, Runtime};
use crate::state::{RuntimeState, MAX_HOT_SYMBOLS};
use crate::store::Persist;
use crate::types::{HotList, Quote, ResearchContext};

/// Deterministic base universe
pub const CORE_UNIVERSE: &[&str] = &[
    "AAPL", "MSFT", "NVDA", "AMZN", "META", "GOOGL", "TSLA", "AMD", "AVGO", "NFLX", "COST", "JPM",
    "V", "MA", "UNH", "LLY", "XOM", "ORCL", "CRM", "ADBE", "INTC", "QCOM", "PEP", "KO", "WMT",
    "DIS", "BAC", "PLTR", "SHOP", "UBER", "ABNB", "PYPL", "MU", "SNOW", "PANW", "CRWD", "NOW",
    "ASML", "TSM", "SMCI",
];

/// Core universe followed by hot symbols not already in it
pub fn universe(hot: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    CORE_UNIVERSE
        .iter()
        .map(|s| s.to_string())
        .chain(hot.iter().cloned())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// First universe symbol at or after `cursor` that is not on the watchlist,
/// with the cursor to resume from next time
pub fn pick_next_candidate(universe: &[String], watchlist: &[String], cursor: u64) -> Option<(String, u64)> {
    let len = universe.len();
    if len == 0 {
        return None;
    }
    let start = (cursor % len as u64) as usize;
    (0..len)
        .map(|step| (start + step) % len)
        .find(|&idx| !watchlist.contains(&universe[idx]))
        .map(|idx| (universe[idx].clone(), ((idx + 1) % len) as u64))
}

/// Result of the watchlist add rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddDecision {
    Added,
    Replaced { removed: String, removed_sentiment: i64 },
    Rejected(String),
}

/// Try to put `symbol` on the watchlist.
///
/// Requires strictly positive sentiment. When the watchlist is full, the
/// unlocked, unheld symbol with the weakest cached sentiment (missing
/// research counts as 0) is replaced, but only if it is strictly weaker.
pub fn apply_add_rule(
    state: &mut RuntimeState,
    symbol: &str,
    sentiment: i64,
    quote: Option<Quote>,
    now: i64,
) -> AddDecision {
    if sentiment <= 0 {
        return AddDecision::Rejected(format!(
            "{} sentiment {} is not positive; not added.",
            symbol, sentiment
        ));
    }
    if state.wallet.watchlist.iter().any(|s| s == symbol) {
        return AddDecision::Rejected(format!("{} is already on the watchlist.", symbol));
    }

    let mut decision = AddDecision::Added;
    if state.wallet.is_full() {
        let weakest = state
            .wallet
            .watchlist
            .iter()
            .filter(|s| !state.wallet.is_locked(s) && state.wallet.shares_of(s) == 0)
            .map(|s| {
                let cached = state
                    .research_cache
                    .get(s, &state.ai_settings)
                    .map(|e| e.profile.sentiment)
                    .unwrap_or(0);
                (s.clone(), cached)
            })
            .min_by_key(|(_, cached)| *cached);

        match weakest {
            None => {
                return AddDecision::Rejected(format!(
                    "Watchlist full of held or locked symbols; {} not added.",
                    symbol
                ))
            }
            Some((weak, weak_sentiment)) if weak_sentiment < sentiment => {
                state.wallet.remove_symbol(&weak);
                state.refresh_meta.remove(&weak);
                decision = AddDecision::Replaced {
                    removed: weak,
                    removed_sentiment: weak_sentiment,
                };
            }
            Some((weak, weak_sentiment)) => {
                return AddDecision::Rejected(format!(
                    "Watchlist full; weakest {} ({}) is not below {} ({}).",
                    weak, weak_sentiment, symbol, sentiment
                ))
            }
        }
    }

    if !state.wallet.add_symbol(symbol, quote) {
        return AddDecision::Rejected(format!("Could not add {}.", symbol));
    }
    let fetched_at = state
        .research_cache
        .get(symbol, &state.ai_settings)
        .map(|e| e.fetched_at)
        .unwrap_or(0);
    state.refresh_meta.insert(
        symbol.to_string(),
        RefreshMeta {
            added_at: now,
            last_updated_at: fetched_at,
            last_attempt_at: fetched_at,
        },
    );
    decision
}

fn describe(symbol: &str, sentiment: i64, decision: &AddDecision) -> String {
    match decision {
        AddDecision::Added => format!("Added {} (sentiment {}).", symbol, sentiment),
        AddDecision::Replaced {
            removed,
            removed_sentiment,
        } => format!(
            "Added {} (sentiment {}), replacing {} ({}).",
            symbol, sentiment, removed, removed_sentiment
        ),
        AddDecision::Rejected(reason) => reason.clone(),
    }
}

/// Ask for currently notable symbols and keep the tradable ones outside the core universe
pub async fn refresh_hot_list(
    broker: &dyn MarketDataProvider,
    decision: &dyn DecisionProvider,
    model: &str,
) -> Result<HotList> {
    let core: Vec<String> = CORE_UNIVERSE.iter().map(|s| s.to_string()).collect();
    let mut hot = decision.discover_hot_symbols(model, &core).await?;
    match broker.get_tradable_assets().await {
        Ok(tradable) if !tradable.is_empty() => hot.symbols.retain(|s| tradable.contains(s)),
        Ok(_) => {}
        Err(e) => warn!("Asset directory unavailable, hot list left unfiltered: {}", e),
    }
    hot.symbols.retain(|s| !core.contains(s));
    hot.symbols.truncate(MAX_HOT_SYMBOLS);
    Ok(hot)
}

/// One discovery step. `Ok(None)` when skipped without touching state.
pub async fn run_cycle(rt: &Runtime) -> Result<Option<String>> {
    let Some(_busy) = rt.scout_busy.try_acquire() else {
        debug!("Scout cycle already running");
        return Ok(None);
    };
    let now = now_ms();
    let (broker, decision) = match (rt.broker(), rt.decision()) {
        (Ok(broker), Ok(decision)) => (broker, decision),
        (Err(e), _) | (_, Err(e)) => {
            let message = format!("Scout paused: {}.", e);
            let logged = message.clone();
            rt.state
                .mutate(move |s| {
                    s.scout.last_run_at = now;
                    s.scout.log(logged);
                })
                .await?;
            debug!("{}", message);
            return Ok(Some(message));
        }
    };

    let mut state = rt.state.snapshot().await?;
    if now - state.scout.last_hot_refresh_at >= rt.config.hot_refresh_ms() {
        let model = state.ai_settings.model.clone();
        match refresh_hot_list(broker.as_ref(), decision.as_ref(), &model).await {
            Ok(hot) => {
                info!("Hot list refreshed: {} symbols", hot.symbols.len());
                state = rt
                    .state
                    .mutate(move |s| {
                        s.scout.last_hot_refresh_at = now;
                        s.scout.log(format!("Hot list refreshed: {} symbols.", hot.symbols.len()));
                        s.scout.hot_symbols = hot.symbols;
                        s.scout.hot_summary = hot.summary;
                        s.clone()
                    })
                    .await?;
            }
            Err(e) => {
                warn!("Hot list refresh failed: {}", e);
                state = rt
                    .state
                    .apply(move |s| {
                        s.scout.last_hot_refresh_at = now;
                        (s.clone(), Persist::Quiet)
                    })
                    .await?;
            }
        }
    }

    let candidates = universe(&state.scout.hot_symbols);
    let Some((symbol, cursor)) =
        pick_next_candidate(&candidates, &state.wallet.watchlist, state.scout.cursor)
    else {
        let message = "Every universe symbol is already on the watchlist.".to_string();
        let logged = message.clone();
        rt.state
            .mutate(move |s| {
                s.scout.last_run_at = now;
                s.scout.log(logged);
            })
            .await?;
        return Ok(Some(message));
    };

    let attempt = check_symbol(rt, broker.as_ref(), &state, &symbol, now).await;
    let target = symbol.clone();
    let message = rt
        .state
        .mutate(move |s| {
            s.scout.last_run_at = now;
            s.scout.cursor = cursor;
            s.scout.last_symbol = target.clone();
            s.scout.checked_at_by_symbol.insert(target.clone(), now);
            let message = match attempt {
                Ok((quote, entry)) => {
                    let sentiment = entry.profile.sentiment;
                    s.research_cache.upsert(entry);
                    let decision = apply_add_rule(s, &target, sentiment, Some(quote), now);
                    describe(&target, sentiment, &decision)
                }
                Err(reason) => reason,
            };
            s.scout.log(message.clone());
            message
        })
        .await?;
    info!("Scout {}: {}", symbol, message);
    Ok(Some(message))
}

/// Quote plus research for one candidate; `Err` carries the message to log
async fn check_symbol(
    rt: &Runtime,
    broker: &dyn MarketDataProvider,
    state: &RuntimeState,
    symbol: &str,
    now: i64,
) -> std::result::Result<(Quote, ResearchEntry), String> {
    let quotes = broker
        .get_quotes(&[symbol.to_string()])
        .await
        .map_err(|e| format!("Quote for {} failed: {}", symbol, e))?;
    let Some(quote) = quotes.get(symbol).copied() else {
        return Err(format!("No quote for {}; skipped.", symbol));
    };

    let settings = &state.ai_settings;
    if let Some(cached) = state.research_cache.get_fresh(symbol, settings, now) {
        debug!("Reusing research for {} from {}", symbol, cached.fetched_at);
        return Ok((quote, cached.clone()));
    }
    let context = ResearchContext {
        symbol: symbol.to_string(),
        model: settings.model.clone(),
        horizon: settings.horizon,
        quote: Some(quote),
        company: None,
        held_shares: 0,
    };
    let entry = fetch_research(rt, symbol, settings, context)
        .await
        .map_err(|e| format!("Research for {} failed: {}", symbol, e))?;
    Ok((quote, entry))
}
