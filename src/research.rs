//! Research cache and refresh scheduling

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{AiSettings, Horizon};
use crate::error::Result;
use crate::portfolio::normalize_symbol;
use crate::runtime::{now_ms, Runtime};
use crate::state::RuntimeState;
use crate::store::Persist;
use crate::types::{CompanyProfile, ResearchContext, ResearchProfile};

pub const MAX_CACHE_ENTRIES: usize = 300;
/// Failed refreshes are not retried sooner than this
pub const RETRY_COOLDOWN_MS: i64 = 5 * 60_000;
/// Spread used when seeding refresh meta for new watchlist symbols
const SEED_SPREAD_MS: i64 = 60 * 60_000;

/// Cache key: symbol, provider, model and horizon
pub fn cache_key(symbol: &str, settings: &AiSettings) -> String {
    format!(
        "{}|{}|{}|{}",
        symbol, settings.provider, settings.model, settings.horizon
    )
}

/// Cached research for one (symbol, provider, model, horizon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchEntry {
    pub symbol: String,
    pub provider: String,
    pub model: String,
    pub horizon: Horizon,
    pub fetched_at: i64,
    pub profile: ResearchProfile,
    #[serde(default)]
    pub company: Option<CompanyProfile>,
}

impl ResearchEntry {
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.symbol, self.provider, self.model, self.horizon
        )
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.fetched_at < self.horizon.research_ttl_ms()
    }
}

/// Bounded research store keyed by [`cache_key`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResearchCache(BTreeMap<String, ResearchEntry>);

impl<'de> Deserialize<'de> for ResearchCache {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Drop rows that do not parse instead of rejecting the document
        let rows = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let entries = rows
            .into_values()
            .filter_map(|row| serde_json::from_value::<ResearchEntry>(row).ok())
            .map(|entry| (entry.key(), entry))
            .collect();
        let mut cache = ResearchCache(entries);
        cache.evict();
        Ok(cache)
    }
}

impl ResearchCache {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ResearchEntry> {
        self.0.values()
    }

    /// Entry for `symbol` under the current settings, fresh or not
    pub fn get(&self, symbol: &str, settings: &AiSettings) -> Option<&ResearchEntry> {
        self.0.get(&cache_key(symbol, settings))
    }

    /// Entry for `symbol` under the current settings, if still within its TTL
    pub fn get_fresh(&self, symbol: &str, settings: &AiSettings, now: i64) -> Option<&ResearchEntry> {
        self.get(symbol, settings).filter(|e| e.is_fresh(now))
    }

    pub fn upsert(&mut self, entry: ResearchEntry) {
        self.0.insert(entry.key(), entry);
        self.evict();
    }

    /// Union with another cache, newest `fetched_at` winning per key
    pub fn merge(&mut self, other: ResearchCache) {
        for (key, entry) in other.0 {
            match self.0.get(&key) {
                Some(existing) if existing.fetched_at >= entry.fetched_at => {}
                _ => {
                    self.0.insert(key, entry);
                }
            }
        }
        self.evict();
    }

    /// Drop invalid rows, then keep the newest [`MAX_CACHE_ENTRIES`] by `fetched_at`
    pub fn evict(&mut self) {
        let total = self.0.len();
        let mut newest: BTreeMap<String, ResearchEntry> = BTreeMap::new();
        for mut entry in std::mem::take(&mut self.0).into_values() {
            if entry.fetched_at <= 0 {
                continue;
            }
            let Some(symbol) = normalize_symbol(&entry.symbol) else {
                continue;
            };
            entry.symbol = symbol;
            match newest.get(&entry.key()) {
                Some(kept) if kept.fetched_at >= entry.fetched_at => {}
                _ => {
                    newest.insert(entry.key(), entry);
                }
            }
        }
        let mut rows: Vec<ResearchEntry> = newest.into_values().collect();
        rows.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        rows.truncate(MAX_CACHE_ENTRIES);
        if rows.len() < total {
            debug!("Evicted {} research cache entries", total - rows.len());
        }
        self.0 = rows.into_iter().map(|e| (e.key(), e)).collect();
    }
}

/// Per-symbol refresh bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshMeta {
    pub added_at: i64,
    pub last_updated_at: i64,
    pub last_attempt_at: i64,
}

/// Deterministic per-symbol offset in `[0, interval_ms)`
pub fn symbol_refresh_offset_ms(symbol: &str, interval_ms: i64) -> i64 {
    if interval_ms <= 1 {
        return 0;
    }
    let hash = symbol
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    hash as i64 % interval_ms
}

/// One meta entry per watchlist symbol; unseen symbols get a spread-out `added_at`
pub fn normalize_refresh_meta(
    meta: &BTreeMap<String, RefreshMeta>,
    watchlist: &[String],
    now: i64,
) -> BTreeMap<String, RefreshMeta> {
    watchlist
        .iter()
        .map(|symbol| {
            let existing = meta
                .get(symbol)
                .copied()
                .map(|m| RefreshMeta {
                    added_at: m.added_at.max(0),
                    last_updated_at: m.last_updated_at.max(0),
                    last_attempt_at: m.last_attempt_at.max(0),
                })
                .filter(|m| m.added_at > 0 || m.last_updated_at > 0 || m.last_attempt_at > 0);
            let entry = existing.unwrap_or_else(|| RefreshMeta {
                added_at: (now - symbol_refresh_offset_ms(symbol, SEED_SPREAD_MS)).max(1),
                ..RefreshMeta::default()
            });
            (symbol.clone(), entry)
        })
        .collect()
}

/// When `symbol` next needs fresh research
pub fn next_due_at(state: &RuntimeState, symbol: &str) -> i64 {
    let meta = state.refresh_meta.get(symbol).copied().unwrap_or_default();
    let fetched_at = state
        .research_cache
        .get(symbol, &state.ai_settings)
        .map(|e| e.fetched_at)
        .unwrap_or(0);
    meta.last_updated_at.max(fetched_at).max(meta.added_at)
        + state.ai_settings.auto_refresh_interval_ms()
}

/// The overdue symbol with the earliest due time, honoring the retry cooldown
pub fn pick_due_symbol(state: &RuntimeState, now: i64) -> Option<String> {
    if !state.ai_settings.ai_research_auto_refresh_enabled {
        return None;
    }
    state
        .wallet
        .watchlist
        .iter()
        .filter_map(|symbol| {
            let due = next_due_at(state, symbol);
            if now < due {
                return None;
            }
            let last_attempt = state
                .refresh_meta
                .get(symbol)
                .map(|m| m.last_attempt_at)
                .unwrap_or(0);
            if last_attempt > 0 && now - last_attempt < RETRY_COOLDOWN_MS {
                return None;
            }
            Some((due, symbol.clone()))
        })
        .min_by_key(|(due, _)| *due)
        .map(|(_, symbol)| symbol)
}

/// Store a fresh entry and stamp the symbol's refresh meta
pub fn record_research(state: &mut RuntimeState, entry: ResearchEntry, now: i64) {
    if let Some(meta) = state.refresh_meta.get_mut(&entry.symbol) {
        meta.last_updated_at = now;
        meta.last_attempt_at = now;
    }
    state.research_cache.upsert(entry);
}

/// Ask the decision provider for research on `symbol`.
///
/// Does not touch state; callers decide whether the result is kept.
pub async fn fetch_research(
    rt: &Runtime,
    symbol: &str,
    settings: &AiSettings,
    context: ResearchContext,
) -> Result<ResearchEntry> {
    let decision = rt.decision()?;
    let mut context = context;
    if context.company.is_none() {
        if let Some(profiles) = rt.profiles() {
            match profiles.get_profile(symbol).await {
                Ok(profile) => context.company = profile,
                Err(e) => warn!("Company profile for {} unavailable: {}", symbol, e),
            }
        }
    }
    let company = context.company.clone();
    let profile = decision.generate_research(&context).await?;
    Ok(ResearchEntry {
        symbol: symbol.to_string(),
        provider: settings.provider.clone(),
        model: settings.model.clone(),
        horizon: settings.horizon,
        fetched_at: now_ms(),
        profile,
        company,
    })
}

/// Refresh research for one watchlist symbol and cache it
pub async fn refresh_symbol(rt: &Runtime, symbol: &str) -> Result<ResearchEntry> {
    let now = now_ms();
    let target = symbol.to_string();
    let (settings, context) = rt
        .state
        .apply(move |state| {
            if let Some(meta) = state.refresh_meta.get_mut(&target) {
                meta.last_attempt_at = now;
            }
            let context = ResearchContext {
                symbol: target.clone(),
                model: state.ai_settings.model.clone(),
                horizon: state.ai_settings.horizon,
                quote: state.wallet.prices.get(&target).copied(),
                company: None,
                held_shares: state.wallet.shares_of(&target),
            };
            ((state.ai_settings.clone(), context), Persist::Quiet)
        })
        .await?;

    let entry = fetch_research(rt, symbol, &settings, context).await?;
    let stored = entry.clone();
    rt.state
        .mutate(move |state| record_research(state, stored, now_ms()))
        .await?;
    info!(
        "Research refreshed for {}: sentiment {}, confidence {}, {:?}",
        symbol, entry.profile.sentiment, entry.profile.confidence, entry.profile.action
    );
    Ok(entry)
}

/// Refresh at most one overdue watchlist symbol
pub async fn auto_refresh_once(rt: &Runtime) -> Result<Option<String>> {
    if rt.decision().is_err() {
        return Ok(None);
    }
    let Some(_guard) = rt.refresh_busy.try_acquire() else {
        debug!("Research refresh already running");
        return Ok(None);
    };
    let now = now_ms();
    let Some(symbol) = rt.state.read(move |s| pick_due_symbol(s, now)).await? else {
        return Ok(None);
    };
    refresh_symbol(rt, &symbol).await?;
    Ok(Some(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(symbol: &str, fetched_at: i64) -> ResearchEntry {
        ResearchEntry {
            symbol: symbol.to_string(),
            provider: "openai".to_string(),
            model: "gpt-4.1-mini".to_string(),
            horizon: Horizon::Swing,
            fetched_at,
            profile: ResearchProfile::default(),
            company: None,
        }
    }

    #[test]
    fn test_key_matches_settings() {
        let settings = AiSettings::default();
        assert_eq!(cache_key("AAPL", &settings), "AAPL|openai|gpt-4.1-mini|swing");
        assert_eq!(entry("AAPL", 1).key(), cache_key("AAPL", &settings));
    }

    #[test]
    fn test_settings_change_invalidates_reuse() {
        let mut cache = ResearchCache::default();
        cache.upsert(entry("AAPL", 10));
        let mut settings = AiSettings::default();
        assert!(cache.get("AAPL", &settings).is_some());
        settings.horizon = Horizon::Long;
        assert!(cache.get("AAPL", &settings).is_none());
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let mut cache = ResearchCache::default();
        for i in 0..350 {
            let mut e = entry(&format!("S{}", i), (i + 1) as i64);
            e.model = format!("m{}", i % 3);
            cache.0.insert(e.key(), e);
        }
        cache.evict();
        assert_eq!(cache.len(), MAX_CACHE_ENTRIES);
        let oldest_kept = cache.entries().map(|e| e.fetched_at).min().unwrap();
        assert_eq!(oldest_kept, 51);
    }

    #[test]
    fn test_merge_prefers_newer() {
        let mut server = ResearchCache::default();
        server.upsert(entry("AAPL", 100));
        let mut client = ResearchCache::default();
        client.upsert(entry("AAPL", 50));
        client.upsert(entry("MSFT", 70));
        server.merge(client);
        assert_eq!(server.len(), 2);
        assert_eq!(server.get("AAPL", &AiSettings::default()).unwrap().fetched_at, 100);
    }

    #[test]
    fn test_colliding_symbols_keep_newest() {
        let rows = serde_json::json!({
            "aapl|openai|gpt-4.1-mini|swing": entry("aapl", 200),
            "AAPL|openai|gpt-4.1-mini|swing": entry("AAPL", 100),
        });
        let cache: ResearchCache = serde_json::from_value(rows).unwrap();
        assert_eq!(cache.len(), 1);
        let kept = cache.get("AAPL", &AiSettings::default()).unwrap();
        assert_eq!(kept.fetched_at, 200);
        assert_eq!(kept.symbol, "AAPL");
    }

    #[test]
    fn test_freshness_by_horizon() {
        let e = entry("AAPL", 1_000);
        assert!(e.is_fresh(1_000 + 7 * 3_600_000));
        assert!(!e.is_fresh(1_000 + 8 * 3_600_000));
    }

    #[test]
    fn test_seed_offsets_spread() {
        let a = symbol_refresh_offset_ms("AAPL", SEED_SPREAD_MS);
        let b = symbol_refresh_offset_ms("MSFT", SEED_SPREAD_MS);
        assert!((0..SEED_SPREAD_MS).contains(&a));
        assert_ne!(a, b);
        assert_eq!(symbol_refresh_offset_ms("AAPL", 1), 0);
    }

    #[test]
    fn test_pick_due_symbol_earliest_wins_and_cooldown() {
        let mut state = RuntimeState::default();
        state.wallet.watchlist = vec!["AAPL".to_string(), "MSFT".to_string()];
        state.refresh_meta.insert(
            "AAPL".to_string(),
            RefreshMeta {
                added_at: 2_000,
                ..Default::default()
            },
        );
        state.refresh_meta.insert(
            "MSFT".to_string(),
            RefreshMeta {
                added_at: 1_000,
                ..Default::default()
            },
        );
        let interval = state.ai_settings.auto_refresh_interval_ms();
        assert_eq!(pick_due_symbol(&state, 500 + interval), None);
        assert_eq!(
            pick_due_symbol(&state, 3_000 + interval),
            Some("MSFT".to_string())
        );

        let now = 3_000 + interval;
        state.refresh_meta.get_mut("MSFT").unwrap().last_attempt_at = now - 60_000;
        assert_eq!(pick_due_symbol(&state, now), Some("AAPL".to_string()));

        state.ai_settings.ai_research_auto_refresh_enabled = false;
        assert_eq!(pick_due_symbol(&state, now), None);
    }

    #[test]
    fn test_cached_fetch_pushes_due_time() {
        let mut state = RuntimeState::default();
        state.wallet.watchlist = vec!["AAPL".to_string()];
        state.refresh_meta.insert(
            "AAPL".to_string(),
            RefreshMeta {
                added_at: 1_000,
                ..Default::default()
            },
        );
        state.research_cache.upsert(entry("AAPL", 9_000));
        let interval = state.ai_settings.auto_refresh_interval_ms();
        assert_eq!(next_due_at(&state, "AAPL"), 9_000 + interval);
    }
}
