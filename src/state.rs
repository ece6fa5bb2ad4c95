//! Runtime state aggregate
//!
//! One document holds everything the runtime owns. It is mutated only
//! through the state actor (see `store`) and persisted wholesale.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::amount::truncate_text;
use crate::config::AiSettings;
use crate::portfolio::{normalize_symbol, Ring, Wallet};
use crate::research::{RefreshMeta, ResearchCache};
use crate::scout::CORE_UNIVERSE;
use crate::types::ProposedAction;

pub const MAX_HOT_SYMBOLS: usize = 30;
pub const MAX_SCOUT_MESSAGES: usize = 40;

/// Market discovery state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoutState {
    pub enabled: bool,
    pub interval_mins: i64,
    pub last_run_at: i64,
    pub last_hot_refresh_at: i64,
    pub cursor: u64,
    pub last_symbol: String,
    pub latest_message: String,
    pub hot_summary: String,
    pub hot_symbols: Vec<String>,
    pub recent_messages: Ring<String, MAX_SCOUT_MESSAGES>,
    pub checked_at_by_symbol: BTreeMap<String, i64>,
}

impl Default for ScoutState {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_mins: 2,
            last_run_at: 0,
            last_hot_refresh_at: 0,
            cursor: 0,
            last_symbol: String::new(),
            latest_message: "Research ticker idle.".to_string(),
            hot_summary: String::new(),
            hot_symbols: Vec::new(),
            recent_messages: Ring::default(),
            checked_at_by_symbol: BTreeMap::new(),
        }
    }
}

impl ScoutState {
    /// Check stamps survive only for symbols the scout can still visit or the watchlist holds
    pub fn normalize(&mut self, watchlist: &[String]) {
        self.interval_mins = self.interval_mins.clamp(1, 120);
        self.last_run_at = self.last_run_at.max(0);
        self.last_hot_refresh_at = self.last_hot_refresh_at.max(0);
        self.last_symbol = normalize_symbol(&self.last_symbol).unwrap_or_default();
        self.latest_message = truncate_text(&self.latest_message, 260);
        if self.latest_message.is_empty() {
            self.latest_message = ScoutState::default().latest_message;
        }
        self.hot_summary = truncate_text(&self.hot_summary, 600);

        let mut seen = HashSet::new();
        self.hot_symbols = self
            .hot_symbols
            .iter()
            .filter_map(|s| normalize_symbol(s))
            .filter(|s| seen.insert(s.clone()))
            .take(MAX_HOT_SYMBOLS)
            .collect();

        let reachable: HashSet<&str> = CORE_UNIVERSE
            .iter()
            .copied()
            .chain(self.hot_symbols.iter().map(String::as_str))
            .chain(watchlist.iter().map(String::as_str))
            .collect();
        self.checked_at_by_symbol = std::mem::take(&mut self.checked_at_by_symbol)
            .into_iter()
            .filter_map(|(s, at)| Some((normalize_symbol(&s)?, at)).filter(|(_, at)| *at > 0))
            .filter(|(s, _)| reachable.contains(s.as_str()))
            .collect();

        // Ring keeps newest first; rebuild oldest-first so order survives
        let mut messages: Vec<String> = self
            .recent_messages
            .iter()
            .map(|m| truncate_text(m, 260))
            .filter(|m| !m.is_empty())
            .collect();
        messages.reverse();
        self.recent_messages = Ring::default();
        for message in messages {
            self.recent_messages.push(message);
        }
    }

    /// Record a scout outcome as the latest message and in the log
    pub fn log(&mut self, message: impl Into<String>) {
        let message = truncate_text(&message.into(), 260);
        self.latest_message = message.clone();
        self.recent_messages.push(message);
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_mins * 60_000
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.enabled && (self.last_run_at == 0 || now - self.last_run_at >= self.interval_ms())
    }
}

/// Last executed autobot action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAction {
    pub action: ProposedAction,
    pub executed: bool,
    pub at: i64,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// Autobot decision-cycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutobotState {
    pub enabled: bool,
    pub last_run_at: i64,
    pub latest_thought: String,
    pub latest_recommendation: Option<ProposedAction>,
    pub latest_auto_action: Option<AutoAction>,
    pub last_status: String,
    pub last_error: String,
}

impl Default for AutobotState {
    fn default() -> Self {
        Self {
            enabled: false,
            last_run_at: 0,
            latest_thought: String::new(),
            latest_recommendation: None,
            latest_auto_action: None,
            last_status: "Disabled".to_string(),
            last_error: String::new(),
        }
    }
}

impl AutobotState {
    pub fn normalize(&mut self) {
        self.last_run_at = self.last_run_at.max(0);
        self.latest_thought = truncate_text(&self.latest_thought, 900);
        self.last_status = truncate_text(&self.last_status, 180);
        if self.last_status.is_empty() {
            self.last_status = AutobotState::default().last_status;
        }
        self.last_error = truncate_text(&self.last_error, 220);
    }

    pub fn set_status(&mut self, status: impl AsRef<str>) {
        self.last_status = truncate_text(status.as_ref(), 180);
    }

    pub fn set_error(&mut self, error: impl AsRef<str>) {
        self.last_error = truncate_text(error.as_ref(), 220);
    }
}

/// The single server-owned aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeState {
    pub updated_at: i64,
    pub last_client_heartbeat_at: i64,
    pub ai_settings: AiSettings,
    pub wallet: Wallet,
    pub research_cache: ResearchCache,
    pub refresh_meta: BTreeMap<String, RefreshMeta>,
    pub scout: ScoutState,
    pub autobot: AutobotState,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            updated_at: 0,
            last_client_heartbeat_at: 0,
            ai_settings: AiSettings::default(),
            wallet: Wallet::default(),
            research_cache: ResearchCache::default(),
            refresh_meta: BTreeMap::new(),
            scout: ScoutState::default(),
            autobot: AutobotState::default(),
        }
    }
}

impl RuntimeState {
    /// Fresh state with refresh meta seeded
    pub fn new(now: i64) -> Self {
        let mut state = RuntimeState::default();
        state.normalize(now);
        state
    }

    /// Restore every cross-field invariant. Idempotent for a fixed `now`,
    /// and stable across reloads once refresh meta has been seeded.
    pub fn normalize(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(0);
        self.last_client_heartbeat_at = self.last_client_heartbeat_at.max(0);
        self.ai_settings = self.ai_settings.clone().clamped();
        self.wallet.normalize();
        self.research_cache.evict();
        self.refresh_meta = crate::research::normalize_refresh_meta(
            &self.refresh_meta,
            &self.wallet.watchlist,
            now,
        );
        self.scout.normalize(&self.wallet.watchlist);
        self.autobot.normalize();
    }

    /// Advance `updated_at`, never backwards and never equal to the previous value
    pub fn touch(&mut self, now: i64) {
        self.updated_at = now.max(self.updated_at + 1);
    }

    pub fn autobot_due(&self, now: i64) -> bool {
        self.autobot.enabled
            && (self.autobot.last_run_at == 0
                || now - self.autobot.last_run_at >= self.ai_settings.autobot_interval_ms())
    }

    /// Next scheduled autobot run, 0 when disabled
    pub fn next_autobot_run_at(&self, now: i64) -> i64 {
        if !self.autobot.enabled {
            return 0;
        }
        if self.autobot.last_run_at == 0 {
            return now;
        }
        self.autobot.last_run_at + self.ai_settings.autobot_interval_ms()
    }

    pub fn view(&self, now: i64) -> RuntimeView {
        RuntimeView {
            next_run_at: self.next_autobot_run_at(now),
            server_side_autobot_active: self.autobot.enabled,
            ai_research_cache: self.research_cache.clone(),
            ai_refresh_meta: self.refresh_meta.clone(),
            market_scout: self.scout.clone(),
            state: self.clone(),
        }
    }
}

/// Snapshot as returned over HTTP.
///
/// Research cache, refresh meta and scout are also sent under the names the
/// browser client keeps them as locally.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeView {
    #[serde(flatten)]
    pub state: RuntimeState,
    pub next_run_at: i64,
    pub server_side_autobot_active: bool,
    pub ai_research_cache: ResearchCache,
    pub ai_refresh_meta: BTreeMap<String, RefreshMeta>,
    pub market_scout: ScoutState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = RuntimeState::new(1_000_000);
        assert_eq!(state.autobot.last_status, "Disabled");
        assert!(!state.autobot.enabled);
        assert!(state.scout.enabled);
        assert_eq!(state.scout.interval_mins, 2);
        assert_eq!(state.wallet.watchlist.len(), 8);
        assert_eq!(state.refresh_meta.len(), 8);
    }

    #[test]
    fn test_touch_is_strictly_increasing() {
        let mut state = RuntimeState::default();
        state.touch(100);
        assert_eq!(state.updated_at, 100);
        state.touch(50);
        assert_eq!(state.updated_at, 101);
    }

    #[test]
    fn test_scout_log_is_bounded() {
        let mut scout = ScoutState::default();
        for i in 0..50 {
            scout.log(format!("msg {}", i));
        }
        assert_eq!(scout.recent_messages.len(), MAX_SCOUT_MESSAGES);
        assert_eq!(scout.latest_message, "msg 49");
        assert_eq!(scout.recent_messages.front().map(String::as_str), Some("msg 49"));
    }

    #[test]
    fn test_scout_normalize_keeps_message_order() {
        let mut scout = ScoutState::default();
        scout.log("first");
        scout.log("second");
        scout.interval_mins = 500;
        scout.normalize(&[]);
        assert_eq!(scout.interval_mins, 120);
        let messages: Vec<&String> = scout.recent_messages.iter().collect();
        assert_eq!(messages, vec!["second", "first"]);
    }

    #[test]
    fn test_scout_normalize_prunes_unreachable_checks() {
        let mut scout = ScoutState::default();
        scout.hot_symbols = vec!["RKLB".to_string()];
        for symbol in ["AAPL", "RKLB", "ZZZ", "GONE"] {
            scout.checked_at_by_symbol.insert(symbol.to_string(), 10);
        }
        scout.normalize(&["ZZZ".to_string()]);
        let kept: Vec<&str> = scout.checked_at_by_symbol.keys().map(String::as_str).collect();
        assert_eq!(kept, vec!["AAPL", "RKLB", "ZZZ"]);
    }

    #[test]
    fn test_next_run_at() {
        let mut state = RuntimeState::new(1);
        assert_eq!(state.next_autobot_run_at(10), 0);
        state.autobot.enabled = true;
        assert_eq!(state.next_autobot_run_at(10), 10);
        state.autobot.last_run_at = 1_000;
        assert_eq!(state.next_autobot_run_at(10), 1_000 + 30 * 60_000);
    }
}
