//! Runtime configuration
//!
//! `RuntimeConfig` is the process configuration read once at startup.
//! `AiSettings` is the user-tunable part of the runtime state; it travels
//! with the persisted document and the client sync payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::amount::{clamp_round, f64_from_value};

pub const AI_PROVIDERS: &[&str] = &["openai"];
pub const AI_MODELS: &[&str] = &[
    "gpt-4.1-mini",
    "gpt-4o-mini",
    "gpt-5-mini",
    "gpt-5-mini-2025-08-07",
];

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Process configuration loaded from the environment
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub port: u16,
    pub state_path: PathBuf,
    pub log_level: String,
    pub tick_secs: u64,
    pub alpaca_key_id: String,
    pub alpaca_secret_key: String,
    pub alpaca_trading_url: String,
    pub alpaca_market_data_url: String,
    pub alpaca_feed: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub finnhub_api_key: String,
    pub order_poll_interval_ms: u64,
    pub order_poll_timeout_secs: u64,
    pub scout_hot_refresh_mins: u64,
    pub http_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            state_path: PathBuf::from("data/runtime-state.json"),
            log_level: "info".to_string(),
            tick_secs: 15,
            alpaca_key_id: String::new(),
            alpaca_secret_key: String::new(),
            alpaca_trading_url: "https://paper-api.alpaca.markets".to_string(),
            alpaca_market_data_url: "https://data.alpaca.markets".to_string(),
            alpaca_feed: "iex".to_string(),
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com".to_string(),
            finnhub_api_key: String::new(),
            order_poll_interval_ms: 1000,
            order_poll_timeout_secs: 20,
            scout_hot_refresh_mins: 60,
            http_timeout_secs: 30,
        }
    }
}

impl RuntimeConfig {
    /// Load from process environment (call `dotenvy::dotenv()` first)
    pub fn from_env() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        let mut cfg: RuntimeConfig = settings.try_deserialize()?;

        // Alpaca's own SDK variable names
        if cfg.alpaca_key_id.trim().is_empty() {
            cfg.alpaca_key_id = std::env::var("APCA_API_KEY_ID").unwrap_or_default();
        }
        if cfg.alpaca_secret_key.trim().is_empty() {
            cfg.alpaca_secret_key = std::env::var("APCA_API_SECRET_KEY").unwrap_or_default();
        }

        cfg.tick_secs = cfg.tick_secs.max(1);
        cfg.order_poll_interval_ms = cfg.order_poll_interval_ms.max(50);
        Ok(cfg)
    }

    pub fn broker_configured(&self) -> bool {
        !self.alpaca_key_id.trim().is_empty() && !self.alpaca_secret_key.trim().is_empty()
    }

    pub fn decision_configured(&self) -> bool {
        !self.openai_api_key.trim().is_empty()
    }

    pub fn profiles_configured(&self) -> bool {
        !self.finnhub_api_key.trim().is_empty()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }

    pub fn order_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.order_poll_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn hot_refresh_ms(&self) -> i64 {
        self.scout_hot_refresh_mins as i64 * 60_000
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Trading timeframe bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Horizon {
    Short,
    #[default]
    Swing,
    Long,
}

impl From<String> for Horizon {
    fn from(raw: String) -> Self {
        Horizon::parse(&raw).unwrap_or_default()
    }
}

impl Horizon {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "short" => Some(Horizon::Short),
            "swing" => Some(Horizon::Swing),
            "long" => Some(Horizon::Long),
            _ => None,
        }
    }

    /// Age after which cached research on this horizon is stale
    pub fn research_ttl_ms(&self) -> i64 {
        match self {
            Horizon::Short => 2 * HOUR_MS,
            Horizon::Swing => 8 * HOUR_MS,
            Horizon::Long => 24 * HOUR_MS,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Horizon::Short => write!(f, "short"),
            Horizon::Swing => write!(f, "swing"),
            Horizon::Long => write!(f, "long"),
        }
    }
}

/// User-tunable research and autobot settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct AiSettings {
    pub provider: String,
    pub model: String,
    pub horizon: Horizon,
    pub autobot_interval_mins: i64,
    pub max_trades_per_cycle: i64,
    pub ai_research_auto_refresh_enabled: bool,
    pub ai_research_auto_refresh_mins: i64,
    pub add_confidence_min: i64,
    pub add_sentiment_min: i64,
    pub sell_confidence_min: i64,
    pub sell_sentiment_max: i64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4.1-mini".to_string(),
            horizon: Horizon::Swing,
            autobot_interval_mins: 30,
            max_trades_per_cycle: 3,
            ai_research_auto_refresh_enabled: true,
            ai_research_auto_refresh_mins: 60,
            add_confidence_min: 80,
            add_sentiment_min: 45,
            sell_confidence_min: 60,
            sell_sentiment_max: -5,
        }
    }
}

impl From<Value> for AiSettings {
    fn from(raw: Value) -> Self {
        AiSettings::default().merged(&raw)
    }
}

impl AiSettings {
    /// Apply a (possibly partial) client payload on top of `self`.
    ///
    /// Fields absent from `raw` keep their current value; present fields
    /// are validated, clamped and rounded.
    pub fn merged(&self, raw: &Value) -> Self {
        let num = |key: &str| raw.get(key).and_then(f64_from_value);
        let pick = |key: &str, allowed: &[&str], current: &str| {
            raw.get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim())
                .filter(|s| allowed.contains(s))
                .unwrap_or(current)
                .to_string()
        };

        Self {
            provider: pick("provider", AI_PROVIDERS, &self.provider),
            model: pick("model", AI_MODELS, &self.model),
            horizon: raw
                .get("horizon")
                .and_then(Value::as_str)
                .and_then(Horizon::parse)
                .unwrap_or(self.horizon),
            autobot_interval_mins: clamp_round(
                num("autobotIntervalMins"),
                5,
                240,
                self.autobot_interval_mins,
            ),
            max_trades_per_cycle: clamp_round(
                num("maxTradesPerCycle"),
                1,
                5,
                self.max_trades_per_cycle,
            ),
            ai_research_auto_refresh_enabled: raw
                .get("aiResearchAutoRefreshEnabled")
                .and_then(Value::as_bool)
                .unwrap_or(self.ai_research_auto_refresh_enabled),
            ai_research_auto_refresh_mins: clamp_round(
                num("aiResearchAutoRefreshMins"),
                15,
                720,
                self.ai_research_auto_refresh_mins,
            ),
            add_confidence_min: clamp_round(
                num("addConfidenceMin"),
                50,
                95,
                self.add_confidence_min,
            ),
            add_sentiment_min: clamp_round(num("addSentimentMin"), 0, 90, self.add_sentiment_min),
            sell_confidence_min: clamp_round(
                num("sellConfidenceMin"),
                50,
                95,
                self.sell_confidence_min,
            ),
            sell_sentiment_max: clamp_round(
                num("sellSentimentMax"),
                -60,
                20,
                self.sell_sentiment_max,
            ),
        }
        .clamped()
    }

    /// Re-apply ranges to the current values
    pub fn clamped(mut self) -> Self {
        if !AI_PROVIDERS.contains(&self.provider.as_str()) {
            self.provider = AI_PROVIDERS[0].to_string();
        }
        if !AI_MODELS.contains(&self.model.as_str()) {
            self.model = AI_MODELS[0].to_string();
        }
        self.autobot_interval_mins = self.autobot_interval_mins.clamp(5, 240);
        self.max_trades_per_cycle = self.max_trades_per_cycle.clamp(1, 5);
        self.ai_research_auto_refresh_mins = self.ai_research_auto_refresh_mins.clamp(15, 720);
        self.add_confidence_min = self.add_confidence_min.clamp(50, 95);
        self.add_sentiment_min = self.add_sentiment_min.clamp(0, 90);
        self.sell_confidence_min = self.sell_confidence_min.clamp(50, 95);
        self.sell_sentiment_max = self.sell_sentiment_max.clamp(-60, 20);
        self
    }

    pub fn autobot_interval_ms(&self) -> i64 {
        self.autobot_interval_mins * 60_000
    }

    pub fn auto_refresh_interval_ms(&self) -> i64 {
        self.ai_research_auto_refresh_mins * 60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_clamp_and_round() {
        let settings: AiSettings = serde_json::from_value(json!({
            "model": "gpt-9-ultra",
            "horizon": "LONG",
            "autobotIntervalMins": 1,
            "maxTradesPerCycle": 4.6,
            "aiResearchAutoRefreshMins": "9000",
            "sellSentimentMax": -100
        }))
        .unwrap();

        assert_eq!(settings.model, "gpt-4.1-mini");
        assert_eq!(settings.horizon, Horizon::Long);
        assert_eq!(settings.autobot_interval_mins, 5);
        assert_eq!(settings.max_trades_per_cycle, 5);
        assert_eq!(settings.ai_research_auto_refresh_mins, 720);
        assert_eq!(settings.sell_sentiment_max, -60);
        assert_eq!(settings.add_confidence_min, 80);
    }

    #[test]
    fn test_partial_merge_keeps_current_values() {
        let mut current = AiSettings::default();
        current.max_trades_per_cycle = 5;
        let merged = current.merged(&json!({ "autobotIntervalMins": 45 }));
        assert_eq!(merged.autobot_interval_mins, 45);
        assert_eq!(merged.max_trades_per_cycle, 5);
    }

    #[test]
    fn test_unknown_horizon_falls_back_to_swing() {
        let h: Horizon = serde_json::from_value(json!("weekly")).unwrap();
        assert_eq!(h, Horizon::Swing);
        assert_eq!(Horizon::Short.research_ttl_ms(), 2 * 60 * 60 * 1000);
    }

    #[test]
    fn test_runtime_config_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.tick_secs, 15);
        assert!(!cfg.broker_configured());
        assert!(!cfg.decision_configured());
    }
}
