//! Core types for the provider contracts
//!
//! These types define what the runtime expects from the brokerage,
//! company-profile and decision providers. Anything coming back from a
//! provider is normalized here before the rest of the crate sees it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::amount::{clamp_round, f64_from_value, truncate_text};
use crate::config::Horizon;
use crate::portfolio::normalize_symbol;

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Lenient parse of client/provider side strings
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// Latest price and previous close for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub price: Decimal,
    pub last_close: Decimal,
}

impl Quote {
    pub fn day_change_pct(&self) -> f64 {
        crate::amount::day_change_pct(self.price, self.last_close).unwrap_or(0.0)
    }
}

/// Brokerage order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum OrderStatus {
    New,
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    DoneForDay,
    Canceled,
    Expired,
    Replaced,
    PendingCancel,
    PendingReplace,
    Stopped,
    Rejected,
    Suspended,
    Calculated,
    Unknown,
}

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => OrderStatus::New,
            "pending_new" => OrderStatus::PendingNew,
            "accepted" | "accepted_for_bidding" => OrderStatus::Accepted,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "done_for_day" | "done" => OrderStatus::DoneForDay,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            "replaced" => OrderStatus::Replaced,
            "pending_cancel" => OrderStatus::PendingCancel,
            "pending_replace" => OrderStatus::PendingReplace,
            "stopped" => OrderStatus::Stopped,
            "rejected" => OrderStatus::Rejected,
            "suspended" => OrderStatus::Suspended,
            "calculated" => OrderStatus::Calculated,
            _ => OrderStatus::Unknown,
        }
    }
}

impl OrderStatus {
    /// No further fills can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::Suspended
                | OrderStatus::DoneForDay
        )
    }

    /// The broker took the order, whatever happened after
    pub fn is_accepted(&self) -> bool {
        !matches!(self, OrderStatus::Rejected | OrderStatus::Unknown)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::New => "new",
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::DoneForDay => "done_for_day",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Replaced => "replaced",
            OrderStatus::PendingCancel => "pending_cancel",
            OrderStatus::PendingReplace => "pending_replace",
            OrderStatus::Stopped => "stopped",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Suspended => "suspended",
            OrderStatus::Calculated => "calculated",
            OrderStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Brokerage order, whole shares only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub qty: u64,
    #[serde(default)]
    pub filled_qty: u64,
    #[serde(default)]
    pub filled_avg_price: Option<Decimal>,
    pub status: OrderStatus,
    #[serde(default)]
    pub submitted_at: String,
}

impl BrokerOrder {
    pub fn remaining_qty(&self) -> u64 {
        self.qty.saturating_sub(self.filled_qty)
    }
}

/// Position as reported by the brokerage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: u64,
    pub avg_entry_price: Decimal,
}

/// Account summary as reported by the brokerage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAccount {
    pub cash: Decimal,
    pub equity: Option<Decimal>,
    pub buying_power: Option<Decimal>,
}

/// Full account truth pulled after every trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub cash: Decimal,
    pub positions: Vec<BrokerPosition>,
    pub open_orders: Vec<BrokerOrder>,
}

/// Market clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open: Option<String>,
}

/// Company reference data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanyProfile {
    pub symbol: String,
    pub name: String,
    pub industry: String,
    pub exchange: String,
    pub country: String,
    pub web_url: String,
    pub market_cap: Option<f64>,
}

/// Research stance on a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", from = "String")]
pub enum ResearchAction {
    Buy,
    Hold,
    Sell,
}

impl From<String> for ResearchAction {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => ResearchAction::Buy,
            "SELL" => ResearchAction::Sell,
            _ => ResearchAction::Hold,
        }
    }
}

/// Provider-scored research on one symbol
///
/// Deserialization goes through [`ResearchProfile::from_value`], so a
/// persisted or provider-supplied profile is always clamped into range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct ResearchProfile {
    pub sentiment: i64,
    pub confidence: i64,
    pub action: ResearchAction,
    pub buy_cash_pct: f64,
    pub trim_position_pct: f64,
    pub thesis: String,
    pub catalyst: String,
    pub risk: String,
    pub brief: String,
}

impl Default for ResearchProfile {
    fn default() -> Self {
        Self::from_value(&Value::Null)
    }
}

impl From<Value> for ResearchProfile {
    fn from(raw: Value) -> Self {
        Self::from_value(&raw)
    }
}

impl ResearchProfile {
    pub fn from_value(raw: &Value) -> Self {
        let num = |key: &str, alt: &str| {
            raw.get(key)
                .or_else(|| raw.get(alt))
                .and_then(f64_from_value)
        };
        let text = |key: &str| raw.get(key).and_then(Value::as_str).unwrap_or("").to_string();
        let action = raw
            .get("action")
            .and_then(Value::as_str)
            .map(|s| ResearchAction::from(s.to_string()))
            .unwrap_or(ResearchAction::Hold);

        let thesis = truncate_text(&text("thesis"), 600);

        Self {
            sentiment: clamp_round(num("sentiment", "sentimentScore"), -100, 100, 0),
            confidence: clamp_round(num("confidence", "confidenceScore"), 0, 100, 50),
            action,
            buy_cash_pct: clamp_pct(num("buyCashPct", "buy_cash_pct"), 0.01, 0.5, 0.08),
            trim_position_pct: clamp_pct(num("trimPositionPct", "trim_position_pct"), 0.05, 1.0, 0.25),
            thesis: if thesis.is_empty() {
                "No thesis provided.".to_string()
            } else {
                thesis
            },
            catalyst: truncate_text(&text("catalyst"), 420),
            risk: truncate_text(&text("risk"), 420),
            brief: truncate_text(&text("brief"), 1800),
        }
    }
}

fn clamp_pct(raw: Option<f64>, min: f64, max: f64, fallback: f64) -> f64 {
    match raw {
        Some(v) if v.is_finite() => {
            // Providers sometimes answer in whole percent
            let v = if v > 1.0 { v / 100.0 } else { v };
            (v.clamp(min, max) * 10_000.0).round() / 10_000.0
        }
        _ => fallback,
    }
}

/// One action of a decision plan
///
/// Closed variant: anything the provider returns that is not a clear BUY
/// or SELL becomes `Hold` with an explanatory reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum ProposedAction {
    Buy {
        symbol: Option<String>,
        shares: u64,
        reason: String,
    },
    Sell {
        symbol: Option<String>,
        shares: u64,
        reason: String,
    },
    Hold {
        #[serde(default)]
        symbol: Option<String>,
        reason: String,
    },
}

impl ProposedAction {
    pub fn hold(symbol: Option<String>, reason: impl Into<String>) -> Self {
        ProposedAction::Hold {
            symbol,
            reason: truncate_text(&reason.into(), 320),
        }
    }

    pub fn from_value(raw: &Value) -> Self {
        if !raw.is_object() {
            return Self::hold(None, "Unrecognized action from decision provider.");
        }
        let kind = ["action", "type", "side"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .unwrap_or("")
            .trim()
            .to_ascii_uppercase();
        let symbol = ["symbol", "ticker"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .and_then(normalize_symbol);
        let shares = ["shares", "qty", "quantity"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(f64_from_value))
            .filter(|v| *v > 0.0)
            .map(|v| v.floor() as u64)
            .unwrap_or(0);
        let reason = ["reason", "rationale", "why"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .map(|s| truncate_text(s, 320))
            .unwrap_or_default();

        match kind.as_str() {
            "BUY" | "ADD" => ProposedAction::Buy { symbol, shares, reason },
            "SELL" | "TRIM" | "EXIT" => ProposedAction::Sell { symbol, shares, reason },
            "HOLD" | "WAIT" | "WATCH" => Self::hold(
                symbol,
                if reason.is_empty() { "Holding.".to_string() } else { reason },
            ),
            other => Self::hold(symbol, format!("Unrecognized action '{}'; holding.", other)),
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            ProposedAction::Buy { symbol, .. }
            | ProposedAction::Sell { symbol, .. }
            | ProposedAction::Hold { symbol, .. } => symbol.as_deref(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ProposedAction::Buy { reason, .. }
            | ProposedAction::Sell { reason, .. }
            | ProposedAction::Hold { reason, .. } => reason,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, ProposedAction::Hold { .. })
    }

    /// One-line summary for status fields
    pub fn summary(&self) -> String {
        let line = match self {
            ProposedAction::Buy { symbol, shares, reason } => format!(
                "BUY {} {}: {}",
                shares,
                symbol.as_deref().unwrap_or("?"),
                reason
            ),
            ProposedAction::Sell { symbol, shares, reason } => format!(
                "SELL {} {}: {}",
                shares,
                symbol.as_deref().unwrap_or("?"),
                reason
            ),
            ProposedAction::Hold { reason, .. } => format!("HOLD: {}", reason),
        };
        truncate_text(&line, 320)
    }
}

/// Ordered action plan returned by the decision provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionPlan {
    pub thought: String,
    pub actions: Vec<ProposedAction>,
}

impl DecisionPlan {
    pub fn from_value(raw: &Value, max_actions: usize) -> Self {
        let thought = ["thought", "summary", "reasoning"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .map(|s| truncate_text(s, 900))
            .unwrap_or_default();
        let actions = ["actions", "trades", "plan"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_array))
            .map(|rows| {
                rows.iter()
                    .take(max_actions)
                    .map(ProposedAction::from_value)
                    .collect()
            })
            .unwrap_or_default();
        Self { thought, actions }
    }
}

/// Per-symbol row of the decision context
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolContext {
    pub symbol: String,
    pub price: Decimal,
    pub last_close: Decimal,
    pub day_change_pct: f64,
    pub held_shares: u64,
    pub avg_cost: Option<Decimal>,
    pub locked: bool,
    pub signal: String,
    pub research: Option<ResearchProfile>,
}

/// Portfolio context sent to the decision provider
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanContext {
    pub generated_at: i64,
    pub model: String,
    pub horizon: Horizon,
    pub max_trades: u32,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub symbols: Vec<SymbolContext>,
}

/// Context for a single-symbol research request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchContext {
    pub symbol: String,
    pub model: String,
    pub horizon: Horizon,
    pub quote: Option<Quote>,
    pub company: Option<CompanyProfile>,
    pub held_shares: u64,
}

/// Notable symbols from a live-search discovery call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotList {
    pub symbols: Vec<String>,
    pub summary: String,
}
