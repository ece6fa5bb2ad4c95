//! Alpaca brokerage and market-data client

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::MarketDataProvider;
use crate::amount::{decimal_from_value, round2, whole_shares};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::portfolio::normalize_symbol;
use crate::types::{
    BrokerAccount, BrokerOrder, BrokerPosition, MarketClock, OrderStatus, Quote, TradeSide,
};

/// Alpaca REST client (trading + market data)
pub struct AlpacaClient {
    client: Client,
    trading_url: String,
    data_url: String,
    feed: String,
    key_id: String,
    secret_key: String,
}

impl AlpacaClient {
    pub fn new(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.http_timeout()).build()?;

        info!(
            "Alpaca client initialized: trading={}, data={}, feed={}",
            config.alpaca_trading_url, config.alpaca_market_data_url, config.alpaca_feed
        );

        Ok(Self {
            client,
            trading_url: config.alpaca_trading_url.trim_end_matches('/').to_string(),
            data_url: config.alpaca_market_data_url.trim_end_matches('/').to_string(),
            feed: config.alpaca_feed.trim().to_ascii_lowercase(),
            key_id: config.alpaca_key_id.trim().to_string(),
            secret_key: config.alpaca_secret_key.trim().to_string(),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .header("Accept", "application/json")
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Value> {
        let response = self.authed(req).send().await.map_err(|e| {
            if e.is_timeout() {
                RuntimeError::Provider(format!("Alpaca {} timed out", what))
            } else if e.is_connect() {
                RuntimeError::Provider(format!("Failed to connect to Alpaca for {}: {}", what, e))
            } else {
                RuntimeError::Provider(format!("Alpaca {} failed: {}", what, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(180).collect();
            return Err(RuntimeError::Provider(format!(
                "Alpaca {} failed ({}): {}",
                what, status, body
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RuntimeError::MalformedResponse(format!("Alpaca {}: {}", what, e)))
    }
}

#[async_trait]
impl MarketDataProvider for AlpacaClient {
    async fn get_quotes(&self, symbols: &[String]) -> Result<BTreeMap<String, Quote>> {
        if symbols.is_empty() {
            return Ok(BTreeMap::new());
        }
        let url = format!("{}/v2/stocks/snapshots", self.data_url);
        let req = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.join(",")), ("feed", self.feed.clone())]);
        let payload = self.send(req, "snapshots").await?;
        let quotes = normalize_snapshots(&payload, symbols);
        debug!("Alpaca quotes: {}/{} symbols priced", quotes.len(), symbols.len());
        Ok(quotes)
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>> {
        let url = format!("{}/v2/orders", self.trading_url);
        let req = self
            .client
            .get(&url)
            .query(&[("status", "open"), ("limit", "100")]);
        let payload = self.send(req, "open orders").await?;
        let rows = payload.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(|row| parse_order(row).ok()).collect())
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        qty: u64,
    ) -> Result<BrokerOrder> {
        let url = format!("{}/v2/orders", self.trading_url);
        let body = json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": side.to_string(),
            "type": "market",
            "time_in_force": "day",
        });
        let payload = self.send(self.client.post(&url).json(&body), "order submit").await?;
        let order = parse_order(&payload)?;
        info!(
            "Alpaca accepted {} {} {} (order {}, {})",
            side, qty, symbol, order.id, order.status
        );
        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<BrokerOrder> {
        let url = format!("{}/v2/orders/{}", self.trading_url, id);
        let payload = self.send(self.client.get(&url), "order status").await?;
        parse_order(&payload)
    }

    async fn get_account(&self) -> Result<BrokerAccount> {
        let url = format!("{}/v2/account", self.trading_url);
        let payload = self.send(self.client.get(&url), "account").await?;
        let cash = payload
            .get("cash")
            .and_then(decimal_from_value)
            .ok_or_else(|| RuntimeError::MalformedResponse("account has no cash".to_string()))?;
        Ok(BrokerAccount {
            cash: round2(cash),
            equity: payload.get("equity").and_then(decimal_from_value),
            buying_power: payload.get("buying_power").and_then(decimal_from_value),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!("{}/v2/positions", self.trading_url);
        let payload = self.send(self.client.get(&url), "positions").await?;
        let rows = payload.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let symbol = row.get("symbol").and_then(Value::as_str).and_then(normalize_symbol)?;
                let qty = whole_shares(row.get("qty").and_then(decimal_from_value)?);
                let positive = |key: &str| {
                    row.get(key)
                        .and_then(decimal_from_value)
                        .filter(|p| *p > Decimal::ZERO)
                };
                let avg_entry_price = positive("avg_entry_price")
                    .or_else(|| positive("current_price"))
                    .unwrap_or(Decimal::ZERO);
                (qty > 0).then_some(BrokerPosition {
                    symbol,
                    qty,
                    avg_entry_price,
                })
            })
            .collect())
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        let url = format!("{}/v2/clock", self.trading_url);
        let payload = self.send(self.client.get(&url), "clock").await?;
        let is_open = payload
            .get("is_open")
            .and_then(Value::as_bool)
            .ok_or_else(|| RuntimeError::MalformedResponse("clock has no is_open".to_string()))?;
        Ok(MarketClock {
            is_open,
            next_open: payload
                .get("next_open")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn get_tradable_assets(&self) -> Result<HashSet<String>> {
        let url = format!("{}/v2/assets", self.trading_url);
        let req = self
            .client
            .get(&url)
            .query(&[("status", "active"), ("asset_class", "us_equity")]);
        let payload = self.send(req, "assets").await?;
        let assets: HashSet<String> = payload
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.get("tradable").and_then(Value::as_bool).unwrap_or(false))
                    .filter_map(|row| row.get("symbol").and_then(Value::as_str))
                    .filter_map(normalize_symbol)
                    .collect()
            })
            .unwrap_or_default();
        if assets.is_empty() {
            warn!("Alpaca asset directory came back empty");
        }
        Ok(assets)
    }
}

/// Quotes from a `/v2/stocks/snapshots` payload.
///
/// price: latest trade, else minute bar close, else daily bar close.
/// lastClose: previous daily close, else daily open, else price.
pub fn normalize_snapshots(payload: &Value, symbols: &[String]) -> BTreeMap<String, Quote> {
    let map = payload.get("snapshots").unwrap_or(payload);
    let field = |snap: &Value, names: &[&str], key: &str| {
        names
            .iter()
            .find_map(|n| snap.get(*n))
            .and_then(|bar| bar.get(key))
            .and_then(decimal_from_value)
            .filter(|v| *v > Decimal::ZERO)
    };

    symbols
        .iter()
        .filter_map(|symbol| {
            let snap = map.get(symbol.as_str()).filter(|s| s.is_object())?;
            let price = field(snap, &["latestTrade", "latest_trade"], "p")
                .or_else(|| field(snap, &["minuteBar", "minute_bar"], "c"))
                .or_else(|| field(snap, &["dailyBar", "daily_bar"], "c"))?;
            let last_close = field(
                snap,
                &["prevDailyBar", "previousDailyBar", "prev_daily_bar"],
                "c",
            )
            .or_else(|| field(snap, &["dailyBar", "daily_bar"], "o"))
            .unwrap_or(price);
            Some((
                symbol.clone(),
                Quote {
                    price: round2(price),
                    last_close: round2(last_close),
                },
            ))
        })
        .collect()
}

/// Parse an Alpaca order object
pub fn parse_order(raw: &Value) -> Result<BrokerOrder> {
    let text = |key: &str| raw.get(key).and_then(Value::as_str).unwrap_or("").trim().to_string();
    let id = text("id");
    let symbol = normalize_symbol(&text("symbol"));
    let side = TradeSide::parse(&text("side"));
    let qty = raw.get("qty").and_then(decimal_from_value).map(whole_shares).unwrap_or(0);

    let (Some(symbol), Some(side)) = (symbol, side) else {
        return Err(RuntimeError::MalformedResponse(format!(
            "order {} is missing symbol or side",
            id
        )));
    };
    if id.is_empty() {
        return Err(RuntimeError::MalformedResponse("order has no id".to_string()));
    }

    Ok(BrokerOrder {
        id,
        symbol,
        side,
        qty,
        filled_qty: raw
            .get("filled_qty")
            .and_then(decimal_from_value)
            .map(whole_shares)
            .unwrap_or(0),
        filled_avg_price: raw
            .get("filled_avg_price")
            .and_then(decimal_from_value)
            .filter(|p| *p > rust_decimal::Decimal::ZERO),
        status: OrderStatus::from(text("status")),
        submitted_at: text("submitted_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_snapshot_fallbacks() {
        let payload = json!({
            "AAPL": {
                "latestTrade": {"p": 190.456},
                "prevDailyBar": {"c": 188.0}
            },
            "MSFT": {
                "minuteBar": {"c": 410.0},
                "dailyBar": {"o": 405.0, "c": 409.0}
            },
            "NVDA": {
                "dailyBar": {"c": 120.0}
            },
            "XYZ": {}
        });
        let symbols: Vec<String> = ["AAPL", "MSFT", "NVDA", "XYZ", "GONE"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let quotes = normalize_snapshots(&payload, &symbols);

        assert_eq!(quotes.len(), 3);
        assert_eq!(quotes["AAPL"].price, Decimal::new(19046, 2));
        assert_eq!(quotes["AAPL"].last_close, Decimal::from(188));
        assert_eq!(quotes["MSFT"].price, Decimal::from(410));
        assert_eq!(quotes["MSFT"].last_close, Decimal::from(405));
        assert_eq!(quotes["NVDA"].last_close, Decimal::from(120));
    }

    #[test]
    fn test_parse_order_strings() {
        let order = parse_order(&json!({
            "id": "abc",
            "symbol": "aapl",
            "side": "sell",
            "qty": "10",
            "filled_qty": "4",
            "filled_avg_price": "101.5",
            "status": "partially_filled",
            "submitted_at": "2025-01-02T15:00:00Z"
        }))
        .unwrap();
        assert_eq!(order.symbol, "AAPL");
        assert_eq!(order.side, TradeSide::Sell);
        assert_eq!(order.remaining_qty(), 6);
        assert_eq!(order.filled_avg_price, Some(Decimal::new(1015, 1)));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        assert!(parse_order(&json!({"id": "x", "symbol": "AAPL"})).is_err());
    }
}
