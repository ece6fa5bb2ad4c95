//! Trade Execution Pipeline
//!
//! conflict check -> market order -> poll to terminal -> fill record ->
//! wholesale account reload. The broker is the source of truth for cash
//! and positions; the transaction record is history only.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::{Result, RuntimeError};
use crate::intent::{IntentGuard, IntentRegistry};
use crate::portfolio::{normalize_symbol, Transaction};
use crate::providers::{account_snapshot, MarketDataProvider};
use crate::runtime::{now_ms, Runtime};
use crate::types::{AccountSnapshot, BrokerOrder, TradeSide};

/// Who asked for the trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSource {
    Manual,
    Autobot,
}

impl TradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSource::Manual => "manual",
            TradeSource::Autobot => "autobot",
        }
    }
}

/// Result of one pipeline run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOutcome {
    pub order: BrokerOrder,
    pub transaction: Option<Transaction>,
    /// `None` if the post-trade account reload failed
    pub snapshot: Option<AccountSnapshot>,
}

pub struct TradeExecutor {
    intents: Arc<Mutex<IntentRegistry>>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl TradeExecutor {
    pub fn new(poll_interval: Duration, poll_timeout: Duration) -> Self {
        Self {
            intents: Arc::new(Mutex::new(IntentRegistry::new())),
            poll_interval,
            poll_timeout,
        }
    }

    /// Run the full pipeline for a whole-share market order
    pub async fn execute(
        &self,
        rt: &Runtime,
        symbol: &str,
        side: TradeSide,
        qty: u64,
        source: TradeSource,
    ) -> Result<TradeOutcome> {
        let symbol = normalize_symbol(symbol)
            .ok_or_else(|| RuntimeError::InvalidRequest(format!("invalid symbol '{}'", symbol)))?;
        if qty == 0 {
            return Err(RuntimeError::InvalidRequest(
                "quantity must be a positive whole number".to_string(),
            ));
        }
        let broker = rt.broker()?;
        let intent = IntentGuard::acquire(&self.intents, &symbol, side, qty, source.as_str())?;

        // 1. Existing open order for the same pair blocks submission
        let open_orders = broker.get_open_orders().await?;
        if let Some(existing) = open_orders
            .iter()
            .find(|o| o.symbol == symbol && o.side == side && !o.status.is_terminal())
        {
            warn!(
                "Rejecting {} {} {}: order {} still {}",
                side, qty, symbol, existing.id, existing.status
            );
            return Err(RuntimeError::Conflict {
                symbol,
                side,
                remaining: existing.remaining_qty(),
            });
        }

        let key = symbol.clone();
        let prior_avg_cost = rt
            .state
            .read(move |s| s.wallet.positions.get(&key).map(|p| p.avg_cost))
            .await?;

        // 2. Submit
        let submitted = broker.submit_market_order(&symbol, side, qty).await?;
        intent.mark_submitted(&submitted.id);

        // 3. Poll
        let order = self.poll_until_terminal(broker.as_ref(), submitted).await;

        // 4. Fill record
        let transaction = Transaction::from_fill(&order, prior_avg_cost, now_ms(), source.as_str());

        // 5. Reload account truth
        let snapshot = match account_snapshot(broker.as_ref()).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Account reload after order {} failed: {}", order.id, e);
                None
            }
        };

        let tx = transaction.clone();
        let snap = snapshot.clone();
        rt.state
            .mutate(move |s| {
                if let Some(tx) = tx {
                    s.wallet.record_transaction(tx);
                }
                if let Some(snap) = snap {
                    s.wallet.apply_account_snapshot(&snap);
                }
            })
            .await?;

        info!(
            "{} {} {} {} -> {} (filled {}/{})",
            source.as_str(),
            side,
            qty,
            symbol,
            order.status,
            order.filled_qty,
            order.qty
        );

        Ok(TradeOutcome {
            order,
            transaction,
            snapshot,
        })
    }

    /// Poll at a fixed cadence until terminal or timeout; returns the last status seen
    async fn poll_until_terminal(
        &self,
        broker: &dyn MarketDataProvider,
        order: BrokerOrder,
    ) -> BrokerOrder {
        let deadline = Instant::now() + self.poll_timeout;
        let mut last = order;
        while !last.status.is_terminal() && Instant::now() < deadline {
            sleep(self.poll_interval).await;
            match broker.get_order(&last.id).await {
                Ok(order) => last = order,
                Err(e) => warn!("Polling order {} failed: {}", last.id, e),
            }
        }
        if !last.status.is_terminal() {
            warn!(
                "Order {} not terminal after {:?}, last status {}",
                last.id, self.poll_timeout, last.status
            );
        }
        last
    }
}
