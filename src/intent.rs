//! In-flight trade intent tracking
//!
//! The broker's open-order list only shows an order once it has been
//! submitted. Two submissions for the same (symbol, side) racing through
//! the conflict check would both pass it, so every submission first
//! claims its pair here for as long as it is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::types::TradeSide;

/// Trade intent states
#[derive(Debug, Clone, PartialEq)]
pub enum TradeIntentState {
    Created,
    Submitted { order_id: String },
}

/// A submission currently in flight
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub id: uuid::Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub qty: u64,
    pub source: String,
    pub state: TradeIntentState,
    pub created_at: Instant,
}

type IntentKey = (String, TradeSide);

/// Intent registry keyed by (symbol, side)
pub struct IntentRegistry {
    intents: HashMap<IntentKey, TradeIntent>,
    max_age: Duration,
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
            // Anything older was abandoned by a crashed task
            max_age: Duration::from_secs(300),
        }
    }

    /// Claim (symbol, side); fails with a conflict while another claim is live
    pub fn create(&mut self, symbol: &str, side: TradeSide, qty: u64, source: &str) -> Result<TradeIntent> {
        self.cleanup();
        let key = (symbol.to_string(), side);
        if let Some(existing) = self.intents.get(&key) {
            debug!("Intent {} already in flight for {} {}", existing.id, side, symbol);
            return Err(RuntimeError::Conflict {
                symbol: symbol.to_string(),
                side,
                remaining: existing.qty,
            });
        }
        let intent = TradeIntent {
            id: uuid::Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            qty,
            source: source.to_string(),
            state: TradeIntentState::Created,
            created_at: Instant::now(),
        };
        self.intents.insert(key, intent.clone());
        debug!("Created trade intent: {} for {} {} {}", intent.id, side, qty, symbol);
        Ok(intent)
    }

    pub fn mark_submitted(&mut self, symbol: &str, side: TradeSide, order_id: &str) {
        if let Some(intent) = self.intents.get_mut(&(symbol.to_string(), side)) {
            intent.state = TradeIntentState::Submitted {
                order_id: order_id.to_string(),
            };
        }
    }

    pub fn finish(&mut self, symbol: &str, side: TradeSide) {
        self.intents.remove(&(symbol.to_string(), side));
    }

    pub fn get(&self, symbol: &str, side: TradeSide) -> Option<&TradeIntent> {
        self.intents.get(&(symbol.to_string(), side))
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Drop intents abandoned past `max_age`
    pub fn cleanup(&mut self) {
        let before = self.intents.len();
        let max_age = self.max_age;
        self.intents.retain(|_, intent| intent.created_at.elapsed() < max_age);
        let after = self.intents.len();
        if before != after {
            warn!("Dropped {} abandoned trade intents", before - after);
        }
    }
}

/// Releases its (symbol, side) claim when dropped
pub struct IntentGuard {
    registry: Arc<Mutex<IntentRegistry>>,
    symbol: String,
    side: TradeSide,
}

impl IntentGuard {
    pub fn acquire(
        registry: &Arc<Mutex<IntentRegistry>>,
        symbol: &str,
        side: TradeSide,
        qty: u64,
        source: &str,
    ) -> Result<Self> {
        registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .create(symbol, side, qty, source)?;
        Ok(Self {
            registry: Arc::clone(registry),
            symbol: symbol.to_string(),
            side,
        })
    }

    pub fn mark_submitted(&self, order_id: &str) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.mark_submitted(&self.symbol, self.side, order_id);
        }
    }
}

impl Drop for IntentGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.finish(&self.symbol, self.side);
        }
    }
}
