//! Wallet: cash, watchlist, positions and trade history

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::debug;

use crate::amount::round2;
use crate::types::{AccountSnapshot, BrokerOrder, Quote, TradeSide};

pub const MAX_WATCHLIST: usize = 20;
pub const MAX_TRANSACTIONS: usize = 100;
pub const MAX_OPEN_ORDERS: usize = 100;
pub const STARTING_CASH: i64 = 100_000;

/// Default watchlist with base prices in cents
const DEFAULT_STOCKS: &[(&str, i64)] = &[
    ("AAPL", 19235),
    ("MSFT", 42812),
    ("NVDA", 11890),
    ("AMZN", 17764),
    ("META", 48532),
    ("GOOGL", 16547),
    ("TSLA", 19324),
    ("AMD", 17365),
];

/// Uppercase and validate a ticker (`[A-Z0-9.-]{1,12}`)
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= 12
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');
    valid.then_some(symbol)
}

/// Placeholder quote for a symbol that has never been priced
pub fn base_quote(symbol: &str) -> Quote {
    let cents = DEFAULT_STOCKS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, c)| *c)
        .unwrap_or(10_000);
    let price = Decimal::new(cents, 2);
    Quote {
        price,
        last_close: price,
    }
}

/// Bounded newest-first buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Ring<T, const N: usize>(VecDeque<T>);

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Ring(VecDeque::new())
    }
}

impl<T, const N: usize> Ring<T, N> {
    /// Insert at the front, evicting the oldest entries past capacity
    pub fn push(&mut self, item: T) {
        self.0.push_front(item);
        self.0.truncate(N);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.0.front()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Serialize, const N: usize> Serialize for Ring<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de, T: DeserializeOwned, const N: usize> Deserialize<'de> for Ring<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Skip entries that no longer parse rather than failing the whole document
        let rows = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let items = rows
            .into_iter()
            .filter_map(|row| serde_json::from_value::<T>(row).ok())
            .take(N)
            .collect();
        Ok(Ring(items))
    }
}

/// Held position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub shares: u64,
    pub avg_cost: Decimal,
}

/// Historical fill record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub at: i64,
    pub side: TradeSide,
    pub symbol: String,
    pub shares: u64,
    pub price: Decimal,
    pub total: Decimal,
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub source: String,
}

impl Transaction {
    /// Build a record from a broker order; `None` when nothing filled.
    ///
    /// `prior_avg_cost` is the position's average cost before the trade
    /// and is only used to compute realized P&L on a sell.
    pub fn from_fill(
        order: &BrokerOrder,
        prior_avg_cost: Option<Decimal>,
        at: i64,
        source: &str,
    ) -> Option<Self> {
        let price = order.filled_avg_price.filter(|p| *p > Decimal::ZERO)?;
        if !order.status.is_accepted() || order.filled_qty == 0 {
            return None;
        }
        let shares = Decimal::from(order.filled_qty);
        let realized_pnl = match (order.side, prior_avg_cost) {
            (TradeSide::Sell, Some(cost)) if cost > Decimal::ZERO => {
                Some(round2((price - cost) * shares))
            }
            _ => None,
        };
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            at,
            side: order.side,
            symbol: order.symbol.clone(),
            shares: order.filled_qty,
            price: round2(price),
            total: round2(price * shares),
            realized_pnl,
            order_id: Some(order.id.clone()),
            source: source.to_string(),
        })
    }
}

/// Virtual trading wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Wallet {
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub selected_symbol: String,
    pub watchlist: Vec<String>,
    pub locked_symbols: Vec<String>,
    pub prices: BTreeMap<String, Quote>,
    pub positions: BTreeMap<String, Position>,
    pub transactions: Ring<Transaction, MAX_TRANSACTIONS>,
    pub open_orders: Vec<BrokerOrder>,
}

impl Default for Wallet {
    fn default() -> Self {
        let watchlist: Vec<String> = DEFAULT_STOCKS.iter().map(|(s, _)| s.to_string()).collect();
        let prices = watchlist
            .iter()
            .map(|s| (s.clone(), base_quote(s)))
            .collect();
        Self {
            cash: Decimal::from(STARTING_CASH),
            realized_pnl: Decimal::ZERO,
            selected_symbol: watchlist[0].clone(),
            watchlist,
            locked_symbols: Vec::new(),
            prices,
            positions: BTreeMap::new(),
            transactions: Ring::default(),
            open_orders: Vec::new(),
        }
    }
}

impl Wallet {
    /// Restore every wallet invariant. Idempotent.
    pub fn normalize(&mut self) {
        self.cash = round2(self.cash.max(Decimal::ZERO));
        self.realized_pnl = round2(self.realized_pnl);

        let positions: BTreeMap<String, Position> = std::mem::take(&mut self.positions)
            .into_iter()
            .filter_map(|(symbol, pos)| {
                let symbol = normalize_symbol(&symbol)?;
                (pos.shares > 0 && pos.avg_cost > Decimal::ZERO).then_some((symbol, pos))
            })
            .collect();

        let mut seen = HashSet::new();
        let mut watchlist: Vec<String> = self
            .watchlist
            .iter()
            .filter_map(|s| normalize_symbol(s))
            .filter(|s| seen.insert(s.clone()))
            .collect();
        for symbol in positions.keys() {
            if seen.insert(symbol.clone()) {
                watchlist.push(symbol.clone());
            }
        }

        let mut locked: Vec<String> = Vec::new();
        for symbol in self.locked_symbols.iter().filter_map(|s| normalize_symbol(s)) {
            if watchlist.contains(&symbol) && !locked.contains(&symbol) {
                locked.push(symbol);
            }
        }

        // Held symbols outrank locked ones, locked outrank the rest
        while watchlist.len() > MAX_WATCHLIST {
            let victim = watchlist
                .iter()
                .rposition(|s| !positions.contains_key(s) && !locked.contains(s))
                .or_else(|| watchlist.iter().rposition(|s| !positions.contains_key(s)))
                .unwrap_or(watchlist.len() - 1);
            watchlist.remove(victim);
        }
        locked.retain(|s| watchlist.contains(s));

        self.positions = positions
            .into_iter()
            .filter(|(s, _)| watchlist.contains(s))
            .collect();
        self.prices.retain(|s, _| watchlist.contains(s));
        for symbol in &watchlist {
            self.prices
                .entry(symbol.clone())
                .or_insert_with(|| base_quote(symbol));
        }
        self.selected_symbol = normalize_symbol(&self.selected_symbol)
            .filter(|s| watchlist.contains(s))
            .or_else(|| watchlist.first().cloned())
            .unwrap_or_default();
        self.watchlist = watchlist;
        self.locked_symbols = locked;

        self.open_orders.retain(|o| normalize_symbol(&o.symbol).is_some() && o.qty > 0);
        self.open_orders.truncate(MAX_OPEN_ORDERS);
    }

    /// Refill an empty watchlist with the default symbols
    pub fn seed_default_watchlist(&mut self) {
        if !self.watchlist.is_empty() {
            return;
        }
        self.watchlist = Wallet::default().watchlist;
        self.normalize();
    }

    pub fn shares_of(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).map(|p| p.shares).unwrap_or(0)
    }

    pub fn is_locked(&self, symbol: &str) -> bool {
        self.locked_symbols.iter().any(|s| s == symbol)
    }

    pub fn is_full(&self) -> bool {
        self.watchlist.len() >= MAX_WATCHLIST
    }

    /// Add a symbol if there is room; returns false if already present or full
    pub fn add_symbol(&mut self, symbol: &str, quote: Option<Quote>) -> bool {
        if self.watchlist.iter().any(|s| s == symbol) || self.is_full() {
            return false;
        }
        self.watchlist.push(symbol.to_string());
        self.prices
            .insert(symbol.to_string(), quote.unwrap_or_else(|| base_quote(symbol)));
        true
    }

    /// Remove a symbol that is neither held nor locked
    pub fn remove_symbol(&mut self, symbol: &str) -> bool {
        if self.shares_of(symbol) > 0 || self.is_locked(symbol) {
            return false;
        }
        let before = self.watchlist.len();
        self.watchlist.retain(|s| s != symbol);
        if self.watchlist.len() == before {
            return false;
        }
        self.prices.remove(symbol);
        if self.selected_symbol == symbol {
            self.selected_symbol = self.watchlist.first().cloned().unwrap_or_default();
        }
        true
    }

    /// Record fresh quotes for symbols already on the watchlist
    pub fn apply_quotes(&mut self, quotes: &BTreeMap<String, Quote>) {
        for (symbol, quote) in quotes {
            if let Some(slot) = self.prices.get_mut(symbol) {
                *slot = *quote;
            }
        }
    }

    /// Replace cash, positions and open orders with broker truth
    pub fn apply_account_snapshot(&mut self, snapshot: &AccountSnapshot) {
        self.cash = round2(snapshot.cash.max(Decimal::ZERO));
        self.positions = snapshot
            .positions
            .iter()
            .filter_map(|p| {
                let symbol = normalize_symbol(&p.symbol)?;
                let avg_cost = Some(p.avg_entry_price)
                    .filter(|c| *c > Decimal::ZERO)
                    .or_else(|| self.prices.get(&symbol).map(|q| q.price))
                    .map(round2)
                    .filter(|c| *c > Decimal::ZERO)?;
                (p.qty > 0).then_some((
                    symbol,
                    Position {
                        shares: p.qty,
                        avg_cost,
                    },
                ))
            })
            .collect();
        self.open_orders = snapshot
            .open_orders
            .iter()
            .take(MAX_OPEN_ORDERS)
            .cloned()
            .collect();
        self.normalize();
        debug!(
            "Applied broker snapshot: cash {}, {} positions, {} open orders",
            self.cash,
            self.positions.len(),
            self.open_orders.len()
        );
    }

    pub fn record_transaction(&mut self, tx: Transaction) {
        if let Some(pnl) = tx.realized_pnl {
            self.realized_pnl = round2(self.realized_pnl + pnl);
        }
        self.transactions.push(tx);
    }

    pub fn market_value(&self) -> Decimal {
        self.positions
            .iter()
            .map(|(symbol, pos)| {
                let price = self.prices.get(symbol).map(|q| q.price).unwrap_or(pos.avg_cost);
                price * Decimal::from(pos.shares)
            })
            .sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        let pnl: Decimal = self
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let price = self.prices.get(symbol).map(|q| q.price).unwrap_or(pos.avg_cost);
                (price - pos.avg_cost) * Decimal::from(pos.shares)
            })
            .sum();
        round2(pnl)
    }

    pub fn equity(&self) -> Decimal {
        round2(self.cash + self.market_value())
    }
}
