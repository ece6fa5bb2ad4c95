//! External collaborators
//!
//! The runtime only knows these traits; concrete clients live in the
//! submodules and mocks stand in for them in tests.

pub mod alpaca;
pub mod finnhub;
pub mod openai;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::types::{
    AccountSnapshot, BrokerAccount, BrokerOrder, BrokerPosition, CompanyProfile, DecisionPlan,
    HotList, MarketClock, PlanContext, Quote, ResearchContext, ResearchProfile, TradeSide,
};

pub use alpaca::AlpacaClient;
pub use finnhub::FinnhubClient;
pub use openai::OpenAiClient;

/// Brokerage and market data
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest price and previous close; symbols without a usable price are omitted
    async fn get_quotes(&self, symbols: &[String]) -> Result<BTreeMap<String, Quote>>;

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrder>>;

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        qty: u64,
    ) -> Result<BrokerOrder>;

    async fn get_order(&self, id: &str) -> Result<BrokerOrder>;

    async fn get_account(&self) -> Result<BrokerAccount>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn get_clock(&self) -> Result<MarketClock>;

    /// Symbols of active, tradable assets
    async fn get_tradable_assets(&self) -> Result<HashSet<String>>;
}

/// Pull cash, positions and open orders from the broker
pub async fn account_snapshot(broker: &dyn MarketDataProvider) -> Result<AccountSnapshot> {
    let (account, positions, open_orders) = tokio::try_join!(
        broker.get_account(),
        broker.get_positions(),
        broker.get_open_orders()
    )?;
    Ok(AccountSnapshot {
        cash: account.cash,
        positions,
        open_orders,
    })
}

/// Company reference data (name, industry, ...)
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn get_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>>;
}

/// Language-model research and planning
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn generate_research(&self, context: &ResearchContext) -> Result<ResearchProfile>;

    async fn generate_plan(&self, context: &PlanContext, max_actions: usize)
        -> Result<DecisionPlan>;

    /// Currently notable symbols, using live search where available
    async fn discover_hot_symbols(&self, model: &str, exclude: &[String]) -> Result<HotList>;
}
