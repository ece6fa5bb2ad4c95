//! Runtime: the dependency container shared by the scheduler and handlers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::executor::TradeExecutor;
use crate::providers::{DecisionProvider, MarketDataProvider, ProfileProvider};
use crate::state::RuntimeView;
use crate::store::StateHandle;

/// Wall-clock epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Non-queuing mutual exclusion flag
#[derive(Debug, Default)]
pub struct BusyFlag(AtomicBool);

impl BusyFlag {
    /// `None` if already held
    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.0))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything a cycle or handler needs
pub struct Runtime {
    pub config: RuntimeConfig,
    pub state: StateHandle,
    pub executor: TradeExecutor,
    broker: Option<Arc<dyn MarketDataProvider>>,
    decision: Option<Arc<dyn DecisionProvider>>,
    profiles: Option<Arc<dyn ProfileProvider>>,
    pub autobot_busy: BusyFlag,
    pub scout_busy: BusyFlag,
    pub refresh_busy: BusyFlag,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, state: StateHandle) -> Self {
        let executor = TradeExecutor::new(config.order_poll_interval(), config.order_poll_timeout());
        Self {
            config,
            state,
            executor,
            broker: None,
            decision: None,
            profiles: None,
            autobot_busy: BusyFlag::default(),
            scout_busy: BusyFlag::default(),
            refresh_busy: BusyFlag::default(),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn MarketDataProvider>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_decision(mut self, decision: Arc<dyn DecisionProvider>) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileProvider>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn broker(&self) -> Result<Arc<dyn MarketDataProvider>> {
        self.broker
            .clone()
            .ok_or(RuntimeError::ProviderUnavailable("Brokerage"))
    }

    pub fn decision(&self) -> Result<Arc<dyn DecisionProvider>> {
        self.decision
            .clone()
            .ok_or(RuntimeError::ProviderUnavailable("Decision provider"))
    }

    pub fn profiles(&self) -> Option<Arc<dyn ProfileProvider>> {
        self.profiles.clone()
    }

    pub fn broker_configured(&self) -> bool {
        self.broker.is_some()
    }

    pub fn decision_configured(&self) -> bool {
        self.decision.is_some()
    }

    pub fn profiles_configured(&self) -> bool {
        self.profiles.is_some()
    }

    /// Current snapshot with scheduling extras
    pub async fn view(&self) -> Result<RuntimeView> {
        let now = now_ms();
        self.state.read(move |s| s.view(now)).await
    }
}
