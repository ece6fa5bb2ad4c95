//! Tick scheduler - the runtime's background loop

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::autobot::{self, Trigger};
use crate::research;
use crate::runtime::{now_ms, Runtime};
use crate::scout;

/// Fires every tick and runs whatever is due
pub struct TickScheduler {
    rt: Arc<Runtime>,
    tick: Duration,
}

impl TickScheduler {
    pub fn new(rt: Arc<Runtime>) -> Self {
        let tick = rt.config.tick_interval();
        Self { rt, tick }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Tick scheduler starting ({:?} interval)", self.tick);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Tick scheduler stopped");
    }

    /// One firing: scout, then autobot, then at most one research refresh
    pub async fn tick_once(&self) {
        let now = now_ms();
        let (scout_due, autobot_due) = match self
            .rt
            .state
            .read(move |s| (s.scout.is_due(now), s.autobot_due(now)))
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("Tick skipped: {}", e);
                return;
            }
        };

        if scout_due {
            match scout::run_cycle(&self.rt).await {
                Ok(Some(message)) => debug!("Scout: {}", message),
                Ok(None) => {}
                Err(e) => error!("Scout cycle error: {}", e),
            }
        }

        if autobot_due {
            let outcome = autobot::run_cycle(&self.rt, Trigger::Scheduled).await;
            if outcome.ran {
                info!("Autobot: {}", outcome.status);
            } else {
                debug!("Autobot did not run: {:?}", outcome.reason);
            }
        }

        match research::auto_refresh_once(&self.rt).await {
            Ok(Some(symbol)) => debug!("Auto-refreshed research for {}", symbol),
            Ok(None) => {}
            Err(e) => warn!("Research auto-refresh failed: {}", e),
        }
    }
}
