//! Client reconciliation
//!
//! Settings and the enabled toggles always come from the client. Wallet,
//! research cache and refresh meta are taken only from a client whose
//! `clientRuntimeUpdatedAt` is at least the server's `updatedAt`, so a
//! stale client cannot overwrite trades the server made on its own.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::amount::{clamp_round, f64_from_value};
use crate::error::Result;
use crate::portfolio::{normalize_symbol, Wallet};
use crate::research::{RefreshMeta, ResearchCache};
use crate::runtime::{now_ms, Runtime};
use crate::state::{RuntimeState, RuntimeView};
use crate::store::Persist;

/// Push payload from the client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncRequest {
    pub client_heartbeat_at: Option<Value>,
    pub client_runtime_updated_at: Option<Value>,
    pub ai_settings: Option<Value>,
    pub wallet: Option<Value>,
    #[serde(alias = "aiResearchCache")]
    pub research_cache: Option<Value>,
    #[serde(alias = "aiRefreshMeta")]
    pub refresh_meta: Option<Value>,
    #[serde(alias = "marketScout")]
    pub scout: Option<Value>,
    pub autobot: Option<Value>,
}

/// Validated payload, ready to merge
#[derive(Debug, Clone, Default)]
pub struct SyncPayload {
    pub client_updated_at: i64,
    pub ai_settings: Option<Value>,
    pub autobot_enabled: Option<bool>,
    pub scout_enabled: Option<bool>,
    pub scout_interval_mins: Option<f64>,
    pub wallet: Option<Wallet>,
    pub research_cache: Option<ResearchCache>,
    pub refresh_meta: Option<BTreeMap<String, RefreshMeta>>,
}

/// Parse one optional data section; a malformed section is dropped
fn parse_section<T: serde::de::DeserializeOwned>(section: Option<Value>, name: &str) -> Option<T> {
    let raw = section.filter(|v| !v.is_null())?;
    match serde_json::from_value(raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Ignoring malformed {} in client sync: {}", name, e);
            None
        }
    }
}

impl SyncPayload {
    pub fn from_request(request: SyncRequest) -> Self {
        let wallet = parse_section::<Wallet>(request.wallet, "wallet");
        let research_cache = parse_section::<ResearchCache>(request.research_cache, "researchCache");
        let refresh_meta = match request.refresh_meta.filter(|v| !v.is_null()) {
            None => None,
            Some(Value::Object(rows)) => Some(
                rows.into_iter()
                    .filter_map(|(symbol, row)| {
                        let symbol = normalize_symbol(&symbol)?;
                        let meta = serde_json::from_value::<RefreshMeta>(row).ok()?;
                        Some((symbol, meta))
                    })
                    .collect(),
            ),
            Some(_) => {
                warn!("Ignoring refreshMeta in client sync: not an object");
                None
            }
        };

        let flag = |section: &Option<Value>, key: &str| {
            section.as_ref().and_then(|v| v.get(key)).and_then(Value::as_bool)
        };

        Self {
            client_updated_at: request
                .client_runtime_updated_at
                .as_ref()
                .and_then(f64_from_value)
                .map(|v| v as i64)
                .unwrap_or(0),
            ai_settings: request.ai_settings.filter(Value::is_object),
            autobot_enabled: flag(&request.autobot, "enabled"),
            scout_enabled: flag(&request.scout, "enabled"),
            scout_interval_mins: request
                .scout
                .as_ref()
                .and_then(|v| v.get("intervalMins"))
                .and_then(f64_from_value),
            wallet,
            research_cache,
            refresh_meta,
        }
    }

    fn carries_data(&self) -> bool {
        self.wallet.is_some() || self.research_cache.is_some() || self.refresh_meta.is_some()
    }
}

/// What a merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub settings_changed: bool,
    pub toggles_changed: bool,
    pub data_applied: bool,
    pub stale_rejected: bool,
}

impl MergeReport {
    pub fn is_substantive(&self) -> bool {
        self.settings_changed || self.toggles_changed || self.data_applied
    }
}

/// Merge a client payload into the authoritative state
pub fn merge(state: &mut RuntimeState, payload: SyncPayload, now: i64) -> MergeReport {
    let mut report = MergeReport::default();
    state.last_client_heartbeat_at = now;

    if let Some(raw) = &payload.ai_settings {
        let merged = state.ai_settings.merged(raw);
        if merged != state.ai_settings {
            state.ai_settings = merged;
            report.settings_changed = true;
        }
    }

    if let Some(enabled) = payload.autobot_enabled {
        if enabled != state.autobot.enabled {
            state.autobot.enabled = enabled;
            state.autobot.set_status(if enabled { "Waiting for next run." } else { "Disabled" });
            report.toggles_changed = true;
        }
    }
    if let Some(enabled) = payload.scout_enabled {
        if enabled != state.scout.enabled {
            state.scout.enabled = enabled;
            report.toggles_changed = true;
        }
    }
    if payload.scout_interval_mins.is_some() {
        let mins = clamp_round(payload.scout_interval_mins, 1, 120, state.scout.interval_mins);
        if mins != state.scout.interval_mins {
            state.scout.interval_mins = mins;
            report.toggles_changed = true;
        }
    }

    if !payload.carries_data() {
        return report;
    }
    if payload.client_updated_at < state.updated_at {
        report.stale_rejected = true;
        return report;
    }
    if let Some(mut wallet) = payload.wallet {
        wallet.normalize();
        state.wallet = wallet;
    }
    if let Some(cache) = payload.research_cache {
        state.research_cache.merge(cache);
    }
    if let Some(meta) = payload.refresh_meta {
        state.refresh_meta = meta;
    }
    report.data_applied = true;
    report
}

/// Apply a push and return the resulting authoritative snapshot
pub async fn sync(rt: &Runtime, request: SyncRequest) -> Result<RuntimeView> {
    let payload = SyncPayload::from_request(request);
    let now = now_ms();
    let report = rt
        .state
        .apply(move |state| {
            let report = merge(state, payload, now);
            let persist = if report.is_substantive() {
                Persist::Touch
            } else {
                Persist::Quiet
            };
            (report, persist)
        })
        .await?;

    if report.stale_rejected {
        info!("Ignored wallet/research data from a stale client");
    }
    if report.is_substantive() {
        info!("Client sync merged: {:?}", report);
    } else {
        debug!("Client heartbeat");
    }
    rt.view().await
}
