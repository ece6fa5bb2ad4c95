//! Finnhub company-profile client with a small in-process cache

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::ProfileProvider;
use crate::error::{Result, RuntimeError};
use crate::runtime::now_ms;
use crate::types::CompanyProfile;

const DEFAULT_BASE_URL: &str = "https://finnhub.io";
const PROFILE_TTL_MS: i64 = 24 * 60 * 60 * 1000;
const MAX_PROFILE_ENTRIES: usize = 200;

pub struct FinnhubClient {
    client: Client,
    base_url: String,
    api_key: String,
    // symbol -> (fetched_at, profile); `None` caches "no such company"
    cache: Mutex<HashMap<String, (i64, Option<CompanyProfile>)>>,
}

impl FinnhubClient {
    pub fn new(api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key, timeout)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, symbol: &str, now: i64) -> Option<Option<CompanyProfile>> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(symbol)
            .filter(|(at, _)| now - at < PROFILE_TTL_MS)
            .map(|(_, profile)| profile.clone())
    }

    fn store(&self, symbol: &str, profile: Option<CompanyProfile>, now: i64) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        cache.insert(symbol.to_string(), (now, profile));
        if cache.len() > MAX_PROFILE_ENTRIES {
            let mut rows: Vec<(String, i64)> =
                cache.iter().map(|(s, (at, _))| (s.clone(), *at)).collect();
            rows.sort_by(|a, b| b.1.cmp(&a.1));
            for (stale, _) in rows.into_iter().skip(MAX_PROFILE_ENTRIES) {
                cache.remove(&stale);
            }
        }
    }
}

#[async_trait]
impl ProfileProvider for FinnhubClient {
    async fn get_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>> {
        let now = now_ms();
        if let Some(hit) = self.cached(symbol, now) {
            return Ok(hit);
        }

        let url = format!("{}/api/v1/stock/profile2", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("token", self.api_key.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::Provider(format!(
                "Finnhub profile for {} failed ({})",
                symbol, status
            )));
        }
        let payload: Value = response.json().await?;
        let profile = parse_profile(symbol, &payload);
        debug!("Finnhub profile for {}: {}", symbol, profile.is_some());
        self.store(symbol, profile.clone(), now);
        Ok(profile)
    }
}

/// `None` when the payload does not describe a company
pub fn parse_profile(symbol: &str, raw: &Value) -> Option<CompanyProfile> {
    let text = |key: &str| raw.get(key).and_then(Value::as_str).unwrap_or("").trim().to_string();
    let name = text("name");
    if name.is_empty() {
        return None;
    }
    Some(CompanyProfile {
        symbol: symbol.to_string(),
        name,
        industry: text("finnhubIndustry"),
        exchange: text("exchange"),
        country: text("country"),
        web_url: text("weburl"),
        market_cap: raw.get("marketCapitalization").and_then(Value::as_f64),
    })
}
