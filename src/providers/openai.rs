//! OpenAI research and planning client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info};

use super::DecisionProvider;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::portfolio::normalize_symbol;
use crate::state::MAX_HOT_SYMBOLS;
use crate::types::{DecisionPlan, HotList, PlanContext, ResearchContext, ResearchProfile};

const RESEARCH_SYSTEM: &str = "You are an equity research analyst. Reply with one JSON object: \
{\"sentiment\": integer -100..100, \"confidence\": integer 0..100, \"action\": \"BUY\"|\"HOLD\"|\"SELL\", \
\"buyCashPct\": number 0.01..0.5, \"trimPositionPct\": number 0.05..1, \"thesis\": string, \
\"catalyst\": string, \"risk\": string, \"brief\": string}. Weigh the stated horizon.";

const PLAN_SYSTEM: &str = "You manage a paper stock portfolio. Reply with one JSON object: \
{\"thought\": string, \"actions\": [{\"action\": \"BUY\"|\"SELL\"|\"HOLD\", \"symbol\": string, \
\"shares\": integer, \"reason\": string}]}. Only use symbols from the context. Whole shares only. \
Never sell shares that are not held. Never spend more cash than available.";

const DISCOVERY_PROMPT: &str = "Search today's US equity market news and list up to 30 liquid, \
US-listed stock tickers that are notable right now (earnings, guidance, upgrades, unusual volume). \
Reply with one JSON object: {\"symbols\": [string], \"summary\": string}.";

/// Chat-completions and responses API client
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    response_format: Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.http_timeout()).build()?;
        info!("OpenAI client initialized: url={}", config.openai_base_url);
        Ok(Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.trim().to_string(),
        })
    }

    async fn post(&self, path: &str, body: &impl Serialize, what: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RuntimeError::Provider(format!("OpenAI {} timed out", what))
                } else {
                    RuntimeError::Provider(format!("OpenAI {} failed: {}", what, e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(300).collect();
            return Err(RuntimeError::Provider(format!(
                "OpenAI {} failed ({}): {}",
                what, status, snippet
            )));
        }
        Ok(body)
    }

    async fn chat_json(&self, model: &str, system: &str, user: String, what: &str) -> Result<Value> {
        let req = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: json!({ "type": "json_object" }),
        };
        let body = self.post("/v1/chat/completions", &req, what).await?;
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| RuntimeError::MalformedResponse(format!("OpenAI {}: {}", what, e)))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        extract_json(&content).ok_or_else(|| {
            RuntimeError::MalformedResponse(format!("OpenAI {} returned no JSON object", what))
        })
    }
}

#[async_trait]
impl DecisionProvider for OpenAiClient {
    async fn generate_research(&self, context: &ResearchContext) -> Result<ResearchProfile> {
        let user = format!(
            "Research {} for a {} horizon. Context: {}",
            context.symbol,
            context.horizon,
            serde_json::to_string(context)?
        );
        let raw = self.chat_json(&context.model, RESEARCH_SYSTEM, user, "research").await?;
        Ok(ResearchProfile::from_value(&raw))
    }

    async fn generate_plan(&self, context: &PlanContext, max_actions: usize) -> Result<DecisionPlan> {
        let user = format!(
            "Propose at most {} actions for a {} horizon. Context: {}",
            max_actions,
            context.horizon,
            serde_json::to_string(context)?
        );
        let raw = self.chat_json(&context.model, PLAN_SYSTEM, user, "plan").await?;
        let plan = DecisionPlan::from_value(&raw, max_actions);
        debug!("OpenAI plan: {} actions", plan.actions.len());
        Ok(plan)
    }

    async fn discover_hot_symbols(&self, model: &str, exclude: &[String]) -> Result<HotList> {
        let body = json!({
            "model": model,
            "tools": [{ "type": "web_search_preview" }],
            "input": DISCOVERY_PROMPT,
        });
        let raw = self.post("/v1/responses", &body, "discovery").await?;
        let payload: Value = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::MalformedResponse(format!("OpenAI discovery: {}", e)))?;
        let text = response_text(&payload);
        let parsed = extract_json(&text).unwrap_or(Value::Null);
        Ok(parse_hot_list(&parsed, exclude))
    }
}

/// Concatenated output text of a responses-API payload
fn response_text(payload: &Value) -> String {
    if let Some(text) = payload.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }
    payload
        .get("output")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("content").and_then(Value::as_array))
                .flatten()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// First JSON object in model output, tolerating prose and code fences
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Normalize a discovery answer: valid, unique, not excluded, capped
pub fn parse_hot_list(raw: &Value, exclude: &[String]) -> HotList {
    let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let symbols = raw
        .get("symbols")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| match row {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("symbol").and_then(Value::as_str),
                })
                .filter_map(normalize_symbol)
                .filter(|s| !excluded.contains(s.as_str()))
                .filter(|s| seen.insert(s.clone()))
                .take(MAX_HOT_SYMBOLS)
                .collect()
        })
        .unwrap_or_default();
    let summary = raw
        .get("summary")
        .and_then(Value::as_str)
        .map(|s| crate::amount::truncate_text(s, 600))
        .unwrap_or_default();
    HotList { symbols, summary }
}
