use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::DecisionError;
use crate::types::{AccessibilityNode, Action, ActionKind, Decision, ModelTier, PageEvents};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent driving a live Chrome window toward a user goal, one action at a time.

Each turn you receive a screenshot, the goal, the actions taken so far, a list of accessibility nodes and recent console/page errors.

Reply with ONE JSON object and nothing else:
{
  "thought": "what you see now -> the next milestone -> how it serves the goal",
  "plan": "your current strategy",
  "action": {
    "type": "navigate|click|type|press|hover|scroll|wait|finish|fail",
    "description": "short summary of the action",
    "nodeId": "accessibility node id (preferred target)",
    "selector": "CSS selector (fallback target)",
    "value": "text to type, URL to open or key to press",
    "reason": "why you finish or fail"
  }
}

Rules:
1. Prefer nodeId from the accessibility list; add a selector only as a backup.
2. navigate, type and press need a value.
3. A history entry of type fail_retry means the previous action raised an error; try a different target or strategy.
4. If the same action has made no progress three times, change strategy.
5. Use finish once the goal is achieved and fail only when it cannot be achieved."#;

/// Everything the decision service sees for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub screenshot: &'a [u8],
    pub goal: &'a str,
    pub history: &'a [Decision],
    pub snapshot: &'a [AccessibilityNode],
    pub events: &'a PageEvents,
    pub tier: ModelTier,
}

/// The "think" step. Implementations only report errors; turning them into
/// a synthetic fail decision is the orchestrator's job.
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError>;
}

/// Escalate on the first cycle and right after a `fail` entry.
pub fn select_tier(history: &[Decision]) -> ModelTier {
    match history.last() {
        None => ModelTier::Escalated,
        Some(last) if last.action.kind == ActionKind::Fail => ModelTier::Escalated,
        Some(_) => ModelTier::Standard,
    }
}

#[derive(Deserialize)]
struct RawDecision {
    thought: Option<String>,
    plan: Option<String>,
    action: Option<RawAction>,
}

#[derive(Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
    #[serde(rename = "nodeId")]
    node_id: Option<Value>,
    selector: Option<String>,
    locator: Option<String>,
    value: Option<Value>,
    url: Option<String>,
    key: Option<String>,
    reason: Option<String>,
}

/// Strips code fences and validates a decision payload into the canonical
/// schema. Aliases only fill canonical fields that are absent:
/// `locator` → `selector`, `url`/`key` → `value`.
pub fn parse_decision(content: &str) -> Result<Decision, DecisionError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let raw: RawDecision = serde_json::from_str(cleaned)?;
    let raw_action = raw
        .action
        .ok_or_else(|| DecisionError::Invalid("missing action".to_string()))?;
    let kind_text = raw_action
        .kind
        .ok_or_else(|| DecisionError::Invalid("action has no type".to_string()))?;
    let kind = ActionKind::parse(&kind_text)
        .ok_or_else(|| DecisionError::Invalid(format!("unknown action type '{kind_text}'")))?;

    let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
    let mut action = Action::new(kind);
    action.node_id = raw_action.node_id.and_then(scalar_text);
    action.selector = non_empty(raw_action.selector).or(non_empty(raw_action.locator));
    action.value = raw_action
        .value
        .and_then(scalar_text)
        .or(non_empty(raw_action.url))
        .or(non_empty(raw_action.key));
    action.description = raw_action.description;
    action.reason = raw_action.reason;

    if matches!(kind, ActionKind::Navigate | ActionKind::Type | ActionKind::Press)
        && action.value.is_none()
    {
        return Err(DecisionError::Invalid(format!("{kind} requires a value")));
    }

    let thought = raw
        .thought
        .or_else(|| action.description.clone())
        .unwrap_or_else(|| "Moving forward...".to_string());

    Ok(Decision {
        thought,
        plan: raw.plan.unwrap_or_default(),
        action,
    })
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct BrainSettings {
    /// Base of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub standard_model: String,
    pub escalated_model: String,
    pub temperature: f32,
}

/// Decision service backed by an OpenAI-compatible chat completions API.
pub struct Brain {
    client: Client,
    settings: BrainSettings,
}

impl Brain {
    pub fn new(settings: BrainSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Standard => &self.settings.standard_model,
            ModelTier::Escalated => &self.settings.escalated_model,
        }
    }
}

fn observation_text(request: &DecisionRequest<'_>) -> String {
    let history = serde_json::to_string(request.history).unwrap_or_else(|_| "[]".to_string());
    let snapshot = if request.snapshot.is_empty() {
        "N/A".to_string()
    } else {
        serde_json::to_string(request.snapshot).unwrap_or_else(|_| "N/A".to_string())
    };
    let mut text = format!(
        "Goal: {}\n\nHistory: {}\n\nAccessibility nodes: {}",
        request.goal, history, snapshot
    );
    if !request.events.is_empty() {
        let events = serde_json::to_string(request.events).unwrap_or_default();
        text.push_str(&format!("\n\nRecent page events: {events}"));
    }
    text
}

#[async_trait]
impl DecisionService for Brain {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        let model = self.model_for(request.tier);
        let image = format!("data:image/jpeg;base64,{}", BASE64.encode(request.screenshot));
        debug!(model, history = request.history.len(), "asking decision service");

        let response = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.settings.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.settings.api_key)
            .json(&json!({
                "model": model,
                "temperature": self.settings.temperature,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": [
                        {"type": "text", "text": observation_text(&request)},
                        {"type": "image_url", "image_url": {"url": image}},
                    ]},
                ],
            }))
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            warn!(%status, "decision service error: {}", message);
            return Err(DecisionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(DecisionError::EmptyContent)?;
        info!(model, "decision service replied");
        debug!("raw decision: {}", content);

        parse_decision(content)
    }
}
