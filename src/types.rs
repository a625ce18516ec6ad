use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of action a decision may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Hover,
    Scroll,
    Press,
    Wait,
    Finish,
    Fail,
    /// Synthetic entry recorded after an execution error. Never accepted
    /// from the decision service.
    FailRetry,
}

impl ActionKind {
    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw.trim().to_ascii_lowercase().as_str() {
            "navigate" => ActionKind::Navigate,
            "click" => ActionKind::Click,
            "type" => ActionKind::Type,
            "hover" => ActionKind::Hover,
            "scroll" => ActionKind::Scroll,
            "press" => ActionKind::Press,
            "wait" => ActionKind::Wait,
            "finish" => ActionKind::Finish,
            "fail" => ActionKind::Fail,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Hover => "hover",
            ActionKind::Scroll => "scroll",
            ActionKind::Press => "press",
            ActionKind::Wait => "wait",
            ActionKind::Finish => "finish",
            ActionKind::Fail => "fail",
            ActionKind::FailRetry => "fail_retry",
        }
    }

    /// Everything except `finish` and `fail` changes the page.
    pub fn is_mutating(self) -> bool {
        !matches!(self, ActionKind::Finish | ActionKind::Fail)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated action. `node_id` wins over `selector`, which wins over
/// `value` when a target has to be picked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            node_id: None,
            selector: None,
            value: None,
            description: None,
            reason: None,
            error: None,
        }
    }

    pub fn target(&self) -> TargetDescriptor {
        TargetDescriptor {
            node_id: self.node_id.clone(),
            selector: self.selector.clone(),
            value: self.value.clone(),
        }
    }
}

/// The part of an action the interaction layer resolves against the page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub node_id: Option<String>,
    pub selector: Option<String>,
    pub value: Option<String>,
}

/// A structured decision from the decision service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub plan: String,
    pub action: Action,
}

impl Decision {
    /// The decision the loop acts on when the service could not produce one.
    pub fn synthetic_fail(reason: impl Into<String>) -> Self {
        let mut action = Action::new(ActionKind::Fail);
        action.reason = Some(reason.into());
        Self {
            thought: String::new(),
            plan: String::new(),
            action,
        }
    }

    /// History entry recorded after a mutating action raised an error.
    pub fn fail_retry(plan: &str, error: impl Into<String>) -> Self {
        let mut action = Action::new(ActionKind::FailRetry);
        action.error = Some(error.into());
        Self {
            thought: "Execution failed. Retrying with different strategy.".to_string(),
            plan: plan.to_string(),
            action,
        }
    }
}

/// A node of the page accessibility tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityNode {
    pub id: String,
    pub role: String,
    pub name: String,
    #[serde(rename = "backingElementId")]
    pub backing_element_id: Option<i64>,
    #[serde(default, skip_serializing)]
    pub ignored: bool,
}

/// Console output and page errors collected since the last drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEvents {
    pub console: Vec<String>,
    pub errors: Vec<String>,
}

impl PageEvents {
    pub fn is_empty(&self) -> bool {
        self.console.is_empty() && self.errors.is_empty()
    }
}

/// What the loop saw at the start of a cycle.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    pub url: String,
    pub screenshot: Vec<u8>,
    pub accessibility_snapshot: Vec<AccessibilityNode>,
    pub events: PageEvents,
}

/// One completed cycle. Immutable once appended to a session.
#[derive(Debug, Clone)]
pub struct Step {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub observed: ObservedState,
    pub decision: Decision,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Succeeded,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Succeeded | SessionStatus::Failed | SessionStatus::Stopped
        )
    }

    /// Status string written to the report.
    pub fn report_label(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running | SessionStatus::Paused => "running",
            SessionStatus::Succeeded => "success",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// Which capability tier the decision service should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Standard,
    Escalated,
}

impl ModelTier {
    pub fn label(self) -> &'static str {
        match self {
            ModelTier::Standard => "standard",
            ModelTier::Escalated => "escalated",
        }
    }
}

/// Messages accepted from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Start { goal: String, step_mode: bool },
    Stop { reason: String },
    NextStep,
}

#[derive(Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    goal: Option<String>,
    #[serde(default)]
    step_by_step: bool,
}

impl ControlMessage {
    /// Parses one client frame. Any frame other than stop or next_step that
    /// carries a non-empty goal is a start; anything else yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let inbound: InboundMessage = serde_json::from_str(raw).ok()?;
        match inbound.kind.as_deref() {
            Some("stop") => Some(ControlMessage::Stop {
                reason: "User Clicked Stop".to_string(),
            }),
            Some("next_step") => Some(ControlMessage::NextStep),
            _ => {
                let goal = inbound.goal?.trim().to_string();
                if goal.is_empty() {
                    return None;
                }
                Some(ControlMessage::Start {
                    goal,
                    step_mode: inbound.step_by_step,
                })
            }
        }
    }
}

/// Notifications pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Log { message: String },
    State {
        screenshot: String,
        url: String,
        events: PageEvents,
    },
    Thought { thought: String },
    Pause { message: String },
    Success { message: String },
    Error { message: String },
    Report { url: String },
}
