#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use browser_pilot::error::{DecisionError, DriverError, ReportError};
use browser_pilot::events::EventCollector;
use browser_pilot::hands::{BrowserDriver, InteractionSettings, LocatorAction, Point};
use browser_pilot::orchestrator::{LoopSettings, Notifier, Orchestrator};
use browser_pilot::report::ReportSink;
use browser_pilot::types::{
    AccessibilityNode, Action, ActionKind, Decision, ModelTier, ObservedState, ServerMessage,
    SessionStatus,
};
use browser_pilot::{DecisionRequest, DecisionService};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start,
    ContentQuad(i64),
    MovePointer(Point),
    ClickAt(Point),
    TypeText(String),
    Highlight(String),
    Locator(LocatorAction, String, Option<String>),
    Navigate(String),
    PressKey(String),
    ScrollBy(f64, f64),
}

/// In-memory browser that records every call.
#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<Call>>,
    events: EventCollector,
    started: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_locators: AtomicBool,
    pub fail_idle: AtomicBool,
    pub screenshots: AtomicUsize,
    pub quads: Mutex<HashMap<i64, Vec<f64>>>,
    pub tree: Mutex<Vec<AccessibilityNode>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started() -> Self {
        let driver = Self::default();
        driver.started.store(true, Ordering::SeqCst);
        driver
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(call);
        self.page()
    }

    fn page(&self) -> Result<(), DriverError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::NoActivePage)
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn start(&self) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(Call::Start);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DriverError::Launch("chrome not found".to_string()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> &EventCollector {
        &self.events
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.page()?;
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0xff, 0xd8, 0xff, 0xd9])
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.page()?;
        Ok("https://example.com/".to_string())
    }

    async fn accessibility_tree(&self) -> Result<Vec<AccessibilityNode>, DriverError> {
        self.page()?;
        Ok(self.tree.lock().unwrap().clone())
    }

    async fn content_quad(&self, backend_node_id: i64) -> Result<Vec<f64>, DriverError> {
        self.record(Call::ContentQuad(backend_node_id))?;
        self.quads
            .lock()
            .unwrap()
            .get(&backend_node_id)
            .cloned()
            .ok_or_else(|| DriverError::Protocol("no box model".to_string()))
    }

    async fn move_pointer(&self, to: Point) -> Result<(), DriverError> {
        self.record(Call::MovePointer(to))
    }

    async fn click_at(&self, at: Point) -> Result<(), DriverError> {
        self.record(Call::ClickAt(at))
    }

    async fn type_text(&self, text: &str) -> Result<(), DriverError> {
        self.record(Call::TypeText(text.to_string()))
    }

    async fn wait_for_idle(&self, timeout: Duration) -> Result<(), DriverError> {
        self.page()?;
        if self.fail_idle.load(Ordering::SeqCst) {
            return Err(DriverError::Timeout {
                operation: "idle wait",
                millis: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn highlight(&self, selector: &str) -> Result<(), DriverError> {
        self.record(Call::Highlight(selector.to_string()))
    }

    async fn locator_action(
        &self,
        action: LocatorAction,
        selector: &str,
        value: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.record(Call::Locator(
            action,
            selector.to_string(),
            value.map(str::to_string),
        ))?;
        if self.fail_locators.load(Ordering::SeqCst) {
            return Err(DriverError::Timeout {
                operation: "locator",
                millis: 5,
            });
        }
        Ok(())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
        self.record(Call::Navigate(url.to_string()))
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        self.record(Call::PressKey(key.to_string()))
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), DriverError> {
        self.record(Call::ScrollBy(dx, dy))
    }
}

/// Replays queued decisions; with nothing queued, `decide` never returns.
#[derive(Default)]
pub struct ScriptedBrain {
    script: Mutex<VecDeque<Result<Decision, DecisionError>>>,
    tiers: Mutex<Vec<ModelTier>>,
    histories: Mutex<Vec<Vec<ActionKind>>>,
}

impl ScriptedBrain {
    pub fn new(script: Vec<Result<Decision, DecisionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: Result<Decision, DecisionError>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.tiers.lock().unwrap().len()
    }

    pub fn tiers(&self) -> Vec<ModelTier> {
        self.tiers.lock().unwrap().clone()
    }

    pub fn histories(&self) -> Vec<Vec<ActionKind>> {
        self.histories.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionService for ScriptedBrain {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        self.histories
            .lock()
            .unwrap()
            .push(request.history.iter().map(|d| d.action.kind).collect());
        self.tiers.lock().unwrap().push(request.tier);
        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingReport {
    pub goals: Mutex<Vec<String>>,
    pub steps: Mutex<Vec<(usize, ActionKind)>>,
    pub ended: Mutex<Vec<SessionStatus>>,
}

impl RecordingReport {
    pub fn ended(&self) -> Vec<SessionStatus> {
        self.ended.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<(usize, ActionKind)> {
        self.steps.lock().unwrap().clone()
    }
}

impl ReportSink for RecordingReport {
    fn start_session(&self, goal: &str) -> Result<(), ReportError> {
        self.goals.lock().unwrap().push(goal.to_string());
        Ok(())
    }

    fn log_step(
        &self,
        index: usize,
        _observed: &ObservedState,
        decision: &Decision,
    ) -> Result<(), ReportError> {
        self.steps
            .lock()
            .unwrap()
            .push((index, decision.action.kind));
        Ok(())
    }

    fn end_session(&self, status: SessionStatus) -> Result<(), ReportError> {
        self.ended.lock().unwrap().push(status);
        Ok(())
    }

    fn current_report_location(&self) -> Option<String> {
        let goals = self.goals.lock().unwrap().len();
        (goals > 0).then(|| format!("memory://report/{goals}"))
    }
}

pub fn fast_interaction() -> InteractionSettings {
    InteractionSettings {
        idle_timeout: Duration::from_millis(10),
        locator_timeout: Duration::from_millis(10),
        navigation_timeout: Duration::from_millis(10),
        highlight_delay: Duration::ZERO,
        wait_interval: Duration::from_millis(1),
        ..InteractionSettings::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub driver: Arc<FakeDriver>,
    pub brain: Arc<ScriptedBrain>,
    pub report: Arc<RecordingReport>,
    pub notifications: UnboundedReceiver<ServerMessage>,
}

impl Harness {
    pub fn new(script: Vec<Result<Decision, DecisionError>>) -> Self {
        Self::with_driver(FakeDriver::new(), script)
    }

    pub fn with_driver(driver: FakeDriver, script: Vec<Result<Decision, DecisionError>>) -> Self {
        Self::with_settings(
            driver,
            script,
            LoopSettings {
                decision_timeout: Duration::from_secs(5),
                action_backoff: Duration::from_millis(10),
            },
        )
    }

    pub fn with_settings(
        driver: FakeDriver,
        script: Vec<Result<Decision, DecisionError>>,
        settings: LoopSettings,
    ) -> Self {
        let driver = Arc::new(driver);
        let brain = Arc::new(ScriptedBrain::new(script));
        let report = Arc::new(RecordingReport::default());
        let (notifier, notifications) = Notifier::channel();
        let orchestrator = Orchestrator::new(
            driver.clone(),
            brain.clone(),
            report.clone(),
            notifier,
            settings,
            fast_interaction(),
        );
        Self {
            orchestrator,
            driver,
            brain,
            report,
            notifications,
        }
    }

    /// Everything sent to the client so far.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.notifications.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub async fn wait_for_status(&self, wanted: SessionStatus) {
        let mut status = self
            .orchestrator
            .watch_status()
            .await
            .expect("no session started");
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
    }

    pub async fn wait_for_decisions(&self, count: usize) {
        eventually(|| self.brain.calls() >= count).await;
    }
}

pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn decision(kind: ActionKind) -> Decision {
    Decision {
        thought: format!("next: {kind}"),
        plan: "reach the goal".to_string(),
        action: Action::new(kind),
    }
}

pub fn click(selector: &str) -> Decision {
    let mut decision = decision(ActionKind::Click);
    decision.action.selector = Some(selector.to_string());
    decision.action.description = Some(format!("click {selector}"));
    decision
}

pub fn finish() -> Decision {
    decision(ActionKind::Finish)
}

pub fn fail(reason: &str) -> Decision {
    let mut decision = decision(ActionKind::Fail);
    decision.action.reason = Some(reason.to_string());
    decision
}

pub fn logs(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Log { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn errors(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn count(messages: &[ServerMessage], matches: impl Fn(&ServerMessage) -> bool) -> usize {
    messages.iter().filter(|m| matches(m)).count()
}
