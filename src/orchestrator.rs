//! The sense-think-act loop and the session lifecycle around it.
//!
//! One `Orchestrator` serves one client connection. Sessions are strictly
//! serialized: a new Start stops and joins the previous loop before anything
//! else touches the browser. The loop task is the only writer of session
//! state; control messages reach it through a cancellation token (Stop) and
//! a queue that is only read while paused (NextStep).

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::brain::{DecisionRequest, DecisionService, select_tier};
use crate::dom::filter_snapshot;
use crate::error::DecisionError;
use crate::hands::{BrowserDriver, InteractionLayer, InteractionSettings};
use crate::report::ReportSink;
use crate::types::{
    ActionKind, ControlMessage, Decision, ModelTier, ObservedState, PageEvents, ServerMessage,
    SessionStatus, Step,
};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub decision_timeout: Duration,
    /// Pause after an action raised an error, before the next cycle.
    pub action_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(120),
            action_backoff: Duration::from_secs(1),
        }
    }
}

/// Outbound half of the transport. Sends never block and never fail the
/// caller; a gone client just drops notifications.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: ServerMessage) {
        if self.tx.send(message).is_err() {
            debug!("client gone, notification dropped");
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.send(ServerMessage::Log {
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(ServerMessage::Error {
            message: message.into(),
        });
    }
}

/// Per-goal state owned by the loop task.
#[derive(Debug)]
pub struct Session {
    pub goal: String,
    pub step_mode: bool,
    /// Decisions in execution order, including synthetic `fail_retry` entries.
    pub history: Vec<Decision>,
    pub steps: Vec<Step>,
}

impl Session {
    fn new(goal: String, step_mode: bool) -> Self {
        Self {
            goal,
            step_mode,
            history: Vec::new(),
            steps: Vec::new(),
        }
    }
}

type StatusCell = Arc<watch::Sender<SessionStatus>>;

/// Moves a live session into `to`. Terminal states are final, so this is a
/// no-op returning false once any terminal state has been reached.
fn conclude(status: &StatusCell, to: SessionStatus) -> bool {
    status.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = to;
            true
        }
    })
}

fn transition(status: &StatusCell, from: SessionStatus, to: SessionStatus) -> bool {
    status.send_if_modified(|current| {
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    })
}

struct Shared {
    browser: Arc<dyn BrowserDriver>,
    hands: InteractionLayer,
    brain: Arc<dyn DecisionService>,
    report: Arc<dyn ReportSink>,
    notifier: Notifier,
    settings: LoopSettings,
}

struct ActiveSession {
    status: StatusCell,
    cancel: CancellationToken,
    next_tx: mpsc::UnboundedSender<()>,
    handle: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    lease: Option<Arc<Semaphore>>,
    active: Mutex<Option<ActiveSession>>,
}

impl Orchestrator {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        brain: Arc<dyn DecisionService>,
        report: Arc<dyn ReportSink>,
        notifier: Notifier,
        settings: LoopSettings,
        interaction: InteractionSettings,
    ) -> Self {
        let hands = InteractionLayer::new(Arc::clone(&browser), interaction);
        Self {
            shared: Arc::new(Shared {
                browser,
                hands,
                brain,
                report,
                notifier,
                settings,
            }),
            lease: None,
            active: Mutex::new(None),
        }
    }

    /// Shares the browser with other orchestrators: a session only runs
    /// while it holds the lease's single permit.
    pub fn with_browser_lease(mut self, lease: Arc<Semaphore>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub async fn process_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Start { goal, step_mode } => self.start(goal, step_mode).await,
            ControlMessage::Stop { reason } => self.stop(&reason).await,
            ControlMessage::NextStep => self.next_step().await,
        }
    }

    /// Stops any previous session, then spawns a fresh loop for `goal`.
    /// Returns once the loop is running; it does not wait for the goal.
    pub async fn start(&self, goal: String, step_mode: bool) {
        let mut active = self.active.lock().await;
        self.stop_locked(&mut active, "restarting").await;
        let notifier = &self.shared.notifier;

        let permit = match &self.lease {
            Some(lease) => match Arc::clone(lease).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("browser is held by another session; start refused");
                    notifier.error("Browser is busy with another session.");
                    return;
                }
            },
            None => None,
        };

        let report = Arc::clone(&self.shared.report);
        let report_goal = goal.clone();
        match tokio::task::spawn_blocking(move || report.start_session(&report_goal)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("could not open report: {}", e),
            Err(e) => warn!("report task failed: {}", e),
        }
        notifier.log(format!("Orchestrating goal: {goal}"));
        info!(goal = %goal, step_mode, "session starting");

        let status: StatusCell = Arc::new(watch::channel(SessionStatus::Running).0);
        let mut finalizer = Finalizer::new(
            Arc::clone(&self.shared.report),
            notifier.clone(),
            Arc::clone(&status),
        );
        let cancel = CancellationToken::new();
        let (next_tx, next_rx) = mpsc::unbounded_channel();

        if let Err(e) = self.shared.browser.start().await {
            error!("browser unavailable: {}", e);
            conclude(&status, SessionStatus::Failed);
            notifier.error(format!("Critical Error: {e}"));
            finalizer.close().await;
            *active = Some(ActiveSession {
                status,
                cancel,
                next_tx,
                handle: None,
            });
            return;
        }
        notifier.log("Browser ready.");

        let session_loop = SessionLoop {
            shared: Arc::clone(&self.shared),
            session: Session::new(goal, step_mode),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            next_rx,
            finalizer,
            _permit: permit,
        };
        let handle = tokio::spawn(session_loop.run());
        *active = Some(ActiveSession {
            status,
            cancel,
            next_tx,
            handle: Some(handle),
        });
    }

    /// Idempotent. Returns only after the loop has fully exited and its
    /// finalization has run.
    pub async fn stop(&self, reason: &str) {
        let mut active = self.active.lock().await;
        self.stop_locked(&mut active, reason).await;
    }

    /// Connection teardown. The shared browser stays up for later sessions.
    pub async fn shutdown(&self) {
        self.stop("Connection Lost").await;
    }

    /// Waits for the current loop to finish on its own.
    pub async fn join(&self) {
        let handle = self
            .active
            .lock()
            .await
            .as_mut()
            .and_then(|session| session.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("session task ended abnormally: {}", e);
            }
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| *session.status.borrow())
            .unwrap_or(SessionStatus::Idle)
    }

    pub async fn watch_status(&self) -> Option<watch::Receiver<SessionStatus>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| session.status.subscribe())
    }

    async fn next_step(&self) {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(session) if *session.status.borrow() == SessionStatus::Paused => {
                let _ = session.next_tx.send(());
            }
            _ => debug!("next_step ignored: no paused session"),
        }
    }

    async fn stop_locked(&self, active: &mut Option<ActiveSession>, reason: &str) {
        let Some(session) = active.as_mut() else {
            return;
        };
        if conclude(&session.status, SessionStatus::Stopped) {
            info!(reason, "stopping session");
            self.shared
                .notifier
                .log(format!("Execution Interrupted: {reason}"));
        }
        session.cancel.cancel();
        if let Some(handle) = session.handle.take() {
            if let Err(e) = handle.await {
                warn!("session task ended abnormally: {}", e);
            }
        }
    }
}

/// Closes the report and tells the client where it is, exactly once per
/// session. `close` does it on the blocking pool; if the guard is dropped
/// without `close` (panic or aborted task) it happens inline instead.
struct Finalizer {
    report: Arc<dyn ReportSink>,
    notifier: Notifier,
    status: StatusCell,
    closed: bool,
}

impl Finalizer {
    fn new(report: Arc<dyn ReportSink>, notifier: Notifier, status: StatusCell) -> Self {
        Self {
            report,
            notifier,
            status,
            closed: false,
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        conclude(&self.status, SessionStatus::Stopped);
        let status = *self.status.borrow();
        let report = Arc::clone(&self.report);
        let location = tokio::task::spawn_blocking(move || {
            if let Err(e) = report.end_session(status) {
                warn!("could not finalize report: {}", e);
            }
            report.current_report_location()
        })
        .await;
        match location {
            Ok(location) => self.announce(status, location),
            Err(e) => warn!("report task failed: {}", e),
        }
    }

    fn announce(&self, status: SessionStatus, location: Option<String>) {
        if let Some(url) = location {
            info!(url = %url, status = status.report_label(), "session finalized");
            self.notifier.send(ServerMessage::Report { url });
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let fallback = if std::thread::panicking() {
            SessionStatus::Failed
        } else {
            SessionStatus::Stopped
        };
        conclude(&self.status, fallback);
        let status = *self.status.borrow();
        if let Err(e) = self.report.end_session(status) {
            warn!("could not finalize report: {}", e);
        }
        self.announce(status, self.report.current_report_location());
    }
}

struct SessionLoop {
    shared: Arc<Shared>,
    session: Session,
    status: StatusCell,
    cancel: CancellationToken,
    next_rx: mpsc::UnboundedReceiver<()>,
    // Field order matters: the report is finalized before the lease is released.
    finalizer: Finalizer,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionLoop {
    async fn run(mut self) {
        self.drive().await;
        let status = *self.status.borrow();
        debug!(steps = self.session.steps.len(), ?status, "loop exited");
        self.finalizer.close().await;
    }

    async fn drive(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let observed = self.observe().await;
            self.send_state(&observed.url, &observed.screenshot, observed.events.clone());

            if self.cancel.is_cancelled() {
                return;
            }

            let tier = select_tier(&self.session.history);
            self.shared.notifier.log("Thinking...");
            let decision = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                decision = self.decide(&observed, tier) => decision,
            };

            if !decision.plan.is_empty() {
                self.shared.notifier.log(format!("Plan: {}", decision.plan));
            }
            self.shared.notifier.send(ServerMessage::Thought {
                thought: format!("[{}] {}", tier.label(), decision.thought),
            });

            let kind = decision.action.kind;
            if !kind.is_mutating() {
                self.record(observed, decision.clone(), None).await;
                let reason = decision.action.reason.unwrap_or_default();
                if kind == ActionKind::Finish {
                    if conclude(&self.status, SessionStatus::Succeeded) {
                        info!("goal achieved");
                        self.shared.notifier.send(ServerMessage::Success {
                            message: "Goal Achieved!".to_string(),
                        });
                    }
                } else if conclude(&self.status, SessionStatus::Failed) {
                    info!(reason = %reason, "agent declared failure");
                    self.shared
                        .notifier
                        .error(format!("Agent stopped: {reason}"));
                }
                return;
            }

            let description = decision
                .action
                .description
                .clone()
                .unwrap_or_else(|| format!("Executing {kind}"));
            self.shared
                .notifier
                .log(format!("Executing: {description}"));

            let outcome = self
                .shared
                .hands
                .execute(kind, &decision.action.target(), &observed.accessibility_snapshot)
                .await;
            self.session.history.push(decision.clone());
            let failure = match outcome {
                Ok(resolution) => {
                    debug!(?resolution, %kind, "action executed");
                    None
                }
                Err(e) => {
                    warn!(%kind, "action failed: {}", e);
                    self.shared.notifier.error(format!("Action Failed: {e}"));
                    self.session
                        .history
                        .push(Decision::fail_retry(&decision.plan, e.to_string()));
                    Some(e.to_string())
                }
            };

            let url = self.current_url().await;
            let screenshot = self.screenshot().await;
            let events = self.shared.browser.events().get_and_clear();
            self.send_state(&url, &screenshot, events);
            self.record(observed, decision, failure.clone()).await;

            if failure.is_some() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.shared.settings.action_backoff) => {}
                }
                continue;
            }

            if self.cancel.is_cancelled() {
                return;
            }
            if self.session.step_mode && !self.pause().await {
                return;
            }
        }
    }

    async fn observe(&self) -> ObservedState {
        let screenshot = self.screenshot().await;
        let raw_tree = match self.shared.browser.accessibility_tree().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("accessibility snapshot unavailable: {}", e);
                Vec::new()
            }
        };
        ObservedState {
            url: self.current_url().await,
            screenshot,
            accessibility_snapshot: filter_snapshot(&raw_tree),
            events: self.shared.browser.events().get_and_clear(),
        }
    }

    async fn screenshot(&self) -> Vec<u8> {
        self.shared.browser.screenshot().await.unwrap_or_else(|e| {
            warn!("screenshot failed: {}", e);
            Vec::new()
        })
    }

    async fn current_url(&self) -> String {
        self.shared
            .browser
            .current_url()
            .await
            .unwrap_or_else(|_| "Unknown".to_string())
    }

    async fn decide(&self, observed: &ObservedState, tier: ModelTier) -> Decision {
        let request = DecisionRequest {
            screenshot: &observed.screenshot,
            goal: &self.session.goal,
            history: &self.session.history,
            snapshot: &observed.accessibility_snapshot,
            events: &observed.events,
            tier,
        };
        let timeout = self.shared.settings.decision_timeout;
        let result = match tokio::time::timeout(timeout, self.shared.brain.decide(request)).await {
            Ok(result) => result,
            Err(_) => Err(DecisionError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
        };
        result.unwrap_or_else(|e| {
            warn!(tier = tier.label(), "decision failed: {}", e);
            Decision::synthetic_fail(format!("Agent error: {e}"))
        })
    }

    /// Blocks until NextStep (true) or Stop (false).
    async fn pause(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        while self.next_rx.try_recv().is_ok() {}
        if !transition(&self.status, SessionStatus::Running, SessionStatus::Paused) {
            return false;
        }
        self.shared.notifier.send(ServerMessage::Pause {
            message: "Step-by-Step Approval Needed.".to_string(),
        });
        info!("paused for approval");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            next = self.next_rx.recv() => {
                next.is_some()
                    && transition(&self.status, SessionStatus::Paused, SessionStatus::Running)
            }
        }
    }

    /// Writes the step to the report on the blocking pool, then appends it.
    async fn record(&mut self, observed: ObservedState, decision: Decision, outcome: Option<String>) {
        let index = self.session.steps.len() + 1;
        let report = Arc::clone(&self.shared.report);
        let written = tokio::task::spawn_blocking(move || {
            let result = report.log_step(index, &observed, &decision);
            (result, observed, decision)
        })
        .await;
        let (observed, decision) = match written {
            Ok((result, observed, decision)) => {
                if let Err(e) = result {
                    warn!(index, "could not record step: {}", e);
                }
                (observed, decision)
            }
            Err(e) => {
                warn!(index, "report task failed: {}", e);
                return;
            }
        };
        self.session.steps.push(Step {
            index,
            timestamp: Utc::now(),
            observed,
            decision,
            outcome,
        });
    }

    fn send_state(&self, url: &str, screenshot: &[u8], events: PageEvents) {
        self.shared.notifier.send(ServerMessage::State {
            screenshot: BASE64.encode(screenshot),
            url: url.to_string(),
            events,
        });
    }
}
