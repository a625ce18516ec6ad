//! WebSocket front end. Each connection gets its own orchestrator; all of
//! them share one browser, one decision service and one report sink.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::brain::DecisionService;
use crate::hands::{BrowserDriver, InteractionSettings};
use crate::orchestrator::{LoopSettings, Notifier, Orchestrator};
use crate::report::{FileReport, ReportSummary};
use crate::types::ControlMessage;

/// How many ports above the configured one are tried before giving up.
const PORT_FALLBACK_SPAN: u16 = 10;

pub struct AppState {
    pub browser: Arc<dyn BrowserDriver>,
    pub brain: Arc<dyn DecisionService>,
    pub reports: Arc<FileReport>,
    pub loop_settings: LoopSettings,
    pub interaction: InteractionSettings,
    lease: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        brain: Arc<dyn DecisionService>,
        reports: Arc<FileReport>,
        loop_settings: LoopSettings,
        interaction: InteractionSettings,
    ) -> Self {
        Self {
            browser,
            brain,
            reports,
            loop_settings,
            interaction,
            lease: Arc::new(Semaphore::new(1)),
        }
    }

    fn orchestrator(&self, notifier: Notifier) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.browser),
            Arc::clone(&self.brain),
            self.reports.clone(),
            notifier,
            self.loop_settings.clone(),
            self.interaction.clone(),
        )
        .with_browser_lease(Arc::clone(&self.lease))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/reports", get(reports_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

/// Binds `host:port`, falling back to the next free port, and serves until
/// the server fails.
pub async fn serve(host: &str, port: u16, state: AppState) -> Result<()> {
    let listener = bind(host, port).await?;
    let address = listener.local_addr()?;
    info!("agent listening on ws://{}/ws", address);

    axum::serve(listener, router(Arc::new(state)))
        .await
        .context("server stopped")
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    for candidate in port..port.saturating_add(PORT_FALLBACK_SPAN) {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port = candidate, "port unavailable: {}", e),
        }
    }
    Err(anyhow!(
        "could not bind to any port {}-{} on {}; is another agent running?",
        port,
        port.saturating_add(PORT_FALLBACK_SPAN - 1),
        host
    ))
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "Backend is running"}))
}

async fn reports_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ReportSummary>>, (StatusCode, String)> {
    let reports = Arc::clone(&state.reports);
    tokio::task::spawn_blocking(move || reports.list_reports())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Control messages are queued to a dispatcher task; the socket task itself
/// never waits on the orchestrator.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    info!("client connected");
    let (notifier, mut outbound) = Notifier::channel();
    let orchestrator = Arc::new(state.orchestrator(notifier));
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();

    let dispatcher = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            while let Some(message) = control_rx.recv().await {
                orchestrator.process_message(message).await;
            }
        }
    });

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => match ControlMessage::parse(text.as_str()) {
                    Some(message) => {
                        debug!(?message, "control message");
                        if control_tx.send(message).is_err() {
                            break;
                        }
                    }
                    None => warn!("ignoring unrecognised message: {}", text.as_str()),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("websocket error: {}", e);
                    break;
                }
            },
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("could not encode notification: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("client disconnected");
    drop(control_tx);
    if let Err(e) = dispatcher.await {
        warn!("dispatcher ended abnormally: {}", e);
    }
    orchestrator.shutdown().await;
}
