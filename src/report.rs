use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ReportError;
use crate::types::{Action, Decision, ObservedState, SessionStatus};

/// Receives the session record. One session is open at a time; a new
/// `start_session` replaces the previous one.
pub trait ReportSink: Send + Sync {
    fn start_session(&self, goal: &str) -> Result<(), ReportError>;

    fn log_step(
        &self,
        index: usize,
        observed: &ObservedState,
        decision: &Decision,
    ) -> Result<(), ReportError>;

    fn end_session(&self, status: SessionStatus) -> Result<(), ReportError>;

    /// Where the current session's report can be fetched, if one is open.
    fn current_report_location(&self) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub screenshot: Option<String>,
    pub thought: String,
    pub plan: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportData {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub goal: String,
    pub status: String,
    pub steps: Vec<StepRecord>,
}

/// Listing entry for a stored report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub goal: String,
    pub status: String,
    pub step_count: usize,
}

struct OpenReport {
    dir: PathBuf,
    data: ReportData,
}

/// Writes `report.json` plus one JPEG per step under
/// `<base_dir>/<timestamp>_<goal slug>/`.
pub struct FileReport {
    base_dir: PathBuf,
    base_url: String,
    current: Mutex<Option<OpenReport>>,
}

impl FileReport {
    pub fn new(base_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self, ReportError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            base_url: base_url.into(),
            current: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenReport>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Summaries of every stored report, newest first.
    pub fn list_reports(&self) -> Result<Vec<ReportSummary>, ReportError> {
        let mut reports = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path().join("report.json");
            if !path.is_file() {
                continue;
            }
            let data: ReportData = match fs::read_to_string(&path)
                .map_err(ReportError::from)
                .and_then(|text| serde_json::from_str(&text).map_err(ReportError::from))
            {
                Ok(data) => data,
                Err(e) => {
                    debug!(path = %path.display(), "skipping unreadable report: {}", e);
                    continue;
                }
            };
            reports.push(ReportSummary {
                id: entry.file_name().to_string_lossy().into_owned(),
                start_time: data.start_time,
                goal: data.goal,
                status: data.status,
                step_count: data.steps.len(),
            });
        }
        reports.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(reports)
    }
}

fn session_id(goal: &str) -> String {
    let slug: String = goal
        .chars()
        .take(20)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), slug)
}

fn save(report: &OpenReport) -> Result<(), ReportError> {
    let json = serde_json::to_string_pretty(&report.data)?;
    fs::write(report.dir.join("report.json"), json)?;
    Ok(())
}

fn write_screenshot(dir: &Path, index: usize, bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let name = format!("step_{index}.jpg");
    match fs::write(dir.join(&name), bytes) {
        Ok(()) => Some(name),
        Err(e) => {
            warn!(index, "failed to save screenshot: {}", e);
            None
        }
    }
}

impl ReportSink for FileReport {
    fn start_session(&self, goal: &str) -> Result<(), ReportError> {
        // A failed start must not leave the previous session's report open.
        *self.lock() = None;
        let id = session_id(goal);
        let dir = self.base_dir.join(&id);
        fs::create_dir_all(&dir)?;

        let report = OpenReport {
            dir,
            data: ReportData {
                session_id: id.clone(),
                start_time: Utc::now(),
                end_time: None,
                goal: goal.to_string(),
                status: SessionStatus::Running.report_label().to_string(),
                steps: Vec::new(),
            },
        };
        save(&report)?;
        *self.lock() = Some(report);
        info!(session = %id, "report session started");
        Ok(())
    }

    fn log_step(
        &self,
        index: usize,
        observed: &ObservedState,
        decision: &Decision,
    ) -> Result<(), ReportError> {
        let mut current = self.lock();
        let Some(report) = current.as_mut() else {
            return Ok(());
        };
        let screenshot = write_screenshot(&report.dir, index, &observed.screenshot);
        report.data.steps.push(StepRecord {
            step_index: index,
            timestamp: Utc::now(),
            url: observed.url.clone(),
            screenshot,
            thought: decision.thought.clone(),
            plan: decision.plan.clone(),
            action: decision.action.clone(),
        });
        save(report)
    }

    fn end_session(&self, status: SessionStatus) -> Result<(), ReportError> {
        let mut current = self.lock();
        let Some(report) = current.as_mut() else {
            return Ok(());
        };
        report.data.status = status.report_label().to_string();
        report.data.end_time = Some(Utc::now());
        info!(status = status.report_label(), "report session ended");
        save(report)
    }

    fn current_report_location(&self) -> Option<String> {
        self.lock().as_ref().map(|report| {
            format!(
                "{}/{}/report.json",
                self.base_url.trim_end_matches('/'),
                report.data.session_id
            )
        })
    }
}
