//! The agent's hands: the browser seam and the interaction layer built on it.
//!
//! `BrowserDriver` is the only place the rest of the crate touches the
//! browser. `chrome` implements it on top of a real Chrome instance;
//! `interact` turns an abstract action into driver calls through its tiered
//! fallback chain.

pub mod chrome;
pub mod interact;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::events::EventCollector;
use crate::types::AccessibilityNode;

pub use chrome::{ChromeBrowser, ChromeSettings};
pub use interact::{InteractionLayer, InteractionSettings, Resolution};

/// A viewport coordinate in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Element actions performed through the driver's own locator API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorAction {
    Click,
    Fill,
    Hover,
    ScrollIntoView,
}

/// The shared browser resource.
///
/// One instance is shared by every session of the process; the orchestrator
/// guarantees only one session drives it at a time. Every page operation
/// fails with `DriverError::NoActivePage` until `start` has succeeded.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launches or attaches to the browser. Idempotent.
    async fn start(&self) -> Result<(), DriverError>;

    /// Collector fed by the listeners registered at start.
    fn events(&self) -> &EventCollector;

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// The full, unfiltered accessibility tree of the active page.
    async fn accessibility_tree(&self) -> Result<Vec<AccessibilityNode>, DriverError>;

    /// Content quad of a DOM element as `[x1, y1, x2, y2, x3, y3, x4, y4]`.
    async fn content_quad(&self, backend_node_id: i64) -> Result<Vec<f64>, DriverError>;

    async fn move_pointer(&self, to: Point) -> Result<(), DriverError>;

    async fn click_at(&self, at: Point) -> Result<(), DriverError>;

    /// Types into whatever currently holds focus.
    async fn type_text(&self, text: &str) -> Result<(), DriverError>;

    /// Waits for in-flight loading to settle, up to `timeout`.
    async fn wait_for_idle(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Briefly outlines the element matching `selector`.
    async fn highlight(&self, selector: &str) -> Result<(), DriverError>;

    async fn locator_action(
        &self,
        action: LocatorAction,
        selector: &str,
        value: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), DriverError>;
}
