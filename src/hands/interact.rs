use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{BrowserDriver, LocatorAction, Point};
use crate::error::{DriverError, InteractionError};
use crate::types::{AccessibilityNode, ActionKind, TargetDescriptor};

/// Which tier ended up performing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Pointer/keyboard input at coordinates taken from the accessibility node.
    Protocol,
    /// The driver's element locator API.
    Locator,
    /// Navigation, key press, viewport scroll or wait.
    Primitive,
    /// Nothing was applicable; the action was a no-op.
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct InteractionSettings {
    /// Intermediate pointer positions emitted before acting on coordinates.
    pub pointer_steps: usize,
    pub idle_timeout: Duration,
    pub locator_timeout: Duration,
    pub navigation_timeout: Duration,
    pub highlight_delay: Duration,
    pub scroll_delta: f64,
    pub wait_interval: Duration,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self {
            pointer_steps: 10,
            idle_timeout: Duration::from_secs(5),
            locator_timeout: Duration::from_secs(5),
            navigation_timeout: Duration::from_secs(30),
            highlight_delay: Duration::from_millis(300),
            scroll_delta: 500.0,
            wait_interval: Duration::from_secs(1),
        }
    }
}

/// Resolves an action and its target into browser effects.
///
/// Tiers are tried in order, each only when the previous one was not
/// applicable or failed:
///
/// 1. protocol: node id → backing element → quad centre → pointer input;
/// 2. locator: selector string through the driver's locator API;
/// 3. primitive: navigate, press, viewport scroll, wait.
///
/// Protocol failures are swallowed. A locator failure is reported only when
/// no primitive picks the action up afterwards.
pub struct InteractionLayer {
    driver: Arc<dyn BrowserDriver>,
    settings: InteractionSettings,
    pointer: Mutex<Point>,
}

impl InteractionLayer {
    pub fn new(driver: Arc<dyn BrowserDriver>, settings: InteractionSettings) -> Self {
        Self {
            driver,
            settings,
            pointer: Mutex::new(Point::default()),
        }
    }

    /// Executes `kind` against `target`. `snapshot` must be the filtered
    /// accessibility snapshot observed in the current cycle.
    pub async fn execute(
        &self,
        kind: ActionKind,
        target: &TargetDescriptor,
        snapshot: &[AccessibilityNode],
    ) -> Result<Resolution, InteractionError> {
        if let Some(node_id) = target.node_id.as_deref() {
            if matches!(kind, ActionKind::Click | ActionKind::Type | ActionKind::Hover) {
                match self
                    .protocol_tier(kind, node_id, target.value.as_deref(), snapshot)
                    .await
                {
                    Ok(()) => {
                        info!(%kind, node_id, "action resolved via protocol tier");
                        return Ok(Resolution::Protocol);
                    }
                    Err(DriverError::NoActivePage) => return Err(InteractionError::NoActivePage),
                    Err(e) => warn!(%kind, node_id, "protocol tier failed, falling back: {}", e),
                }
            }
        }

        let mut locator_failure = None;
        if let Some(selector) = target.selector.as_deref() {
            if matches!(
                kind,
                ActionKind::Click | ActionKind::Type | ActionKind::Hover | ActionKind::Scroll
            ) {
                match self
                    .locator_tier(kind, selector, target.value.as_deref())
                    .await
                {
                    Ok(()) => {
                        info!(%kind, selector, "action resolved via locator tier");
                        return Ok(Resolution::Locator);
                    }
                    Err(DriverError::NoActivePage) => return Err(InteractionError::NoActivePage),
                    Err(e) => {
                        warn!(%kind, selector, "locator tier failed: {}", e);
                        locator_failure = Some(e);
                    }
                }
            }
        }

        match self.primitive_tier(kind, target).await {
            Ok(true) => {
                info!(%kind, "action resolved via primitive tier");
                Ok(Resolution::Primitive)
            }
            Ok(false) => match locator_failure {
                Some(cause) => Err(InteractionError::Exhausted { kind, cause }),
                None => {
                    info!(%kind, ?target, "no tier satisfied the action; treating as no-op");
                    Ok(Resolution::Unresolved)
                }
            },
            Err(e) => Err(InteractionError::from_driver(kind, e)),
        }
    }

    async fn protocol_tier(
        &self,
        kind: ActionKind,
        node_id: &str,
        value: Option<&str>,
        snapshot: &[AccessibilityNode],
    ) -> Result<(), DriverError> {
        let node = snapshot
            .iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| DriverError::Protocol(format!("node {node_id} not in snapshot")))?;
        let backend_id = node.backing_element_id.ok_or_else(|| {
            DriverError::Protocol(format!("node {node_id} has no backing element"))
        })?;

        let quad = self.driver.content_quad(backend_id).await?;
        let center = quad_center(&quad).ok_or_else(|| {
            DriverError::Protocol(format!("malformed quad for element {backend_id}"))
        })?;
        debug!(node_id, backend_id, x = center.x, y = center.y, "protocol target");

        self.glide_pointer(center).await?;
        match kind {
            ActionKind::Click => self.driver.click_at(center).await?,
            ActionKind::Type => {
                self.driver.click_at(center).await?;
                self.driver.type_text(value.unwrap_or_default()).await?;
            }
            _ => {}
        }
        self.settle().await;
        Ok(())
    }

    async fn locator_tier(
        &self,
        kind: ActionKind,
        selector: &str,
        value: Option<&str>,
    ) -> Result<(), DriverError> {
        if let Err(e) = self.driver.highlight(selector).await {
            debug!(selector, "highlight skipped: {}", e);
        } else {
            tokio::time::sleep(self.settings.highlight_delay).await;
        }

        let action = match kind {
            ActionKind::Type => LocatorAction::Fill,
            ActionKind::Hover => LocatorAction::Hover,
            ActionKind::Scroll => LocatorAction::ScrollIntoView,
            _ => LocatorAction::Click,
        };
        self.driver
            .locator_action(action, selector, value, self.settings.locator_timeout)
            .await?;
        self.settle().await;
        Ok(())
    }

    /// Returns `Ok(false)` when no primitive applies to the action.
    async fn primitive_tier(
        &self,
        kind: ActionKind,
        target: &TargetDescriptor,
    ) -> Result<bool, DriverError> {
        match kind {
            ActionKind::Navigate => {
                let Some(raw) = target.value.as_deref().or(target.selector.as_deref()) else {
                    return Ok(false);
                };
                let url = normalize_url(raw);
                info!(url = %url, "navigating");
                match self
                    .driver
                    .navigate(&url, self.settings.navigation_timeout)
                    .await
                {
                    Ok(()) => self.settle().await,
                    Err(DriverError::NoActivePage) => return Err(DriverError::NoActivePage),
                    Err(e) => warn!(url = %url, "navigation warning: {}", e),
                }
                Ok(true)
            }
            ActionKind::Press => {
                let Some(key) = target.value.as_deref() else {
                    return Ok(false);
                };
                self.driver.press_key(key).await?;
                self.settle().await;
                Ok(true)
            }
            ActionKind::Scroll if target.selector.is_none() => {
                self.driver.scroll_by(0.0, self.settings.scroll_delta).await?;
                Ok(true)
            }
            ActionKind::Wait => {
                tokio::time::sleep(self.settings.wait_interval).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Walks the pointer from its last position to `to` in several moves;
    /// some pages only enable controls after seeing pointer movement.
    async fn glide_pointer(&self, to: Point) -> Result<(), DriverError> {
        let from = *self.pointer.lock().unwrap_or_else(|p| p.into_inner());
        for point in interpolate(from, to, self.settings.pointer_steps) {
            self.driver.move_pointer(point).await?;
        }
        *self.pointer.lock().unwrap_or_else(|p| p.into_inner()) = to;
        Ok(())
    }

    async fn settle(&self) {
        if let Err(e) = self.driver.wait_for_idle(self.settings.idle_timeout).await {
            warn!("page did not go idle, continuing: {}", e);
        }
    }
}

/// Arithmetic mean of the four corners of a content quad.
pub fn quad_center(quad: &[f64]) -> Option<Point> {
    if quad.len() < 8 {
        return None;
    }
    let x = (quad[0] + quad[2] + quad[4] + quad[6]) / 4.0;
    let y = (quad[1] + quad[3] + quad[5] + quad[7]) / 4.0;
    Some(Point::new(x, y))
}

/// `steps` evenly spaced points from just after `from` up to and including `to`.
pub fn interpolate(from: Point, to: Point, steps: usize) -> Vec<Point> {
    let steps = steps.max(1);
    (1..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            Point::new(from.x + (to.x - from.x) * t, from.y + (to.y - from.y) * t)
        })
        .collect()
}

/// Adds `https://` to bare hosts such as `example.com/path`.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let has_scheme = raw.contains("://")
        || ["about:", "data:", "file:", "javascript:"]
            .iter()
            .any(|scheme| raw.starts_with(scheme));
    if has_scheme {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}
