use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point as ChromePoint;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::{Accessibility, DOM, Log, Page, Runtime};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use super::{BrowserDriver, LocatorAction, Point};
use crate::error::DriverError;
use crate::events::EventCollector;
use crate::types::AccessibilityNode;

const SCREENSHOT_QUALITY: u32 = 50;

#[derive(Debug, Clone)]
pub struct ChromeSettings {
    /// DevTools endpoint of an already running Chrome, e.g. `http://127.0.0.1:9222`.
    pub attach_url: Option<String>,
    pub executable: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
    pub headless: bool,
    pub window_size: (u32, u32),
    pub idle_browser_timeout: Duration,
}

impl Default for ChromeSettings {
    fn default() -> Self {
        Self {
            attach_url: None,
            executable: None,
            profile_dir: None,
            headless: false,
            window_size: (1280, 720),
            idle_browser_timeout: Duration::from_secs(600),
        }
    }
}

struct ChromeState {
    _browser: Browser,
    tab: Arc<Tab>,
}

/// Process-wide Chrome instance. Created once, reused for every session.
///
/// `headless_chrome` is synchronous, so every page call is moved onto the
/// blocking pool.
pub struct ChromeBrowser {
    settings: ChromeSettings,
    events: Arc<EventCollector>,
    state: Mutex<Option<ChromeState>>,
}

impl ChromeBrowser {
    pub fn new(settings: ChromeSettings) -> Self {
        Self {
            settings,
            events: Arc::new(EventCollector::new()),
            state: Mutex::new(None),
        }
    }

    fn tab(&self) -> Result<Arc<Tab>, DriverError> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|state| Arc::clone(&state.tab))
            .ok_or(DriverError::NoActivePage)
    }

    /// Runs `f` against the active tab on the blocking pool.
    async fn with_tab<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = self.tab()?;
        tokio::task::spawn_blocking(move || f(tab.as_ref()))
            .await
            .map_err(DriverError::protocol)?
            .map_err(DriverError::protocol)
    }

    async fn with_tab_timeout<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        match tokio::time::timeout(timeout, self.with_tab(f)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                operation,
                millis: timeout.as_millis() as u64,
            }),
        }
    }
}

fn launch(settings: &ChromeSettings, events: Arc<EventCollector>) -> anyhow::Result<ChromeState> {
    if let Some(url) = settings.attach_url.as_deref() {
        info!(url, "attaching to existing Chrome");
        match Browser::connect(url.to_string()) {
            Ok(browser) => {
                let existing = browser
                    .get_tabs()
                    .lock()
                    .map_err(|_| anyhow::anyhow!("tab list lock poisoned"))?
                    .first()
                    .cloned();
                let tab = match existing {
                    Some(tab) => {
                        debug!("using existing tab");
                        tab
                    }
                    None => browser.new_tab()?,
                };
                register_listeners(&tab, events)?;
                return Ok(ChromeState {
                    _browser: browser,
                    tab,
                });
            }
            Err(e) => warn!("could not attach ({}), launching a new Chrome", e),
        }
    }

    let profile_dir = match &settings.profile_dir {
        Some(dir) => dir.clone(),
        None => dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("nl-browser-pilot")
            .join("profile"),
    };
    std::fs::create_dir_all(&profile_dir)?;

    let options = LaunchOptions {
        headless: settings.headless,
        path: settings.executable.clone(),
        user_data_dir: Some(profile_dir),
        window_size: Some(settings.window_size),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: settings.idle_browser_timeout,
        ..Default::default()
    };

    info!(headless = settings.headless, "launching Chrome");
    let browser = Browser::new(options)?;
    let tab = browser.new_tab()?;
    tab.navigate_to("about:blank")?;
    register_listeners(&tab, events)?;
    info!("Chrome ready");

    Ok(ChromeState {
        _browser: browser,
        tab,
    })
}

/// Subscribes the collector to console, exception and log-domain events.
/// Called exactly once per tab, when the browser comes up.
fn register_listeners(tab: &Arc<Tab>, events: Arc<EventCollector>) -> anyhow::Result<()> {
    tab.call_method(Runtime::Enable(None))?;
    tab.call_method(Log::Enable(None))?;
    tab.call_method(Accessibility::Enable(None))?;

    tab.add_event_listener(Arc::new(move |event: &Event| match event {
        Event::RuntimeConsoleAPICalled(called) => {
            let text = called
                .params
                .args
                .iter()
                .map(|arg| match (&arg.value, &arg.description) {
                    (Some(serde_json::Value::String(s)), _) => s.clone(),
                    (Some(value), _) => value.to_string(),
                    (None, Some(description)) => description.clone(),
                    (None, None) => String::new(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            let kind = format!("{:?}", called.params.Type).to_lowercase();
            events.push_console(format!("[{kind}] {text}"));
        }
        Event::RuntimeExceptionThrown(thrown) => {
            events.push_error(format!(
                "Page Error: {}",
                thrown.params.exception_details.text
            ));
        }
        Event::LogEntryAdded(added) => {
            let entry = &added.params.entry;
            let source = entry.url.as_deref().unwrap_or("");
            events.push_error(format!("[{:?}] {} {}", entry.level, entry.text, source));
        }
        _ => {}
    }))?;
    Ok(())
}

#[async_trait]
impl BrowserDriver for ChromeBrowser {
    async fn start(&self) -> Result<(), DriverError> {
        if self.tab().is_ok() {
            return Ok(());
        }
        let settings = self.settings.clone();
        let events = Arc::clone(&self.events);
        let state = tokio::task::spawn_blocking(move || launch(&settings, events))
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?
            .map_err(|e| DriverError::Launch(format!("{e:#}")))?;

        let mut slot = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(state);
        }
        Ok(())
    }

    fn events(&self) -> &EventCollector {
        &self.events
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.with_tab(|tab| {
            tab.capture_screenshot(
                Page::CaptureScreenshotFormatOption::Jpeg,
                Some(SCREENSHOT_QUALITY),
                None,
                true,
            )
        })
        .await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn accessibility_tree(&self) -> Result<Vec<AccessibilityNode>, DriverError> {
        let tree = self
            .with_tab(|tab| {
                tab.call_method(Accessibility::GetFullAXTree {
                    depth: None,
                    frame_id: None,
                })
            })
            .await?;

        let text = |value: &Option<Accessibility::AXValue>| {
            value
                .as_ref()
                .and_then(|v| v.value.as_ref())
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };

        Ok(tree
            .nodes
            .iter()
            .map(|node| AccessibilityNode {
                id: node.node_id.clone(),
                role: text(&node.role),
                name: text(&node.name),
                backing_element_id: node.backend_dom_node_id.map(i64::from),
                ignored: node.ignored,
            })
            .collect())
    }

    async fn content_quad(&self, backend_node_id: i64) -> Result<Vec<f64>, DriverError> {
        let backend_node_id = u32::try_from(backend_node_id)
            .map_err(|_| DriverError::Protocol(format!("invalid backend node id {backend_node_id}")))?;
        let boxed = self
            .with_tab(move |tab| {
                tab.call_method(DOM::GetBoxModel {
                    node_id: None,
                    backend_node_id: Some(backend_node_id),
                    object_id: None,
                })
            })
            .await?;
        Ok(boxed.model.content)
    }

    async fn move_pointer(&self, to: Point) -> Result<(), DriverError> {
        self.with_tab(move |tab| {
            tab.move_mouse_to_point(ChromePoint { x: to.x, y: to.y })?;
            Ok(())
        })
        .await
    }

    async fn click_at(&self, at: Point) -> Result<(), DriverError> {
        self.with_tab(move |tab| {
            tab.click_point(ChromePoint { x: at.x, y: at.y })?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, text: &str) -> Result<(), DriverError> {
        let text = text.to_string();
        self.with_tab(move |tab| {
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_idle(&self, timeout: Duration) -> Result<(), DriverError> {
        self.with_tab_timeout("idle wait", timeout, |tab| {
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn highlight(&self, selector: &str) -> Result<(), DriverError> {
        let selector = serde_json::to_string(selector).map_err(DriverError::protocol)?;
        let script = format!(
            "(() => {{ const el = document.querySelector({selector}); \
             if (el) {{ el.style.outline = '4px solid #6d28d9'; el.style.outlineOffset = '2px'; \
             setTimeout(() => {{ el.style.outline = ''; }}, 2000); }} }})()"
        );
        self.with_tab(move |tab| {
            tab.evaluate(&script, false)?;
            Ok(())
        })
        .await
    }

    async fn locator_action(
        &self,
        action: LocatorAction,
        selector: &str,
        value: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let selector = selector.to_string();
        let value = value.unwrap_or_default().to_string();
        self.with_tab_timeout("locator action", timeout + Duration::from_secs(1), move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            match action {
                LocatorAction::Click => {
                    element.click()?;
                }
                LocatorAction::Fill => {
                    element.call_js_fn("function() { this.value = ''; }", vec![], false)?;
                    element.type_into(&value)?;
                }
                LocatorAction::Hover => {
                    element.move_mouse_over()?;
                }
                LocatorAction::ScrollIntoView => {
                    element.scroll_into_view()?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let url = url.to_string();
        self.with_tab_timeout("navigation", timeout, move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        let key = key.to_string();
        self.with_tab(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), DriverError> {
        self.with_tab(move |tab| {
            tab.evaluate(&format!("window.scrollBy({dx}, {dy})"), false)?;
            Ok(())
        })
        .await
    }
}
