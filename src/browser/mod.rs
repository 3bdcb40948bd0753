//! Typed browser operations over the DevTools transport.
//!
//! Every operation returns only after the page has settled (readiness
//! plus a bounded network-quiet grace) or with a typed error. Input
//! simulation follows human timing: randomized inter-key delays, a
//! hover pause before clicks, and a post-action settle.

pub mod annotator;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BrowserLaunchConfig;
use crate::errors::BrowserError;

pub use annotator::{AnnotatedElement, AnnotationSummary, Annotator};
pub use transport::{ChromiumTransport, PageTransport, ScriptedTransport};

const FIND_CLICKABLE_SCRIPT: &str = include_str!("scripts/find_clickable.js");
const FIND_FIELD_SCRIPT: &str = include_str!("scripts/find_field.js");
const FIND_SEARCH_INPUT_SCRIPT: &str = include_str!("scripts/find_search_input.js");

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Wait policy for navigation; retries escalate from dom-ready to
/// network-idle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WaitPolicy {
    DomReady,
    NetworkIdle,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FrameInfo {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct LocatedPoint {
    found: bool,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

pub struct Browser {
    transport: Arc<dyn PageTransport>,
    annotator: Annotator,
    cfg: BrowserLaunchConfig,
    /// Isolated-world context for the currently selected frame, if any.
    frame_context: SyncMutex<Option<i64>>,
}

impl Browser {
    pub fn new(transport: Arc<dyn PageTransport>, cfg: BrowserLaunchConfig) -> Self {
        Self {
            annotator: Annotator::new(transport.clone()),
            transport,
            cfg,
            frame_context: SyncMutex::new(None),
        }
    }

    /// Launch a Chromium-backed browser from configuration.
    pub async fn launch(cfg: BrowserLaunchConfig) -> Result<Self, BrowserError> {
        let transport: Arc<dyn PageTransport> = Arc::new(ChromiumTransport::new(cfg.clone()));
        transport.start().await?;
        Ok(Self::new(transport, cfg))
    }

    pub fn annotator(&self) -> &Annotator {
        &self.annotator
    }

    pub fn viewport_height(&self) -> u32 {
        self.cfg.viewport_height
    }

    /// Navigate to an absolute URL. The first attempt waits for
    /// dom-content readiness; a retry escalates to network-idle.
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let parsed = Url::parse(url)
            .map_err(|err| BrowserError::TargetNotFound(format!("invalid url {url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BrowserError::TargetNotFound(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }

        self.exit_frame();
        let deadline = Duration::from_millis(self.cfg.navigation_deadline_ms);
        let mut last_err = None;

        for policy in [WaitPolicy::DomReady, WaitPolicy::NetworkIdle] {
            let response = self
                .transport
                .command("Page.navigate", json!({ "url": url }))
                .await?;
            if let Some(error_text) = response.get("errorText").and_then(Value::as_str) {
                if !error_text.is_empty() {
                    return Err(BrowserError::NavTimeout(format!(
                        "navigation to {url} failed: {error_text}"
                    )));
                }
            }

            match self.wait_for_ready(policy, deadline).await {
                Ok(()) => {
                    info!(url = %url, ?policy, "navigation settled");
                    return Ok(());
                }
                Err(err) => {
                    warn!(url = %url, ?policy, %err, "navigation wait not satisfied, escalating");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| BrowserError::NavTimeout(url.to_string())))
    }

    async fn wait_for_ready(
        &self,
        policy: WaitPolicy,
        deadline: Duration,
    ) -> Result<(), BrowserError> {
        let started = Instant::now();
        let settle = Duration::from_millis(self.cfg.settle_ms);

        loop {
            if started.elapsed() > deadline {
                return Err(BrowserError::NavTimeout(format!(
                    "page not ready within {deadline:?}"
                )));
            }

            let state = self
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_default();

            let ready = match policy {
                WaitPolicy::DomReady => state == "interactive" || state == "complete",
                WaitPolicy::NetworkIdle => {
                    state == "complete"
                        && self
                            .transport
                            .network_quiet_for()
                            .map(|quiet| quiet >= settle)
                            .unwrap_or(true)
                }
            };
            if ready {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Resolve an identifier to a clickable element and click it.
    ///
    /// Resolution is two-stage: exact then substring text match across
    /// the highlighted inventory (textContent, value, aria-label,
    /// title, placeholder), then the standard interactive selectors,
    /// and finally, for purely numeric identifiers, the numbered badge
    /// index assigned by the annotator.
    pub async fn click(&self, identifier: &str) -> Result<(), BrowserError> {
        let point = self
            .locate(FIND_CLICKABLE_SCRIPT, identifier)
            .await?
            .ok_or_else(|| BrowserError::TargetNotFound(identifier.to_string()))?;
        self.click_point(point.0, point.1).await?;
        self.settle_pause().await;
        Ok(())
    }

    /// Dispatch a click at viewport coordinates with a hover pause.
    pub async fn click_point(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        self.mouse_event("mouseMoved", x, y, 0).await?;
        tokio::time::sleep(human_delay(80, 220)).await;
        self.mouse_event("mousePressed", x, y, 1).await?;
        tokio::time::sleep(human_delay(20, 80)).await;
        self.mouse_event("mouseReleased", x, y, 1).await?;
        Ok(())
    }

    async fn mouse_event(
        &self,
        kind: &str,
        x: f64,
        y: f64,
        click_count: u32,
    ) -> Result<(), BrowserError> {
        self.transport
            .command(
                "Input.dispatchMouseEvent",
                json!({
                    "type": kind,
                    "x": x,
                    "y": y,
                    "button": if click_count > 0 { "left" } else { "none" },
                    "clickCount": click_count,
                }),
            )
            .await
            .map(|_| ())
    }

    /// Type into the field matched by `matcher` (placeholder, label,
    /// aria-label, name, or id; case-insensitive substring). Clears the
    /// field first, then types with randomized keystroke delays.
    /// Retries up to 3 times with a 1s backoff.
    pub async fn type_text(
        &self,
        matcher: &str,
        text: &str,
        press_enter: bool,
    ) -> Result<(), BrowserError> {
        let mut last_err = None;
        for attempt in 1..=3u32 {
            match self.try_type(matcher, text, press_enter).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(attempt, %err, "typing attempt failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BrowserError::TargetNotFound(matcher.to_string())))
    }

    async fn try_type(
        &self,
        matcher: &str,
        text: &str,
        press_enter: bool,
    ) -> Result<(), BrowserError> {
        let point = self
            .locate(FIND_FIELD_SCRIPT, matcher)
            .await?
            .ok_or_else(|| BrowserError::TargetNotFound(format!("input field '{matcher}'")))?;
        self.click_point(point.0, point.1).await?;
        self.clear_focused_field().await?;
        self.insert_text_slow(text).await?;
        if press_enter {
            self.press_enter().await?;
        }
        self.settle_pause().await;
        Ok(())
    }

    /// Locate the page's search input using the prioritized selector
    /// list, then type the query and submit.
    pub async fn search(&self, query: &str) -> Result<(), BrowserError> {
        let point = self
            .eval_locator(FIND_SEARCH_INPUT_SCRIPT, None)
            .await?
            .ok_or_else(|| BrowserError::TargetNotFound("search input".into()))?;
        self.click_point(point.0, point.1).await?;
        self.clear_focused_field().await?;
        self.insert_text_slow(query).await?;
        self.press_enter().await?;
        self.settle_pause().await;
        Ok(())
    }

    async fn clear_focused_field(&self) -> Result<(), BrowserError> {
        self.evaluate(
            "(() => { const el = document.activeElement; \
             if (el && 'value' in el) { el.select && el.select(); el.value = ''; \
             el.dispatchEvent(new Event('input', { bubbles: true })); } })()",
        )
        .await?;
        Ok(())
    }

    async fn insert_text_slow(&self, text: &str) -> Result<(), BrowserError> {
        for ch in text.chars() {
            self.transport
                .command(
                    "Input.insertText",
                    json!({ "text": ch.to_string() }),
                )
                .await?;
            tokio::time::sleep(human_delay(30, 120)).await;
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), BrowserError> {
        for kind in ["rawKeyDown", "char", "keyUp"] {
            self.transport
                .command(
                    "Input.dispatchKeyEvent",
                    json!({
                        "type": kind,
                        "key": "Enter",
                        "code": "Enter",
                        "text": "\r",
                        "windowsVirtualKeyCode": 13,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Scroll by `amount` pixels (defaults to one viewport height).
    pub async fn scroll(
        &self,
        direction: ScrollDirection,
        amount: Option<u32>,
    ) -> Result<(), BrowserError> {
        let pixels = amount.unwrap_or(self.cfg.viewport_height) as i64;
        let delta = match direction {
            ScrollDirection::Down => pixels,
            ScrollDirection::Up => -pixels,
        };
        self.evaluate(&format!("window.scrollBy(0, {delta})")).await?;
        self.settle_pause().await;
        Ok(())
    }

    /// Navigate one entry back in session history; a no-op at the start
    /// of history.
    pub async fn back(&self) -> Result<(), BrowserError> {
        let history = self
            .transport
            .command("Page.getNavigationHistory", json!({}))
            .await?;
        let current = history["currentIndex"].as_i64().unwrap_or(0);
        if current <= 0 {
            debug!("history is at its first entry; back is a no-op");
            return Ok(());
        }
        let entry_id = history["entries"][(current - 1) as usize]["id"]
            .as_i64()
            .ok_or_else(|| BrowserError::Io("navigation history entry missing id".into()))?;
        self.transport
            .command(
                "Page.navigateToHistoryEntry",
                json!({ "entryId": entry_id }),
            )
            .await?;
        self.wait_for_ready(
            WaitPolicy::DomReady,
            Duration::from_millis(self.cfg.navigation_deadline_ms),
        )
        .await
    }

    /// Capture the page state the decision loop feeds to the model:
    /// overlays are removed before capture and reapplied afterwards so
    /// the next turn's click resolution sees a fresh inventory.
    pub async fn capture_page_state(&self) -> Result<String, BrowserError> {
        self.annotator.clear().await?;
        let shot = self.screenshot_raw().await?;
        self.annotator.annotate().await?;
        Ok(shot)
    }

    /// Plain viewport JPEG as base64, no overlay juggling.
    pub async fn screenshot_raw(&self) -> Result<String, BrowserError> {
        let response = self
            .transport
            .command(
                "Page.captureScreenshot",
                json!({
                    "format": "jpeg",
                    "quality": self.cfg.screenshot_quality,
                }),
            )
            .await?;
        response["data"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Io("screenshot returned no data".into()))
    }

    /// Capture a clipped region of the viewport as base64 JPEG.
    pub async fn screenshot_clip(
        &self,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<String, BrowserError> {
        let response = self
            .transport
            .command(
                "Page.captureScreenshot",
                json!({
                    "format": "jpeg",
                    "quality": self.cfg.screenshot_quality,
                    "clip": { "x": x, "y": y, "width": width, "height": height, "scale": 1 },
                }),
            )
            .await?;
        response["data"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Io("clipped screenshot returned no data".into()))
    }

    /// Evaluate an expression in the current frame context.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let mut params = json!({
            "expression": expression,
            "returnByValue": true,
            "awaitPromise": true,
        });
        if let Some(context_id) = *self.frame_context.lock() {
            params["contextId"] = json!(context_id);
        }

        let response = self.transport.command("Runtime.evaluate", params).await?;
        if let Some(details) = response.get("exceptionDetails") {
            return Err(BrowserError::ScriptFailed(details.to_string()));
        }
        Ok(response["result"]["value"].clone())
    }

    /// List frames in the page, main frame first.
    pub async fn frames(&self) -> Result<Vec<FrameInfo>, BrowserError> {
        let tree = self
            .transport
            .command("Page.getFrameTree", json!({}))
            .await?;
        let mut frames = Vec::new();
        collect_frames(&tree["frameTree"], &mut frames);
        Ok(frames)
    }

    /// Select the first frame whose URL contains `url_fragment`;
    /// subsequent `evaluate` calls run inside it.
    pub async fn switch_to_frame(&self, url_fragment: &str) -> Result<(), BrowserError> {
        let frames = self.frames().await?;
        let frame = frames
            .iter()
            .find(|frame| frame.url.contains(url_fragment))
            .ok_or_else(|| BrowserError::FrameNotFound(url_fragment.to_string()))?;

        let world = self
            .transport
            .command(
                "Page.createIsolatedWorld",
                json!({ "frameId": frame.id, "worldName": "webpilot" }),
            )
            .await?;
        let context_id = world["executionContextId"]
            .as_i64()
            .ok_or_else(|| BrowserError::FrameNotFound("isolated world has no context".into()))?;
        *self.frame_context.lock() = Some(context_id);
        debug!(frame = %frame.url, "switched into frame");
        Ok(())
    }

    /// Return evaluation scope to the main frame.
    pub fn exit_frame(&self) {
        *self.frame_context.lock() = None;
    }

    pub async fn close(&self) -> Result<(), BrowserError> {
        self.transport.close().await
    }

    async fn locate(
        &self,
        script: &str,
        argument: &str,
    ) -> Result<Option<(f64, f64)>, BrowserError> {
        self.eval_locator(script, Some(argument)).await
    }

    async fn eval_locator(
        &self,
        script: &str,
        argument: Option<&str>,
    ) -> Result<Option<(f64, f64)>, BrowserError> {
        let call = match argument {
            Some(argument) => {
                let encoded = serde_json::to_string(argument)
                    .map_err(|err| BrowserError::ScriptFailed(err.to_string()))?;
                format!("({script})({encoded})")
            }
            None => format!("({script})()"),
        };
        let value = self.evaluate(&call).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| BrowserError::ScriptFailed("locator returned no payload".into()))?;
        let located: LocatedPoint = serde_json::from_str(raw)
            .map_err(|err| BrowserError::ScriptFailed(format!("locator payload invalid: {err}")))?;
        Ok(located.found.then_some((located.x, located.y)))
    }

    async fn settle_pause(&self) {
        tokio::time::sleep(human_delay(250, 600)).await;
    }
}

fn collect_frames(node: &Value, out: &mut Vec<FrameInfo>) {
    if let Some(frame) = node.get("frame") {
        if let (Some(id), Some(url)) = (frame["id"].as_str(), frame["url"].as_str()) {
            out.push(FrameInfo {
                id: id.to_string(),
                url: url.to_string(),
            });
        }
    }
    if let Some(children) = node.get("childFrames").and_then(Value::as_array) {
        for child in children {
            collect_frames(child, out);
        }
    }
}

fn human_delay(min_ms: u64, max_ms: u64) -> Duration {
    let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    Duration::from_millis(ms)
}
