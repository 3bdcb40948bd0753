//! Captcha detection and solving.
//!
//! Detection looks for a fixed set of visibility-constrained surfaces.
//! Solving starts with the strategy matching the detected surface (or
//! a cached per-host hint) and falls back to the remaining strategies
//! in canonical order: reCAPTCHA checkbox plus its tile challenge with
//! the vision model, then hCaptcha, then a generic text/image captcha.
//! Every attempt is verified by re-running detection.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::errors::{BrowserError, CaptchaError};
use crate::events::{EventSink, ServerEvent};
use crate::llm::{LanguageModel, Part, Role, Turn};
use crate::metrics;

const DETECT_SCRIPT: &str = include_str!("scripts/detect.js");
const RECAPTCHA_TILES_SCRIPT: &str = include_str!("scripts/recaptcha_tiles.js");

const ANCHOR_FRAME_FRAGMENT: &str = "recaptcha/api2/anchor";
const CHALLENGE_FRAME_FRAGMENT: &str = "api2/bframe";
const CHECKBOX_CLICK_ATTEMPTS: u32 = 3;
const CHALLENGE_ATTEMPTS: u32 = 5;
const CONTINUOUS_ROUNDS_CAP: u32 = 8;
const HINT_TTL: Duration = Duration::from_secs(600);

const TILE_SYSTEM_PROMPT: &str = "You are solving an image-selection captcha. \
You will receive an instruction and numbered tile images. Reply with ONLY the \
comma-separated numbers of the tiles matching the instruction, or 0 if none match.";

const TEXT_SYSTEM_PROMPT: &str = "You are reading a text captcha from a screenshot. \
Reply with ONLY a JSON object of the form \
{\"field_hint\": \"<placeholder or label of the answer input>\", \"answer\": \"<captcha answer>\"}.";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaptchaKind {
    Recaptcha,
    Hcaptcha,
    Text,
}

/// A qualifying captcha surface on the current page.
#[derive(Clone, Debug)]
pub struct Detection {
    pub kind: CaptchaKind,
    pub selector: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Strategy {
    RecaptchaAnchor,
    Hcaptcha,
    TextImage,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::RecaptchaAnchor => "recaptcha",
            Strategy::Hcaptcha => "hcaptcha",
            Strategy::TextImage => "text-image",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub enum SolveReport {
    NotPresent,
    Solved { strategy: Strategy },
}

struct HintEntry {
    strategy: Strategy,
    recorded_at: Instant,
}

static STRATEGY_HINTS: Lazy<DashMap<String, HintEntry>> = Lazy::new(DashMap::new);

fn hint_for(host: &str) -> Option<Strategy> {
    if let Some(entry) = STRATEGY_HINTS.get(host) {
        if entry.recorded_at.elapsed() < HINT_TTL {
            return Some(entry.strategy);
        }
    }
    STRATEGY_HINTS.remove(host);
    None
}

fn record_hint(host: &str, strategy: Strategy) {
    STRATEGY_HINTS.insert(
        host.to_string(),
        HintEntry {
            strategy,
            recorded_at: Instant::now(),
        },
    );
}

#[derive(Debug, Deserialize)]
struct DetectPayload {
    kind: Option<String>,
    #[serde(default)]
    selector: String,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

/// Scan the page for a qualifying captcha surface.
pub async fn detect(browser: &Browser) -> Result<Option<Detection>, BrowserError> {
    browser.exit_frame();
    let value = browser
        .evaluate(&format!("({DETECT_SCRIPT})()"))
        .await?;
    let raw = value
        .as_str()
        .ok_or_else(|| BrowserError::ScriptFailed("detection returned no payload".into()))?;
    let payload: DetectPayload = serde_json::from_str(raw)
        .map_err(|err| BrowserError::ScriptFailed(format!("detection payload invalid: {err}")))?;

    let kind = match payload.kind.as_deref() {
        Some("recaptcha") => CaptchaKind::Recaptcha,
        Some("hcaptcha") => CaptchaKind::Hcaptcha,
        Some("text") => CaptchaKind::Text,
        _ => return Ok(None),
    };
    Ok(Some(Detection {
        kind,
        selector: payload.selector,
        x: payload.x,
        y: payload.y,
    }))
}

/// Detect, emit events, and solve. Used as the pre-check by both the
/// decision loop and the replay engine.
pub async fn precheck(
    browser: &Browser,
    vision: &dyn LanguageModel,
    sink: &dyn EventSink,
) -> Result<SolveReport, CaptchaError> {
    let Some(_) = detect(browser).await? else {
        return Ok(SolveReport::NotPresent);
    };
    sink.emit(ServerEvent::CaptchaDetected);
    let report = solve_if_present(browser, vision).await?;
    if matches!(report, SolveReport::Solved { .. }) {
        sink.emit(ServerEvent::CaptchaSolved);
    }
    Ok(report)
}

/// Solve whatever captcha is on the page, if any.
pub async fn solve_if_present(
    browser: &Browser,
    vision: &dyn LanguageModel,
) -> Result<SolveReport, CaptchaError> {
    let Some(detection) = detect(browser).await? else {
        return Ok(SolveReport::NotPresent);
    };
    metrics::record_captcha("detected");
    info!(kind = ?detection.kind, selector = %detection.selector, "captcha detected");

    let host = browser
        .evaluate("window.location.host")
        .await
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();

    for strategy in strategy_order(&detection, hint_for(&host)) {
        let attempt = match strategy {
            Strategy::RecaptchaAnchor => try_recaptcha(browser, vision).await,
            Strategy::Hcaptcha => try_hcaptcha(browser).await,
            Strategy::TextImage => try_text_image(browser, vision).await,
        };
        browser.exit_frame();

        match attempt {
            Ok(true) => {
                // Solved iff no qualifying surface remains.
                if detect(browser).await?.is_none() {
                    metrics::record_captcha("solved");
                    if !host.is_empty() {
                        record_hint(&host, strategy);
                    }
                    info!(%strategy, "captcha solved");
                    return Ok(SolveReport::Solved { strategy });
                }
                debug!(%strategy, "strategy reported success but captcha persists");
            }
            Ok(false) => debug!(%strategy, "strategy not applicable or unsuccessful"),
            Err(err) => warn!(%strategy, %err, "captcha strategy errored"),
        }
    }

    metrics::record_captcha("failed");
    Err(CaptchaError::Unsolvable(format!(
        "all strategies exhausted for {:?}",
        detection.kind
    )))
}

/// Strategies in canonical order, rotated so the hinted (or detected)
/// strategy runs first.
fn strategy_order(detection: &Detection, hint: Option<Strategy>) -> Vec<Strategy> {
    let canonical = [
        Strategy::RecaptchaAnchor,
        Strategy::Hcaptcha,
        Strategy::TextImage,
    ];
    let preferred = hint.unwrap_or(match detection.kind {
        CaptchaKind::Recaptcha => Strategy::RecaptchaAnchor,
        CaptchaKind::Hcaptcha => Strategy::Hcaptcha,
        CaptchaKind::Text => Strategy::TextImage,
    });

    let mut order = vec![preferred];
    order.extend(canonical.iter().copied().filter(|s| *s != preferred));
    order
}

#[derive(Debug, Deserialize)]
struct FrameRect {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

/// Viewport-relative origin of the first element matching `selector`.
async fn element_rect(browser: &Browser, selector: &str) -> Result<Option<FrameRect>, BrowserError> {
    let encoded = serde_json::to_string(selector)
        .map_err(|err| BrowserError::ScriptFailed(err.to_string()))?;
    let expr = format!(
        "(() => {{ const el = document.querySelector({encoded}); \
         if (!el) return JSON.stringify({{ found: false }}); \
         const r = el.getBoundingClientRect(); \
         return JSON.stringify({{ found: true, x: r.left, y: r.top, width: r.width, height: r.height }}); }})()"
    );
    let value = browser.evaluate(&expr).await?;
    let raw = value
        .as_str()
        .ok_or_else(|| BrowserError::ScriptFailed("rect probe returned no payload".into()))?;
    let rect: FrameRect = serde_json::from_str(raw)
        .map_err(|err| BrowserError::ScriptFailed(format!("rect payload invalid: {err}")))?;
    Ok(rect.found.then_some(rect))
}

async fn try_recaptcha(
    browser: &Browser,
    vision: &dyn LanguageModel,
) -> Result<bool, CaptchaError> {
    // Anchor checkbox first: scroll it into view and click, retrying.
    browser.exit_frame();
    let Some(anchor_rect) =
        element_rect(browser, "iframe[src*='recaptcha/api2/anchor']").await?
    else {
        return Ok(false);
    };

    browser.switch_to_frame(ANCHOR_FRAME_FRAGMENT).await?;
    for attempt in 1..=CHECKBOX_CLICK_ATTEMPTS {
        let checkbox = browser
            .evaluate(
                "(() => { const el = document.querySelector('#recaptcha-anchor'); \
                 if (!el) return JSON.stringify({ found: false }); \
                 el.scrollIntoView({ block: 'center' }); \
                 const r = el.getBoundingClientRect(); \
                 return JSON.stringify({ found: true, x: r.left + r.width / 2, y: r.top + r.height / 2 }); })()",
            )
            .await?;
        let point: Value = checkbox
            .as_str()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null);
        if !point["found"].as_bool().unwrap_or(false) {
            return Ok(false);
        }

        browser
            .click_point(
                anchor_rect.x + point["x"].as_f64().unwrap_or(0.0),
                anchor_rect.y + point["y"].as_f64().unwrap_or(0.0),
            )
            .await?;
        tokio::time::sleep(Duration::from_millis(800)).await;

        let checked = browser
            .evaluate(
                "(() => { const el = document.querySelector('#recaptcha-anchor'); \
                 return el ? el.getAttribute('aria-checked') === 'true' : false; })()",
            )
            .await?;
        if checked.as_bool().unwrap_or(false) {
            debug!(attempt, "recaptcha checkbox accepted");
            return Ok(true);
        }
    }

    // Checkbox alone was not enough; work the tile challenge.
    browser.exit_frame();
    solve_recaptcha_challenge(browser, vision).await
}

async fn solve_recaptcha_challenge(
    browser: &Browser,
    vision: &dyn LanguageModel,
) -> Result<bool, CaptchaError> {
    let Some(frame_rect) = element_rect(browser, "iframe[src*='api2/bframe']").await? else {
        return Ok(false);
    };
    browser.switch_to_frame(CHALLENGE_FRAME_FRAGMENT).await?;

    for attempt in 1..=CHALLENGE_ATTEMPTS {
        let challenge = read_challenge(browser).await?;
        if challenge.tiles.is_empty() {
            return Ok(false);
        }
        let continuous = challenge
            .instructions
            .to_lowercase()
            .contains("once there are none left");
        debug!(attempt, continuous, instructions = %challenge.instructions, "recaptcha challenge");

        let mut rounds = 0;
        loop {
            rounds += 1;
            let state = read_challenge(browser).await?;
            let unselected: Vec<&Tile> =
                state.tiles.iter().filter(|tile| !tile.selected).collect();
            if unselected.is_empty() {
                break;
            }

            let selected = pick_tiles(browser, vision, &frame_rect, &challenge.instructions, &unselected)
                .await?;
            if selected.is_empty() {
                break;
            }
            for index in &selected {
                if let Some(tile) = state.tiles.iter().find(|tile| tile.index == *index) {
                    browser
                        .click_point(
                            frame_rect.x + tile.x + tile.width / 2.0,
                            frame_rect.y + tile.y + tile.height / 2.0,
                        )
                        .await?;
                }
            }
            tokio::time::sleep(Duration::from_millis(1_200)).await;

            if !continuous || rounds >= CONTINUOUS_ROUNDS_CAP {
                break;
            }
        }

        let state = read_challenge(browser).await?;
        if let Some(verify) = state.verify {
            browser
                .click_point(frame_rect.x + verify.x, frame_rect.y + verify.y)
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let state = read_challenge(browser).await.unwrap_or(Challenge {
            instructions: String::new(),
            tiles: Vec::new(),
            verify: None,
            incorrect: false,
        });
        if !state.incorrect {
            return Ok(true);
        }
        warn!(attempt, "recaptcha reported an incorrect response, retrying");
    }

    Ok(false)
}

#[derive(Debug, Deserialize)]
struct Tile {
    index: u32,
    selected: bool,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct VerifyPoint {
    x: f64,
    y: f64,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    tiles: Vec<Tile>,
    #[serde(default)]
    verify: Option<VerifyPoint>,
    #[serde(default)]
    incorrect: bool,
}

async fn read_challenge(browser: &Browser) -> Result<Challenge, CaptchaError> {
    let value = browser
        .evaluate(&format!("({RECAPTCHA_TILES_SCRIPT})()"))
        .await?;
    let raw = value.as_str().ok_or_else(|| {
        CaptchaError::Browser(BrowserError::ScriptFailed(
            "challenge probe returned no payload".into(),
        ))
    })?;
    serde_json::from_str(raw).map_err(|err| {
        CaptchaError::Browser(BrowserError::ScriptFailed(format!(
            "challenge payload invalid: {err}"
        )))
    })
}

/// Capture each unselected tile and ask the vision model which match.
async fn pick_tiles(
    browser: &Browser,
    vision: &dyn LanguageModel,
    frame_rect: &FrameRect,
    instructions: &str,
    unselected: &[&Tile],
) -> Result<Vec<u32>, CaptchaError> {
    let mut turn = Turn::text(
        Role::User,
        format!("Instruction: {instructions}\nTiles follow, numbered in order."),
    );
    for tile in unselected {
        let shot = browser
            .screenshot_clip(
                frame_rect.x + tile.x,
                frame_rect.y + tile.y,
                tile.width,
                tile.height,
            )
            .await?;
        turn.parts.push(Part::Text(format!("Tile {}:", tile.index)));
        turn.parts.push(Part::InlineImage {
            mime: "image/jpeg".into(),
            data: shot,
        });
    }

    let turns = vec![Turn::text(Role::System, TILE_SYSTEM_PROMPT), turn];
    let reply = vision.generate(&turns, None).await?;
    Ok(parse_tile_indices(&reply.text))
}

/// Parse a "1, 4, 7" style reply; `0` or anything unparsable means none.
fn parse_tile_indices(text: &str) -> Vec<u32> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|token| token.trim().parse::<u32>().ok())
        .filter(|index| *index > 0)
        .collect()
}

async fn try_hcaptcha(browser: &Browser) -> Result<bool, CaptchaError> {
    browser.exit_frame();
    let Some(rect) = element_rect(browser, "iframe[src*='hcaptcha.com']").await? else {
        return Ok(false);
    };
    browser
        .click_point(rect.x + rect.width / 2.0, rect.y + rect.height / 2.0)
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    browser.switch_to_frame("hcaptcha.com").await?;
    let checked = browser
        .evaluate(
            "(() => { const el = document.querySelector('#checkbox'); \
             if (!el) return false; \
             return el.getAttribute('aria-checked') === 'true' || el.className.includes('checked'); })()",
        )
        .await?;
    Ok(checked.as_bool().unwrap_or(false))
}

async fn try_text_image(
    browser: &Browser,
    vision: &dyn LanguageModel,
) -> Result<bool, CaptchaError> {
    browser.exit_frame();
    let shot = browser.screenshot_raw().await?;

    let reply = crate::llm::describe_image(
        vision,
        TEXT_SYSTEM_PROMPT,
        "Find the captcha challenge and its answer input on this page.",
        &shot,
    )
    .await?;
    let Some(payload) = extract_json_object(&reply) else {
        return Ok(false);
    };
    let parsed: Value = serde_json::from_str(&payload)
        .map_err(|err| CaptchaError::Unsolvable(format!("text solver reply invalid: {err}")))?;

    let field_hint = parsed["field_hint"].as_str().unwrap_or_default();
    let answer = parsed["answer"].as_str().unwrap_or_default();
    if field_hint.is_empty() || answer.is_empty() {
        return Ok(false);
    }

    browser.type_text(field_hint, answer, true).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(true)
}

/// First balanced JSON object embedded in free text.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
