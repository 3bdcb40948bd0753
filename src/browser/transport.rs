//! Raw DevTools transport.
//!
//! One transport owns one Chromium process (or attaches to an existing
//! one) and one page target. Higher layers speak typed operations; this
//! layer speaks raw CDP methods so the command surface stays a single
//! seam that tests can script.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrowserLaunchConfig;
use crate::errors::BrowserError;

#[async_trait]
pub trait PageTransport: Send + Sync {
    /// Connect, create the page target, and enable the domains the
    /// engine relies on. Idempotent.
    async fn start(&self) -> Result<(), BrowserError>;

    /// Issue a command against the page session.
    async fn command(&self, method: &str, params: Value) -> Result<Value, BrowserError>;

    /// Issue a command against the browser target.
    async fn browser_command(&self, method: &str, params: Value) -> Result<Value, BrowserError>;

    /// How long the page network has been quiet, when known.
    fn network_quiet_for(&self) -> Option<Duration>;

    async fn close(&self) -> Result<(), BrowserError>;
}

pub struct ChromiumTransport {
    cfg: BrowserLaunchConfig,
    state: Mutex<Option<Arc<RuntimeState>>>,
    session: SyncMutex<Option<String>>,
    last_network_activity: Arc<SyncMutex<Instant>>,
}

impl ChromiumTransport {
    pub fn new(cfg: BrowserLaunchConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(None),
            session: SyncMutex::new(None),
            last_network_activity: Arc::new(SyncMutex::new(Instant::now())),
        }
    }

    async fn runtime(&self) -> Result<Arc<RuntimeState>, BrowserError> {
        let mut guard = self.state.lock().await;
        if let Some(runtime) = guard.as_ref() {
            if runtime.is_alive() {
                return Ok(runtime.clone());
            }
        }
        let runtime = Arc::new(
            RuntimeState::start(self.cfg.clone(), self.last_network_activity.clone()).await?,
        );
        *guard = Some(runtime.clone());
        Ok(runtime)
    }

    fn session_id(&self) -> Result<String, BrowserError> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| BrowserError::Io("page session not attached".into()))
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.command_deadline_ms)
    }
}

#[async_trait]
impl PageTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), BrowserError> {
        if self.session.lock().is_some() {
            return Ok(());
        }

        let runtime = self.runtime().await?;
        let deadline = self.deadline();

        let created = runtime
            .send(None, "Target.createTarget", json!({ "url": "about:blank" }), deadline)
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Io("createTarget returned no targetId".into()))?
            .to_string();

        let attached = runtime
            .send(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                deadline,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Io("attachToTarget returned no sessionId".into()))?
            .to_string();

        for method in ["Page.enable", "Runtime.enable", "Network.enable", "DOM.enable"] {
            runtime
                .send(Some(session_id.clone()), method, json!({}), deadline)
                .await?;
        }

        info!(target_id = %target_id, "page target attached");
        *self.session.lock() = Some(session_id);
        Ok(())
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        let runtime = self.runtime().await?;
        let session = self.session_id()?;
        runtime
            .send(Some(session), method, params, self.deadline())
            .await
    }

    async fn browser_command(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        let runtime = self.runtime().await?;
        runtime.send(None, method, params, self.deadline()).await
    }

    fn network_quiet_for(&self) -> Option<Duration> {
        Some(self.last_network_activity.lock().elapsed())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut guard = self.state.lock().await;
        if let Some(runtime) = guard.take() {
            runtime.shutdown().await;
        }
        *self.session.lock() = None;
        Ok(())
    }
}

struct ControlMessage {
    session: Option<String>,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, BrowserError>>,
}

struct RuntimeState {
    command_tx: mpsc::Sender<ControlMessage>,
    loop_task: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl RuntimeState {
    async fn start(
        cfg: BrowserLaunchConfig,
        last_network_activity: Arc<SyncMutex<Instant>>,
    ) -> Result<Self, BrowserError> {
        let browser_cfg = Self::browser_config(&cfg)?;
        let (child, ws_url) = Self::launch_browser(browser_cfg).await?;

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| BrowserError::Io(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();

        let loop_task = tokio::spawn(async move {
            let result = Self::run_loop(conn, command_rx, last_network_activity).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(?err, "devtools transport loop terminated with error");
            }
        });

        info!(url = %ws_url, "chromium connection established");

        Ok(Self {
            command_tx,
            loop_task,
            child: Mutex::new(child),
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send(
        &self,
        session: Option<String>,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BrowserError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            session,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|err| BrowserError::Io(err.to_string()))?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrowserError::Io("command response channel closed".into())),
            Err(_) => Err(BrowserError::NavTimeout(format!("{method} timed out"))),
        }
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!(?err, "failed to kill chromium child");
            }
        }
    }

    fn browser_config(cfg: &BrowserLaunchConfig) -> Result<BrowserConfig, BrowserError> {
        if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
            return Err(BrowserError::Io(format!(
                "chrome executable not found at {}; set WEBPILOT_CHROME",
                cfg.executable.display()
            )));
        }

        let profile_dir = if cfg.user_data_dir.is_absolute() {
            cfg.user_data_dir.clone()
        } else {
            std::env::current_dir()
                .map_err(|err| BrowserError::Io(format!("resolving cwd: {err}")))?
                .join(&cfg.user_data_dir)
        };
        fs::create_dir_all(&profile_dir)
            .map_err(|err| BrowserError::Io(format!("ensuring user-data-dir: {err}")))?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_millis(cfg.command_deadline_ms))
            .launch_timeout(Duration::from_secs(20))
            .window_size(cfg.viewport_width, cfg.viewport_height)
            .user_data_dir(profile_dir);

        if !cfg.headless {
            builder = builder.with_head();
        }

        let mut args = vec![
            "--disable-background-networking",
            "--disable-default-apps",
            "--disable-dev-shm-usage",
            "--disable-extensions",
            "--disable-popup-blocking",
            "--disable-sync",
            "--no-first-run",
            "--no-default-browser-check",
            "--remote-allow-origins=*",
        ];
        if cfg.headless {
            args.push("--headless=new");
            args.push("--hide-scrollbars");
            args.push("--mute-audio");
        }
        builder = builder.args(args);

        if !cfg.executable.as_os_str().is_empty() {
            builder = builder.chrome_executable(cfg.executable.clone());
        }

        builder
            .build()
            .map_err(|err| BrowserError::Io(format!("browser config error: {err}")))
    }

    async fn launch_browser(
        config: BrowserConfig,
    ) -> Result<(Option<Child>, String), BrowserError> {
        let mut child = config
            .launch()
            .map_err(|err| BrowserError::Io(format!("failed to launch chromium: {err}")))?;

        let ws_url = extract_ws_url(&mut child).await?;
        Ok((Some(child), ws_url))
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        last_network_activity: Arc<SyncMutex<Instant>>,
    ) -> Result<(), BrowserError> {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, BrowserError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    let session = cmd.session.map(CdpSessionId::from);
                    let method_id: MethodId = cmd.method.clone().into();
                    match conn.submit_command(method_id, session, cmd.params) {
                        Ok(call_id) => {
                            inflight.insert(call_id, cmd.responder);
                        }
                        Err(err) => {
                            let _ = cmd.responder.send(Err(BrowserError::Io(err.to_string())));
                        }
                    }
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(resp))) => {
                            Self::handle_response(resp, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            Self::note_event(event, &last_network_activity);
                        }
                        Some(Err(err)) => {
                            let mapped = Self::map_cdp_error(err);
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(mapped.clone()));
                            }
                            return Err(mapped);
                        }
                        None => {
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(BrowserError::Closed));
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_response(
        resp: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, BrowserError>>>,
    ) {
        let Some(sender) = inflight.remove(&resp.id) else {
            return;
        };
        let result = if let Some(result) = resp.result {
            Ok(result)
        } else if let Some(error) = resp.error {
            Err(BrowserError::Io(format!(
                "cdp error {}: {}",
                error.code, error.message
            )))
        } else {
            Err(BrowserError::Io("empty cdp response".into()))
        };
        let _ = sender.send(result);
    }

    fn note_event(event: CdpEventMessage, last_network_activity: &Arc<SyncMutex<Instant>>) {
        let raw: CdpJsonEventMessage = match event.try_into() {
            Ok(raw) => raw,
            Err(_) => return,
        };
        if raw.method.starts_with("Network.") {
            *last_network_activity.lock() = Instant::now();
        } else {
            debug!(method = %raw.method, "devtools event");
        }
    }

    fn map_cdp_error(err: CdpError) -> BrowserError {
        let hint = err.to_string();
        match err {
            CdpError::Timeout => BrowserError::NavTimeout(hint),
            CdpError::FrameNotFound(_) => BrowserError::FrameNotFound(hint),
            CdpError::JavascriptException(_) => BrowserError::ScriptFailed(hint),
            _ => BrowserError::Io(hint),
        }
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = child.kill().await;
                    });
                }
            }
        }
    }
}

/// Extract the DevTools websocket URL from Chromium stderr output.
async fn extract_ws_url(child: &mut Child) -> Result<String, BrowserError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BrowserError::Io("chromium process missing stderr handle".into()))?;
    let mut lines = BufReader::new(stderr).lines();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| BrowserError::Io(err.to_string()))?;
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(BrowserError::Io(
            "chromium exited before exposing devtools websocket url".into(),
        ))
    };

    tokio::time::timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| BrowserError::NavTimeout("waiting for devtools websocket url".into()))?
}

/// Handler signature for [`ScriptedTransport`].
pub type ScriptedHandler =
    Box<dyn Fn(&str, &Value) -> Result<Value, BrowserError> + Send + Sync>;

/// Transport that records every command and answers from a handler
/// closure. Backs engine tests that must not touch a real browser.
pub struct ScriptedTransport {
    calls: SyncMutex<Vec<(String, Value)>>,
    handler: ScriptedHandler,
    quiet: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new(handler: ScriptedHandler) -> Self {
        Self {
            calls: SyncMutex::new(Vec::new()),
            handler,
            quiet: Some(Duration::from_secs(5)),
        }
    }

    /// Transport that returns an empty object for every command.
    pub fn permissive() -> Self {
        Self::new(Box::new(|_, _| Ok(json!({}))))
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl PageTransport for ScriptedTransport {
    async fn start(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.calls.lock().push((method.to_string(), params.clone()));
        (self.handler)(method, &params)
    }

    async fn browser_command(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.command(method, params).await
    }

    fn network_quiet_for(&self) -> Option<Duration> {
        self.quiet
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}
