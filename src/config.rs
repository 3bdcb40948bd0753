//! Application configuration.
//!
//! Layered the usual way: built-in defaults, then an optional JSON
//! config file, then `WEBPILOT_*` environment overrides. Every section
//! deserializes with defaults so a partial file is fine.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use which::which;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub browser: BrowserLaunchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Interval of the heartbeat sweep, seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".parse().expect("static addr"),
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserLaunchConfig {
    /// Chrome/Chromium executable; autodetected when empty.
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Default deadline for a single devtools command, milliseconds.
    pub command_deadline_ms: u64,
    /// Overall navigation deadline, milliseconds.
    pub navigation_deadline_ms: u64,
    /// Quiet window after readiness before navigation returns, milliseconds.
    pub settle_ms: u64,
    pub screenshot_quality: u8,
}

impl Default for BrowserLaunchConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable().unwrap_or_default(),
            user_data_dir: PathBuf::from("./.webpilot-profile"),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            command_deadline_ms: 30_000,
            navigation_deadline_ms: 30_000,
            settle_ms: 500,
            screenshot_quality: 70,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// External verification endpoint; when unset, `dev_token` applies.
    #[serde(default)]
    pub verify_url: Option<String>,
    /// Static token accepted in development mode.
    #[serde(default)]
    pub dev_token: Option<String>,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verify_url: None,
            dev_token: None,
            timeout_secs: default_auth_timeout(),
        }
    }
}

fn default_auth_timeout() -> u64 {
    10
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap on decision-loop iterations.
    pub max_steps: u32,
    /// Live screenshot pump cadence, milliseconds.
    pub live_screenshot_ms: u64,
    /// Replay screenshot pump cadence, milliseconds.
    pub replay_screenshot_ms: u64,
    /// Grace pause between replayed commands, milliseconds.
    pub replay_step_grace_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            live_screenshot_ms: 1_000,
            replay_screenshot_ms: 500,
            replay_step_grace_ms: 1_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => AppConfig::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(bind) = env_var("WEBPILOT_BIND") {
            if let Ok(addr) = bind.parse() {
                self.server.bind = addr;
            }
        }
        if let Some(path) = env_var("WEBPILOT_CHROME") {
            self.browser.executable = PathBuf::from(path);
        }
        if let Some(headless) = env_var("WEBPILOT_HEADLESS") {
            self.browser.headless =
                !matches!(headless.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
        if let Some(base) = env_var("WEBPILOT_LLM_BASE") {
            self.llm.api_base = base;
        }
        if let Some(key) = env_var("WEBPILOT_LLM_KEY") {
            self.llm.api_key = key;
        }
        if let Some(model) = env_var("WEBPILOT_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = env_var("WEBPILOT_AUTH_URL") {
            self.auth.verify_url = Some(url);
        }
        if let Some(token) = env_var("WEBPILOT_DEV_TOKEN") {
            self.auth.dev_token = Some(token);
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Locate a Chrome/Chromium binary: explicit env override, PATH lookup,
/// then well-known OS install locations.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Some(raw) = env_var("WEBPILOT_CHROME") {
        let candidate = PathBuf::from(raw);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    os_specific_chrome_paths()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.limits.max_steps, 25);
        assert_eq!(config.server.heartbeat_interval_secs, 30);
        assert_eq!(config.limits.live_screenshot_ms, 1_000);
        assert_eq!(config.limits.replay_screenshot_ms, 500);
    }

    #[test]
    fn partial_file_fills_from_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server":{{"bind":"0.0.0.0:9000","heartbeat_interval_secs":15}}}}"#
        )
        .unwrap();
        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.server.heartbeat_interval_secs, 15);
        assert_eq!(config.limits.max_steps, 25);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(AppConfig::load(Some(file.path())).is_err());
    }
}
