use std::env;
use std::path::Path;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme '{0}' (expected ws or wss)")]
    BadScheme(String),
}

/// Transport reconnection policy: bounded attempt count, exponential
/// backoff with a cap, and a ±randomization factor so a fleet of clients
/// does not redial in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay used as the jitter range, in [0, 1].
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 10, base_delay_ms: 500, max_delay_ms: 10_000, jitter: 0.25 }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub default_shell: String,
    pub auth_token: Option<String>,
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8790/ws".to_string(),
            default_shell: detect_shell(),
            auth_token: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    /// Load `~/.wsmux.conf` if present, then apply `WSMUX_*` environment
    /// overrides on top.
    pub fn load() -> Self {
        let mut cfg = Config::default();
        if let Some(home) = env::var_os("HOME") {
            let path = Path::new(&home).join(".wsmux.conf");
            if let Ok(content) = std::fs::read_to_string(&path) {
                parse_config_content(&mut cfg, &content);
            }
        }
        apply_env(&mut cfg);
        cfg
    }

    pub fn validate_server_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| ConfigError::InvalidUrl { url: self.server_url.clone(), source: e })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::BadScheme(other.to_string())),
        }
    }
}

pub fn parse_config_content(cfg: &mut Config, content: &str) {
    for line in content.lines() {
        parse_config_line(cfg, line);
    }
}

fn parse_config_line(cfg: &mut Config, line: &str) {
    let l = line.trim();
    if l.is_empty() || l.starts_with('#') {
        return;
    }
    let Some(rest) = l.strip_prefix("set ") else { return };
    let mut parts = rest.trim().splitn(2, char::is_whitespace);
    let (Some(key), Some(value)) = (parts.next(), parts.next()) else { return };
    let value = value.trim();
    match key {
        "server-url" => cfg.server_url = value.to_string(),
        "default-shell" => cfg.default_shell = value.to_string(),
        "auth-token" => cfg.auth_token = Some(value.to_string()),
        "reconnect-attempts" => {
            if let Ok(n) = value.parse() {
                cfg.reconnect.max_attempts = n;
            }
        }
        "reconnect-delay" => {
            if let Ok(ms) = value.parse() {
                cfg.reconnect.base_delay_ms = ms;
            }
        }
        "reconnect-max-delay" => {
            if let Ok(ms) = value.parse() {
                cfg.reconnect.max_delay_ms = ms;
            }
        }
        "reconnect-jitter" => {
            if let Ok(j) = value.parse::<f64>() {
                cfg.reconnect.jitter = j.clamp(0.0, 1.0);
            }
        }
        _ => {}
    }
}

fn apply_env(cfg: &mut Config) {
    if let Ok(v) = env::var("WSMUX_SERVER") {
        if !v.is_empty() {
            cfg.server_url = v;
        }
    }
    if let Ok(v) = env::var("WSMUX_SHELL") {
        if !v.is_empty() {
            cfg.default_shell = v;
        }
    }
    if let Ok(v) = env::var("WSMUX_TOKEN") {
        if !v.is_empty() {
            cfg.auth_token = Some(v);
        }
    }
}

/// Resolve the default shell: $SHELL when set, otherwise the first common
/// shell found on PATH.
pub fn detect_shell() -> String {
    if let Ok(sh) = env::var("SHELL") {
        if !sh.is_empty() {
            return sh;
        }
    }
    for candidate in ["zsh", "bash", "sh"] {
        if let Ok(path) = which::which(candidate) {
            return path.to_string_lossy().into_owned();
        }
    }
    "sh".to_string()
}
