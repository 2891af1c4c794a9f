//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.roust/config.json`) and environment.
//! The agent roster can be inline (`agents`) or an external file (`rosterPath`,
//! an array of `{id, displayName, role, url, token}` objects).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Board HTTP + push endpoints.
    #[serde(default)]
    pub board: BoardConfig,

    /// Inline agent roster. Wins over `rosterPath` when non-empty.
    #[serde(default)]
    pub agents: Vec<AgentEndpoint>,

    /// Path to an external roster file (array of agent endpoint objects).
    /// Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub roster_path: Option<PathBuf>,

    /// Wake delivery settings.
    #[serde(default)]
    pub wake: WakeConfig,

    /// Relevance observer settings.
    #[serde(default)]
    pub observer: ObserverConfig,
}

/// One agent's private gateway endpoint, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEndpoint {
    pub id: String,
    /// Human-readable name shown to the judge (falls back to id when empty).
    #[serde(default)]
    pub display_name: String,
    /// Role description (e.g. "developer", "qa").
    #[serde(default)]
    pub role: String,
    /// WebSocket URL of the agent's gateway.
    pub url: String,
    /// Shared secret used until the gateway issues a device token.
    #[serde(default)]
    pub token: String,
}

impl AgentEndpoint {
    /// Display name with id fallback.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Board base URL and push endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardConfig {
    /// HTTP base URL (default "http://meeting-board:8080").
    #[serde(default = "default_board_url")]
    pub url: String,

    /// Push WebSocket URL. When absent, derived from `url` ("http" -> "ws", plus "/ws").
    #[serde(default)]
    pub ws_url: Option<String>,
}

fn default_board_url() -> String {
    "http://meeting-board:8080".to_string()
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            url: default_board_url(),
            ws_url: None,
        }
    }
}

/// Wake delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeConfig {
    /// Minimum ms between successive wakes to the same agent (default 30000).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    30_000
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Relevance observer (content triage) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverConfig {
    /// Master switch (default true). The observer is also skipped when no API key resolves.
    #[serde(default = "default_observer_enabled")]
    pub enabled: bool,

    /// Judgment service model id. Default is the judge client's built-in.
    pub model: Option<String>,

    /// Judgment service base URL override.
    pub base_url: Option<String>,

    /// API key. Overridden by ROUST_JUDGE_API_KEY env when set.
    pub api_key: Option<String>,

    /// Max output tokens for the judgment call (default 256).
    #[serde(default = "default_observer_max_tokens")]
    pub max_tokens: u32,

    /// Judgment call timeout in ms (default 10000).
    #[serde(default = "default_observer_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_observer_enabled() -> bool {
    true
}

fn default_observer_max_tokens() -> u32 {
    256
}

fn default_observer_timeout_ms() -> u64 {
    10_000
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: default_observer_enabled(),
            model: None,
            base_url: None,
            api_key: None,
            max_tokens: default_observer_max_tokens(),
            timeout_ms: default_observer_timeout_ms(),
        }
    }
}

/// Resolve the board HTTP base URL: env ROUST_BOARD_URL overrides config.
pub fn resolve_board_url(config: &Config) -> String {
    env_nonempty("ROUST_BOARD_URL")
        .unwrap_or_else(|| config.board.url.trim_end_matches('/').to_string())
}

/// Resolve the board push WebSocket URL: env ROUST_BOARD_WS_URL, then config,
/// then derived from the HTTP base URL.
pub fn resolve_board_ws_url(config: &Config) -> String {
    env_nonempty("ROUST_BOARD_WS_URL")
        .or_else(|| {
            config
                .board
                .ws_url
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| {
            let base = resolve_board_url(config);
            let ws = if let Some(rest) = base.strip_prefix("https://") {
                format!("wss://{}", rest)
            } else if let Some(rest) = base.strip_prefix("http://") {
                format!("ws://{}", rest)
            } else {
                base
            };
            format!("{}/ws", ws.trim_end_matches('/'))
        })
}

/// Resolve the judgment service API key: env ROUST_JUDGE_API_KEY overrides config.
pub fn resolve_judge_api_key(config: &Config) -> Option<String> {
    env_nonempty("ROUST_JUDGE_API_KEY").or_else(|| {
        config
            .observer
            .api_key
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve config path from env or default (~/.roust/config.json).
pub fn default_config_path() -> PathBuf {
    std::env::var("ROUST_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".roust").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// State directory for persisted identity and tokens (config dir's `identity` subdirectory).
pub fn identity_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("identity")
}

/// Load config from the default path (or ROUST_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Resolve the agent roster: inline `agents` when non-empty, otherwise the
/// `rosterPath` file. Missing roster => empty (the router runs but wakes nobody).
pub fn load_roster(config: &Config, config_path: &Path) -> Result<Vec<AgentEndpoint>> {
    if !config.agents.is_empty() {
        return Ok(config.agents.clone());
    }
    let Some(ref roster) = config.roster_path else {
        return Ok(Vec::new());
    };
    let path = if roster.is_absolute() {
        roster.clone()
    } else {
        config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join(roster)
    };
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("reading roster from {}", path.display()))?;
    let agents: Vec<AgentEndpoint> = serde_json::from_str(&s)
        .with_context(|| format!("parsing roster from {}", path.display()))?;
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.board.url, "http://meeting-board:8080");
        assert_eq!(c.wake.debounce_ms, 30_000);
        assert!(c.observer.enabled);
        assert_eq!(c.observer.max_tokens, 256);
    }

    #[test]
    fn ws_url_derived_from_http_base() {
        let c = Config::default();
        assert_eq!(resolve_board_ws_url(&c), "ws://meeting-board:8080/ws");
    }

    #[test]
    fn ws_url_config_override() {
        let mut c = Config::default();
        c.board.ws_url = Some("ws://elsewhere:9090/push".to_string());
        assert_eq!(resolve_board_ws_url(&c), "ws://elsewhere:9090/push");
    }

    #[test]
    fn roster_inline_wins() {
        let mut c = Config::default();
        c.agents.push(AgentEndpoint {
            id: "dev".to_string(),
            display_name: String::new(),
            role: "developer".to_string(),
            url: "ws://dev:1".to_string(),
            token: "t".to_string(),
        });
        c.roster_path = Some(PathBuf::from("/nonexistent/roster.json"));
        let roster = load_roster(&c, Path::new("/tmp/config.json")).unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name(), "dev");
    }
}
