//! Layered settings.
//!
//! 1. Compiled [`Settings::default()`]
//! 2. Optional JSON file, deep-merged over the defaults
//! 3. `PARLEY_*` environment overrides
//! 4. Command-line flags (applied by `main`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use parley_core::ids::AgentId;
use parley_core::profile::{AgentProfile, DEFAULT_MAX_TOOL_CALLS};
use parley_engine::{AgentConfig, ContextConfig};
use parley_llm::{OpenAiConfig, ToolHubConfig};
use parley_server::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub server: ServerSettings,
    pub llm: LlmSettings,
    pub tool_hub: ToolHubSettings,
    pub store: StoreSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    pub agent: DefaultAgentSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            path: defaults.path,
            max_send_queue: defaults.max_send_queue,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub idle_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        let defaults = OpenAiConfig::default();
        Self {
            base_url: defaults.base_url,
            api_key: None,
            model: defaults.model,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolHubSettings {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ToolHubSettings {
    fn default() -> Self {
        let defaults = ToolHubConfig::default();
        Self {
            base_url: defaults.base_url,
            timeout_ms: defaults.timeout.as_millis() as u64,
            max_retries: defaults.max_retries,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSettings {
    pub database_path: String,
    pub in_memory: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: home_dir().join(".parley").join("parley.db").display().to_string(),
            in_memory: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub max_tool_calls: u32,
    pub fan_out_timeout_ms: u64,
    pub memory_limit: usize,
    pub stream_text: bool,
    /// Unset waits for a decision until the session goes away.
    pub approval_timeout_ms: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let context = ContextConfig::default();
        Self {
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            fan_out_timeout_ms: context.fan_out_timeout.as_millis() as u64,
            memory_limit: context.memory_limit,
            stream_text: true,
            approval_timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Agent profile seeded into the profile store at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultAgentSettings {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub avatar_url: Option<String>,
    pub system_prompt: Option<String>,
    pub supports_tools: bool,
    pub supports_memory: bool,
    pub capabilities: Vec<String>,
}

impl Default for DefaultAgentSettings {
    fn default() -> Self {
        Self {
            id: "agent_default".to_string(),
            name: "assistant".to_string(),
            agent_type: "basic".to_string(),
            avatar_url: None,
            system_prompt: None,
            supports_tools: true,
            supports_memory: false,
            capabilities: vec!["tool_usage".to_string()],
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

impl Settings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            path: self.server.path.clone(),
            max_send_queue: self.server.max_send_queue,
        }
    }

    pub fn llm_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.llm.base_url.clone(),
            api_key: self.llm.api_key.clone().map(SecretString::from),
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
            idle_timeout: Duration::from_secs(self.llm.idle_timeout_secs),
        }
    }

    pub fn tool_hub_config(&self) -> ToolHubConfig {
        ToolHubConfig {
            base_url: self.tool_hub.base_url.clone(),
            timeout: Duration::from_millis(self.tool_hub.timeout_ms),
            max_retries: self.tool_hub.max_retries,
            ..ToolHubConfig::default()
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            context: ContextConfig {
                fan_out_timeout: Duration::from_millis(self.engine.fan_out_timeout_ms),
                memory_limit: self.engine.memory_limit,
            },
            approval_timeout: self.engine.approval_timeout_ms.map(Duration::from_millis),
            stream_text: self.engine.stream_text,
        }
    }

    pub fn default_profile(&self) -> AgentProfile {
        let agent = &self.agent;
        let mut profile = AgentProfile {
            agent_type: agent.agent_type.clone(),
            avatar_url: agent.avatar_url.clone(),
            supports_tools: agent.supports_tools,
            supports_memory: agent.supports_memory,
            max_tool_calls: self.engine.max_tool_calls,
            capabilities: agent.capabilities.clone(),
            ..AgentProfile::new(AgentId::from_raw(agent.id.as_str()), agent.name.as_str())
        };
        if let Some(prompt) = &agent.system_prompt {
            profile.system_prompt = prompt.clone();
        }
        profile
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.server.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/': {}",
                self.server.path
            )));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue("server.maxSendQueue must be positive".into()));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("llm.baseUrl is empty".into()));
        }
        if self.tool_hub.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("toolHub.baseUrl is empty".into()));
        }
        if self.engine.max_tool_calls == 0 {
            return Err(SettingsError::InvalidValue("engine.maxToolCalls must be at least 1".into()));
        }
        if self.agent.id.trim().is_empty() {
            return Err(SettingsError::InvalidValue("agent.id is empty".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Default settings file location, `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    home_dir().join(".parley").join("settings.json")
}

/// Load settings from `path` (or the default location) plus process env overrides.
pub fn load(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let default_path = settings_path();
    let explicit = path.is_some();
    let path = path.unwrap_or(&default_path);
    if explicit && !path.exists() {
        return Err(SettingsError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }
    let mut settings = load_from_path(path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Defaults with the file at `path` merged over them. A missing file yields defaults.
pub fn load_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key, everything else is replaced; nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides read through `env`. Unparseable values are
/// logged and ignored.
pub fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PARLEY_PORT") {
        match v.trim().parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(_) => warn!(key = "PARLEY_PORT", value = %v, "invalid port, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_LLM_BASE_URL") {
        settings.llm.base_url = v;
    }
    if let Some(v) = read("PARLEY_LLM_API_KEY") {
        settings.llm.api_key = Some(v);
    }
    if let Some(v) = read("PARLEY_LLM_MODEL") {
        settings.llm.model = v;
    }
    if let Some(v) = read("PARLEY_TOOL_HUB_URL") {
        settings.tool_hub.base_url = v;
    }
    if let Some(v) = read("PARLEY_DB_PATH") {
        settings.store.database_path = v;
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("PARLEY_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.logging.json = json,
            None => warn!(key = "PARLEY_LOG_JSON", value = %v, "invalid boolean, ignoring"),
        }
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("parley-settings-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_match_documented_endpoint() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 38888);
        assert_eq!(settings.server.path, "/ws/agent");
        assert_eq!(settings.engine.max_tool_calls, 5);
        assert_eq!(settings.engine.fan_out_timeout_ms, 5000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn deep_merge_recurses_and_skips_null() {
        let target = json!({"a": {"x": 1, "y": 2}, "b": [1, 2], "c": "keep"});
        let source = json!({"a": {"y": 3}, "b": [9], "c": null});
        assert_eq!(
            deep_merge(target, source),
            json!({"a": {"x": 1, "y": 3}, "b": [9], "c": "keep"})
        );
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let path = temp_file(r#"{"server": {"port": 9000}, "llm": {"model": "local-7b"}, "engine": {"approvalTimeoutMs": 1500}}"#);
        let settings = load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.path, "/ws/agent");
        assert_eq!(settings.llm.model, "local-7b");
        assert_eq!(
            settings.agent_config().approval_timeout,
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("parley-settings-does-not-exist.json");
        assert_eq!(load_from_path(&path).unwrap(), Settings::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("parley-settings-explicit-missing.json");
        assert!(matches!(load(Some(&path)), Err(SettingsError::Io(_))));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_file("{ nope");
        let result = load_from_path(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("PARLEY_PORT", "not-a-port"),
                ("PARLEY_LLM_MODEL", "qwen"),
                ("PARLEY_LOG_JSON", "yes"),
                ("PARLEY_DB_PATH", "/var/lib/parley.db"),
                ("PARLEY_HOST", "  "),
            ]),
        );
        assert_eq!(settings.server.port, 38888);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.llm.model, "qwen");
        assert!(settings.logging.json);
        assert_eq!(settings.store.database_path, "/var/lib/parley.db");

        apply_env_overrides(&mut settings, env(&[("PARLEY_PORT", "4100")]));
        assert_eq!(settings.server.port, 4100);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.server.path = "ws".into();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));

        let mut settings = Settings::default();
        settings.server.max_send_queue = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.engine.max_tool_calls = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn default_profile_follows_agent_and_engine_settings() {
        let mut settings = Settings::default();
        settings.agent.system_prompt = Some("You are {agent_name}.".into());
        settings.engine.max_tool_calls = 8;
        let profile = settings.default_profile();
        assert_eq!(profile.agent_id.as_str(), "agent_default");
        assert_eq!(profile.max_tool_calls, 8);
        assert_eq!(profile.system_prompt, "You are {agent_name}.");
        assert!(profile.supports_tools);
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
