//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

const DEFAULT_GATEWAY_PORT: u16 = 8788;
const DEFAULT_INGRESS_CAPACITY: usize = 256;
const DEFAULT_GRACE_PERIOD_MS: u64 = 2_000;
const DEFAULT_MAX_HISTORY: usize = 20;

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Runtime knobs for every session pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Frames buffered between the transport source and the first stage (default: 256).
    /// Frames arriving while the buffer is full are dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_capacity: Option<usize>,

    /// How long `stop` waits for in-flight frames before abandoning them (default: 2000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_ms: Option<u64>,

    /// Inject "Participant Joined/Left" announcements (default: true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce_membership: Option<bool>,
}

/// How the speech-to-text stage decides where an utterance ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// Every inbound audio frame is one utterance.
    PerFrame,
    /// Energy-based voice activity detection.
    #[default]
    Vad,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Override for the transcription endpoint base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default)]
    pub segmentation: SegmentationMode,

    /// RMS threshold for speech (default: 300.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_threshold: Option<f64>,

    /// Silence that closes an utterance, in ms (default: 300).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_ms: Option<u64>,

    /// Longest utterance before a forced flush, in ms (default: 30000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_utterance_ms: Option<u64>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
            base_url: None,
            segmentation: SegmentationMode::default(),
            vad_threshold: None,
            silence_ms: None,
            max_utterance_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single chat completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Conversational agent behind the text stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider id from `models.providers` (default: the first one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Conversation turns kept as context (default: 20).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_history: Option<usize>,
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Default voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Default model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            default_voice: None,
            default_model: None,
            base_url: None,
        }
    }
}

/// Media bridge connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect timeout in ms (default: 10000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Use plain `ws://` when the callback address has no scheme.
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,
}

fn default_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the control token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_dir() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or(DEFAULT_GATEWAY_PORT)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Control-surface token, if auth is configured.
    pub fn gateway_token(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .and_then(|a| a.resolve_token())
    }

    pub fn ingress_capacity(&self) -> usize {
        self.pipeline
            .as_ref()
            .and_then(|p| p.ingress_capacity)
            .unwrap_or(DEFAULT_INGRESS_CAPACITY)
    }

    pub fn grace_period(&self) -> Duration {
        let ms = self
            .pipeline
            .as_ref()
            .and_then(|p| p.grace_period_ms)
            .unwrap_or(DEFAULT_GRACE_PERIOD_MS);
        Duration::from_millis(ms)
    }

    pub fn announce_membership(&self) -> bool {
        self.pipeline
            .as_ref()
            .and_then(|p| p.announce_membership)
            .unwrap_or(true)
    }

    pub fn connect_timeout(&self) -> Duration {
        let ms = self
            .transport
            .as_ref()
            .and_then(|t| t.connect_timeout_ms)
            .unwrap_or(10_000);
        Duration::from_millis(ms)
    }

    pub fn transport_insecure(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.insecure)
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    /// Provider used by the agent: the named one, else the first configured.
    pub fn agent_provider(&self) -> Option<&ProviderConfig> {
        match self.agent.as_ref().and_then(|a| a.provider.as_deref()) {
            Some(id) => self.provider(id),
            None => self
                .models
                .as_ref()
                .and_then(|m| m.providers.as_ref())
                .and_then(|p| p.first()),
        }
    }

    /// Chat model: agent override, then provider default, then a fixed fallback.
    pub fn agent_model(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.model.clone())
            .or_else(|| self.agent_provider().and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tokens)
            .unwrap_or(512)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.agent.as_ref().and_then(|a| a.temperature)
    }

    pub fn max_history(&self) -> usize {
        self.agent
            .as_ref()
            .and_then(|a| a.max_history)
            .unwrap_or(DEFAULT_MAX_HISTORY)
    }

    pub fn system_prompt(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.system_prompt.clone())
            .unwrap_or_else(|| {
                "You are a helpful voice assistant taking part in a live meeting. \
                 Keep replies short and conversational; they will be spoken aloud."
                    .to_string()
            })
    }

    /// Get a config value by dotted path (e.g. "gateway.port").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(providers) = self.models.as_ref().and_then(|m| m.providers.as_ref()) {
            for p in providers {
                if p.resolve_api_key().is_none() {
                    warnings.push(format!("Provider '{}' has no API key configured", p.id));
                }
            }
        }

        if let Some(agent_provider) = self.agent.as_ref().and_then(|a| a.provider.as_deref()) {
            if self.provider(agent_provider).is_none() {
                errors.push(format!(
                    "Agent provider '{agent_provider}' is not defined in models.providers"
                ));
            }
        }

        if self
            .transcription
            .as_ref()
            .is_some_and(|t| t.resolve_api_key().is_none())
        {
            warnings.push(
                "Transcription has no API key configured; the session api_token will be used"
                    .to_string(),
            );
        }

        if self
            .tts
            .as_ref()
            .is_some_and(|t| t.resolve_api_key().is_none())
        {
            warnings.push(
                "TTS has no API key configured; the session api_token will be used".to_string(),
            );
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.auth.as_ref().is_some_and(|a| a.resolve_token().is_none()) {
                errors.push("Gateway auth is configured but no token resolves".to_string());
            }
        }

        if let Some(pipeline) = &self.pipeline {
            if pipeline.ingress_capacity == Some(0) {
                errors.push("pipeline.ingress_capacity cannot be 0".to_string());
            }
            if pipeline.grace_period_ms == Some(0) {
                errors.push("pipeline.grace_period_ms cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_PARLEY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PARLEY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8788);
        assert_eq!(config.ingress_capacity(), 256);
        assert_eq!(config.grace_period(), Duration::from_millis(2000));
        assert!(config.announce_membership());
        assert_eq!(config.max_history(), 20);
        assert!(config.gateway_token().is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.pipeline.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine
                pipeline: { ingress_capacity: 8, grace_period_ms: 50, announce_membership: false },
                transcription: { segmentation: "per_frame" },
                gateway: { port: 9000 },
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.ingress_capacity(), 8);
        assert_eq!(config.grace_period(), Duration::from_millis(50));
        assert!(!config.announce_membership());
        assert_eq!(config.gateway_port(), 9000);
        assert_eq!(
            config.transcription.unwrap().segmentation,
            SegmentationMode::PerFrame
        );
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = Config::parse("{ not valid").unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_PARLEY_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "test".into(),
            api_key_env: Some("TEST_PARLEY_API_KEY".into()),
            api_key: None,
            base_url: None,
            default_model: None,
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let provider2 = ProviderConfig {
            api_key: Some("direct-key".into()),
            ..provider
        };
        assert_eq!(provider2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PARLEY_API_KEY") };
    }

    #[test]
    fn test_agent_provider_and_model() {
        let config: Config = json5::from_str(
            r#"{
                models: { providers: [
                    { id: "openai", default_model: "gpt-4o" },
                    { id: "groq", default_model: "llama-3.1-8b-instant" },
                ] },
                agent: { provider: "groq" },
            }"#,
        )
        .unwrap();
        assert_eq!(config.agent_provider().unwrap().id, "groq");
        assert_eq!(config.agent_model(), "llama-3.1-8b-instant");

        let first: Config =
            json5::from_str(r#"{ models: { providers: [{ id: "openai" }] } }"#).unwrap();
        assert_eq!(first.agent_provider().unwrap().id, "openai");
        assert_eq!(first.agent_model(), "gpt-4o-mini");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ gateway: { port: 1234 } }"#).unwrap();
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(1234)));
        assert!(config.get_path("gateway.nope").is_none());
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            models: Some(ModelsConfig {
                providers: Some(vec![ProviderConfig {
                    id: "openai".into(),
                    api_key: None,
                    api_key_env: None,
                    base_url: None,
                    default_model: None,
                }]),
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(
            warnings.iter().any(|w| w.contains("openai") && w.to_lowercase().contains("key")),
            "Expected a warning about missing API key for openai, got: {warnings:?}"
        );
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config: Config = json5::from_str(
            r#"{
                gateway: { port: 0 },
                pipeline: { ingress_capacity: 0, grace_period_ms: 0 },
                agent: { provider: "missing" },
            }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 4, "got: {errors:?}");
    }

    #[test]
    fn test_save_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config: Config = json5::from_str(r#"{ gateway: { port: 4321 } }"#).unwrap();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap().gateway_port(), 4321);
    }
}
