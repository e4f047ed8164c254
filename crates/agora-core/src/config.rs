//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::model::SandboxPolicy;

/// Top-level Agora configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Configuration for a single LLM provider.
///
/// Cloud providers are only selectable once a key resolves (bring-your-own-key).
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Number of prior messages replayed into each prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,

    /// Extra profile context appended to every agent persona.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_context: Option<String>,

    /// Tool-call argument completion detector: "brace_balance" or "strict_json".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_detection: Option<String>,
}

/// Default sandbox limits applied to servers that do not declare their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_calls_per_session: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_enabled: Option<bool>,

    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_sec: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,

    /// Directory holding the durable job journal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "agora_tools=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
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

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::AgoraError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers
            .as_ref()
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    pub fn default_model(&self) -> String {
        self.chat
            .as_ref()
            .and_then(|c| c.default_model.clone())
            .unwrap_or_else(|| "llama3.2".to_string())
    }

    pub fn temperature(&self) -> Option<f64> {
        self.chat.as_ref().and_then(|c| c.temperature)
    }

    pub fn max_tokens(&self) -> u32 {
        self.chat
            .as_ref()
            .and_then(|c| c.max_tokens)
            .unwrap_or(4096)
    }

    pub fn history_limit(&self) -> usize {
        self.chat
            .as_ref()
            .and_then(|c| c.history_limit)
            .unwrap_or(20)
    }

    pub fn profile_context(&self) -> Option<&str> {
        self.chat.as_ref().and_then(|c| c.profile_context.as_deref())
    }

    pub fn tool_call_detection(&self) -> String {
        self.chat
            .as_ref()
            .and_then(|c| c.tool_call_detection.clone())
            .unwrap_or_else(|| "brace_balance".to_string())
    }

    /// Sandbox policy applied when a server does not carry its own.
    pub fn default_sandbox(&self) -> SandboxPolicy {
        let defaults = SandboxPolicy::default();
        match &self.sandbox {
            Some(s) => SandboxPolicy {
                max_execution_time_ms: s
                    .max_execution_time_ms
                    .unwrap_or(defaults.max_execution_time_ms),
                max_tool_calls_per_session: s
                    .max_tool_calls_per_session
                    .unwrap_or(defaults.max_tool_calls_per_session),
                network_enabled: s.network_enabled.unwrap_or(defaults.network_enabled),
                allowed_domains: s.allowed_domains.clone(),
            },
            None => defaults,
        }
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.sandbox
            .as_ref()
            .and_then(|s| s.connect_timeout_ms)
            .unwrap_or(10_000)
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.sandbox
            .as_ref()
            .and_then(|s| s.idle_timeout_ms)
            .unwrap_or(300_000)
    }

    pub fn sweep_interval_ms(&self) -> u64 {
        self.sandbox
            .as_ref()
            .and_then(|s| s.sweep_interval_ms)
            .unwrap_or(60_000)
    }

    pub fn worker_concurrency(&self) -> usize {
        self.pipeline
            .as_ref()
            .and_then(|p| p.concurrency)
            .unwrap_or(5)
    }

    pub fn rate_limit_per_sec(&self) -> u32 {
        self.pipeline
            .as_ref()
            .and_then(|p| p.rate_limit_per_sec)
            .unwrap_or(50)
    }

    pub fn max_attempts(&self) -> u32 {
        self.pipeline
            .as_ref()
            .and_then(|p| p.max_attempts)
            .unwrap_or(3)
    }

    pub fn backoff_base_ms(&self) -> u64 {
        self.pipeline
            .as_ref()
            .and_then(|p| p.backoff_base_ms)
            .unwrap_or(1_000)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.pipeline
            .as_ref()
            .and_then(|p| p.queue_dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("queue"))
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(18790)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("data"))
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "pipeline.concurrency").
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

        if let Some(providers) = &self.providers {
            for p in providers {
                if p.id != "ollama" && p.resolve_api_key().is_none() {
                    warnings.push(format!(
                        "Provider '{}' has no API key configured and stays disabled",
                        p.id
                    ));
                }
            }
        }

        let detection = self.tool_call_detection();
        if !matches!(detection.as_str(), "brace_balance" | "strict_json") {
            errors.push(format!(
                "chat.tool_call_detection '{detection}' is not one of brace_balance, strict_json"
            ));
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if self.worker_concurrency() == 0 {
            errors.push("pipeline.concurrency must be at least 1".to_string());
        }
        if self.rate_limit_per_sec() == 0 {
            errors.push("pipeline.rate_limit_per_sec must be at least 1".to_string());
        }
        if self.max_attempts() == 0 {
            errors.push("pipeline.max_attempts must be at least 1".to_string());
        }
        if self.default_sandbox().max_execution_time_ms == 0 {
            errors.push("sandbox.max_execution_time_ms cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Agora data: `~/.agora/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agora")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_AGORA_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_AGORA_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_AGORA_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_AGORA_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert_eq!(result, r#"{"key": ""}"#);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 18790);
        assert_eq!(config.max_tokens(), 4096);
        assert_eq!(config.history_limit(), 20);
        assert_eq!(config.worker_concurrency(), 5);
        assert_eq!(config.rate_limit_per_sec(), 50);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.backoff_base_ms(), 1_000);
        assert_eq!(config.default_model(), "llama3.2");
    }

    #[test]
    fn test_default_sandbox_merges_overrides() {
        let config: Config = json5::from_str(
            r#"{
                sandbox: {
                    max_execution_time_ms: 5000,
                    network_enabled: false,
                    allowed_domains: ["example.com"],
                },
            }"#,
        )
        .unwrap();
        let policy = config.default_sandbox();
        assert_eq!(policy.max_execution_time_ms, 5000);
        assert!(!policy.network_enabled);
        assert_eq!(policy.allowed_domains, vec!["example.com".to_string()]);
        assert_eq!(
            policy.max_tool_calls_per_session,
            SandboxPolicy::default().max_tool_calls_per_session
        );
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_AGORA_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "openai".into(),
            api_key_env: Some("TEST_AGORA_API_KEY".into()),
            api_key: None,
            base_url: None,
            default_model: None,
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let provider2 = ProviderConfig {
            api_key: Some("direct-key".into()),
            ..provider
        };
        // Direct key takes priority
        assert_eq!(provider2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_AGORA_API_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ gateway: { port: 9000 } }"#).unwrap();
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(9000)));
        assert!(config.get_path("gateway.missing").is_none());
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            providers: Some(vec![ProviderConfig {
                id: "anthropic".into(),
                api_key: None,
                api_key_env: None,
                base_url: None,
                default_model: None,
            }]),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(
            warnings.iter().any(|w| w.contains("anthropic")),
            "Expected a warning about missing API key, got: {warnings:?}"
        );
    }

    #[test]
    fn test_validate_zero_concurrency_errors() {
        let config: Config = json5::from_str(r#"{ pipeline: { concurrency: 0 } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("concurrency")));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/agora/config.json")).unwrap();
        assert!(config.providers.is_none());
    }
}
