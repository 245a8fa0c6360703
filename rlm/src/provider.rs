use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "no API credentials found: set ANTHROPIC_API_KEY or OPENROUTER_API_KEY, \
         pass --api-key, or add a provider to ~/.rlm/config.json"
    )]
    MissingCredentials,
    #[error("unknown provider: {0} (expected \"anthropic\" or \"openrouter\")")]
    UnknownProvider(String),
}

/// Backend service that serves generation calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Provider {
    Anthropic {
        api_key: String,
        #[serde(default = "default_anthropic_url")]
        base_url: String,
    },
    OpenRouter {
        api_key: String,
        #[serde(default = "default_openrouter_url")]
        base_url: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenRouter,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl Provider {
    pub fn new(kind: ProviderKind, api_key: String, base_url: Option<String>) -> Self {
        match kind {
            ProviderKind::Anthropic => Provider::Anthropic {
                api_key,
                base_url: base_url.unwrap_or_else(default_anthropic_url),
            },
            ProviderKind::OpenRouter => Provider::OpenRouter {
                api_key,
                base_url: base_url.unwrap_or_else(default_openrouter_url),
            },
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Anthropic { .. } => ProviderKind::Anthropic,
            Provider::OpenRouter { .. } => ProviderKind::OpenRouter,
        }
    }

    /// Default model for the controlling (root) agent.
    pub fn default_root_model(&self) -> &str {
        match self {
            Provider::Anthropic { .. } => "claude-opus-4-6",
            Provider::OpenRouter { .. } => "anthropic/claude-opus-4.6",
        }
    }

    /// Default model for sub-queries issued from inside executed code.
    pub fn default_sub_model(&self) -> &str {
        match self {
            Provider::Anthropic { .. } => "claude-sonnet-4-5-20250929",
            Provider::OpenRouter { .. } => "anthropic/claude-sonnet-4.5",
        }
    }

    /// Resolve model name: strip "anthropic/" prefix for the direct Anthropic API.
    pub fn resolve_model(&self, model: &str) -> String {
        match self {
            Provider::Anthropic { .. } => model
                .strip_prefix("anthropic/")
                .unwrap_or(model)
                .to_string(),
            Provider::OpenRouter { .. } => model.to_string(),
        }
    }

    /// Pick a provider from explicit flags, the environment, then the config file.
    ///
    /// `env` is injected so resolution can be tested without touching process state.
    pub fn resolve(
        kind: Option<ProviderKind>,
        api_key: Option<String>,
        base_url: Option<String>,
        config: Option<&RlmConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Provider, ConfigError> {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        if let Some(key) = api_key {
            return Ok(Provider::new(
                kind.unwrap_or(ProviderKind::Anthropic),
                key,
                base_url,
            ));
        }

        let env_key = |var: &str| env(var).filter(|k| !k.trim().is_empty());
        let candidates: &[(ProviderKind, &str)] = &[
            (ProviderKind::Anthropic, "ANTHROPIC_API_KEY"),
            (ProviderKind::OpenRouter, "OPENROUTER_API_KEY"),
        ];
        for (candidate, var) in candidates {
            if kind.is_some_and(|k| k != *candidate) {
                continue;
            }
            if let Some(key) = env_key(var) {
                return Ok(Provider::new(*candidate, key, base_url));
            }
        }

        if let Some(provider) = config.and_then(|c| c.provider.clone())
            && kind.is_none_or(|k| k == provider.kind())
        {
            return Ok(match (provider, base_url) {
                (Provider::Anthropic { api_key, .. }, Some(url)) => Provider::Anthropic {
                    api_key,
                    base_url: url,
                },
                (Provider::OpenRouter { api_key, .. }, Some(url)) => Provider::OpenRouter {
                    api_key,
                    base_url: url,
                },
                (p, None) => p,
            });
        }

        Err(ConfigError::MissingCredentials)
    }
}

/// Stored configuration: provider credentials plus run defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RlmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_workers: Option<usize>,
}

impl RlmConfig {
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rlm")
            .join("config.json")
    }

    /// Load from ~/.rlm/config.json. A missing or unreadable file yields `None`.
    pub fn load() -> Option<Self> {
        let path = Self::config_path();
        if let Ok(data) = std::fs::read_to_string(&path) {
            match serde_json::from_str(&data) {
                Ok(config) => return Some(config),
                Err(e) => tracing::warn!("ignoring malformed {}: {e}", path.display()),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn anthropic() -> Provider {
        Provider::Anthropic {
            api_key: "test-key".into(),
            base_url: default_anthropic_url(),
        }
    }

    fn openrouter() -> Provider {
        Provider::OpenRouter {
            api_key: "test-key".into(),
            base_url: default_openrouter_url(),
        }
    }

    // ── Models ──

    #[test]
    fn default_models() {
        assert_eq!(anthropic().default_root_model(), "claude-opus-4-6");
        assert_eq!(
            anthropic().default_sub_model(),
            "claude-sonnet-4-5-20250929"
        );
        assert!(openrouter().default_root_model().starts_with("anthropic/"));
    }

    #[test]
    fn resolve_model_anthropic_strips_prefix() {
        let p = anthropic();
        assert_eq!(p.resolve_model("anthropic/claude-opus-4-6"), "claude-opus-4-6");
        assert_eq!(p.resolve_model("claude-opus-4-6"), "claude-opus-4-6");
    }

    #[test]
    fn resolve_model_openrouter_passthrough() {
        assert_eq!(
            openrouter().resolve_model("anthropic/claude-opus-4.6"),
            "anthropic/claude-opus-4.6"
        );
    }

    // ── ProviderKind ──

    #[test]
    fn provider_kind_parses() {
        assert_eq!(
            "Anthropic".parse::<ProviderKind>().unwrap(),
            ProviderKind::Anthropic
        );
        assert_eq!(
            "openrouter".parse::<ProviderKind>().unwrap(),
            ProviderKind::OpenRouter
        );
        assert!(matches!(
            "bedrock".parse::<ProviderKind>(),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    // ── Provider::resolve ──

    #[test]
    fn explicit_key_wins() {
        let env = |_: &str| Some("env-key".to_string());
        let p = Provider::resolve(None, Some("flag-key".into()), None, None, env).unwrap();
        match p {
            Provider::Anthropic { api_key, base_url } => {
                assert_eq!(api_key, "flag-key");
                assert_eq!(base_url, "https://api.anthropic.com");
            }
            other => panic!("unexpected provider: {other:?}"),
        }
    }

    #[test]
    fn env_key_used_when_no_flag() {
        let env = |var: &str| (var == "OPENROUTER_API_KEY").then(|| "or-key".to_string());
        let p = Provider::resolve(None, None, None, None, env).unwrap();
        assert_eq!(p.kind(), ProviderKind::OpenRouter);
    }

    #[test]
    fn kind_filters_env_candidates() {
        let env = |var: &str| (var == "ANTHROPIC_API_KEY").then(|| "a-key".to_string());
        let err = Provider::resolve(Some(ProviderKind::OpenRouter), None, None, None, env);
        assert!(matches!(err, Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn blank_keys_are_missing() {
        let env = |_: &str| Some("   ".to_string());
        let err = Provider::resolve(None, Some(String::new()), None, None, env);
        assert!(matches!(err, Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn config_file_is_last_resort() {
        let config = RlmConfig {
            provider: Some(openrouter()),
            ..Default::default()
        };
        let p = Provider::resolve(
            None,
            None,
            Some("http://localhost:9999".into()),
            Some(&config),
            no_env,
        )
        .unwrap();
        match p {
            Provider::OpenRouter { base_url, .. } => assert_eq!(base_url, "http://localhost:9999"),
            other => panic!("unexpected provider: {other:?}"),
        }
    }

    #[test]
    fn missing_everything_is_config_error() {
        let err = Provider::resolve(None, None, None, None, no_env);
        assert!(matches!(err, Err(ConfigError::MissingCredentials)));
    }

    // ── RlmConfig ──

    #[test]
    fn config_fills_default_base_url() {
        let json = r#"{"provider":{"type":"Anthropic","api_key":"k"},"max_iterations":7}"#;
        let config: RlmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_iterations, Some(7));
        match config.provider.unwrap() {
            Provider::Anthropic { base_url, .. } => assert_eq!(base_url, default_anthropic_url()),
            other => panic!("unexpected provider: {other:?}"),
        }
    }
}
