use std::str::FromStr;
use std::time::Duration;

use hitl_types::HitlError;

use crate::{
    BackoffPolicy, LlmClient, LoggingMiddleware, OpenAiAdapter, ScriptedProvider,
    UsageTrackingMiddleware,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Ollama,
    Scripted,
}

impl FromStr for ProviderKind {
    type Err = HitlError;

    fn from_str(s: &str) -> Result<Self, HitlError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            "scripted" | "offline" => Ok(ProviderKind::Scripted),
            other => Err(HitlError::Other(format!("unknown LLM provider '{other}'"))),
        }
    }
}

/// Generation client settings. Read from the environment by [`LlmConfig::from_env`];
/// the CLI overrides individual fields.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub max_retries: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            api_key: None,
            base_url: None,
            model: None,
            timeout: Duration::from_secs(120),
            max_retries: 2,
        }
    }
}

impl LlmConfig {
    /// `HITL_LLM_PROVIDER`, `OPENAI_API_KEY`, `HITL_LLM_BASE_URL`, `HITL_LLM_MODEL`,
    /// `HITL_LLM_TIMEOUT_SECS`, `HITL_LLM_MAX_RETRIES`.
    pub fn from_env() -> Result<Self, HitlError> {
        let mut config = Self::default();
        if let Ok(provider) = std::env::var("HITL_LLM_PROVIDER") {
            config.provider = provider.parse()?;
        }
        config.api_key = std::env::var("OPENAI_API_KEY").ok();
        config.base_url = std::env::var("HITL_LLM_BASE_URL").ok();
        config.model = std::env::var("HITL_LLM_MODEL").ok();
        if let Some(secs) = env_number("HITL_LLM_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_number("HITL_LLM_MAX_RETRIES")? {
            config.max_retries = retries as usize;
        }
        Ok(config)
    }

    /// Build a client with logging and usage tracking installed.
    pub fn build_client(&self, usage: UsageTrackingMiddleware) -> Result<LlmClient, HitlError> {
        let mut client = LlmClient::new()
            .with_middleware(LoggingMiddleware)
            .with_middleware(usage)
            .with_retry(self.max_retries, BackoffPolicy::default());

        match self.provider {
            ProviderKind::OpenAi => {
                let key = self.api_key.clone().ok_or_else(|| HitlError::AuthError {
                    provider: "openai".into(),
                })?;
                let mut adapter = OpenAiAdapter::new(key).with_timeout(self.timeout)?;
                if let Some(url) = &self.base_url {
                    adapter = adapter.with_base_url(url);
                }
                client.register_provider(adapter);
            }
            ProviderKind::Ollama => {
                let url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                client.register_provider(OpenAiAdapter::ollama(url).with_timeout(self.timeout)?);
            }
            ProviderKind::Scripted => client.register_provider(ScriptedProvider::new()),
        }

        if let Some(model) = &self.model {
            client = client.with_default_model(model);
        }
        Ok(client)
    }
}

fn env_number(key: &str) -> Result<Option<u64>, HitlError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HitlError::Other(format!("{key} must be a number, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}
