use crate::errors::ConfigError;
use crate::model::UsageStats;
use async_trait::async_trait;
use std::sync::Arc;

pub mod fake;
pub mod gemini;
pub mod openai;

/// Raw reply of one chat turn, before code/prose splitting.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub usage: UsageStats,
}

/// A stateful conversation. Each call sees every earlier successful turn.
#[async_trait]
pub trait ChatSession: Send {
    async fn send(&mut self, message: &str) -> anyhow::Result<ChatReply>;
}

/// Opens fresh conversations against one model.
pub trait ChatProvider: Send + Sync {
    fn start_session(&self) -> Box<dyn ChatSession>;
    fn provider_name(&self) -> &'static str;
    fn model(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub alias: &'static str,
    pub model_id: &'static str,
    pub provider: ProviderKind,
}

pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        alias: "gemini-2.0",
        model_id: "gemini-2.0-flash",
        provider: ProviderKind::Gemini,
    },
    ModelSpec {
        alias: "gemini-2.5",
        model_id: "gemini-2.5-pro-exp-03-25",
        provider: ProviderKind::Gemini,
    },
    ModelSpec {
        alias: "gpt-4o-mini",
        model_id: "gpt-4o-mini",
        provider: ProviderKind::OpenAi,
    },
];

pub fn resolve_model(alias: &str) -> Result<&'static ModelSpec, ConfigError> {
    MODELS.iter().find(|m| m.alias == alias).ok_or_else(|| {
        let known: Vec<_> = MODELS.iter().map(|m| m.alias).collect();
        ConfigError(format!(
            "model '{}' is not supported (options: {})",
            alias,
            known.join(", ")
        ))
    })
}

/// Builds the provider for a registry alias, reading its API key from the environment.
pub fn build_provider(alias: &str) -> anyhow::Result<Arc<dyn ChatProvider>> {
    let spec = resolve_model(alias)?;
    let key_var = match spec.provider {
        ProviderKind::OpenAi => "OPENAI_API_KEY",
        ProviderKind::Gemini => "GEMINI_API_KEY",
    };
    let api_key = std::env::var(key_var)
        .map_err(|_| ConfigError(format!("{} is not set (required by model '{}')", key_var, alias)))?;

    let provider: Arc<dyn ChatProvider> = match spec.provider {
        ProviderKind::OpenAi => Arc::new(openai::OpenAIProvider::new(
            spec.model_id.to_string(),
            api_key,
        )),
        ProviderKind::Gemini => Arc::new(gemini::GeminiProvider::new(
            spec.model_id.to_string(),
            api_key,
        )),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_aliases() {
        let spec = resolve_model("gemini-2.0").unwrap();
        assert_eq!(spec.model_id, "gemini-2.0-flash");
        assert_eq!(spec.provider, ProviderKind::Gemini);
        assert_eq!(
            resolve_model("gpt-4o-mini").unwrap().provider,
            ProviderKind::OpenAi
        );
    }

    #[test]
    fn unknown_alias_lists_options() {
        let err = resolve_model("llama").unwrap_err();
        assert!(err.0.contains("gemini-2.5"));
    }
}
