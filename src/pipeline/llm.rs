//! Hosted-provider backend on top of `edgequake-llm`.
//!
//! Any provider the factory knows (OpenAI, Anthropic, Gemini, Azure, a local
//! OpenAI-compatible server, …) can transcribe segments. The request is a
//! single user turn carrying the prompt and the segment PNG.
//!
//! These providers answer in one piece here, so streaming mode falls back to
//! the trait's default: the whole text arrives as a single chunk.

use crate::error::{BackendError, ExtractError};
use crate::pipeline::infer::{InferenceBackend, InferenceRequest};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::{debug, info};

/// Wraps an `edgequake-llm` provider as an [`InferenceBackend`].
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }

    /// Create the named provider for `model`.
    ///
    /// `"auto"` picks the provider from the environment: the
    /// `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` pair when both are set,
    /// otherwise whichever API key the factory finds first.
    pub fn from_name(name: &str, model: &str) -> Result<Self, ExtractError> {
        if name != "auto" {
            return create(name, model);
        }

        if let (Ok(prov), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !env_model.is_empty() {
                return create(&prov, &env_model);
            }
        }

        let (provider, _embedding) = ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from the environment.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY, or use the Ollama backend.\n\
                 Error: {e}"
            ),
        })?;
        info!("Auto-detected LLM provider");
        Ok(Self::new(provider, "auto"))
    }
}

fn create(name: &str, model: &str) -> Result<ProviderBackend, ExtractError> {
    let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: e.to_string(),
        }
    })?;
    info!("Using provider {} with model {}", name, model);
    Ok(ProviderBackend::new(provider, name))
}

#[async_trait]
impl InferenceBackend for ProviderBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        let messages = vec![ChatMessage::user_with_images(
            request.prompt.as_ref(),
            vec![request.image.to_image_data()],
        )];
        let options = build_options(request);

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify(&e.to_string()))?;

        debug!(
            "Page {} segment {}: {} input tokens, {} output tokens",
            request.page, request.segment, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

fn build_options(request: &InferenceRequest) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(request.options.temperature),
        max_tokens: request.options.max_tokens,
        ..Default::default()
    }
}

/// Provider errors only expose a message; sort connection trouble from
/// model-side refusals by its wording.
fn classify(message: &str) -> BackendError {
    let lower = message.to_lowercase();
    let transport = ["network", "connection", "connect", "dns", "tls", "reset"];
    if transport.iter().any(|w| lower.contains(w)) {
        BackendError::Transport(message.to_string())
    } else {
        BackendError::Model(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::EncodedImage;
    use crate::pipeline::infer::SamplingOptions;

    #[test]
    fn options_follow_sampling() {
        let request = InferenceRequest {
            page: 1,
            segment: 0,
            image: EncodedImage {
                base64: String::new(),
                width: 1,
                height: 1,
            },
            prompt: Arc::from("p"),
            options: Arc::new(SamplingOptions {
                model: "gpt-4.1-nano".into(),
                temperature: 0.1,
                top_p: 0.8,
                top_k: 10,
                repeat_penalty: 1.2,
                max_tokens: Some(2048),
            }),
        };
        let opts = build_options(&request);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(2048));
    }

    #[test]
    fn error_classification() {
        assert!(matches!(classify("Network error: connection refused"), BackendError::Transport(_)));
        assert!(matches!(classify("API error: content policy"), BackendError::Model(_)));
    }

    #[test]
    fn unknown_provider_is_not_configured() {
        let err = ProviderBackend::from_name("no-such-provider", "m").err().unwrap();
        assert!(matches!(err, ExtractError::ProviderNotConfigured { .. }));
    }
}
