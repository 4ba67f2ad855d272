//! Text generation provider abstraction and implementations.
//!
//! Defines the [`GenerationProvider`] trait and concrete implementations:
//! - **[`DisabledGenerator`]** — returns errors; used when generation is not configured.
//! - **[`OllamaGenerator`]** — calls a local Ollama instance's `/api/chat` endpoint.
//! - **[`OpenAIGenerator`]** — calls the OpenAI chat completions API.
//!
//! Each call is a single request with a system prompt and a user prompt,
//! returning the raw completion text. There is no retry layer and no
//! conversation state; callers own prompt construction and response parsing.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;

/// Trait for chat-style text generation providers.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"llama3.1"`).
    fn model_name(&self) -> &str;
    /// Run one completion: system prompt plus a single user message.
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

// ============ Disabled Generator ============

/// A no-op generation provider that always returns errors.
///
/// Used when `generation.provider = "disabled"` in the configuration.
pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled. Set [generation] provider in the config.")
    }
}

// ============ Ollama Generator ============

/// Generation provider using a local Ollama instance.
///
/// Calls `POST /api/chat` on the configured base URL with streaming off.
/// Requires Ollama to be running with the model pulled (e.g.
/// `ollama pull llama3.1`).
pub struct OllamaGenerator {
    model: String,
    base_url: String,
    timeout_secs: u64,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "stream": false,
        });

        let response = client
            .post(format!("{}/api/chat", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.base_url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_ollama_chat_response(&json)
    }
}

fn parse_ollama_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message.content"))
}

// ============ OpenAI Generator ============

/// Generation provider using the OpenAI API.
///
/// Calls the `POST /v1/chat/completions` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIGenerator {
    model: String,
    timeout_secs: u64,
}

impl OpenAIGenerator {
    /// Create a new OpenAI generator from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_chat_response(&json)
    }
}

fn parse_openai_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

/// Create the appropriate [`GenerationProvider`] based on configuration.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_generator_errors() {
        let gen = DisabledGenerator;
        assert!(gen.generate("system", "user").await.is_err());
        assert_eq!(gen.model_name(), "disabled");
    }

    #[test]
    fn test_parse_ollama_chat_response() {
        let json = serde_json::json!({
            "model": "llama3.1",
            "message": { "role": "assistant", "content": "Hello there." },
            "done": true,
        });
        assert_eq!(parse_ollama_chat_response(&json).unwrap(), "Hello there.");

        let bad = serde_json::json!({ "done": true });
        assert!(parse_ollama_chat_response(&bad).is_err());
    }

    #[test]
    fn test_parse_openai_chat_response() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Response text" } }
            ],
        });
        assert_eq!(parse_openai_chat_response(&json).unwrap(), "Response text");

        let empty = serde_json::json!({ "choices": [] });
        assert!(parse_openai_chat_response(&empty).is_err());
    }

    #[test]
    fn test_create_generator_rejects_unknown() {
        let mut config = GenerationConfig::default();
        config.provider = "gemini".to_string();
        assert!(create_generator(&config).is_err());
    }
}
