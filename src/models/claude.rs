//! Anthropic messages API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ModelBackend, ModelConfig, ModelResponse, REQUEST_TIMEOUT};
use super::config::DEFAULT_CLAUDE_MODEL;
use crate::errors::ModelError;

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Short names accepted in place of full Claude model identifiers.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-4-opus-latest"),
    ("opus-latest", "claude-4-opus-latest"),
    ("4-opus", "claude-4-opus-latest"),
    ("claude-opus", "claude-4-opus-latest"),
    ("3.5-opus", "claude-3-5-opus-latest"),
    ("3-opus", "claude-3-opus-latest"),
    ("sonnet", "claude-4-sonnet-latest"),
    ("sonnet-latest", "claude-4-sonnet-latest"),
    ("4-sonnet", "claude-4-sonnet-latest"),
    ("claude-sonnet", "claude-4-sonnet-latest"),
    ("3.5-sonnet", "claude-3-5-sonnet-latest"),
    ("3-sonnet", "claude-3-sonnet-latest"),
    ("haiku", "claude-4-haiku-latest"),
    ("haiku-latest", "claude-4-haiku-latest"),
    ("4-haiku", "claude-4-haiku-latest"),
    ("claude-haiku", "claude-4-haiku-latest"),
    ("3.5-haiku", "claude-3-5-haiku-latest"),
    ("3-haiku", "claude-3-haiku-latest"),
];

/// Maps an alias to its full identifier. Full `claude-*` identifiers pass
/// through; anything else falls back to the default model.
pub fn resolve_model_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return DEFAULT_CLAUDE_MODEL.to_string();
    }
    if let Some((_, full)) = MODEL_ALIASES.iter().find(|(alias, _)| *alias == lowered) {
        return full.to_string();
    }
    if lowered.starts_with("claude-") {
        return lowered;
    }
    warn!(
        model = name,
        default = DEFAULT_CLAUDE_MODEL,
        "Unsupported Claude model, using default"
    );
    DEFAULT_CLAUDE_MODEL.to_string()
}

pub struct ClaudeBackend {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl ClaudeBackend {
    pub fn new(
        http_client: reqwest::Client,
        api_key: String,
        base_url: Option<String>,
        config: ModelConfig,
    ) -> Self {
        Self {
            http_client,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            config,
        }
    }
}

#[async_trait]
impl ModelBackend for ClaudeBackend {
    async fn execute(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        let model = resolve_model_name(&self.config.claude.model);
        let body = MessagesRequest {
            model: &model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            system: &self.config.claude.system_message,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::RequestFailed {
                model: "claude".to_string(),
                details: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::RequestFailed {
                model: "claude".to_string(),
                details: format!("HTTP {}: {}", status, text),
            });
        }

        let parsed: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::InvalidResponse {
                    model: "claude".to_string(),
                    details: e.to_string(),
                })?;

        let content = parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ModelError::InvalidResponse {
                model: "claude".to_string(),
                details: "no text content in Claude response".to_string(),
            })?;

        Ok(ModelResponse::new(parsed.model.unwrap_or(model), content))
    }
}
