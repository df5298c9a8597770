//! Google Gemini `generateContent`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ModelBackend, ModelConfig, ModelResponse, REQUEST_TIMEOUT};
use crate::errors::ModelError;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiBackend {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<SafetySetting>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_p: f64,
    max_output_tokens: u32,
}

#[derive(Serialize, Debug, PartialEq)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

fn harm_category(name: &str) -> Option<&'static str> {
    Some(match name {
        "harassment" => "HARM_CATEGORY_HARASSMENT",
        "hate_speech" | "hate" => "HARM_CATEGORY_HATE_SPEECH",
        "sexually_explicit" | "sexual" => "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "dangerous_content" | "dangerous" => "HARM_CATEGORY_DANGEROUS_CONTENT",
        "derogatory" => "HARM_CATEGORY_DEROGATORY",
        "toxicity" | "toxic" => "HARM_CATEGORY_TOXICITY",
        "violence" => "HARM_CATEGORY_VIOLENCE",
        "medical" => "HARM_CATEGORY_MEDICAL",
        _ => return None,
    })
}

fn harm_threshold(level: &str) -> Option<&'static str> {
    Some(match level {
        "block_none" | "none" => "BLOCK_NONE",
        "block_low" | "low" => "BLOCK_LOW_AND_ABOVE",
        "block_medium" | "medium" => "BLOCK_MEDIUM_AND_ABOVE",
        "block_high" | "high" => "BLOCK_ONLY_HIGH",
        "block" | "block_all" => "HARM_BLOCK_THRESHOLD_UNSPECIFIED",
        _ => return None,
    })
}

impl GeminiBackend {
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
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            config,
        }
    }

    /// Unknown categories or levels are logged and skipped.
    fn safety_settings(&self) -> Vec<SafetySetting> {
        self.config
            .gemini
            .safety_settings
            .iter()
            .filter_map(|(category, level)| {
                match (
                    harm_category(&category.to_lowercase()),
                    harm_threshold(&level.to_lowercase()),
                ) {
                    (Some(category), Some(threshold)) => Some(SafetySetting {
                        category,
                        threshold,
                    }),
                    _ => {
                        warn!(%category, %level, "Ignoring invalid Gemini safety setting");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    async fn execute(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        let model = self.config.gemini.model.as_str();
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                max_output_tokens: self.config.max_tokens,
            },
            safety_settings: self.safety_settings(),
        };

        let response = self
            .http_client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, model
            ))
            .query(&[("key", self.api_key.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::RequestFailed {
                model: "gemini".to_string(),
                details: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::RequestFailed {
                model: "gemini".to_string(),
                details: format!("HTTP {}: {}", status, text),
            });
        }

        let parsed: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::InvalidResponse {
                    model: "gemini".to_string(),
                    details: e.to_string(),
                })?;

        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if content.is_empty() {
            return Err(ModelError::InvalidResponse {
                model: "gemini".to_string(),
                details: "no text content in Gemini response".to_string(),
            });
        }

        Ok(ModelResponse::new(model, content))
    }
}
