//! OpenAI-compatible chat completions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ModelBackend, ModelConfig, ModelResponse, REQUEST_TIMEOUT};
use crate::errors::ModelError;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiBackend {
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
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            config,
        }
    }

    fn request_failed(details: impl Into<String>) -> ModelError {
        ModelError::RequestFailed {
            model: "openai".to_string(),
            details: details.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn execute(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        let model = self.config.openai.model.as_str();
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.config.openai.system_message,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
        };

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::request_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::request_failed(format!("HTTP {}: {}", status, text)));
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::InvalidResponse {
                    model: "openai".to_string(),
                    details: e.to_string(),
                })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::InvalidResponse {
                model: "openai".to_string(),
                details: "no response from OpenAI".to_string(),
            })?;

        Ok(ModelResponse::new(
            parsed.model.unwrap_or_else(|| model.to_string()),
            content,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> OpenAiBackend {
        let mut config = ModelConfig::default();
        config.openai.model = "gpt-4".to_string();
        config.temperature = 0.3;
        OpenAiBackend::new(
            reqwest::Client::new(),
            "sk-test".to_string(),
            Some(format!("{}/v1/", server.uri())),
            config,
        )
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(bearer_token("sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4",
                "temperature": 0.3,
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant."},
                    {"role": "user", "content": "Say hi"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4-0613",
                "choices": [{"message": {"role": "assistant", "content": "hi"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = backend(&server).execute("Say hi").await.unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(response.model, "gpt-4-0613");
    }

    #[tokio::test]
    async fn test_error_status_and_empty_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let err = backend.execute("x").await.unwrap_err();
        assert!(matches!(&err, ModelError::RequestFailed { details, .. } if details.contains("429")));
        let err = backend.execute("x").await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidResponse { .. }));
    }
}
