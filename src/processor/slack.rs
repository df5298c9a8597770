use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{DELIVERY_TIMEOUT, Processor, ProcessorConfig, delivery_failed, parse_json_payload};
use crate::errors::ProcessorError;
use crate::models::ModelResponse;
use crate::template::{TemplateData, TemplateManager};

pub const DEFAULT_SLACK_TEMPLATE: &str = "default_slack";
pub const DEFAULT_SLACK_MONITORING_TEMPLATE: &str = "default_slack_monitoring";
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";

const MONITORING_MARKERS: &[&str] = &["monitor", "alert", "health"];

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackProcessor {
    config: ProcessorConfig,
    templates: Arc<TemplateManager>,
    http_client: reqwest::Client,
}

impl SlackProcessor {
    pub fn new(
        config: ProcessorConfig,
        templates: Arc<TemplateManager>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            templates,
            http_client,
        }
    }

    fn default_template(prompt_name: &str) -> &'static str {
        let prompt_name = prompt_name.to_lowercase();
        if MONITORING_MARKERS
            .iter()
            .any(|marker| prompt_name.contains(marker))
        {
            DEFAULT_SLACK_MONITORING_TEMPLATE
        } else {
            DEFAULT_SLACK_TEMPLATE
        }
    }

    /// Renders the message payload, adding the target channel when the
    /// template did not set one.
    pub fn build_payload(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<Value, ProcessorError> {
        let mut data = TemplateData::for_processor(response, self.processor_type(), template_name);
        let template_name = if template_name.is_empty() {
            Self::default_template(&data.prompt_name)
        } else {
            template_name
        };
        data.metadata
            .insert("slack_channel".to_string(), self.config.target.clone());
        data.metadata
            .insert("template_used".to_string(), template_name.to_string());

        let rendered = self.templates.safe_execute(template_name, &data);
        if rendered.trim().is_empty() {
            return Err(ProcessorError::RenderFailed {
                template_name: template_name.to_string(),
                details: "empty Slack payload".to_string(),
            });
        }

        let mut payload = parse_json_payload(&rendered, template_name)?;
        let object = payload
            .as_object_mut()
            .ok_or_else(|| ProcessorError::InvalidPayload {
                details: format!("{}: Slack payload must be a JSON object", template_name),
            })?;
        object
            .entry("channel")
            .or_insert_with(|| Value::String(self.config.target.clone()));
        Ok(payload)
    }

    async fn send_via_webhook(&self, url: &str, payload: &Value) -> Result<(), ProcessorError> {
        let response = self
            .http_client
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .json(payload)
            .send()
            .await
            .map_err(|e| delivery_failed("slack", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| delivery_failed("slack", e))?;
        if !status.is_success() {
            return Err(delivery_failed(
                "slack",
                format!("webhook error: {} - {}", status, body),
            ));
        }
        if body.trim() != "ok" {
            return Err(delivery_failed(
                "slack",
                format!("unexpected webhook response: {}", body),
            ));
        }
        Ok(())
    }

    async fn send_via_api(&self, token: &str, payload: &Value) -> Result<(), ProcessorError> {
        let url = self.config.env_or("SLACK_API_URL", DEFAULT_SLACK_API_URL);
        let response = self
            .http_client
            .post(url.as_str())
            .bearer_auth(token)
            .timeout(DELIVERY_TIMEOUT)
            .json(payload)
            .send()
            .await
            .map_err(|e| delivery_failed("slack", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(delivery_failed(
                "slack",
                format!("API error: {} - {}", status, body),
            ));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| delivery_failed("slack", e))?;
        if !parsed.ok {
            return Err(delivery_failed(
                "slack",
                format!("API returned error: {}", parsed.error.unwrap_or_default()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for SlackProcessor {
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        self.validate()?;
        let payload = self.build_payload(response, template_name)?;

        if self.config.test_mode() {
            info!(channel = %self.config.target, "Test mode, skipping Slack delivery");
            return Ok(());
        }

        if let Some(url) = self.config.env("SLACK_WEBHOOK_URL") {
            self.send_via_webhook(&url, &payload).await?;
        } else if let Some(token) = self.config.env("SLACK_TOKEN") {
            self.send_via_api(&token, &payload).await?;
        }

        info!(channel = %self.config.target, "Sent message to Slack");
        Ok(())
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        if self.config.target.trim().is_empty() {
            return Err(ProcessorError::ValidationFailed {
                processor_type: "slack".to_string(),
                details: "slack channel cannot be empty".to_string(),
            });
        }
        if self.config.env("SLACK_TOKEN").is_none() && self.config.env("SLACK_WEBHOOK_URL").is_none()
        {
            return Err(ProcessorError::MissingEnv {
                var_name: "SLACK_TOKEN or SLACK_WEBHOOK_URL".to_string(),
            });
        }
        Ok(())
    }

    fn processor_type(&self) -> &str {
        "slack"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn processor(config: ProcessorConfig, templates: Arc<TemplateManager>) -> SlackProcessor {
        SlackProcessor::new(config, templates, reqwest::Client::new())
    }

    fn response(prompt_name: &str) -> ModelResponse {
        ModelResponse {
            prompt_name: prompt_name.to_string(),
            ..ModelResponse::new("openai", "Disk at 91%, warning")
        }
    }

    #[test]
    fn test_validate() {
        let templates = Arc::new(TemplateManager::new());
        let configured = ProcessorConfig::new("slack", "alerts").with_env("SLACK_TOKEN", "xoxb");
        assert!(processor(configured, templates.clone()).validate().is_ok());

        let no_channel = ProcessorConfig::new("slack", "").with_env("SLACK_TOKEN", "xoxb");
        assert!(matches!(
            processor(no_channel, templates.clone()).validate(),
            Err(ProcessorError::ValidationFailed { .. })
        ));

        let no_credentials = ProcessorConfig::new("slack", "alerts")
            .with_env("SLACK_TOKEN", "")
            .with_env("SLACK_WEBHOOK_URL", "");
        assert!(matches!(
            processor(no_credentials, templates).validate(),
            Err(ProcessorError::MissingEnv { .. })
        ));
    }

    #[test]
    fn test_monitoring_prompts_use_monitoring_template() {
        let slack = processor(
            ProcessorConfig::new("slack", "ops").with_env("SLACK_TOKEN", "x"),
            Arc::new(TemplateManager::new()),
        );

        let payload = slack.build_payload(&response("disk_health"), "").unwrap();
        assert_eq!(payload["channel"], "ops");
        assert_eq!(payload["attachments"][0]["color"], "warning");

        let payload = slack.build_payload(&response("daily_digest"), "").unwrap();
        assert!(payload["blocks"].is_array());
    }

    #[test]
    fn test_template_channel_is_kept_and_invalid_json_rejected() {
        let templates = Arc::new(TemplateManager::new());
        templates
            .register("routed", r##"{"channel":"#elsewhere","text":{{json .Content}}}"##)
            .unwrap();
        templates.register("broken", "{not json").unwrap();
        let slack = processor(
            ProcessorConfig::new("slack", "ops").with_env("SLACK_TOKEN", "x"),
            templates,
        );

        let payload = slack.build_payload(&response("p"), "routed").unwrap();
        assert_eq!(payload["channel"], "#elsewhere");
        assert!(matches!(
            slack.build_payload(&response("p"), "broken"),
            Err(ProcessorError::InvalidPayload { .. })
        ));
    }

    #[tokio::test]
    async fn test_post_message_via_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat.postMessage"))
            .and(bearer_token("xoxb-test"))
            .and(body_partial_json(json!({"channel": "alerts"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let config = ProcessorConfig::new("slack", "alerts")
            .with_env("SLACK_TOKEN", "xoxb-test")
            .with_env("SLACK_WEBHOOK_URL", "")
            .with_env("CRONAI_TEST_MODE", "false")
            .with_env(
                "SLACK_API_URL",
                &format!("{}/api/chat.postMessage", server.uri()),
            );
        processor(config, Arc::new(TemplateManager::new()))
            .process(&response("daily"), "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;

        let config = ProcessorConfig::new("slack", "nowhere")
            .with_env("SLACK_TOKEN", "xoxb-test")
            .with_env("SLACK_WEBHOOK_URL", "")
            .with_env("CRONAI_TEST_MODE", "false")
            .with_env("SLACK_API_URL", &server.uri());
        let err = processor(config, Arc::new(TemplateManager::new()))
            .process(&response("daily"), "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[tokio::test]
    async fn test_incoming_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/T000"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let config = ProcessorConfig::new("slack", "alerts")
            .with_env("CRONAI_TEST_MODE", "false")
            .with_env("SLACK_WEBHOOK_URL", &format!("{}/hooks/T000", server.uri()));
        processor(config, Arc::new(TemplateManager::new()))
            .process(&response("daily"), "")
            .await
            .unwrap();
    }
}
