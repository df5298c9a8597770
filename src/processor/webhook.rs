use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{info, warn};

use super::{DELIVERY_TIMEOUT, Processor, ProcessorConfig, delivery_failed, parse_json_payload};
use crate::errors::ProcessorError;
use crate::models::ModelResponse;
use crate::template::{TemplateData, TemplateManager};

pub const DEFAULT_WEBHOOK_TEMPLATE: &str = "default_webhook";
pub const DEFAULT_WEBHOOK_METHOD: &str = "POST";

/// Maximum Teams message size in bytes.
pub const TEAMS_PAYLOAD_LIMIT: usize = 25 * 1024;

const TEAMS: &str = "teams";
const TRUNCATION_MARKER: &str = "... [truncated]";

pub struct WebhookProcessor {
    config: ProcessorConfig,
    webhook_type: String,
    templates: Arc<TemplateManager>,
    http_client: reqwest::Client,
}

/// Parses `Key:Value,Key:Value`. Entries without a colon are skipped.
pub fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| entry.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// JSON pointer to the longest string anywhere in `value`.
fn longest_string(value: &Value, pointer: String, best: &mut Option<(usize, String)>) {
    match value {
        Value::String(s) => {
            if best.as_ref().is_none_or(|(len, _)| s.len() > *len) {
                *best = Some((s.len(), pointer));
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                longest_string(item, format!("{}/{}", pointer, index), best);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                longest_string(item, format!("{}/{}", pointer, escaped), best);
            }
        }
        _ => {}
    }
}

fn truncate_at_char_boundary(s: &mut String, max_len: usize) {
    let mut cut = max_len.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Shrinks the longest strings of `payload` until its encoding fits in
/// `limit` bytes. The result is always a complete JSON document.
pub fn fit_payload(mut payload: Value, limit: usize) -> Result<Value, ProcessorError> {
    loop {
        let size = serde_json::to_vec(&payload)
            .map_err(|e| ProcessorError::InvalidPayload {
                details: e.to_string(),
            })?
            .len();
        if size <= limit {
            return Ok(payload);
        }

        let mut best = None;
        longest_string(&payload, String::new(), &mut best);
        let too_large = || ProcessorError::InvalidPayload {
            details: format!("payload of {} bytes exceeds limit of {} bytes", size, limit),
        };
        let Some((len, pointer)) = best else {
            return Err(too_large());
        };
        if len <= TRUNCATION_MARKER.len() {
            return Err(too_large());
        }

        let excess = size - limit;
        let keep = len.saturating_sub(excess + TRUNCATION_MARKER.len());
        if let Some(Value::String(s)) = payload.pointer_mut(&pointer) {
            truncate_at_char_boundary(s, keep);
            s.push_str(TRUNCATION_MARKER);
        }
    }
}

impl WebhookProcessor {
    /// A webhook whose type is the processor target.
    pub fn new(
        config: ProcessorConfig,
        templates: Arc<TemplateManager>,
        http_client: reqwest::Client,
    ) -> Self {
        let webhook_type = config.target.trim().to_lowercase();
        Self {
            config,
            webhook_type,
            templates,
            http_client,
        }
    }

    /// A Microsoft Teams webhook; the target only names the channel.
    pub fn teams(
        config: ProcessorConfig,
        templates: Arc<TemplateManager>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            webhook_type: TEAMS.to_string(),
            templates,
            http_client,
        }
    }

    pub fn webhook_type(&self) -> &str {
        &self.webhook_type
    }

    fn typed_env(&self, prefix: &str) -> Option<String> {
        if self.webhook_type.is_empty() {
            return self.config.env(prefix);
        }
        self.config
            .env(&format!("{}_{}", prefix, self.webhook_type.to_uppercase()))
            .or_else(|| self.config.env(prefix))
    }

    pub fn url(&self) -> Option<String> {
        if self.webhook_type == TEAMS
            && let Some(url) = self.config.env("TEAMS_WEBHOOK_URL")
        {
            return Some(url);
        }
        self.typed_env("WEBHOOK_URL")
    }

    pub fn method(&self) -> Result<Method, ProcessorError> {
        let raw = self
            .typed_env("WEBHOOK_METHOD")
            .unwrap_or_else(|| DEFAULT_WEBHOOK_METHOD.to_string());
        Method::from_bytes(raw.trim().to_uppercase().as_bytes()).map_err(|_| {
            ProcessorError::ValidationFailed {
                processor_type: "webhook".to_string(),
                details: format!("invalid HTTP method: {}", raw),
            }
        })
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.typed_env("WEBHOOK_HEADERS")
            .map(|raw| parse_headers(&raw))
            .unwrap_or_default()
    }

    fn template_for(&self, template_name: &str) -> String {
        if !template_name.is_empty() {
            return template_name.to_string();
        }
        let typed = format!("{}_{}", DEFAULT_WEBHOOK_TEMPLATE, self.webhook_type);
        if !self.webhook_type.is_empty() && self.templates.template_exists(&typed) {
            typed
        } else {
            DEFAULT_WEBHOOK_TEMPLATE.to_string()
        }
    }

    /// Renders and checks the request body.
    pub fn build_payload(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<Value, ProcessorError> {
        let mut data = TemplateData::for_processor(response, self.processor_type(), template_name);
        let template_name = self.template_for(template_name);
        data.metadata
            .insert("webhook_type".to_string(), self.webhook_type.clone());
        data.metadata
            .insert("template_used".to_string(), template_name.clone());

        let rendered = self.templates.safe_execute(&template_name, &data);
        if rendered.trim().is_empty() {
            return Err(ProcessorError::RenderFailed {
                template_name,
                details: "empty webhook payload".to_string(),
            });
        }

        let payload = parse_json_payload(&rendered, &template_name)?;
        if self.webhook_type == TEAMS && rendered.len() > TEAMS_PAYLOAD_LIMIT {
            warn!(
                size = rendered.len(),
                limit = TEAMS_PAYLOAD_LIMIT,
                "Teams payload too large, truncating"
            );
            return fit_payload(payload, TEAMS_PAYLOAD_LIMIT);
        }
        Ok(payload)
    }
}

#[async_trait]
impl Processor for WebhookProcessor {
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        let url = self.url().ok_or_else(|| ProcessorError::MissingEnv {
            var_name: format!("WEBHOOK_URL_{}", self.webhook_type.to_uppercase()),
        })?;
        let method = self.method()?;
        let payload = self.build_payload(response, template_name)?;

        let mut request = self
            .http_client
            .request(method.clone(), url.as_str())
            .timeout(DELIVERY_TIMEOUT)
            .json(&payload);
        for (key, value) in self.headers() {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| delivery_failed(self.processor_type(), e))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(delivery_failed(
                self.processor_type(),
                format!("webhook error: {} - {}", status, body),
            ));
        }

        info!(
            webhook_type = %self.webhook_type,
            %method,
            status = status.as_u16(),
            "Webhook delivered"
        );
        Ok(())
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        if self.url().is_none() {
            return Err(ProcessorError::MissingEnv {
                var_name: format!("WEBHOOK_URL_{}", self.webhook_type.to_uppercase()),
            });
        }
        self.method().map(|_| ())
    }

    fn processor_type(&self) -> &str {
        if self.webhook_type == TEAMS {
            TEAMS
        } else {
            "webhook"
        }
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}
