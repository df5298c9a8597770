//! Output processors.
//!
//! A processor takes a [`ModelResponse`] and delivers it somewhere: stdout, a
//! file, an email, Slack, a generic webhook or GitHub. Instances are built by
//! the [`ProcessorRegistry`] from a [`ProcessorConfig`] on every dispatch.

pub mod console;
pub mod email;
pub mod file;
pub mod github;
pub mod registry;
pub mod slack;
pub mod webhook;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use console::ConsoleProcessor;
pub use email::{EmailMessage, EmailProcessor, EmailTransport, LoggingTransport};
pub use file::{FileProcessor, sanitize_filename};
pub use github::GitHubProcessor;
pub use registry::{ProcessorContext, ProcessorFactory, ProcessorRegistry, processor_factory};
pub use slack::SlackProcessor;
pub use webhook::WebhookProcessor;

use crate::errors::ProcessorError;
use crate::models::ModelResponse;

/// Timeout for outbound deliveries (Slack, webhooks, GitHub).
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifier prefixes that carry a target after the dash.
const TARGETED_PREFIXES: &[&str] = &["slack", "email", "webhook", "github", "file", "teams"];

#[async_trait]
pub trait Processor: Send + Sync {
    /// Delivers `response`. An empty `template_name` selects the processor's
    /// default template.
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError>;

    fn validate(&self) -> Result<(), ProcessorError>;

    fn processor_type(&self) -> &str;

    fn config(&self) -> &ProcessorConfig;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(rename = "type")]
    pub processor_type: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_name: String,
    /// Overrides for environment lookups, consulted before the process
    /// environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
}

impl ProcessorConfig {
    pub fn new(processor_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            processor_type: processor_type.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Looks `key` up in the configured environment, then in the process
    /// environment. Empty values count as unset.
    pub fn env(&self, key: &str) -> Option<String> {
        self.environment
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|value| !value.is_empty())
    }

    pub fn env_or(&self, key: &str, default_value: &str) -> String {
        self.env(key).unwrap_or_else(|| default_value.to_string())
    }

    pub fn test_mode(&self) -> bool {
        matches!(
            self.env("CRONAI_TEST_MODE")
                .unwrap_or_default()
                .to_lowercase()
                .as_str(),
            "true" | "1"
        )
    }
}

/// Splits a processor identifier such as `slack-alerts` into its type and
/// target.
pub fn parse_processor_identifier(identifier: &str) -> Result<(String, String), ProcessorError> {
    match identifier {
        "console" => return Ok(("console".to_string(), String::new())),
        "log-to-file" => return Ok(("file".to_string(), String::new())),
        _ => {}
    }

    if let Some((prefix, target)) = identifier.split_once('-')
        && TARGETED_PREFIXES.contains(&prefix)
    {
        return Ok((prefix.to_string(), target.to_string()));
    }

    Err(ProcessorError::Unsupported {
        identifier: identifier.to_string(),
    })
}

/// Rejects a rendered payload that is not JSON.
pub(crate) fn parse_json_payload(payload: &str, template_name: &str) -> Result<Value, ProcessorError> {
    serde_json::from_str(payload).map_err(|e| ProcessorError::InvalidPayload {
        details: format!("{}: {}", template_name, e),
    })
}

pub(crate) fn delivery_failed(processor_type: &str, details: impl ToString) -> ProcessorError {
    ProcessorError::DeliveryFailed {
        processor_type: processor_type.to_string(),
        details: details.to_string(),
    }
}
