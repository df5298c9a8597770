use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::{Message, TaskMessage};
use crate::errors::QueueError;
use crate::models::SUPPORTED_MODELS;

/// Turns a raw delivery into a task.
pub trait MessageParser: Send + Sync {
    fn parse(&self, message: &Message) -> Result<TaskMessage, QueueError>;
}

/// Accepts the comprehensive (`model`, `prompt`, `processor` in the body)
/// and minimal (`variables` in the body, the rest in attributes) formats.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonMessageParser;

#[derive(Deserialize)]
struct RawTask {
    model: Option<String>,
    prompt: Option<String>,
    processor: Option<String>,
    #[serde(default)]
    variables: Option<HashMap<String, String>>,
    is_inline: Option<bool>,
}

impl RawTask {
    fn is_comprehensive(&self) -> bool {
        self.model.is_some()
            || self.prompt.is_some()
            || self.processor.is_some()
            || self.is_inline.is_some()
    }
}

fn require(fields: &[(&str, Option<String>)]) -> Result<Vec<String>, QueueError> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(QueueError::MissingFields {
            fields: missing.join(", "),
        });
    }
    Ok(fields
        .iter()
        .map(|(_, value)| value.clone().unwrap_or_default())
        .collect())
}

impl MessageParser for JsonMessageParser {
    fn parse(&self, message: &Message) -> Result<TaskMessage, QueueError> {
        if message.body.iter().all(u8::is_ascii_whitespace) {
            return Err(QueueError::ParseFailed {
                details: "empty message body".to_string(),
            });
        }

        let value: Value =
            serde_json::from_slice(&message.body).map_err(|e| QueueError::ParseFailed {
                details: format!("invalid format: {}", e),
            })?;
        if !value.is_object() {
            return Err(QueueError::ParseFailed {
                details: "invalid format: expected a JSON object".to_string(),
            });
        }
        let raw: RawTask = serde_json::from_value(value).map_err(|e| QueueError::ParseFailed {
            details: format!("invalid format: {}", e),
        })?;

        let (fields, is_inline) = if raw.is_comprehensive() {
            (
                require(&[
                    ("model", raw.model),
                    ("prompt", raw.prompt),
                    ("processor", raw.processor),
                ])?,
                raw.is_inline.unwrap_or(false),
            )
        } else {
            let attribute = |key: &str| message.attributes.get(key).cloned();
            let is_inline = attribute("is_inline")
                .map(|value| value.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            (
                require(&[
                    ("model", attribute("model")),
                    ("prompt", attribute("prompt")),
                    ("processor", attribute("processor")),
                ])?,
                is_inline,
            )
        };

        let [model, prompt, processor]: [String; 3] =
            fields
                .try_into()
                .map_err(|_| QueueError::ParseFailed {
                    details: "invalid format".to_string(),
                })?;

        Ok(TaskMessage {
            model: model.trim().to_string(),
            prompt: prompt.trim().to_string(),
            processor: processor.trim().to_string(),
            variables: raw.variables.unwrap_or_default(),
            is_inline,
        })
    }
}

fn invalid(details: impl Into<String>) -> QueueError {
    QueueError::InvalidTask {
        details: details.into(),
    }
}

impl TaskMessage {
    /// Checks the task is runnable before any model is called.
    pub fn validate(&self) -> Result<(), QueueError> {
        let model = self.model.trim();
        if model.is_empty() {
            return Err(invalid("model cannot be empty"));
        }
        if !SUPPORTED_MODELS
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(model))
        {
            return Err(invalid(format!("unsupported model: {}", model)));
        }

        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt cannot be empty"));
        }
        if !self.is_inline && self.prompt.contains('\n') {
            return Err(invalid("prompt name cannot contain newlines"));
        }

        if self.processor.trim().is_empty() {
            return Err(invalid("processor cannot be empty"));
        }

        for (key, value) in &self.variables {
            if key.is_empty() {
                return Err(invalid("variable name cannot be empty"));
            }
            if key.chars().any(char::is_whitespace) {
                return Err(invalid(format!("variable name contains whitespace: {:?}", key)));
            }
            if value.is_empty() {
                return Err(invalid(format!("variable {} has an empty value", key)));
            }
        }
        Ok(())
    }
}
