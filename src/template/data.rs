use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::functions::{object, rfc3339};
use crate::models::ModelResponse;

/// The value handed to a template when it renders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplateData {
    pub content: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_name: String,
    pub execution_id: String,
    pub variables: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub parent: Option<Value>,
}

impl TemplateData {
    /// Builds template data for a processor, filling the standard metadata
    /// keys (`timestamp`, `date`, `time`, `execution_id`, `processor`, and
    /// `template` when one was requested).
    pub fn for_processor(response: &ModelResponse, processor: &str, template_name: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("timestamp".to_string(), rfc3339(&response.timestamp));
        metadata.insert(
            "date".to_string(),
            response.timestamp.format("%Y-%m-%d").to_string(),
        );
        metadata.insert(
            "time".to_string(),
            response.timestamp.format("%H:%M:%S").to_string(),
        );
        metadata.insert("execution_id".to_string(), response.execution_id.clone());
        metadata.insert("processor".to_string(), processor.to_string());
        if !template_name.is_empty() {
            metadata.insert("template".to_string(), template_name.to_string());
        }

        Self {
            content: response.content.clone(),
            model: response.model.clone(),
            timestamp: response.timestamp,
            prompt_name: response.prompt_name.clone(),
            execution_id: response.execution_id.clone(),
            variables: response.variables.clone(),
            metadata,
            parent: None,
        }
    }

    /// The rendering context: every field plus each variable promoted to the
    /// top level, so `.Variables.foo` and `.foo` both resolve. Named fields
    /// win over a variable with the same name.
    pub(crate) fn to_context(&self) -> Value {
        let variables = string_map(&self.variables);
        let mut entries: Vec<(String, Value)> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        entries.extend([
            ("Content".to_string(), Value::String(self.content.clone())),
            ("Model".to_string(), Value::String(self.model.clone())),
            ("Timestamp".to_string(), Value::String(rfc3339(&self.timestamp))),
            ("PromptName".to_string(), Value::String(self.prompt_name.clone())),
            ("ExecutionID".to_string(), Value::String(self.execution_id.clone())),
            ("Variables".to_string(), variables),
            ("Metadata".to_string(), string_map(&self.metadata)),
            ("Parent".to_string(), self.parent.clone().unwrap_or(Value::Null)),
        ]);

        object(entries)
    }
}

fn string_map(map: &HashMap<String, String>) -> Value {
    object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone()))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_promotes_variables() {
        let mut data = TemplateData {
            content: "body".to_string(),
            ..Default::default()
        };
        data.variables.insert("project".to_string(), "CronAI".to_string());
        data.variables.insert("Content".to_string(), "shadowed".to_string());

        let context = data.to_context();
        assert_eq!(context["project"], "CronAI");
        assert_eq!(context["Variables"]["project"], "CronAI");
        assert_eq!(context["Content"], "body");
        assert_eq!(context["Variables"]["Content"], "shadowed");
    }

    #[test]
    fn test_processor_metadata() {
        let response = ModelResponse {
            content: "hi".to_string(),
            model: "openai".to_string(),
            prompt_name: "daily".to_string(),
            execution_id: "openai-daily-20240101000000".to_string(),
            ..Default::default()
        };
        let data = TemplateData::for_processor(&response, "console", "");
        assert_eq!(data.metadata["processor"], "console");
        assert_eq!(data.metadata["execution_id"], response.execution_id);
        assert!(!data.metadata.contains_key("template"));
    }
}
