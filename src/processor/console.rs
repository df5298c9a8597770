use std::sync::Arc;

use async_trait::async_trait;

use super::{Processor, ProcessorConfig};
use crate::errors::ProcessorError;
use crate::models::ModelResponse;
use crate::template::{TemplateData, TemplateManager};

pub const DEFAULT_CONSOLE_TEMPLATE: &str = "default_console";

pub struct ConsoleProcessor {
    config: ProcessorConfig,
    templates: Arc<TemplateManager>,
}

impl ConsoleProcessor {
    pub fn new(config: ProcessorConfig, templates: Arc<TemplateManager>) -> Self {
        Self { config, templates }
    }

    /// The text written to stdout for `response`.
    pub fn render(&self, response: &ModelResponse, template_name: &str) -> String {
        let data = TemplateData::for_processor(response, self.processor_type(), template_name);
        let template_name = if template_name.is_empty() {
            DEFAULT_CONSOLE_TEMPLATE
        } else {
            template_name
        };

        let body = self.templates.safe_execute(template_name, &data);
        let body = if body.is_empty() {
            format!(
                "AI Response ({}): {}\n\n{}",
                data.model, data.prompt_name, data.content
            )
        } else {
            body
        };

        format!(
            "=== {} response for {} ===\n{}",
            data.model, data.prompt_name, body
        )
    }
}

#[async_trait]
impl Processor for ConsoleProcessor {
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        println!("{}", self.render(response, template_name));
        Ok(())
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn processor_type(&self) -> &str {
        "console"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content: &str) -> ModelResponse {
        ModelResponse {
            prompt_name: "daily".to_string(),
            ..ModelResponse::new("openai", content)
        }
    }

    #[test]
    fn test_default_console_output() {
        let processor = ConsoleProcessor::new(
            ProcessorConfig::new("console", ""),
            Arc::new(TemplateManager::new()),
        );
        let output = processor.render(&response("All systems nominal"), "");
        assert!(output.starts_with("=== openai response for daily ===\n"));
        assert!(output.contains("AI Response: daily"));
        assert!(output.contains("All systems nominal"));
    }

    #[test]
    fn test_custom_template() {
        let templates = Arc::new(TemplateManager::new());
        templates
            .register("short", "{{.Model}} says {{.Content}}")
            .unwrap();
        let processor = ConsoleProcessor::new(ProcessorConfig::new("console", ""), templates);
        assert_eq!(
            processor.render(&response("hi"), "short"),
            "=== openai response for daily ===\nopenai says hi"
        );
    }

    #[test]
    fn test_empty_render_falls_back_to_plain_output() {
        let templates = Arc::new(TemplateManager::empty());
        templates.register("blank", "").unwrap();
        let processor = ConsoleProcessor::new(ProcessorConfig::new("console", ""), templates);
        assert_eq!(
            processor.render(&response("text"), "blank"),
            "=== openai response for daily ===\nAI Response (openai): daily\n\ntext"
        );
    }
}
