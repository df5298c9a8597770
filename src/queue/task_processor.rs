use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::TaskMessage;
use super::coordinator::TaskProcessor;
use crate::errors::TaskError;
use crate::models::{ModelExecutor, ModelResponse};
use crate::processor::ProcessorRegistry;
use crate::prompt::PromptManager;

/// Variable naming the processor template to render with.
pub const TEMPLATE_VARIABLE: &str = "template";

/// Runs the prompt, model and processor stages for one task. Shared by the
/// queue coordinator, the cron scheduler and the `run` command.
#[derive(Clone)]
pub struct PipelineTaskProcessor {
    prompts: Arc<PromptManager>,
    models: Arc<ModelExecutor>,
    processors: Arc<ProcessorRegistry>,
}

impl PipelineTaskProcessor {
    pub fn new(
        prompts: Arc<PromptManager>,
        models: Arc<ModelExecutor>,
        processors: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            prompts,
            models,
            processors,
        }
    }

    /// Executes `task` with extra model parameters (`key=value,...`) and
    /// returns the response handed to the processor.
    pub async fn run(
        &self,
        task: &TaskMessage,
        model_params: &str,
        cancel_token: &CancellationToken,
    ) -> Result<ModelResponse, TaskError> {
        let started = Instant::now();
        info!(
            model = %task.model,
            prompt = %task.prompt,
            processor = %task.processor,
            is_inline = task.is_inline,
            "Processing task"
        );

        let mut variables = task.variables.clone();
        variables.insert("promptName".to_string(), task.prompt.clone());

        let content = if task.is_inline {
            debug!(content_len = task.prompt.len(), "Using inline prompt");
            task.prompt.clone()
        } else {
            self.prompts
                .load_prompt_with_variables(&task.prompt, &variables)?
        };

        let model = task.model.trim().to_lowercase();
        let response = self
            .models
            .execute_model(&model, &content, &variables, model_params, cancel_token)
            .await?;

        let template_name = variables
            .get(TEMPLATE_VARIABLE)
            .map(String::as_str)
            .unwrap_or_default();
        self.processors
            .process_response(&task.processor, &response, template_name)
            .await?;

        info!(
            duration = ?started.elapsed(),
            model = %response.model,
            processor = %task.processor,
            execution_id = %response.execution_id,
            "Task completed"
        );
        Ok(response)
    }
}

#[async_trait]
impl TaskProcessor for PipelineTaskProcessor {
    async fn process(
        &self,
        task: &TaskMessage,
        cancel_token: &CancellationToken,
    ) -> Result<(), TaskError> {
        self.run(task, "", cancel_token).await.map(|_| ())
    }
}
