use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    ConsoleProcessor, EmailProcessor, EmailTransport, FileProcessor, GitHubProcessor,
    LoggingTransport, Processor, ProcessorConfig, SlackProcessor, WebhookProcessor,
    parse_processor_identifier,
};
use crate::errors::ProcessorError;
use crate::models::ModelResponse;
use crate::template::TemplateManager;

/// Collaborators shared by every processor instance.
#[derive(Clone)]
pub struct ProcessorContext {
    pub templates: Arc<TemplateManager>,
    pub http_client: reqwest::Client,
    pub email_transport: Arc<dyn EmailTransport>,
}

impl ProcessorContext {
    pub fn new(templates: Arc<TemplateManager>) -> Self {
        Self {
            templates,
            http_client: reqwest::Client::new(),
            email_transport: Arc::new(LoggingTransport),
        }
    }

    pub fn with_email_transport(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.email_transport = transport;
        self
    }
}

pub type ProcessorFactory = Arc<
    dyn Fn(ProcessorConfig, &ProcessorContext) -> Result<Arc<dyn Processor>, ProcessorError>
        + Send
        + Sync,
>;

pub fn processor_factory<F>(factory: F) -> ProcessorFactory
where
    F: Fn(ProcessorConfig, &ProcessorContext) -> Result<Arc<dyn Processor>, ProcessorError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(factory)
}

/// Maps processor types to factories. A factory runs on every dispatch and
/// its product is validated before use.
pub struct ProcessorRegistry {
    context: ProcessorContext,
    factories: RwLock<HashMap<String, ProcessorFactory>>,
}

impl ProcessorRegistry {
    /// A registry with the built-in processor types installed.
    pub fn new(context: ProcessorContext) -> Self {
        let registry = Self {
            context,
            factories: RwLock::new(HashMap::new()),
        };
        registry.register_defaults();
        registry
    }

    pub fn context(&self) -> &ProcessorContext {
        &self.context
    }

    fn register_defaults(&self) {
        let defaults: [(&str, ProcessorFactory); 7] = [
            (
                "console",
                processor_factory(|config, context| {
                    Ok(Arc::new(ConsoleProcessor::new(config, context.templates.clone())))
                }),
            ),
            (
                "file",
                processor_factory(|config, context| {
                    Ok(Arc::new(FileProcessor::new(config, context.templates.clone())))
                }),
            ),
            (
                "email",
                processor_factory(|config, context| {
                    Ok(Arc::new(EmailProcessor::new(
                        config,
                        context.templates.clone(),
                        context.email_transport.clone(),
                    )))
                }),
            ),
            (
                "slack",
                processor_factory(|config, context| {
                    Ok(Arc::new(SlackProcessor::new(
                        config,
                        context.templates.clone(),
                        context.http_client.clone(),
                    )))
                }),
            ),
            (
                "webhook",
                processor_factory(|config, context| {
                    Ok(Arc::new(WebhookProcessor::new(
                        config,
                        context.templates.clone(),
                        context.http_client.clone(),
                    )))
                }),
            ),
            (
                "teams",
                processor_factory(|config, context| {
                    Ok(Arc::new(WebhookProcessor::teams(
                        config,
                        context.templates.clone(),
                        context.http_client.clone(),
                    )))
                }),
            ),
            (
                "github",
                processor_factory(|config, context| {
                    GitHubProcessor::new(
                        config,
                        context.templates.clone(),
                        context.http_client.clone(),
                    )
                    .map(|processor| Arc::new(processor) as Arc<dyn Processor>)
                }),
            ),
        ];

        for (processor_type, factory) in defaults {
            self.register_processor(processor_type, factory);
        }
    }

    /// Installs `factory` for `processor_type`, replacing any earlier one.
    pub fn register_processor(&self, processor_type: &str, factory: ProcessorFactory) {
        self.factories
            .write()
            .insert(processor_type.to_string(), factory);
        debug!(processor_type, "Registered processor");
    }

    /// Builds and validates a processor for `config`.
    pub fn create_processor(
        &self,
        config: ProcessorConfig,
    ) -> Result<Arc<dyn Processor>, ProcessorError> {
        let factory = self
            .factories
            .read()
            .get(&config.processor_type)
            .cloned()
            .ok_or_else(|| ProcessorError::UnknownType {
                processor_type: config.processor_type.clone(),
            })?;

        let processor = factory(config, &self.context)?;
        processor.validate()?;
        Ok(processor)
    }

    /// Parses a processor identifier (`slack-alerts`, `console`, ...) and
    /// builds the matching processor.
    pub fn create_from_identifier(
        &self,
        identifier: &str,
    ) -> Result<Arc<dyn Processor>, ProcessorError> {
        let (processor_type, target) = parse_processor_identifier(identifier)?;
        self.create_processor(ProcessorConfig::new(processor_type, target))
    }

    /// Builds the processor named by `identifier` and hands it `response`.
    pub async fn process_response(
        &self,
        identifier: &str,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        info!(
            processor = identifier,
            model = %response.model,
            prompt = %response.prompt_name,
            execution_id = %response.execution_id,
            template = template_name,
            content_len = response.content.len(),
            "Processing response"
        );
        let processor = self.create_from_identifier(identifier)?;
        processor.process(response, template_name).await
    }

    /// Registered types in sorted order.
    pub fn processor_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }
}
