use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Processor, ProcessorConfig};
use crate::config::SmtpConfig;
use crate::errors::{ConfigError, ProcessorError};
use crate::models::ModelResponse;
use crate::template::{TemplateData, TemplateManager};

pub const DEFAULT_EMAIL_TEMPLATE: &str = "default_email";

#[derive(Clone, Debug, PartialEq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Hands an assembled message to a mail server.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, smtp: &SmtpConfig, message: &EmailMessage) -> Result<(), ProcessorError>;
}

/// Records the delivery in the log without contacting a server.
pub struct LoggingTransport;

#[async_trait]
impl EmailTransport for LoggingTransport {
    async fn send(&self, smtp: &SmtpConfig, message: &EmailMessage) -> Result<(), ProcessorError> {
        info!(
            to = %message.to,
            from = %message.from,
            subject = %message.subject,
            server = %smtp.server,
            port = smtp.port,
            html = !message.html_body.is_empty(),
            text = !message.text_body.is_empty(),
            "Email delivery"
        );
        Ok(())
    }
}

pub struct EmailProcessor {
    config: ProcessorConfig,
    templates: Arc<TemplateManager>,
    transport: Arc<dyn EmailTransport>,
}

impl EmailProcessor {
    pub fn new(
        config: ProcessorConfig,
        templates: Arc<TemplateManager>,
        transport: Arc<dyn EmailTransport>,
    ) -> Self {
        Self {
            config,
            templates,
            transport,
        }
    }

    fn smtp_config(&self) -> Result<SmtpConfig, ProcessorError> {
        SmtpConfig::from_lookup(|key| self.config.env(key)).map_err(|e| match e {
            ConfigError::EnvVarRequired { var_name } => ProcessorError::MissingEnv { var_name },
            other => ProcessorError::ValidationFailed {
                processor_type: "email".to_string(),
                details: other.to_string(),
            },
        })
    }

    fn render_part(&self, template_name: &str, part: &str, data: &TemplateData) -> String {
        let name = format!("{}_{}", template_name, part);
        let name = if self.templates.template_exists(&name) {
            name
        } else {
            format!("{}_{}", DEFAULT_EMAIL_TEMPLATE, part)
        };
        self.templates.safe_execute(&name, data)
    }

    /// Renders the subject and both bodies for `response`.
    pub fn build_message(
        &self,
        response: &ModelResponse,
        template_name: &str,
        from: &str,
    ) -> Result<EmailMessage, ProcessorError> {
        let data = TemplateData::for_processor(response, self.processor_type(), template_name);
        let template_name = if template_name.is_empty() {
            DEFAULT_EMAIL_TEMPLATE
        } else {
            template_name
        };

        let mut subject = self
            .render_part(template_name, "subject", &data)
            .trim()
            .to_string();
        if subject.is_empty() {
            warn!(template = template_name, "Empty email subject, using default");
            subject = format!("AI Response: {}", data.prompt_name);
        }

        let html_body = self.render_part(template_name, "html", &data);
        let text_body = self.render_part(template_name, "text", &data);
        if html_body.trim().is_empty() && text_body.trim().is_empty() {
            return Err(ProcessorError::RenderFailed {
                template_name: template_name.to_string(),
                details: "both HTML and text bodies rendered empty".to_string(),
            });
        }

        Ok(EmailMessage {
            from: from.to_string(),
            to: self.config.target.clone(),
            subject,
            html_body,
            text_body,
        })
    }
}

#[async_trait]
impl Processor for EmailProcessor {
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        let smtp = self.smtp_config()?;
        if smtp.password.is_empty() {
            warn!("SMTP_PASSWORD not set");
        }
        let message = self.build_message(response, template_name, &smtp.from)?;
        self.transport.send(&smtp, &message).await
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        if self.config.target.trim().is_empty() {
            return Err(ProcessorError::ValidationFailed {
                processor_type: "email".to_string(),
                details: "email target cannot be empty".to_string(),
            });
        }
        self.smtp_config().map(|_| ())
    }

    fn processor_type(&self) -> &str {
        "email"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}
