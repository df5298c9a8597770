use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Coarse classification shared by every error in the crate.
///
/// The category drives two decisions: whether a failed task is worth
/// retrying, and which HTTP status a webhook failure maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ErrorCategory {
    #[default]
    Unknown,
    Configuration,
    Validation,
    External,
    System,
    Application,
    Security,
}

impl ErrorCategory {
    /// Transient categories flow through the queue retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::External | ErrorCategory::System | ErrorCategory::Unknown
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Unknown => "UNKNOWN",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::External => "EXTERNAL",
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::Application => "APPLICATION",
            ErrorCategory::Security => "SECURITY",
        };
        f.write_str(label)
    }
}

/// An arbitrary error tagged with a category and structured context.
#[derive(Debug)]
pub struct CategorizedError {
    category: ErrorCategory,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    context: BTreeMap<String, String>,
}

impl CategorizedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    pub fn wrap<E>(source: E, category: ErrorCategory, message: impl Into<String>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            category,
            message: message.into(),
            source: Some(Box::new(source)),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for CategorizedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-cronai-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-cronai-config-2 Version not available")]
    VersionNotAvailable,

    #[error("error-cronai-config-3 Invalid port number: {port}")]
    InvalidPortNumber { port: String },

    #[error("error-cronai-config-4 Invalid value for {name}: {details}")]
    InvalidValue { name: String, details: String },

    #[error("error-cronai-config-5 Invalid duration: {value}")]
    InvalidDuration { value: String },

    #[error("error-cronai-config-6 Webhook secret too short: must be at least {min} characters")]
    WebhookSecretTooShort { min: usize },
}

impl ConfigError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("error-cronai-template-1 Template parse failed: {name}: {details}")]
    ParseFailed { name: String, details: String },

    #[error("error-cronai-template-2 Template not found: {name}")]
    NotFound { name: String },

    #[error("error-cronai-template-3 Template execution failed: {name}: {details}")]
    RenderFailed { name: String, details: String },

    #[error("error-cronai-template-4 Template inheritance cycle: {chain}")]
    InheritanceCycle { chain: String },

    #[error("error-cronai-template-5 Template file operation failed: {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TemplateError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TemplateError::ParseFailed { .. } | TemplateError::NotFound { .. } => {
                ErrorCategory::Validation
            }
            TemplateError::RenderFailed { .. } | TemplateError::InheritanceCycle { .. } => {
                ErrorCategory::Application
            }
            TemplateError::Io { .. } => ErrorCategory::System,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("error-cronai-processor-1 Unsupported processor: {identifier}")]
    Unsupported { identifier: String },

    #[error("error-cronai-processor-2 Processor type not registered: {processor_type}")]
    UnknownType { processor_type: String },

    #[error("error-cronai-processor-3 Processor validation failed: {processor_type}: {details}")]
    ValidationFailed {
        processor_type: String,
        details: String,
    },

    #[error("error-cronai-processor-4 Required environment variable not set: {var_name}")]
    MissingEnv { var_name: String },

    #[error("error-cronai-processor-5 Payload rendering failed: {template_name}: {details}")]
    RenderFailed {
        template_name: String,
        details: String,
    },

    #[error("error-cronai-processor-6 Invalid payload: {details}")]
    InvalidPayload { details: String },

    #[error("error-cronai-processor-7 Path traversal detected: {path}")]
    PathTraversal { path: String },

    #[error("error-cronai-processor-8 File operation failed: {operation}: {path}: {source}")]
    Io {
        operation: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error-cronai-processor-9 Delivery failed: {processor_type}: {details}")]
    DeliveryFailed {
        processor_type: String,
        details: String,
    },
}

impl ProcessorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessorError::Unsupported { .. }
            | ProcessorError::UnknownType { .. }
            | ProcessorError::MissingEnv { .. } => ErrorCategory::Configuration,
            ProcessorError::ValidationFailed { .. } => ErrorCategory::Validation,
            ProcessorError::RenderFailed { .. } | ProcessorError::InvalidPayload { .. } => {
                ErrorCategory::Application
            }
            ProcessorError::PathTraversal { .. } => ErrorCategory::Security,
            ProcessorError::Io { .. } => ErrorCategory::System,
            ProcessorError::DeliveryFailed { .. } => ErrorCategory::External,
        }
    }
}

/// One failed attempt within a fallback chain.
#[derive(Error, Debug)]
#[error("{model} (attempt {}): {message}: {cause}", .retry_index + 1)]
pub struct ModelAttemptError {
    pub model: String,
    pub message: String,
    pub retry_index: u32,
    #[source]
    pub cause: ModelError,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("error-cronai-model-1 API key not set: {var_name}")]
    MissingApiKey { var_name: String },

    #[error("error-cronai-model-2 Invalid model parameter: {key}: {details}")]
    InvalidParameter { key: String, details: String },

    #[error("error-cronai-model-3 Unsupported model: {model}")]
    UnsupportedModel { model: String },

    #[error("error-cronai-model-4 Model request failed: {model}: {details}")]
    RequestFailed { model: String, details: String },

    #[error("error-cronai-model-5 Model returned an unusable response: {model}: {details}")]
    InvalidResponse { model: String, details: String },

    #[error("error-cronai-model-6 All models failed: {}", format_attempts(.attempts))]
    AllModelsFailed { attempts: Vec<ModelAttemptError> },

    #[error("error-cronai-model-7 Model execution cancelled")]
    Cancelled,
}

fn format_attempts(attempts: &[ModelAttemptError]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ModelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ModelError::MissingApiKey { .. } => ErrorCategory::Configuration,
            ModelError::InvalidParameter { .. } | ModelError::UnsupportedModel { .. } => {
                ErrorCategory::Validation
            }
            ModelError::RequestFailed { .. }
            | ModelError::InvalidResponse { .. }
            | ModelError::AllModelsFailed { .. } => ErrorCategory::External,
            ModelError::Cancelled => ErrorCategory::Application,
        }
    }
}

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("error-cronai-prompt-1 Prompt not found: {name}: {path}")]
    NotFound { name: String, path: String },

    #[error("error-cronai-prompt-2 Prompt read failed: {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error-cronai-prompt-3 Prompt rendering failed: {name}: {source}")]
    RenderFailed {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("error-cronai-prompt-4 Invalid prompt name: {name}")]
    InvalidName { name: String },
}

impl PromptError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PromptError::NotFound { .. } => ErrorCategory::Validation,
            PromptError::Io { .. } => ErrorCategory::System,
            PromptError::RenderFailed { .. } => ErrorCategory::Application,
            PromptError::InvalidName { .. } => ErrorCategory::Security,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("error-cronai-queue-1 Unable to parse message: {details}")]
    ParseFailed { details: String },

    #[error("error-cronai-queue-2 Message missing required fields: {fields}")]
    MissingFields { fields: String },

    #[error("error-cronai-queue-3 Invalid task message: {details}")]
    InvalidTask { details: String },

    #[error("error-cronai-queue-4 Queue connection failed: {queue_type}: {details}")]
    ConnectionFailed { queue_type: String, details: String },

    #[error("error-cronai-queue-5 Redis queue operation failed: {operation}: {source}")]
    RedisOperationFailed {
        operation: String,
        #[source]
        source: deadpool_redis::redis::RedisError,
    },

    #[error("error-cronai-queue-6 AMQP operation failed: {operation}: {source}")]
    AmqpOperationFailed {
        operation: String,
        #[source]
        source: lapin::Error,
    },

    #[error("error-cronai-queue-7 Consumer not connected: {consumer}")]
    NotConnected { consumer: String },

    #[error("error-cronai-queue-8 Consumer already registered: {consumer}")]
    ConsumerExists { consumer: String },

    #[error("error-cronai-queue-9 Consumer not found: {consumer}")]
    ConsumerNotFound { consumer: String },

    #[error("error-cronai-queue-10 No consumers registered")]
    NoConsumers,

    #[error("error-cronai-queue-11 Unsupported queue type: {queue_type}")]
    UnsupportedType { queue_type: String },

    #[error("error-cronai-queue-12 Invalid consumer configuration: {details}")]
    InvalidConfig { details: String },

    #[error("error-cronai-queue-13 Timed out waiting for consumers to stop")]
    ShutdownTimeout,

    #[error("error-cronai-queue-14 Coordinator already running")]
    AlreadyRunning,
}

impl QueueError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::ParseFailed { .. }
            | QueueError::MissingFields { .. }
            | QueueError::InvalidTask { .. } => ErrorCategory::Validation,
            QueueError::ConnectionFailed { .. }
            | QueueError::RedisOperationFailed { .. }
            | QueueError::AmqpOperationFailed { .. } => ErrorCategory::External,
            QueueError::UnsupportedType { .. } | QueueError::InvalidConfig { .. } => {
                ErrorCategory::Configuration
            }
            QueueError::NotConnected { .. }
            | QueueError::ConsumerExists { .. }
            | QueueError::ConsumerNotFound { .. }
            | QueueError::NoConsumers
            | QueueError::AlreadyRunning => ErrorCategory::Application,
            QueueError::ShutdownTimeout => ErrorCategory::System,
        }
    }
}

/// Failure of the shared prompt → model → processor pipeline.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Other(#[from] CategorizedError),
}

impl TaskError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskError::Prompt(e) => e.category(),
            TaskError::Model(e) => e.category(),
            TaskError::Processor(e) => e.category(),
            TaskError::Other(e) => e.category(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("error-cronai-webhook-1 Invalid event payload: {event_type}: {details}")]
    InvalidPayload { event_type: String, details: String },

    #[error("error-cronai-webhook-2 Handler error for {event_type} event: {source}")]
    HandlerFailed {
        event_type: String,
        #[source]
        source: Box<TaskError>,
    },
}

impl WebhookError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WebhookError::InvalidPayload { .. } => ErrorCategory::Validation,
            WebhookError::HandlerFailed { source, .. } => source.category(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("error-cronai-http-100 Unhandled web error: {details}")]
    Unhandled { details: String },

    #[error("error-cronai-http-101 Missing header: {header}")]
    MissingHeader { header: String },

    #[error("error-cronai-http-102 Invalid signature")]
    InvalidSignature,

    #[error("error-cronai-http-103 Rate limit exceeded")]
    RateLimited,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("error-cronai-scheduler-1 Invalid task line {line_number}: {details}")]
    InvalidLine { line_number: usize, details: String },

    #[error("error-cronai-scheduler-2 Cron expression parsing failed: {expression}: {details}")]
    CronParseFailed { expression: String, details: String },

    #[error("error-cronai-scheduler-3 Configuration invalid:\n{}", .errors.join("\n"))]
    ConfigInvalid { errors: Vec<String> },

    #[error("error-cronai-scheduler-4 Configuration file read failed: {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error-cronai-scheduler-5 Task index out of range: {index} (have {count})")]
    TaskOutOfRange { index: usize, count: usize },

    #[error("error-cronai-scheduler-6 Task execution failed: {0}")]
    TaskFailed(#[from] TaskError),
}

impl SchedulerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SchedulerError::Io { .. } => ErrorCategory::System,
            SchedulerError::TaskFailed(e) => e.category(),
            _ => ErrorCategory::Configuration,
        }
    }
}
