//! Model invocation: pluggable backends behind [`ModelBackend`] and a
//! fallback chain that walks several backends with retries.

pub mod claude;
pub mod config;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::ModelConfig;

use crate::errors::{ModelAttemptError, ModelError};

/// Backend names accepted as a task's model.
pub const SUPPORTED_MODELS: [&str; 3] = ["openai", "claude", "gemini"];

/// Per-request timeout applied by the HTTP backends.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
    pub prompt_name: String,
    pub variables: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
}

impl ModelResponse {
    /// A response carrying only generated text; the executor fills in the
    /// rest once a backend succeeds.
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }
}

/// A single AI provider.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn execute(&self, prompt: &str) -> Result<ModelResponse, ModelError>;
}

/// Builds a backend for a model name from the effective configuration.
pub trait BackendFactory: Send + Sync {
    fn create(&self, model: &str, config: &ModelConfig)
    -> Result<Arc<dyn ModelBackend>, ModelError>;
}

/// Credentials and endpoints for the HTTP backends.
#[derive(Clone, Debug, Default)]
pub struct BackendSettings {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub gemini_base_url: Option<String>,
}

impl BackendSettings {
    pub fn from_env() -> Self {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            google_api_key: get("GOOGLE_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL"),
            anthropic_base_url: get("ANTHROPIC_BASE_URL"),
            gemini_base_url: get("GEMINI_BASE_URL"),
        }
    }
}

/// Constructs the OpenAI, Claude and Gemini HTTP backends.
pub struct HttpBackendFactory {
    http_client: reqwest::Client,
    settings: BackendSettings,
}

impl HttpBackendFactory {
    pub fn new(http_client: reqwest::Client, settings: BackendSettings) -> Self {
        Self {
            http_client,
            settings,
        }
    }

    pub fn from_env() -> Self {
        Self::new(reqwest::Client::new(), BackendSettings::from_env())
    }
}

fn require_key(key: &Option<String>, var_name: &str) -> Result<String, ModelError> {
    key.clone().ok_or_else(|| ModelError::MissingApiKey {
        var_name: var_name.to_string(),
    })
}

impl BackendFactory for HttpBackendFactory {
    fn create(
        &self,
        model: &str,
        config: &ModelConfig,
    ) -> Result<Arc<dyn ModelBackend>, ModelError> {
        let settings = &self.settings;
        match model.to_lowercase().as_str() {
            "openai" => Ok(Arc::new(openai::OpenAiBackend::new(
                self.http_client.clone(),
                require_key(&settings.openai_api_key, "OPENAI_API_KEY")?,
                settings.openai_base_url.clone(),
                config.clone(),
            ))),
            "claude" => Ok(Arc::new(claude::ClaudeBackend::new(
                self.http_client.clone(),
                require_key(&settings.anthropic_api_key, "ANTHROPIC_API_KEY")?,
                settings.anthropic_base_url.clone(),
                config.clone(),
            ))),
            "gemini" => Ok(Arc::new(gemini::GeminiBackend::new(
                self.http_client.clone(),
                require_key(&settings.google_api_key, "GOOGLE_API_KEY")?,
                settings.gemini_base_url.clone(),
                config.clone(),
            ))),
            _ => Err(ModelError::UnsupportedModel {
                model: model.to_string(),
            }),
        }
    }
}

/// Fallback order used when no explicit list is configured.
pub fn default_fallback_sequence(primary: &str) -> Vec<String> {
    let order: &[&str] = match primary {
        "openai" => &["claude", "gemini"],
        "claude" => &["openai", "gemini"],
        "gemini" => &["openai", "claude"],
        _ => &SUPPORTED_MODELS,
    };
    order
        .iter()
        .filter(|name| **name != primary)
        .map(|name| name.to_string())
        .collect()
}

/// The primary backend followed by its fallbacks, without duplicates.
pub fn fallback_chain(primary: &str, config: &ModelConfig) -> Vec<String> {
    let primary = primary.to_lowercase();
    let fallbacks = if config.fallback_models.is_empty() {
        default_fallback_sequence(&primary)
    } else {
        config.fallback_models.clone()
    };

    let mut chain: Vec<String> = Vec::with_capacity(fallbacks.len() + 1);
    for name in std::iter::once(primary).chain(fallbacks) {
        if !chain.contains(&name) {
            chain.push(name);
        }
    }
    chain
}

/// `<model>-<prompt>-<YYYYMMDDHHMMSS>`.
pub fn generate_execution_id(model: &str, prompt_name: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", model, prompt_name, at.format("%Y%m%d%H%M%S"))
}

/// Runs prompts through the configured backends.
pub struct ModelExecutor {
    factory: Arc<dyn BackendFactory>,
    base_config: ModelConfig,
}

impl ModelExecutor {
    pub fn new(factory: Arc<dyn BackendFactory>, base_config: ModelConfig) -> Self {
        Self {
            factory,
            base_config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            Arc::new(HttpBackendFactory::from_env()),
            ModelConfig::from_env(),
        )
    }

    pub fn base_config(&self) -> &ModelConfig {
        &self.base_config
    }

    /// Applies `params` over the base configuration, then runs the fallback
    /// chain starting at `model`.
    pub async fn execute_model(
        &self,
        model: &str,
        prompt: &str,
        variables: &HashMap<String, String>,
        params: &str,
        cancel_token: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let mut config = self.base_config.clone();
        config.apply_params(params)?;
        config.validate()?;
        self.execute_with_fallback(model, prompt, variables, &config, cancel_token)
            .await
    }

    /// Tries each backend of the chain up to `max_retries` times. Attempts
    /// run sequentially; cancellation stops the chain at the next attempt
    /// boundary and interrupts an in-flight request.
    pub async fn execute_with_fallback(
        &self,
        model: &str,
        prompt: &str,
        variables: &HashMap<String, String>,
        config: &ModelConfig,
        cancel_token: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let prompt_name = variables.get("promptName").cloned().unwrap_or_default();
        let chain = fallback_chain(model, config);
        let max_retries = config.max_retries.max(1);
        let mut attempts: Vec<ModelAttemptError> = Vec::new();

        for (index, name) in chain.iter().enumerate() {
            let backend = match self.factory.create(name, config) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(error = ?e, model = %name, "Failed to create model backend");
                    attempts.push(ModelAttemptError {
                        model: name.clone(),
                        message: "failed to create client".to_string(),
                        retry_index: 0,
                        cause: e,
                    });
                    continue;
                }
            };

            for retry in 0..max_retries {
                if cancel_token.is_cancelled() {
                    return Err(ModelError::Cancelled);
                }

                let result = tokio::select! {
                    _ = cancel_token.cancelled() => return Err(ModelError::Cancelled),
                    result = backend.execute(prompt) => result,
                };

                match result {
                    Ok(mut response) => {
                        let now = Utc::now();
                        response.variables = variables.clone();
                        response.timestamp = now;
                        response.prompt_name = prompt_name.clone();
                        response.execution_id = generate_execution_id(name, &prompt_name, now);
                        if index > 0 || retry > 0 {
                            info!(
                                model = %name,
                                failed_attempts = attempts.len(),
                                "Model succeeded after fallback"
                            );
                        } else {
                            debug!(model = %name, "Model succeeded");
                        }
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!(
                            error = ?e,
                            model = %name,
                            attempt = retry + 1,
                            max_retries,
                            "Model execution failed"
                        );
                        attempts.push(ModelAttemptError {
                            model: name.clone(),
                            message: "execution failed".to_string(),
                            retry_index: retry,
                            cause: e,
                        });
                    }
                }
            }
        }

        Err(ModelError::AllModelsFailed { attempts })
    }
}
