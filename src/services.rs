//! Process-wide collaborators, built once at startup and passed to each mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::config::default_env;
use crate::errors::TemplateError;
use crate::models::ModelExecutor;
use crate::processor::{ProcessorContext, ProcessorRegistry};
use crate::prompt::PromptManager;
use crate::queue::{ConsumerRegistry, PipelineTaskProcessor};
use crate::template::TemplateManager;

pub const DEFAULT_TEMPLATES_DIRECTORY: &str = "templates";

static SHARED: OnceCell<Arc<Services>> = OnceCell::new();

pub struct Services {
    pub templates: Arc<TemplateManager>,
    pub processors: Arc<ProcessorRegistry>,
    pub consumers: Arc<ConsumerRegistry>,
    pub prompts: Arc<PromptManager>,
    pub models: Arc<ModelExecutor>,
}

impl Services {
    pub fn new(
        templates: Arc<TemplateManager>,
        prompts_dir: impl Into<PathBuf>,
        models: Arc<ModelExecutor>,
    ) -> Self {
        Self {
            processors: Arc::new(ProcessorRegistry::new(ProcessorContext::new(
                templates.clone(),
            ))),
            consumers: Arc::new(ConsumerRegistry::new()),
            prompts: Arc::new(PromptManager::new(prompts_dir, templates.clone())),
            models,
            templates,
        }
    }

    /// Production wiring. Templates in `CRONAI_TEMPLATES_DIR` (default
    /// `templates`) are loaded over the built-in defaults when the
    /// directory exists.
    pub fn from_env() -> Result<Self, TemplateError> {
        let templates = Arc::new(TemplateManager::new());
        let templates_dir = default_env("CRONAI_TEMPLATES_DIR", DEFAULT_TEMPLATES_DIRECTORY);
        if Path::new(&templates_dir).is_dir() {
            let loaded = templates.load_templates_from_dir(&templates_dir)?;
            info!(directory = %templates_dir, loaded, "Loaded templates");
        } else {
            debug!(directory = %templates_dir, "No template directory, using defaults");
        }

        let prompts = Arc::new(PromptManager::from_env(templates.clone()));
        Ok(Self {
            processors: Arc::new(ProcessorRegistry::new(ProcessorContext::new(
                templates.clone(),
            ))),
            consumers: Arc::new(ConsumerRegistry::new()),
            prompts,
            models: Arc::new(ModelExecutor::from_env()),
            templates,
        })
    }

    /// A process-wide default built from the environment on first use,
    /// without loading a template directory.
    pub fn shared() -> Arc<Self> {
        SHARED
            .get_or_init(|| {
                let templates = Arc::new(TemplateManager::new());
                let prompts = PromptManager::from_env(templates.clone());
                Arc::new(Self::new(
                    templates,
                    prompts.prompts_dir().to_path_buf(),
                    Arc::new(ModelExecutor::from_env()),
                ))
            })
            .clone()
    }

    /// The prompt, model and processor pipeline over these services.
    pub fn pipeline(&self) -> PipelineTaskProcessor {
        PipelineTaskProcessor::new(
            self.prompts.clone(),
            self.models.clone(),
            self.processors.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_is_built_once() {
        let first = Services::shared();
        let second = Services::shared();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.templates.template_exists("default_console"));
        assert!(
            first
                .consumers
                .queue_types()
                .contains(&"memory".to_string())
        );
    }

    #[test]
    fn test_from_env_loads_template_directory() {
        let _guard = crate::test_helpers::ENV_MUTEX.lock();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weekly.tmpl"), "Week: {{.Content}}").unwrap();
        unsafe {
            std::env::set_var("CRONAI_TEMPLATES_DIR", dir.path());
        }
        let services = Services::from_env();
        unsafe {
            std::env::remove_var("CRONAI_TEMPLATES_DIR");
        }

        let services = services.unwrap();
        assert!(services.templates.template_exists("weekly"));
        assert!(services.templates.template_exists("default_console"));
    }
}
