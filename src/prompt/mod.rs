//! Prompt files on disk.
//!
//! Prompts are markdown files under the prompts directory, addressed by name
//! without the `.md` extension (`reports/daily` is `reports/daily.md`). A
//! prompt may open with a `---` front-matter block; it is stripped from the
//! loaded content and exposed through [`PromptMetadata`].

mod metadata;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

pub use metadata::{PromptMetadata, PromptVariable, extract_metadata};

use crate::config::{DEFAULT_PROMPTS_DIRECTORY, PromptsDirectory, default_env};
use crate::errors::PromptError;
use crate::template::{TemplateData, TemplateManager};

pub const PROMPT_EXTENSION: &str = "md";

/// Category reported for prompts at the top of the prompts directory.
pub const ROOT_CATEGORY: &str = "root";

static TEMPLATE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{-?\s*(if|else|end|range|with|define|template|block)\b")
        .expect("template directive pattern")
});

static SIMPLE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder pattern"));

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PromptInfo {
    pub name: String,
    pub path: String,
    pub category: String,
    pub description: String,
    pub has_metadata: bool,
    pub metadata: Option<PromptMetadata>,
}

pub struct PromptManager {
    prompts_dir: PathBuf,
    templates: Arc<TemplateManager>,
}

/// True when `content` uses control structures rather than plain
/// `{{name}}` placeholders.
pub fn contains_template_directives(content: &str) -> bool {
    TEMPLATE_DIRECTIVE.is_match(content)
}

/// Replaces `{{name}}` placeholders with variable values. Unknown
/// placeholders are left as written.
pub fn apply_variables(content: &str, variables: &HashMap<String, String>) -> String {
    SIMPLE_PLACEHOLDER
        .replace_all(content, |captures: &regex::Captures| {
            variables
                .get(&captures[1])
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned()
}

impl PromptManager {
    pub fn new(prompts_dir: impl Into<PathBuf>, templates: Arc<TemplateManager>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            templates,
        }
    }

    /// Uses `CRON_PROMPTS_DIR`, falling back to `cron_prompts`.
    pub fn from_env(templates: Arc<TemplateManager>) -> Self {
        let dir = PromptsDirectory::from(default_env(
            "CRON_PROMPTS_DIR",
            DEFAULT_PROMPTS_DIRECTORY,
        ));
        Self::new(dir.as_ref(), templates)
    }

    pub fn prompts_dir(&self) -> &Path {
        &self.prompts_dir
    }

    /// Resolves a prompt name to a file inside the prompts directory.
    pub fn prompt_path(&self, name: &str) -> Result<PathBuf, PromptError> {
        let trimmed = name.trim();
        let relative = Path::new(trimmed);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if trimmed.is_empty() || escapes {
            return Err(PromptError::InvalidName {
                name: name.to_string(),
            });
        }

        let file_name = if trimmed.ends_with(&format!(".{}", PROMPT_EXTENSION)) {
            trimmed.to_string()
        } else {
            format!("{}.{}", trimmed, PROMPT_EXTENSION)
        };
        Ok(self.prompts_dir.join(file_name))
    }

    fn read_prompt(&self, name: &str) -> Result<(PathBuf, String), PromptError> {
        let path = self.prompt_path(name)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok((path, content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PromptError::NotFound {
                name: name.to_string(),
                path: path.display().to_string(),
            }),
            Err(e) => Err(PromptError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// The prompt body with any front matter removed.
    pub fn load_prompt(&self, name: &str) -> Result<String, PromptError> {
        let (_, content) = self.read_prompt(name)?;
        let (_, body) = extract_metadata(&content);
        Ok(body.to_string())
    }

    pub fn load_prompt_with_variables(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, PromptError> {
        let content = self.load_prompt(name)?;
        self.render_prompt(name, &content, variables)
    }

    /// Applies variables to already loaded prompt text.
    pub fn render_prompt(
        &self,
        name: &str,
        content: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, PromptError> {
        if !contains_template_directives(content) {
            return Ok(apply_variables(content, variables));
        }

        debug!(prompt = name, "Rendering prompt through template engine");
        let data = TemplateData {
            timestamp: Utc::now(),
            prompt_name: name.to_string(),
            variables: variables.clone(),
            ..Default::default()
        };
        self.templates
            .render_source(content, &data.to_context())
            .map_err(|source| PromptError::RenderFailed {
                name: name.to_string(),
                source,
            })
    }

    pub fn prompt_metadata(&self, name: &str) -> Result<Option<PromptMetadata>, PromptError> {
        let (path, content) = self.read_prompt(name)?;
        let (metadata, _) = extract_metadata(&content);
        Ok(metadata.map(|mut metadata| {
            metadata.path = path.display().to_string();
            metadata
        }))
    }

    pub fn prompt_info(&self, name: &str) -> Result<PromptInfo, PromptError> {
        let path = self.prompt_path(name)?;
        let (_, content) = self.read_prompt(name)?;
        Ok(self.info_for(&path, &content))
    }

    fn info_for(&self, path: &Path, content: &str) -> PromptInfo {
        let relative = path.strip_prefix(&self.prompts_dir).unwrap_or(path);
        let name = relative
            .with_extension("")
            .to_string_lossy()
            .replace('\\', "/");
        let category = relative
            .parent()
            .map(|parent| parent.to_string_lossy().replace('\\', "/"))
            .filter(|parent| !parent.is_empty())
            .unwrap_or_else(|| ROOT_CATEGORY.to_string());

        let (metadata, _) = extract_metadata(content);
        let metadata = metadata.map(|mut metadata| {
            metadata.path = path.display().to_string();
            metadata
        });

        PromptInfo {
            name,
            path: path.display().to_string(),
            category,
            description: metadata
                .as_ref()
                .map(|m| m.description.clone())
                .unwrap_or_default(),
            has_metadata: metadata.is_some(),
            metadata,
        }
    }

    /// Every prompt under the prompts directory, sorted by name. A missing
    /// directory yields an empty list.
    pub fn list_prompts(&self) -> Result<Vec<PromptInfo>, PromptError> {
        let mut files = Vec::new();
        if self.prompts_dir.is_dir() {
            collect_prompt_files(&self.prompts_dir, &mut files)?;
        }

        let mut prompts = Vec::with_capacity(files.len());
        for path in files {
            match std::fs::read_to_string(&path) {
                Ok(content) => prompts.push(self.info_for(&path, &content)),
                Err(e) => warn!(path = %path.display(), error = ?e, "Skipping unreadable prompt"),
            }
        }
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(prompts)
    }

    /// Case-insensitive match on name, description and category. An empty
    /// `category` matches every category.
    pub fn search_prompts(
        &self,
        query: &str,
        category: &str,
    ) -> Result<Vec<PromptInfo>, PromptError> {
        let query = query.to_lowercase();
        Ok(self
            .list_prompts()?
            .into_iter()
            .filter(|info| category.is_empty() || info.category.eq_ignore_ascii_case(category))
            .filter(|info| {
                query.is_empty()
                    || info.name.to_lowercase().contains(&query)
                    || info.description.to_lowercase().contains(&query)
                    || info.category.to_lowercase().contains(&query)
            })
            .collect())
    }

    pub fn search_prompt_content(&self, query: &str) -> Result<Vec<PromptInfo>, PromptError> {
        let query = query.to_lowercase();
        let mut matches = Vec::new();
        for info in self.list_prompts()? {
            match std::fs::read_to_string(&info.path) {
                Ok(content) if content.to_lowercase().contains(&query) => matches.push(info),
                Ok(_) => {}
                Err(e) => warn!(path = %info.path, error = ?e, "Skipping unreadable prompt"),
            }
        }
        Ok(matches)
    }
}

fn collect_prompt_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), PromptError> {
    let io_error = |source| PromptError::Io {
        path: dir.display().to_string(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_dir() {
            collect_prompt_files(&path, files)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(PROMPT_EXTENSION) {
            files.push(path);
        }
    }
    Ok(())
}
