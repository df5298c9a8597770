use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Processor, ProcessorConfig};
use crate::config::LogsDirectory;
use crate::errors::ProcessorError;
use crate::models::ModelResponse;
use crate::template::{TemplateData, TemplateManager};

pub const DEFAULT_FILE_TEMPLATE: &str = "default_file";

pub struct FileProcessor {
    config: ProcessorConfig,
    templates: Arc<TemplateManager>,
}

/// Lexically normalizes `path`: drops `.` and folds `..` into its parent.
/// A `..` that would climb above the root is dropped.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() && !cleaned.has_root() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

fn absolute(path: &Path) -> Result<PathBuf, ProcessorError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ProcessorError::Io {
                operation: "resolve working directory".to_string(),
                path: path.display().to_string(),
                source: e,
            })?
            .join(path)
    };
    Ok(clean_path(&joined))
}

/// Resolves a rendered filename to a path inside `base_dir`.
///
/// Relative names containing `..` are rejected. Absolute names outside
/// `base_dir` are reduced to their file name within `base_dir`.
pub fn sanitize_filename(filename: &str, base_dir: &Path) -> Result<PathBuf, ProcessorError> {
    let traversal = || ProcessorError::PathTraversal {
        path: filename.to_string(),
    };

    let normalized = filename.replace('\\', "/");
    let candidate = Path::new(&normalized);
    let base = absolute(base_dir)?;

    let joined = if candidate.is_absolute() {
        let cleaned = clean_path(candidate);
        if cleaned.starts_with(&base) {
            cleaned
        } else {
            let name = cleaned.file_name().ok_or_else(traversal)?;
            base.join(name)
        }
    } else {
        if candidate
            .components()
            .any(|component| component == Component::ParentDir)
        {
            return Err(traversal());
        }
        base.join(candidate)
    };

    let resolved = absolute(&joined)?;
    if resolved == base || resolved.starts_with(&base) {
        Ok(resolved)
    } else {
        Err(traversal())
    }
}

impl FileProcessor {
    pub fn new(config: ProcessorConfig, templates: Arc<TemplateManager>) -> Self {
        Self { config, templates }
    }

    pub fn logs_directory(&self) -> PathBuf {
        let directory =
            LogsDirectory::from(self.config.env("LOGS_DIRECTORY").unwrap_or_default());
        PathBuf::from(directory.as_ref())
    }

    /// Renders `<template>_<part>`, using the built-in part when the
    /// requested template does not define it.
    fn render_part(&self, template_name: &str, part: &str, data: &TemplateData) -> String {
        let name = format!("{}_{}", template_name, part);
        let name = if self.templates.template_exists(&name) {
            name
        } else {
            format!("{}_{}", DEFAULT_FILE_TEMPLATE, part)
        };
        self.templates.safe_execute(&name, data)
    }

    /// Writes `response` and returns the path written.
    pub async fn write_response(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<PathBuf, ProcessorError> {
        let data = TemplateData::for_processor(response, self.processor_type(), template_name);
        let template_name = if template_name.is_empty() {
            DEFAULT_FILE_TEMPLATE
        } else {
            template_name
        };

        let logs_dir = self.logs_directory();
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .map_err(|e| ProcessorError::Io {
                operation: "create logs directory".to_string(),
                path: logs_dir.display().to_string(),
                source: e,
            })?;

        let filename = if self.config.target.is_empty() {
            self.render_part(template_name, "filename", &data)
        } else {
            self.config.target.clone()
        };
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(ProcessorError::RenderFailed {
                template_name: format!("{}_filename", template_name),
                details: "empty filename".to_string(),
            });
        }
        let path = sanitize_filename(filename, &logs_dir)?;

        let mut content = self.render_part(template_name, "content", &data);
        if content.is_empty() {
            warn!(template = template_name, path = %path.display(), "Empty content rendered, writing raw response");
            content = data.content.clone();
        }
        if !content.ends_with('\n') {
            content.push('\n');
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProcessorError::Io {
                    operation: "create parent directory".to_string(),
                    path: parent.display().to_string(),
                    source: e,
                })?;
        }

        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| ProcessorError::Io {
                operation: "write response".to_string(),
                path: path.display().to_string(),
                source: e,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(|e| ProcessorError::Io {
                    operation: "set permissions".to_string(),
                    path: path.display().to_string(),
                    source: e,
                })?;
        }

        info!(path = %path.display(), content_len = content.len(), "Response saved to file");
        Ok(path)
    }
}

#[async_trait]
impl Processor for FileProcessor {
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        self.write_response(response, template_name).await.map(|_| ())
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn processor_type(&self) -> &str {
        "file"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn processor(logs_dir: &Path, target: &str, templates: Arc<TemplateManager>) -> FileProcessor {
        FileProcessor::new(
            ProcessorConfig::new("file", target)
                .with_env("LOGS_DIRECTORY", &logs_dir.display().to_string()),
            templates,
        )
    }

    fn response() -> ModelResponse {
        ModelResponse {
            prompt_name: "daily".to_string(),
            timestamp: chrono::Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap(),
            ..ModelResponse::new("claude", "Report body")
        }
    }

    #[test]
    fn test_sanitize_relative_names() {
        let base = tempfile::tempdir().unwrap();
        let base_path = absolute(base.path()).unwrap();

        assert_eq!(
            sanitize_filename("out.txt", base.path()).unwrap(),
            base_path.join("out.txt")
        );
        assert_eq!(
            sanitize_filename("nested\\dir/./out.txt", base.path()).unwrap(),
            base_path.join("nested/dir/out.txt")
        );
        for hostile in ["../escape.txt", "a/../../escape.txt", "..\\..\\win.txt"] {
            assert!(
                matches!(
                    sanitize_filename(hostile, base.path()),
                    Err(ProcessorError::PathTraversal { .. })
                ),
                "{hostile}"
            );
        }
    }

    #[test]
    fn test_sanitize_absolute_names() {
        let base = tempfile::tempdir().unwrap();
        let base_path = absolute(base.path()).unwrap();

        assert_eq!(
            sanitize_filename("/etc/passwd", base.path()).unwrap(),
            base_path.join("passwd")
        );
        assert_eq!(
            sanitize_filename("/tmp/../etc/shadow", base.path()).unwrap(),
            base_path.join("shadow")
        );
        let inside = base_path.join("sub/report.txt");
        assert_eq!(
            sanitize_filename(&inside.display().to_string(), base.path()).unwrap(),
            inside
        );
    }

    #[tokio::test]
    async fn test_writes_default_templates() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(dir.path(), "", Arc::new(TemplateManager::new()));

        let path = processor.write_response(&response(), "").await.unwrap();
        assert_eq!(path.file_name().unwrap(), "claude-20250304-050607.txt");

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# AI Response: daily\n"));
        assert!(written.ends_with("Report body\n"));
    }

    #[tokio::test]
    async fn test_target_and_custom_content_template() {
        let dir = tempfile::tempdir().unwrap();
        let templates = Arc::new(TemplateManager::new());
        templates.register("brief_content", "{{.Content}}").unwrap();
        let processor = processor(dir.path(), "reports/today.md", templates);

        let path = processor.write_response(&response(), "brief").await.unwrap();
        assert!(path.ends_with("reports/today.md"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Report body\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn test_traversal_in_rendered_filename_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let templates = Arc::new(TemplateManager::new());
        templates
            .register("evil_filename", "../../{{.Model}}.txt")
            .unwrap();
        let processor = processor(dir.path(), "", templates);

        assert!(matches!(
            processor.write_response(&response(), "evil").await,
            Err(ProcessorError::PathTraversal { .. })
        ));
    }
}
