//! Named templates in the Go `text/template` dialect.
//!
//! A [`TemplateManager`] owns every compiled template behind a single
//! read/write lock. Sources are parsed once at registration; a source that
//! fails to parse is never installed. Templates may include one another with
//! `{{template "name" .}}` and inherit with `{{extends "parent"}}`, where the
//! child's `{{define}}` blocks replace the parent's blocks of the same name.
//!
//! Rendering data is a [`TemplateData`]; its `Variables` are also promoted to
//! the top level, so `.Variables.project` and `.project` are equivalent.

mod data;
mod defaults;
mod exec;
mod functions;
mod lexer;
mod parser;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, warn};

pub use data::TemplateData;

use crate::errors::TemplateError;
use exec::{Compiled, RenderError, Registry};

pub(crate) use functions::{format_time, rfc3339};

/// Extension of template files picked up by directory loading.
pub const TEMPLATE_EXTENSION: &str = "tmpl";

static BLOCK_SUGAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{\{(-?\s*)block\s+("[^"]*")\s*(-?)\}\}"#).expect("block sugar pattern")
});

static ENDBLOCK_SUGAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\{(-?\s*)endblock(\s*-?)\}\}"#).expect("endblock pattern"));

#[derive(Debug)]
pub struct TemplateManager {
    templates: RwLock<Registry>,
}

impl Default for TemplateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateManager {
    /// Creates a manager with the built-in processor templates installed.
    pub fn new() -> Self {
        let manager = Self::empty();
        for (name, source) in defaults::DEFAULT_TEMPLATES {
            if let Err(e) = manager.register(name, source) {
                error!(error = ?e, template = name, "Failed to register default template");
            }
        }
        manager
    }

    /// Creates a manager with no templates at all.
    pub fn empty() -> Self {
        Self {
            templates: RwLock::new(Registry::new()),
        }
    }

    /// Parses `source` and binds it to `name`, replacing any prior binding.
    pub fn register(&self, name: &str, source: &str) -> Result<(), TemplateError> {
        let compiled = compile(name, source)?;
        self.templates
            .write()
            .insert(name.to_string(), Arc::new(compiled));
        debug!(template = name, "Registered template");
        Ok(())
    }

    /// Rewrites `{{block "x"}}...{{endblock}}` into canonical block syntax
    /// before registering.
    pub fn register_template_with_includes(
        &self,
        name: &str,
        source: &str,
    ) -> Result<(), TemplateError> {
        self.register(name, &expand_block_sugar(source))
    }

    /// Renders `name`. Unknown names yield [`TemplateError::NotFound`].
    pub fn execute(&self, name: &str, data: &TemplateData) -> Result<String, TemplateError> {
        self.execute_value(name, &data.to_context())
    }

    /// Renders `name` against an arbitrary JSON context.
    pub fn execute_value(&self, name: &str, context: &Value) -> Result<String, TemplateError> {
        let templates = self.templates.read();
        exec::render(&templates, name, context).map_err(|e| render_error(name, e))
    }

    /// Renders a single block of `name`, honouring inheritance.
    pub fn execute_named(
        &self,
        name: &str,
        block: &str,
        data: &TemplateData,
    ) -> Result<String, TemplateError> {
        let templates = self.templates.read();
        exec::render_block(&templates, name, block, &data.to_context())
            .map_err(|e| render_error(name, e))
    }

    /// Renders an unregistered source. It may reference registered templates.
    pub fn render_source(&self, source: &str, context: &Value) -> Result<String, TemplateError> {
        let compiled = compile("inline", source)?;
        let templates = self.templates.read();
        exec::render_detached(&templates, &compiled, context).map_err(|e| render_error("inline", e))
    }

    /// Best-effort rendering: `name`, then `default_<prefix>` where prefix is
    /// the part of `name` before its first `_`, then the raw content.
    pub fn safe_execute(&self, name: &str, data: &TemplateData) -> String {
        let context = data.to_context();

        match self.execute_value(name, &context) {
            Ok(output) => return output,
            Err(e) => debug!(error = ?e, template = name, "Template execution failed"),
        }

        let prefix = name.split('_').next().unwrap_or_default();
        let fallback = format!("default_{}", prefix);
        if fallback != name && self.template_exists(&fallback) {
            match self.execute_value(&fallback, &context) {
                Ok(output) => return output,
                Err(e) => warn!(error = ?e, template = %fallback, "Fallback template failed"),
            }
        }

        data.content.clone()
    }

    /// Parses `source` without installing it.
    pub fn validate(&self, source: &str) -> Result<(), TemplateError> {
        compile("validation", source).map(|_| ())
    }

    /// Parses the file at `path` without installing it.
    pub fn validate_template(&self, path: impl AsRef<Path>) -> Result<(), TemplateError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        compile(&template_name_for(path), &expand_block_sugar(&source)).map(|_| ())
    }

    /// Parse-checks every template file in `dir`. The returned map holds one
    /// entry per file that failed, keyed by file name.
    pub fn validate_templates_in_dir(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<BTreeMap<String, TemplateError>, TemplateError> {
        let mut failures = BTreeMap::new();
        for path in template_files(dir.as_ref())? {
            if let Err(e) = self.validate_template(&path) {
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                failures.insert(file_name, e);
            }
        }
        Ok(failures)
    }

    /// Registers every `*.tmpl` file in `dir` under its base name. Returns
    /// the number of templates loaded.
    pub fn load_templates_from_dir(&self, dir: impl AsRef<Path>) -> Result<usize, TemplateError> {
        let files = template_files(dir.as_ref())?;
        for path in &files {
            let source = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            self.register_template_with_includes(&template_name_for(path), &source)?;
        }
        Ok(files.len())
    }

    pub fn template_exists(&self, name: &str) -> bool {
        self.templates.read().contains_key(name)
    }

    /// Registered template names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }
}

fn compile(name: &str, source: &str) -> Result<Compiled, TemplateError> {
    parser::parse(source)
        .map(|parsed| Compiled { parsed })
        .map_err(|details| TemplateError::ParseFailed {
            name: name.to_string(),
            details,
        })
}

fn render_error(name: &str, error: RenderError) -> TemplateError {
    match error {
        RenderError::NotFound(missing) => TemplateError::NotFound { name: missing },
        RenderError::Cycle(chain) => TemplateError::InheritanceCycle { chain },
        RenderError::Failed(details) => TemplateError::RenderFailed {
            name: name.to_string(),
            details,
        },
    }
}

fn expand_block_sugar(source: &str) -> String {
    let source = BLOCK_SUGAR.replace_all(source, "{{${1}block ${2} . ${3}}}");
    ENDBLOCK_SUGAR
        .replace_all(&source, "{{${1}end${2}}}")
        .into_owned()
}

fn template_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn template_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, TemplateError> {
    let entries = std::fs::read_dir(dir).map_err(|e| TemplateError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == TEMPLATE_EXTENSION)
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn data_with(vars: &[(&str, &str)]) -> TemplateData {
        TemplateData {
            content: "the content".to_string(),
            model: "openai".to_string(),
            prompt_name: "daily_report".to_string(),
            variables: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_conditional_report() {
        let manager = TemplateManager::empty();
        manager
            .register(
                "report",
                "# Report for {{.Variables.project}}\n{{if eq .Variables.environment \"production\"}}## Production{{.Variables.status}}{{else}}## Test{{end}}",
            )
            .unwrap();

        let output = manager
            .execute(
                "report",
                &data_with(&[
                    ("project", "CronAI"),
                    ("environment", "production"),
                    ("status", "healthy"),
                ]),
            )
            .unwrap();
        assert!(output.contains("# Report for CronAI"));
        assert!(output.contains("## Production"));
        assert!(output.contains("healthy"));
        assert!(!output.contains("## Test"));
    }

    #[test]
    fn test_promoted_variables() {
        let manager = TemplateManager::empty();
        manager.register("t", "{{.project}}/{{.Variables.project}}").unwrap();
        let output = manager.execute("t", &data_with(&[("project", "x")])).unwrap();
        assert_eq!(output, "x/x");
    }

    #[test]
    fn test_parse_failure_keeps_previous_binding() {
        let manager = TemplateManager::empty();
        manager.register("t", "ok").unwrap();
        let err = manager.register("t", "{{if .X}}unterminated").unwrap_err();
        assert!(matches!(err, TemplateError::ParseFailed { .. }));
        assert_eq!(manager.execute("t", &TemplateData::default()).unwrap(), "ok");
        assert!(!manager.template_exists("never"));
        assert!(manager.register("never", "{{unknownHelper .X}}").is_err());
        assert!(!manager.template_exists("never"));
    }

    #[test]
    fn test_execute_errors() {
        let manager = TemplateManager::empty();
        assert!(matches!(
            manager.execute("missing", &TemplateData::default()),
            Err(TemplateError::NotFound { .. })
        ));
        manager.register("bad", "{{index .Content 3}}").unwrap();
        assert!(matches!(
            manager.execute("bad", &TemplateData::default()),
            Err(TemplateError::RenderFailed { .. })
        ));
    }

    #[test]
    fn test_reregistration_is_stable() {
        let manager = TemplateManager::empty();
        let data = data_with(&[("a", "1")]);
        manager.register("t", "{{.a}}-{{.Model}}").unwrap();
        let first = manager.execute("t", &data).unwrap();
        manager.register("t", "{{.a}}-{{.Model}}").unwrap();
        assert_eq!(manager.execute("t", &data).unwrap(), first);
    }

    #[test]
    fn test_safe_execute_fallbacks() {
        let manager = TemplateManager::empty();
        manager.register("default_slack", "fallback {{.Model}}").unwrap();
        manager.register("broken_one", "{{index .Content 1}}").unwrap();

        let data = data_with(&[]);
        assert_eq!(manager.safe_execute("slack_custom", &data), "fallback openai");
        assert_eq!(manager.safe_execute("unknown_thing", &data), "the content");
        assert_eq!(manager.safe_execute("broken_one", &data), "the content");
        assert_eq!(manager.safe_execute("", &data), "the content");
    }

    #[test]
    fn test_safe_execute_survives_date_overflow() {
        let manager = TemplateManager::empty();
        manager
            .register("report_x", "{{addDays 100000000 \"2024-01-01\"}}")
            .unwrap();
        manager.register("default_report", "fallback {{.Model}}").unwrap();

        let data = data_with(&[]);
        assert!(manager.execute("report_x", &data).is_err());
        assert_eq!(manager.safe_execute("report_x", &data), "fallback openai");
    }

    #[test]
    fn test_inheritance_through_manager() {
        let manager = TemplateManager::empty();
        manager
            .register(
                "base",
                "[{{block \"header\" .}}Base header{{end}}] {{block \"content\" .}}{{end}}",
            )
            .unwrap();
        manager
            .register(
                "child",
                "{{extends \"base\"}}{{define \"content\"}}{{.Content}}{{end}}",
            )
            .unwrap();
        manager
            .register(
                "grandchild",
                "{{extends \"child\"}}{{define \"header\"}}GC {{.Model}}{{end}}",
            )
            .unwrap();

        let data = data_with(&[]);
        assert_eq!(manager.execute("child", &data).unwrap(), "[Base header] the content");
        assert_eq!(manager.execute("grandchild", &data).unwrap(), "[GC openai] the content");
        assert_eq!(
            manager.execute_named("grandchild", "header", &data).unwrap(),
            "GC openai"
        );
    }

    #[test]
    fn test_inheritance_cycle() {
        let manager = TemplateManager::empty();
        manager.register("a", "{{extends \"b\"}}").unwrap();
        manager.register("b", "{{extends \"a\"}}").unwrap();
        assert!(matches!(
            manager.execute("a", &TemplateData::default()),
            Err(TemplateError::InheritanceCycle { .. })
        ));
        assert_eq!(manager.safe_execute("a", &data_with(&[])), "the content");
    }

    #[test]
    fn test_block_sugar() {
        let manager = TemplateManager::empty();
        manager
            .register_template_with_includes(
                "page",
                "<{{block \"title\"}}Default{{endblock}}>",
            )
            .unwrap();
        manager
            .register("page_child", "{{extends \"page\"}}{{define \"title\"}}Child{{end}}")
            .unwrap();
        let data = TemplateData::default();
        assert_eq!(manager.execute("page", &data).unwrap(), "<Default>");
        assert_eq!(manager.execute("page_child", &data).unwrap(), "<Child>");
    }

    #[test]
    fn test_include_registered_template() {
        let manager = TemplateManager::empty();
        manager.register("footer", "-- {{.Model}}").unwrap();
        manager
            .register("body", "{{.Content}}\n{{template \"footer\" .}}")
            .unwrap();
        assert_eq!(
            manager.execute("body", &data_with(&[])).unwrap(),
            "the content\n-- openai"
        );
    }

    #[test]
    fn test_render_source_uses_registry() {
        let manager = TemplateManager::empty();
        manager.register("greeting", "hi {{.name}}").unwrap();
        let output = manager
            .render_source(
                "{{template \"greeting\" .}}!",
                &serde_json::json!({"name": "bob"}),
            )
            .unwrap();
        assert_eq!(output, "hi bob!");
    }

    #[test]
    fn test_default_templates_render() {
        let manager = TemplateManager::new();
        let mut data = data_with(&[("head_branch", "feature")]);
        data.content = "line \"quoted\"\nnext".to_string();

        for (name, _) in defaults::DEFAULT_TEMPLATES {
            let output = manager.execute(name, &data);
            assert!(output.is_ok(), "{} failed: {:?}", name, output);
        }

        let json_templates = [
            "default_slack",
            "default_slack_monitoring",
            "default_webhook",
            "default_webhook_teams",
            "default_github_issue",
            "default_github_comment",
            "default_github_pr",
        ];
        for name in json_templates {
            let output = manager.execute(name, &data).unwrap();
            let parsed: Value = serde_json::from_str(&output)
                .unwrap_or_else(|e| panic!("{} is not JSON: {}: {}", name, e, output));
            assert!(parsed.is_object());
        }

        let pr: Value =
            serde_json::from_str(&manager.execute("default_github_pr", &data).unwrap()).unwrap();
        assert_eq!(pr["head"], "feature");
        assert_eq!(pr["base"], "main");

        let issue: Value =
            serde_json::from_str(&manager.execute("default_github_issue", &data).unwrap())
                .unwrap();
        assert_eq!(issue["labels"], serde_json::json!(["auto-generated", "cronai"]));
    }

    #[test]
    fn test_directory_loading_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.tmpl"), "A {{.Model}}").unwrap();
        std::fs::write(
            dir.path().join("beta.tmpl"),
            "{{block \"b\"}}B{{endblock}}",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "{{ignored").unwrap();

        let manager = TemplateManager::empty();
        assert_eq!(manager.load_templates_from_dir(dir.path()).unwrap(), 2);
        assert_eq!(manager.names(), vec!["alpha".to_string(), "beta".to_string()]);
        assert!(manager.validate_templates_in_dir(dir.path()).unwrap().is_empty());

        std::fs::write(dir.path().join("broken.tmpl"), "{{if}}").unwrap();
        let failures = manager.validate_templates_in_dir(dir.path()).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures.contains_key("broken.tmpl"));
        assert!(manager.load_templates_from_dir(dir.path()).is_err());
        assert!(manager.validate_template(dir.path().join("alpha.tmpl")).is_ok());
        assert!(manager.validate_template(dir.path().join("absent.tmpl")).is_err());
    }
}
