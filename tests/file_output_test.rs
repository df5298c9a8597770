use std::path::{Path, PathBuf};
use std::sync::Arc;

use cronai::errors::ProcessorError;
use cronai::models::ModelResponse;
use cronai::processor::{
    FileProcessor, Processor, ProcessorConfig, ProcessorContext, ProcessorRegistry,
    sanitize_filename,
};
use cronai::template::TemplateManager;

#[cfg(unix)]
#[test]
fn test_sanitizer_keeps_writes_under_base() {
    let base = Path::new("/logs");

    assert!(matches!(
        sanitize_filename("../../../etc/passwd", base),
        Err(ProcessorError::PathTraversal { .. })
    ));
    assert_eq!(
        sanitize_filename("/etc/passwd", base).unwrap(),
        PathBuf::from("/logs/passwd")
    );
    assert_eq!(
        sanitize_filename("subdir/out.txt", base).unwrap(),
        PathBuf::from("/logs/subdir/out.txt")
    );

    let once = sanitize_filename("/var/tmp/../report.txt", base).unwrap();
    let twice = sanitize_filename(once.to_str().unwrap(), base).unwrap();
    assert_eq!(once, twice);
}

fn response() -> ModelResponse {
    let mut response = ModelResponse::new("claude", "All systems nominal");
    response.prompt_name = "daily_status".to_string();
    response.execution_id = "claude-daily_status-20240101090000".to_string();
    response
}

#[tokio::test]
async fn test_file_processor_writes_rendered_response() {
    let logs = tempfile::tempdir().unwrap();
    let templates = Arc::new(TemplateManager::new());
    let processor = FileProcessor::new(
        ProcessorConfig::new("file", "reports/status.md")
            .with_env("LOGS_DIRECTORY", &logs.path().display().to_string()),
        templates,
    );

    let path = processor.write_response(&response(), "").await.unwrap();
    assert_eq!(path, logs.path().join("reports").join("status.md"));

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("# AI Response: daily_status"));
    assert!(written.contains("Model: claude"));
    assert!(written.contains("All systems nominal"));
    assert!(written.ends_with('\n'));
}

#[tokio::test]
async fn test_file_processor_rejects_traversal_target() {
    let logs = tempfile::tempdir().unwrap();
    let processor = FileProcessor::new(
        ProcessorConfig::new("file", "../escape.txt")
            .with_env("LOGS_DIRECTORY", &logs.path().display().to_string()),
        Arc::new(TemplateManager::new()),
    );

    let err = processor.write_response(&response(), "").await.unwrap_err();
    assert!(matches!(err, ProcessorError::PathTraversal { .. }));
    assert!(!logs.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn test_custom_template_parts_are_used() {
    let logs = tempfile::tempdir().unwrap();
    let templates = Arc::new(TemplateManager::new());
    templates
        .register(
            "status_content",
            "[{{.Model}}] {{.Content}}{{if .Variables.owner}} owner={{.Variables.owner}}{{end}}",
        )
        .unwrap();
    let mut response = response();
    response
        .variables
        .insert("owner".to_string(), "ops".to_string());

    let registry = ProcessorRegistry::new(ProcessorContext::new(templates));
    let processor = registry
        .create_processor(
            ProcessorConfig::new("file", "status.txt")
                .with_env("LOGS_DIRECTORY", &logs.path().display().to_string()),
        )
        .unwrap();
    processor.process(&response, "status").await.unwrap();

    let written = std::fs::read_to_string(logs.path().join("status.txt")).unwrap();
    assert_eq!(written, "[claude] All systems nominal owner=ops\n");
}
