//! End-to-end runs of the prompt, model and processor pipeline against
//! stubbed provider and delivery endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cronai::errors::{ModelError, ProcessorError, TaskError};
use cronai::models::{BackendSettings, HttpBackendFactory, ModelConfig, ModelExecutor, ModelResponse};
use cronai::processor::{
    Processor, ProcessorConfig, ProcessorContext, ProcessorRegistry, WebhookProcessor,
    processor_factory,
};
use cronai::prompt::PromptManager;
use cronai::queue::{
    ConsumerConfig, Coordinator, MemoryConsumer, PipelineTaskProcessor, TaskMessage,
};
use cronai::template::TemplateManager;

struct CapturingProcessor {
    config: ProcessorConfig,
    seen: Arc<Mutex<Vec<ModelResponse>>>,
}

#[async_trait]
impl Processor for CapturingProcessor {
    async fn process(&self, response: &ModelResponse, _: &str) -> Result<(), ProcessorError> {
        self.seen.lock().push(response.clone());
        Ok(())
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn processor_type(&self) -> &str {
        "console"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

struct Harness {
    pipeline: PipelineTaskProcessor,
    console: Arc<Mutex<Vec<ModelResponse>>>,
    _prompts_dir: tempfile::TempDir,
}

/// A pipeline whose OpenAI and Claude backends point at `provider`, whose
/// console output is captured and whose webhooks go to `delivery_url`.
fn harness(provider: &MockServer, delivery_url: Option<String>) -> Harness {
    let prompts_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        prompts_dir.path().join("test_prompt.md"),
        "Hello {{project}}",
    )
    .unwrap();
    std::fs::create_dir(prompts_dir.path().join("monitoring")).unwrap();
    std::fs::write(
        prompts_dir.path().join("monitoring").join("disk.md"),
        "---\ndescription: Disk usage review\n---\nCheck disk usage on {{host}}",
    )
    .unwrap();

    let settings = BackendSettings {
        openai_api_key: Some("test-openai-key".to_string()),
        anthropic_api_key: Some("test-anthropic-key".to_string()),
        openai_base_url: Some(provider.uri()),
        anthropic_base_url: Some(provider.uri()),
        ..Default::default()
    };
    let models = Arc::new(ModelExecutor::new(
        Arc::new(HttpBackendFactory::new(reqwest::Client::new(), settings)),
        ModelConfig {
            fallback_models: vec!["claude".to_string()],
            ..Default::default()
        },
    ));

    let templates = Arc::new(TemplateManager::new());
    let processors = Arc::new(ProcessorRegistry::new(ProcessorContext::new(
        templates.clone(),
    )));
    let console = Arc::new(Mutex::new(Vec::new()));
    let captured = console.clone();
    processors.register_processor(
        "console",
        processor_factory(move |config, _| {
            Ok(Arc::new(CapturingProcessor {
                config,
                seen: captured.clone(),
            }))
        }),
    );
    if let Some(url) = delivery_url {
        processors.register_processor(
            "webhook",
            processor_factory(move |config, context| {
                Ok(Arc::new(WebhookProcessor::new(
                    config.with_env("WEBHOOK_URL", &url),
                    context.templates.clone(),
                    context.http_client.clone(),
                )))
            }),
        );
    }

    Harness {
        pipeline: PipelineTaskProcessor::new(
            Arc::new(PromptManager::new(prompts_dir.path(), templates)),
            models,
            processors,
        ),
        console,
        _prompts_dir: prompts_dir,
    }
}

fn openai_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "gpt-3.5-turbo",
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
}

fn task(prompt: &str, processor: &str) -> TaskMessage {
    TaskMessage {
        model: "openai".to_string(),
        prompt: prompt.to_string(),
        processor: processor.to_string(),
        ..Default::default()
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[tokio::test]
async fn test_queue_message_is_acknowledged_after_delivery() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-openai-key"))
        .respond_with(openai_reply("Mock response"))
        .expect(1)
        .mount(&provider)
        .await;

    let harness = harness(&provider, None);
    let coordinator = Coordinator::new(Arc::new(harness.pipeline.clone()));
    let consumer = Arc::new(MemoryConsumer::new(
        "memory-tasks",
        ConsumerConfig::new("memory", "memory://", "tasks"),
    ));
    coordinator.add_consumer(consumer.clone()).unwrap();
    coordinator.start(&CancellationToken::new()).unwrap();
    eventually(|| consumer.is_connected()).await;

    consumer
        .add_message(
            r#"{"model":"openai","prompt":"test_prompt","processor":"console"}"#,
            HashMap::new(),
        )
        .await
        .unwrap();
    eventually(|| consumer.acknowledged().len() == 1).await;
    coordinator.stop(Duration::from_secs(2)).await.unwrap();

    assert!(consumer.rejected().is_empty());
    let console = harness.console.lock();
    assert_eq!(console.len(), 1);
    assert_eq!(console[0].content, "Mock response");
    assert_eq!(console[0].prompt_name, "test_prompt");
}

#[tokio::test]
async fn test_invalid_queue_message_is_dropped_without_model_call() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(openai_reply("unused"))
        .expect(0)
        .mount(&provider)
        .await;

    let harness = harness(&provider, None);
    let coordinator = Coordinator::new(Arc::new(harness.pipeline.clone()));
    let consumer = Arc::new(MemoryConsumer::new(
        "memory-tasks",
        ConsumerConfig::new("memory", "memory://", "tasks"),
    ));
    coordinator.add_consumer(consumer.clone()).unwrap();
    coordinator.start(&CancellationToken::new()).unwrap();
    eventually(|| consumer.is_connected()).await;

    consumer
        .add_message(
            r#"{"model":"","prompt":"p","processor":"console"}"#,
            HashMap::new(),
        )
        .await
        .unwrap();
    eventually(|| consumer.rejected().len() == 1).await;
    coordinator.stop(Duration::from_secs(2)).await.unwrap();

    let rejected = consumer.rejected();
    assert!(!rejected[0].1, "invalid messages are not requeued");
    assert!(consumer.acknowledged().is_empty());
    assert!(harness.console.lock().is_empty());
    assert_eq!(coordinator.stats().rejected, 1);
}

#[tokio::test]
async fn test_claude_fallback_delivers_to_webhook() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-anthropic-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "claude-3-5-sonnet-latest",
            "content": [{"type": "text", "text": "Disk usage is fine"}]
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/ops"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&receiver)
        .await;

    let harness = harness(&provider, Some(format!("{}/hooks/ops", receiver.uri())));
    let mut task = task("monitoring/disk", "webhook-ops");
    task.variables
        .insert("host".to_string(), "db-1".to_string());

    let response = harness
        .pipeline
        .run(&task, "", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.content, "Disk usage is fine");
    assert!(response.execution_id.starts_with("claude-monitoring/disk-"));

    let requests = receiver.received_requests().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload["content"], "Disk usage is fine");
    assert_eq!(payload["prompt"], "monitoring/disk");
    assert_eq!(payload["variables"]["host"], "db-1");

    let sent: serde_json::Value =
        serde_json::from_slice(&provider.received_requests().await.unwrap()[0].body).unwrap();
    assert_eq!(sent["messages"][1]["content"], "Check disk usage on db-1");
}

#[tokio::test]
async fn test_exhausted_fallback_chain_reports_every_attempt() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&provider)
        .await;

    let harness = harness(&provider, None);
    let err = harness
        .pipeline
        .run(&task("test_prompt", "console"), "", &CancellationToken::new())
        .await
        .unwrap_err();

    let TaskError::Model(ModelError::AllModelsFailed { attempts }) = &err else {
        panic!("expected all models to fail, got {err:?}");
    };
    let models: Vec<&str> = attempts.iter().map(|a| a.model.as_str()).collect();
    assert_eq!(models, vec!["openai", "claude"]);
    assert!(err.is_retryable());
    assert!(harness.console.lock().is_empty());
}
