//! Typed handlers for the GitHub events the bot reacts to.
//!
//! Every handler follows the same path: decode the payload into its event
//! struct, describe the event to the model, tag the response with event
//! metadata and pass it to the configured processor using the
//! `<event_type>_template` template.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::router::{Event, EventHandler};
use crate::errors::{TaskError, WebhookError};
use crate::models::ModelExecutor;
use crate::processor::ProcessorRegistry;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Account {
    pub login: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Repository {
    pub name: String,
    pub owner: Account,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner.login, self.name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub user: Account,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IssuesEvent {
    pub action: String,
    pub issue: Issue,
    pub repository: Repository,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub head: BranchRef,
    pub base: BranchRef,
    pub user: Account,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub pull_request: PullRequest,
    pub repository: Repository,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Commit {
    pub id: String,
    pub message: String,
    pub author: CommitAuthor,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Pusher {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub commits: Vec<Commit>,
    pub pusher: Pusher,
    pub repository: Repository,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Release {
    pub tag_name: String,
    pub name: Option<String>,
    pub body: Option<String>,
    pub draft: bool,
    pub prerelease: bool,
    pub author: Account,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReleaseEvent {
    pub action: String,
    pub release: Release,
    pub repository: Repository,
}

/// A webhook payload the bot knows how to describe.
pub trait GithubEvent: DeserializeOwned + Serialize + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;

    /// Event-specific metadata merged into the response variables.
    fn metadata(&self, action: &str) -> HashMap<String, String>;
}

impl GithubEvent for IssuesEvent {
    const EVENT_TYPE: &'static str = "issues";

    fn metadata(&self, action: &str) -> HashMap<String, String> {
        HashMap::from([
            ("action".to_string(), action.to_string()),
            ("issue_number".to_string(), self.issue.number.to_string()),
            ("repository".to_string(), self.repository.full_name()),
        ])
    }
}

impl GithubEvent for PullRequestEvent {
    const EVENT_TYPE: &'static str = "pull_request";

    fn metadata(&self, action: &str) -> HashMap<String, String> {
        let number = if self.number != 0 {
            self.number
        } else {
            self.pull_request.number
        };
        HashMap::from([
            ("action".to_string(), action.to_string()),
            ("pr_number".to_string(), number.to_string()),
            ("repository".to_string(), self.repository.full_name()),
        ])
    }
}

impl GithubEvent for PushEvent {
    const EVENT_TYPE: &'static str = "push";

    fn metadata(&self, _action: &str) -> HashMap<String, String> {
        HashMap::from([
            ("ref".to_string(), self.git_ref.clone()),
            ("commit_count".to_string(), self.commits.len().to_string()),
            ("repository".to_string(), self.repository.full_name()),
        ])
    }
}

impl GithubEvent for ReleaseEvent {
    const EVENT_TYPE: &'static str = "release";

    fn metadata(&self, action: &str) -> HashMap<String, String> {
        HashMap::from([
            ("action".to_string(), action.to_string()),
            ("tag".to_string(), self.release.tag_name.clone()),
            ("repository".to_string(), self.repository.full_name()),
        ])
    }
}

/// Prompt sent to the model for an event.
pub fn build_prompt(event_type: &str, event: &impl Serialize) -> String {
    let event_json = serde_json::to_string_pretty(event).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Analyze this GitHub {} event and provide insights:\n\n\
         Event Data:\n{}\n\n\
         Please provide:\n\
         1. A summary of what happened\n\
         2. Any notable patterns or concerns\n\
         3. Recommended actions (if any)",
        event_type, event_json
    )
}

/// Model and processor shared by every handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub models: Arc<ModelExecutor>,
    pub processors: Arc<ProcessorRegistry>,
    pub model: String,
    pub processor: String,
    /// Replaces the generated prompt when set.
    pub prompt_override: Option<String>,
}

pub struct PayloadHandler<E> {
    context: HandlerContext,
    _event: PhantomData<fn() -> E>,
}

impl<E: GithubEvent> PayloadHandler<E> {
    pub fn new(context: HandlerContext) -> Self {
        Self {
            context,
            _event: PhantomData,
        }
    }

    async fn process(
        &self,
        prompt: &str,
        metadata: HashMap<String, String>,
        cancel_token: &CancellationToken,
    ) -> Result<(), TaskError> {
        let mut variables = metadata;
        variables.insert(
            "promptName".to_string(),
            format!("github_{}", E::EVENT_TYPE),
        );

        let mut response = self
            .context
            .models
            .execute_model(&self.context.model, prompt, &variables, "", cancel_token)
            .await?;
        response.variables.extend(variables);

        let template_name = format!("{}_template", E::EVENT_TYPE);
        self.context
            .processors
            .process_response(&self.context.processor, &response, &template_name)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<E: GithubEvent> EventHandler for PayloadHandler<E> {
    async fn handle(
        &self,
        event: &Event,
        cancel_token: &CancellationToken,
    ) -> Result<(), WebhookError> {
        info!(
            event_type = E::EVENT_TYPE,
            action = %event.action,
            delivery_id = %event.delivery_id,
            "Handling event"
        );

        let data: E =
            serde_json::from_slice(&event.payload).map_err(|e| WebhookError::InvalidPayload {
                event_type: E::EVENT_TYPE.to_string(),
                details: e.to_string(),
            })?;

        let prompt = match &self.context.prompt_override {
            Some(prompt) => prompt.clone(),
            None => build_prompt(E::EVENT_TYPE, &data),
        };

        let mut metadata = data.metadata(&event.action);
        metadata.insert("event_type".to_string(), E::EVENT_TYPE.to_string());
        if !event.delivery_id.is_empty() {
            metadata.insert("delivery_id".to_string(), event.delivery_id.clone());
        }

        self.process(&prompt, metadata, cancel_token)
            .await
            .map_err(|e| WebhookError::HandlerFailed {
                event_type: E::EVENT_TYPE.to_string(),
                source: Box::new(e),
            })
    }
}

pub type IssuesHandler = PayloadHandler<IssuesEvent>;
pub type PullRequestHandler = PayloadHandler<PullRequestEvent>;
pub type PushHandler = PayloadHandler<PushEvent>;
pub type ReleaseHandler = PayloadHandler<ReleaseEvent>;
