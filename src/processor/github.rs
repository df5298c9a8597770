use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::{DELIVERY_TIMEOUT, Processor, ProcessorConfig, delivery_failed, parse_json_payload};
use crate::errors::ProcessorError;
use crate::models::ModelResponse;
use crate::template::{TemplateData, TemplateManager};

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_BASE_BRANCH: &str = "main";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GitHubAction {
    Issue,
    Comment,
    PullRequest,
}

impl FromStr for GitHubAction {
    type Err = ProcessorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "issue" => Ok(GitHubAction::Issue),
            "comment" => Ok(GitHubAction::Comment),
            "pr" => Ok(GitHubAction::PullRequest),
            other => Err(invalid(format!(
                "invalid github action: {}, expected one of: issue, comment, pr",
                other
            ))),
        }
    }
}

impl fmt::Display for GitHubAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GitHubAction::Issue => "issue",
            GitHubAction::Comment => "comment",
            GitHubAction::PullRequest => "pr",
        })
    }
}

/// A REST call against the GitHub API, relative to the API root.
#[derive(Clone, Debug, PartialEq)]
pub struct GitHubRequest {
    pub path: String,
    pub body: Value,
}

fn invalid(details: impl Into<String>) -> ProcessorError {
    ProcessorError::ValidationFailed {
        processor_type: "github".to_string(),
        details: details.into(),
    }
}

/// Splits `action:owner/repo[#n]`.
pub fn parse_target(target: &str) -> Result<(GitHubAction, String), ProcessorError> {
    let parts: Vec<&str> = target.split(':').collect();
    let [action, repo] = parts.as_slice() else {
        return Err(invalid(format!(
            "invalid github target format: {}, expected 'action:repo'",
            target
        )));
    };
    Ok((action.parse()?, repo.to_string()))
}

fn split_repo(repo: &str) -> Result<(&str, &str), ProcessorError> {
    match repo.split('/').collect::<Vec<_>>().as_slice() {
        [owner, name] if !owner.is_empty() && !name.is_empty() => Ok((*owner, *name)),
        _ => Err(invalid(format!(
            "invalid repo format: {}, expected 'owner/repo'",
            repo
        ))),
    }
}

fn string_field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

pub struct GitHubProcessor {
    config: ProcessorConfig,
    templates: Arc<TemplateManager>,
    http_client: reqwest::Client,
}

impl GitHubProcessor {
    pub fn new(
        config: ProcessorConfig,
        templates: Arc<TemplateManager>,
        http_client: reqwest::Client,
    ) -> Result<Self, ProcessorError> {
        if config.target.trim().is_empty() {
            return Err(invalid("github target cannot be empty"));
        }
        Ok(Self {
            config,
            templates,
            http_client,
        })
    }

    /// Renders the payload and maps it onto the REST call for the target's
    /// action.
    pub fn build_request(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<GitHubRequest, ProcessorError> {
        let (action, repo) = parse_target(&self.config.target)?;
        let mut data = TemplateData::for_processor(response, self.processor_type(), template_name);
        let template_name = if template_name.is_empty() {
            format!("default_github_{}", action)
        } else {
            template_name.to_string()
        };
        data.metadata
            .insert("github_action".to_string(), action.to_string());
        data.metadata.insert("github_repo".to_string(), repo.clone());
        data.metadata
            .insert("template_used".to_string(), template_name.clone());

        let rendered = self.templates.safe_execute(&template_name, &data);
        if rendered.trim().is_empty() {
            return Err(ProcessorError::RenderFailed {
                template_name,
                details: "empty GitHub payload".to_string(),
            });
        }
        let payload = parse_json_payload(&rendered, &template_name)?;
        if !payload.is_object() {
            return Err(ProcessorError::InvalidPayload {
                details: format!("{}: GitHub payload must be a JSON object", template_name),
            });
        }

        let title = || -> Result<String, ProcessorError> {
            let mut title = string_field(&payload, "title").trim().to_string();
            if title.is_empty() {
                let fallback = format!("default_github_{}_title", action);
                if self.templates.template_exists(&fallback)
                    && let Ok(rendered) = self.templates.execute(&fallback, &data)
                {
                    title = rendered.trim().to_string();
                }
            }
            if title.is_empty() {
                return Err(invalid("missing or invalid 'title' in payload"));
            }
            Ok(title)
        };
        let body = string_field(&payload, "body");

        match action {
            GitHubAction::Issue => {
                let (owner, name) = split_repo(&repo)?;
                let labels: Vec<&str> = payload
                    .get("labels")
                    .and_then(Value::as_array)
                    .map(|labels| labels.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                Ok(GitHubRequest {
                    path: format!("/repos/{}/{}/issues", owner, name),
                    body: json!({"title": title()?, "body": body, "labels": labels}),
                })
            }
            GitHubAction::Comment => {
                let Some((repo, number)) = repo.split_once('#') else {
                    return Err(invalid(format!(
                        "invalid comment target format: {}, expected 'owner/repo#123'",
                        repo
                    )));
                };
                let number: u64 = number
                    .parse()
                    .map_err(|_| invalid(format!("invalid issue number: {}", number)))?;
                let (owner, name) = split_repo(repo)?;
                if body.trim().is_empty() {
                    return Err(invalid("missing or invalid 'body' in payload"));
                }
                Ok(GitHubRequest {
                    path: format!("/repos/{}/{}/issues/{}/comments", owner, name, number),
                    body: json!({"body": body}),
                })
            }
            GitHubAction::PullRequest => {
                let (owner, name) = split_repo(&repo)?;
                let head = string_field(&payload, "head");
                if head.is_empty() {
                    return Err(invalid("missing 'head' branch in payload"));
                }
                let base = match string_field(&payload, "base") {
                    "" => DEFAULT_BASE_BRANCH,
                    base => base,
                };
                Ok(GitHubRequest {
                    path: format!("/repos/{}/{}/pulls", owner, name),
                    body: json!({"title": title()?, "body": body, "head": head, "base": base}),
                })
            }
        }
    }
}

#[async_trait]
impl Processor for GitHubProcessor {
    async fn process(
        &self,
        response: &ModelResponse,
        template_name: &str,
    ) -> Result<(), ProcessorError> {
        let request = self.build_request(response, template_name)?;

        if self.config.test_mode() {
            info!(path = %request.path, payload = %request.body, "Test mode, skipping GitHub request");
            return Ok(());
        }

        let token = self
            .config
            .env("GITHUB_TOKEN")
            .ok_or_else(|| ProcessorError::MissingEnv {
                var_name: "GITHUB_TOKEN".to_string(),
            })?;
        let api_url = self.config.env_or("GITHUB_API_URL", DEFAULT_GITHUB_API_URL);
        let url = format!("{}{}", api_url.trim_end_matches('/'), request.path);

        let response = self
            .http_client
            .post(url.as_str())
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", concat!("cronai/", env!("CARGO_PKG_VERSION")))
            .timeout(DELIVERY_TIMEOUT)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| delivery_failed("github", e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(delivery_failed(
                "github",
                format!("{} {}: {}", status, request.path, text),
            ));
        }

        let html_url = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|created| created.get("html_url").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        info!(path = %request.path, %html_url, "GitHub request completed");
        Ok(())
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        if self.config.target.trim().is_empty() {
            return Err(invalid("github target cannot be empty"));
        }
        parse_target(&self.config.target)?;
        if !self.config.test_mode() && self.config.env("GITHUB_TOKEN").is_none() {
            return Err(ProcessorError::MissingEnv {
                var_name: "GITHUB_TOKEN".to_string(),
            });
        }
        Ok(())
    }

    fn processor_type(&self) -> &str {
        "github"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}
