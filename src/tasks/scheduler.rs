//! Cron-driven task execution.
//!
//! The scheduler reads a config file where each non-comment line describes
//! one task:
//!
//! ```text
//! <min> <hour> <dom> <mon> <dow> <model>[:params] <prompt> <processor> [key=value,...]
//! ```
//!
//! Every task is held with its parsed cron expression. The run loop sleeps
//! until the earliest next occurrence, hands due tasks to the shared
//! [`PipelineTaskProcessor`] on a [`TaskTracker`] and recomputes their next
//! run. Lines starting with `queue ` belong to the queue service and are
//! skipped here.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::SchedulerError;
use crate::models::config::parse_model_params;
use crate::models::{ModelResponse, SUPPORTED_MODELS};
use crate::processor::parse_processor_identifier;
use crate::prompt::PromptManager;
use crate::queue::config::is_queue_line;
use crate::queue::{PipelineTaskProcessor, TaskMessage};

const CURRENT_DATE: &str = "{{CURRENT_DATE}}";
const CURRENT_TIME: &str = "{{CURRENT_TIME}}";
const CURRENT_DATETIME: &str = "{{CURRENT_DATETIME}}";

/// Minimum field count: five schedule fields, model, prompt, processor.
const MIN_FIELDS: usize = 8;

/// One line of the cron config.
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    pub line_number: usize,
    pub schedule: String,
    pub model: String,
    pub model_params: String,
    pub prompt: String,
    pub processor: String,
    pub variables: HashMap<String, String>,
    cron: Cron,
}

impl ScheduledTask {
    /// The next run strictly after `after`. Schedule fields are matched
    /// against wall-clock time in `after`'s zone.
    pub fn next_run_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self.cron.find_next_occurrence(after, false) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(schedule = %self.schedule, error = ?e, "No upcoming occurrence");
                None
            }
        }
    }

    /// Variables with the date placeholders resolved against `now`.
    pub fn resolved_variables(&self, now: DateTime<Local>) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| {
                let value = match value.as_str() {
                    CURRENT_DATE => now.format("%Y-%m-%d").to_string(),
                    CURRENT_TIME => now.format("%H:%M:%S").to_string(),
                    CURRENT_DATETIME => now.format("%Y-%m-%d %H:%M:%S").to_string(),
                    _ => value.clone(),
                };
                (key.clone(), value)
            })
            .collect()
    }

    pub fn task_message(&self, now: DateTime<Local>) -> TaskMessage {
        TaskMessage {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            processor: self.processor.clone(),
            variables: self.resolved_variables(now),
            is_inline: false,
        }
    }
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.schedule, self.model)?;
        if !self.model_params.is_empty() {
            write!(f, ":{}", self.model_params)?;
        }
        write!(f, " {} {}", self.prompt, self.processor)?;
        if !self.variables.is_empty() {
            let mut pairs: Vec<String> = self
                .variables
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            pairs.sort();
            write!(f, " {}", pairs.join(","))?;
        }
        Ok(())
    }
}

fn invalid_line(line_number: usize, details: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidLine {
        line_number,
        details: details.into(),
    }
}

fn parse_variables(
    line_number: usize,
    raw: &str,
) -> Result<HashMap<String, String>, SchedulerError> {
    let mut variables = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| invalid_line(line_number, format!("invalid variable format '{}'", pair)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid_line(
                line_number,
                format!("invalid variable format '{}'", pair),
            ));
        }
        variables.insert(key.to_string(), value.trim().to_string());
    }
    Ok(variables)
}

/// Parses one config line. Blank lines, comments and queue definitions
/// yield `Ok(None)`.
pub fn parse_task_line(
    line: &str,
    line_number: usize,
) -> Result<Option<ScheduledTask>, SchedulerError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || is_queue_line(line) {
        return Ok(None);
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < MIN_FIELDS {
        return Err(invalid_line(
            line_number,
            format!(
                "insufficient fields (need at least {}, got {})",
                MIN_FIELDS,
                parts.len()
            ),
        ));
    }

    let schedule = parts[..5].join(" ");
    let cron = Cron::from_str(&schedule).map_err(|e| SchedulerError::CronParseFailed {
        expression: schedule.clone(),
        details: e.to_string(),
    })?;

    let (model, model_params) = match parts[5].split_once(':') {
        Some((model, params)) => (model, params),
        None => (parts[5], ""),
    };
    let model = model.to_lowercase();
    if !SUPPORTED_MODELS.contains(&model.as_str()) {
        return Err(invalid_line(
            line_number,
            format!(
                "unsupported model '{}' (supported: {})",
                model,
                SUPPORTED_MODELS.join(", ")
            ),
        ));
    }
    parse_model_params(model_params).map_err(|e| invalid_line(line_number, e.to_string()))?;

    let processor = parts[7];
    parse_processor_identifier(processor).map_err(|_| {
        invalid_line(
            line_number,
            format!("invalid processor format '{}'", processor),
        )
    })?;

    let variables = if parts.len() > MIN_FIELDS {
        parse_variables(line_number, &parts[MIN_FIELDS..].join(" "))?
    } else {
        HashMap::new()
    };

    Ok(Some(ScheduledTask {
        line_number,
        schedule,
        model,
        model_params: model_params.to_string(),
        prompt: parts[6].to_string(),
        processor: processor.to_string(),
        variables,
        cron,
    }))
}

/// Parses a whole config, reporting every bad line at once.
pub fn parse_config(content: &str) -> Result<Vec<ScheduledTask>, SchedulerError> {
    let mut tasks = Vec::new();
    let mut errors = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line_number = index + 1;
        match parse_task_line(line, line_number) {
            Ok(Some(task)) => tasks.push(task),
            Ok(None) => {}
            Err(SchedulerError::CronParseFailed {
                expression,
                details,
            }) => errors.push(format!(
                "line {}: invalid cron schedule '{}': {}",
                line_number, expression, details
            )),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if !errors.is_empty() {
        return Err(SchedulerError::ConfigInvalid { errors });
    }
    Ok(tasks)
}

pub fn load_config(path: &Path) -> Result<Vec<ScheduledTask>, SchedulerError> {
    let content = std::fs::read_to_string(path).map_err(|e| SchedulerError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let tasks = parse_config(&content)?;
    info!(path = %path.display(), task_count = tasks.len(), "Parsed cron configuration");
    Ok(tasks)
}

/// Runs [`ScheduledTask`]s on their cron schedules.
pub struct CronScheduler {
    tasks: Arc<Vec<ScheduledTask>>,
    pipeline: PipelineTaskProcessor,
    tracker: TaskTracker,
}

impl CronScheduler {
    pub fn new(tasks: Vec<ScheduledTask>, pipeline: PipelineTaskProcessor) -> Self {
        Self {
            tasks: Arc::new(tasks),
            pipeline,
            tracker: TaskTracker::new(),
        }
    }

    pub fn from_config_file(
        path: &Path,
        pipeline: PipelineTaskProcessor,
    ) -> Result<Self, SchedulerError> {
        Ok(Self::new(load_config(path)?, pipeline))
    }

    pub fn list_tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Reports every task whose prompt file is missing.
    pub fn validate_prompts(&self, prompts: &PromptManager) -> Result<(), SchedulerError> {
        let errors: Vec<String> = self
            .tasks
            .iter()
            .filter_map(|task| match prompts.prompt_path(&task.prompt) {
                Ok(path) if path.is_file() => None,
                Ok(path) => Some(format!(
                    "line {}: prompt file '{}' not found",
                    task.line_number,
                    path.display()
                )),
                Err(e) => Some(format!("line {}: {}", task.line_number, e)),
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::ConfigInvalid { errors })
        }
    }

    /// Executes the task at `index` immediately.
    pub async fn run_task(
        &self,
        index: usize,
        cancel_token: &CancellationToken,
    ) -> Result<ModelResponse, SchedulerError> {
        let task = self.tasks.get(index).ok_or(SchedulerError::TaskOutOfRange {
            index,
            count: self.tasks.len(),
        })?;
        let response = self
            .pipeline
            .run(&task.task_message(Local::now()), &task.model_params, cancel_token)
            .await?;
        Ok(response)
    }

    fn spawn_execution(&self, index: usize, cancel_token: &CancellationToken) {
        let tasks = self.tasks.clone();
        let pipeline = self.pipeline.clone();
        let cancel_token = cancel_token.clone();
        self.tracker.spawn(async move {
            let task = &tasks[index];
            let message = task.task_message(Local::now());
            if let Err(e) = pipeline
                .run(&message, &task.model_params, &cancel_token)
                .await
            {
                error!(
                    line = task.line_number,
                    model = %task.model,
                    prompt = %task.prompt,
                    processor = %task.processor,
                    error = ?e,
                    "Scheduled task failed"
                );
            }
        });
    }

    /// Runs until `cancel_token` fires, then waits for in-flight executions.
    #[instrument(skip_all, fields(tasks = self.tasks.len()))]
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), SchedulerError> {
        let started = Local::now();
        let mut next_runs: Vec<Option<DateTime<Local>>> = self
            .tasks
            .iter()
            .map(|task| task.next_run_after(&started))
            .collect();

        for (task, next) in self.tasks.iter().zip(&next_runs) {
            info!(
                schedule = %task.schedule,
                model = %task.model,
                prompt = %task.prompt,
                processor = %task.processor,
                next_run = ?next,
                "Scheduled task"
            );
        }
        info!("Cron scheduler started");

        while !cancel_token.is_cancelled() {
            let Some(next) = next_runs.iter().flatten().min().copied() else {
                warn!("No scheduled tasks have upcoming runs");
                cancel_token.cancelled().await;
                break;
            };
            let wait = (next - Local::now()).to_std().unwrap_or_default();
            debug!(next_run = %next, wait = ?wait, "Waiting for next run");

            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    let now = Local::now();
                    for (index, slot) in next_runs.iter_mut().enumerate() {
                        if slot.is_some_and(|at| at <= now) {
                            self.spawn_execution(index, &cancel_token);
                            *slot = self.tasks[index].next_run_after(&now);
                        }
                    }
                }
                () = cancel_token.cancelled() => {
                    info!("Cron scheduler cancelled");
                    break;
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Cron scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike, Utc};

    use crate::models::tests::{ScriptedFactory, scripted_executor};
    use crate::processor::{ProcessorContext, ProcessorRegistry};
    use crate::template::TemplateManager;

    const CONFIG: &str = "\
# daily report
0 8 * * * openai:temperature=0.5 product_manager log-to-file project=Atlas,date={{CURRENT_DATE}}

*/15 * * * 1-5 Claude monitoring console
queue jobs memory memory:// tasks
";

    #[test]
    fn test_parse_config() {
        let tasks = parse_config(CONFIG).unwrap();
        assert_eq!(tasks.len(), 2);

        assert_eq!(tasks[0].line_number, 2);
        assert_eq!(tasks[0].schedule, "0 8 * * *");
        assert_eq!(tasks[0].model, "openai");
        assert_eq!(tasks[0].model_params, "temperature=0.5");
        assert_eq!(tasks[0].prompt, "product_manager");
        assert_eq!(tasks[0].processor, "log-to-file");
        assert_eq!(tasks[0].variables["project"], "Atlas");

        assert_eq!(tasks[1].model, "claude");
        assert!(tasks[1].variables.is_empty());
    }

    #[test]
    fn test_variables_keep_spaces_between_pairs() {
        let task = parse_task_line(
            "0 9 * * 1 gemini weekly slack-team project=My App, owner=ops",
            1,
        )
        .unwrap()
        .unwrap();
        assert_eq!(task.variables["project"], "My App");
        assert_eq!(task.variables["owner"], "ops");
    }

    #[test]
    fn test_parse_config_collects_every_error() {
        let content = "\
0 8 * * * openai p console
0 8 * * * llama p console
99 8 * * * openai p console
0 8 * * * openai p pager-duty
0 8 * * openai p
0 8 * * * openai p console novalue
";
        let Err(SchedulerError::ConfigInvalid { errors }) = parse_config(content) else {
            panic!("expected ConfigInvalid");
        };
        assert_eq!(errors.len(), 5);
        assert!(errors[0].contains("unsupported model 'llama'"));
        assert!(errors[1].starts_with("line 3: invalid cron schedule '99 8 * * *'"));
        assert!(errors[2].contains("invalid processor format 'pager-duty'"));
        assert!(errors[3].contains("insufficient fields"));
        assert!(errors[4].contains("invalid variable format 'novalue'"));
    }

    #[test]
    fn test_accepted_processors() {
        for processor in [
            "console",
            "log-to-file",
            "slack-alerts",
            "email-team@example.com",
            "webhook-monitoring",
            "teams-channel",
            "file-report.txt",
            "github-issue:owner/repo",
        ] {
            let line = format!("0 8 * * * openai p {}", processor);
            assert!(parse_task_line(&line, 1).unwrap().is_some(), "{processor}");
        }
    }

    #[test]
    fn test_date_placeholders_resolve_at_execution() {
        let task = parse_task_line(
            "0 8 * * * openai p console d={{CURRENT_DATE}},t={{CURRENT_TIME}},dt={{CURRENT_DATETIME}},x=y",
            1,
        )
        .unwrap()
        .unwrap();
        let now = Local.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let message = task.task_message(now);
        assert_eq!(message.variables["d"], "2025-03-04");
        assert_eq!(message.variables["t"], "05:06:07");
        assert_eq!(message.variables["dt"], "2025-03-04 05:06:07");
        assert_eq!(message.variables["x"], "y");
        assert_eq!(task.variables["d"], CURRENT_DATE);
    }

    #[test]
    fn test_next_run_after() {
        let task = parse_task_line("15 * * * * openai p console", 1)
            .unwrap()
            .unwrap();
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 10, 15, 0).unwrap();
        assert_eq!(
            task.next_run_after(&at),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 11, 15, 0).unwrap())
        );
    }

    #[test]
    fn test_schedule_follows_wall_clock_of_zone() {
        let task = parse_task_line("0 8 * * * openai p console", 1)
            .unwrap()
            .unwrap();

        let offset = FixedOffset::east_opt(5 * 3600).unwrap();
        let at = offset.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let next = task.next_run_after(&at).unwrap();
        assert_eq!(next, offset.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap());
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2025, 1, 2, 3, 0, 0).unwrap()
        );

        let local = task.next_run_after(&Local::now()).unwrap();
        assert_eq!((local.hour(), local.minute()), (8, 0));
    }

    #[test]
    fn test_display_round_trips_the_line() {
        let line = "0 8 * * * openai:temperature=0.5 report console a=1,b=2";
        let task = parse_task_line(line, 1).unwrap().unwrap();
        assert_eq!(task.to_string(), line);
    }

    fn scheduler(dir: &Path, config: &str) -> (CronScheduler, Arc<PromptManager>) {
        let templates = Arc::new(TemplateManager::new());
        let prompts = Arc::new(PromptManager::new(dir, templates.clone()));
        let pipeline = PipelineTaskProcessor::new(
            prompts.clone(),
            Arc::new(scripted_executor(ScriptedFactory::always("Mock response"))),
            Arc::new(ProcessorRegistry::new(ProcessorContext::new(templates))),
        );
        (
            CronScheduler::new(parse_config(config).unwrap(), pipeline),
            prompts,
        )
    }

    #[test]
    fn test_validate_prompts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.md"), "hi").unwrap();
        let (scheduler, prompts) = scheduler(
            dir.path(),
            "0 8 * * * openai present console\n0 9 * * * openai absent console\n",
        );

        let Err(SchedulerError::ConfigInvalid { errors }) = scheduler.validate_prompts(&prompts)
        else {
            panic!("expected ConfigInvalid");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("line 2: prompt file"));
    }

    #[tokio::test]
    async fn test_run_task() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("status.md"), "Status for {{project}}").unwrap();
        let (scheduler, _) = scheduler(dir.path(), "0 8 * * * openai status console project=Atlas\n");

        let response = scheduler
            .run_task(0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "Mock response");
        assert_eq!(response.variables["project"], "Atlas");

        assert!(matches!(
            scheduler.run_task(3, &CancellationToken::new()).await,
            Err(SchedulerError::TaskOutOfRange { index: 3, count: 1 })
        ));
    }

    #[tokio::test]
    async fn test_run_returns_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path(), "0 0 1 1 * openai p console\n");
        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stopper.cancel();
        });

        crate::test_helpers::with_timeout(std::time::Duration::from_secs(5), scheduler.run(token))
            .await
            .unwrap()
            .unwrap();
    }
}
