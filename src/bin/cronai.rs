use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

use cronai::{
    Services,
    bot::BotService,
    config::BotConfig,
    prompt::{PromptInfo, PromptManager},
    queue::{QueueService, TaskMessage, task_processor::TEMPLATE_VARIABLE},
    tasks::{CronScheduler, load_config, manager::spawn_cancellable_task},
};

const DEFAULT_CONFIG_FILE: &str = "cronai.config";
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

const USAGE: &str = "\
Usage: cronai <command> [options]

Commands:
  start [--config <path>]        run the cron scheduler
  bot                            serve GitHub webhooks
  queue [--config <path>]        consume task messages from queues
  run <model>[:params] <prompt> <processor> [key=value,...] [--template <name>]
                                 execute one task immediately
  validate <config>              check a config file and its prompt files
  list <config>                  print the scheduled tasks
  prompt list [--category <c>]   list prompts grouped by category
  prompt search <query> [--category <c>] [--content]
                                 match names and descriptions, or file content
  prompt show <name>             print a prompt's metadata and body
  prompt preview <name> [--vars key=value,...]
                                 render a prompt with variables
  --version                      print the version";

#[derive(Debug, PartialEq)]
enum Command {
    Start { config: PathBuf },
    Bot,
    Queue { config: Option<PathBuf> },
    Run {
        model: String,
        model_params: String,
        prompt: String,
        processor: String,
        variables: HashMap<String, String>,
    },
    Validate { config: PathBuf },
    List { config: PathBuf },
    Prompt(PromptCommand),
}

#[derive(Debug, PartialEq)]
enum PromptCommand {
    List {
        category: String,
    },
    Search {
        query: String,
        category: String,
        content: bool,
    },
    Show {
        name: String,
    },
    Preview {
        name: String,
        variables: HashMap<String, String>,
    },
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(position) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    if position + 1 >= args.len() {
        bail!("{} requires a value", flag);
    }
    let value = args.remove(position + 1);
    args.remove(position);
    Ok(Some(value))
}

fn take_switch(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != flag);
    args.len() != before
}

fn parse_variables(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid variable format '{}'", pair))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_command(mut args: Vec<String>) -> Result<Command> {
    if args.is_empty() {
        bail!("missing command\n\n{}", USAGE);
    }
    let command = args.remove(0);

    match command.as_str() {
        "start" => {
            let config = take_flag(&mut args, "--config")?
                .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
            Ok(Command::Start {
                config: config.into(),
            })
        }
        "bot" => Ok(Command::Bot),
        "queue" => Ok(Command::Queue {
            config: take_flag(&mut args, "--config")?.map(PathBuf::from),
        }),
        "run" => {
            let template = take_flag(&mut args, "--template")?;
            if args.len() < 3 {
                bail!("run needs <model> <prompt> <processor>\n\n{}", USAGE);
            }
            let (model, model_params) = match args[0].split_once(':') {
                Some((model, params)) => (model.to_string(), params.to_string()),
                None => (args[0].clone(), String::new()),
            };
            let mut variables = match args.get(3) {
                Some(raw) => parse_variables(raw)?,
                None => HashMap::new(),
            };
            if let Some(template) = template {
                variables.insert(TEMPLATE_VARIABLE.to_string(), template);
            }
            Ok(Command::Run {
                model,
                model_params,
                prompt: args[1].clone(),
                processor: args[2].clone(),
                variables,
            })
        }
        "validate" | "list" => {
            let config = args
                .first()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("{} needs a config file path", command))?;
            if command == "validate" {
                Ok(Command::Validate { config })
            } else {
                Ok(Command::List { config })
            }
        }
        "prompt" => parse_prompt_command(args).map(Command::Prompt),
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn parse_prompt_command(mut args: Vec<String>) -> Result<PromptCommand> {
    if args.is_empty() {
        bail!("prompt needs a subcommand\n\n{}", USAGE);
    }
    let subcommand = args.remove(0);
    let category = take_flag(&mut args, "--category")?.unwrap_or_default();

    match subcommand.as_str() {
        "list" => Ok(PromptCommand::List { category }),
        "search" => {
            let content = take_switch(&mut args, "--content");
            let query = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("prompt search needs a query"))?;
            Ok(PromptCommand::Search {
                query,
                category,
                content,
            })
        }
        "show" | "preview" => {
            let raw_vars = take_flag(&mut args, "--vars")?;
            let name = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("prompt {} needs a prompt name", subcommand))?;
            if subcommand == "show" {
                return Ok(PromptCommand::Show { name });
            }
            let variables = match raw_vars {
                Some(raw) => parse_variables(&raw)?,
                None => HashMap::new(),
            };
            Ok(PromptCommand::Preview { name, variables })
        }
        other => bail!("unknown prompt subcommand '{}'\n\n{}", other, USAGE),
    }
}

fn print_prompt_table(prompts: &[PromptInfo]) {
    if prompts.is_empty() {
        println!("No prompts found matching the search criteria");
        return;
    }
    println!("{:<16} {:<32} {:<40} PATH", "CATEGORY", "NAME", "DESCRIPTION");
    for info in prompts {
        println!(
            "{:<16} {:<32} {:<40} {}",
            info.category, info.name, info.description, info.path
        );
    }
}

fn run_prompt_command(prompts: &PromptManager, command: PromptCommand) -> Result<()> {
    match command {
        PromptCommand::List { category } => {
            let mut found = prompts.search_prompts("", &category)?;
            found.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
            let mut current = None;
            for info in &found {
                if current != Some(&info.category) {
                    println!("\n{}:", info.category);
                    current = Some(&info.category);
                }
                println!("  {}", info.name);
                if !info.description.is_empty() {
                    println!("    {}", info.description);
                }
            }
        }
        PromptCommand::Search {
            query,
            category,
            content,
        } => {
            let found = if content {
                prompts
                    .search_prompt_content(&query)?
                    .into_iter()
                    .filter(|info| {
                        category.is_empty() || info.category.eq_ignore_ascii_case(&category)
                    })
                    .collect()
            } else {
                prompts.search_prompts(&query, &category)?
            };
            print_prompt_table(&found);
        }
        PromptCommand::Show { name } => {
            let info = prompts.prompt_info(&name)?;
            println!("Name: {}", info.name);
            println!("Category: {}", info.category);
            println!("Path: {}", info.path);
            if let Some(metadata) = &info.metadata {
                println!("Description: {}", metadata.description);
                println!("Author: {}", metadata.author);
                println!("Version: {}", metadata.version);
                if !metadata.tags.is_empty() {
                    println!("Tags: {}", metadata.tags.join(", "));
                }
                if !metadata.variables.is_empty() {
                    println!("\nVariables:");
                    for variable in &metadata.variables {
                        println!("  {:<20} {}", variable.name, variable.description);
                    }
                }
            }
            println!("\nContent:\n{}", prompts.load_prompt(&name)?);
        }
        PromptCommand::Preview {
            name,
            mut variables,
        } => {
            let now = Local::now();
            for (key, format) in [
                ("CURRENT_DATE", "%Y-%m-%d"),
                ("CURRENT_TIME", "%H:%M:%S"),
                ("CURRENT_DATETIME", "%Y-%m-%d %H:%M:%S"),
            ] {
                variables
                    .entry(key.to_string())
                    .or_insert_with(|| now.format(format).to_string());
            }
            println!("{}", prompts.load_prompt_with_variables(&name, &variables)?);
        }
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        env::var("RUST_LOG").unwrap_or_else(|_| "cronai=info,warn".into()),
    );

    let json_logs = env::var("JSON_LOGS")
        .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
        .unwrap_or(false);
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Cancels `token` on Ctrl+C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            () = token.cancelled() => {},
            _ = terminate => {
                tracing::info!("Received SIGTERM signal, initiating shutdown");
            },
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = ?e, "Ctrl+C handler failed");
                }
                tracing::info!("Received Ctrl+C signal, initiating shutdown");
            },
        }
        token.cancel();
    });
    Ok(())
}

async fn run_until_shutdown<F, Fut>(task_name: &'static str, task: F) -> Result<()>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let failed = CancellationToken::new();
    let failure_flag = failed.clone();
    spawn_cancellable_task(
        &tracker,
        token.clone(),
        task_name,
        SHUTDOWN_GRACE_PERIOD,
        move |cancel_token| async move {
            let result = task(cancel_token).await;
            if result.is_err() {
                failure_flag.cancel();
            }
            result
        },
    );

    tracker.close();
    tracker.wait().await;
    tracing::info!("All tasks completed, application shutting down");

    if failed.is_cancelled() {
        bail!("{} stopped with an error", task_name);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let version = cronai::config::version()?;

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--version") {
        println!("{version}");
        return Ok(());
    }
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{USAGE}");
        return Ok(());
    }
    let command = parse_command(args)?;

    init_tracing();
    tracing::info!(version = %version, command = ?command, "Starting cronai");

    let services = Arc::new(Services::from_env().context("loading templates")?);

    match command {
        Command::Start { config } => {
            let scheduler = Arc::new(CronScheduler::from_config_file(
                &config,
                services.pipeline(),
            )?);
            run_until_shutdown("cron-scheduler", move |cancel_token| async move {
                scheduler.run(cancel_token).await?;
                Ok(())
            })
            .await
        }
        Command::Bot => {
            let service = BotService::new(
                BotConfig::from_env()?,
                services.models.clone(),
                services.processors.clone(),
            )?;
            run_until_shutdown("bot", move |cancel_token| async move {
                service.run(cancel_token).await
            })
            .await
        }
        Command::Queue { config } => {
            let tasks = QueueService::load_tasks(config.as_deref())?;
            let service = QueueService::new(
                Arc::new(services.pipeline()),
                &services.consumers,
                tasks,
            )?;
            run_until_shutdown("queue", move |cancel_token| async move {
                service.run(cancel_token).await?;
                Ok(())
            })
            .await
        }
        Command::Run {
            model,
            model_params,
            prompt,
            processor,
            variables,
        } => {
            let task = TaskMessage {
                model,
                prompt,
                processor,
                variables,
                is_inline: false,
            };
            task.validate()?;
            let response = services
                .pipeline()
                .run(&task, &model_params, &CancellationToken::new())
                .await?;
            tracing::info!(
                model = %response.model,
                execution_id = %response.execution_id,
                "Task executed"
            );
            Ok(())
        }
        Command::Validate { config } => {
            let scheduler = CronScheduler::from_config_file(&config, services.pipeline())?;
            scheduler.validate_prompts(&services.prompts)?;
            println!(
                "{}: {} task(s), configuration is valid",
                config.display(),
                scheduler.list_tasks().len()
            );
            Ok(())
        }
        Command::List { config } => {
            let now = Local::now();
            for (index, task) in load_config(&config)?.iter().enumerate() {
                let next = task
                    .next_run_after(&now)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("[{}] {}  (next: {})", index, task, next);
            }
            Ok(())
        }
        Command::Prompt(command) => run_prompt_command(&services.prompts, command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_start_and_queue() {
        assert_eq!(
            parse_command(args("start")).unwrap(),
            Command::Start {
                config: PathBuf::from(DEFAULT_CONFIG_FILE)
            }
        );
        assert_eq!(
            parse_command(args("start --config /etc/cronai.config")).unwrap(),
            Command::Start {
                config: PathBuf::from("/etc/cronai.config")
            }
        );
        assert_eq!(
            parse_command(args("queue")).unwrap(),
            Command::Queue { config: None }
        );
        assert_eq!(parse_command(args("bot")).unwrap(), Command::Bot);
    }

    #[test]
    fn test_parse_run() {
        let command = parse_command(args(
            "run claude:temperature=0.2 weekly_report slack-team project=Atlas,owner=ops --template brief",
        ))
        .unwrap();
        let Command::Run {
            model,
            model_params,
            prompt,
            processor,
            variables,
        } = command
        else {
            panic!("expected run");
        };
        assert_eq!(model, "claude");
        assert_eq!(model_params, "temperature=0.2");
        assert_eq!(prompt, "weekly_report");
        assert_eq!(processor, "slack-team");
        assert_eq!(variables["project"], "Atlas");
        assert_eq!(variables["template"], "brief");
    }

    #[test]
    fn test_parse_prompt_commands() {
        assert_eq!(
            parse_command(args("prompt list")).unwrap(),
            Command::Prompt(PromptCommand::List {
                category: String::new()
            })
        );
        assert_eq!(
            parse_command(args("prompt list --category monitoring")).unwrap(),
            Command::Prompt(PromptCommand::List {
                category: "monitoring".to_string()
            })
        );
        assert_eq!(
            parse_command(args("prompt search disk --content --category monitoring")).unwrap(),
            Command::Prompt(PromptCommand::Search {
                query: "disk".to_string(),
                category: "monitoring".to_string(),
                content: true,
            })
        );
        assert_eq!(
            parse_command(args("prompt show reports/weekly")).unwrap(),
            Command::Prompt(PromptCommand::Show {
                name: "reports/weekly".to_string()
            })
        );

        let Command::Prompt(PromptCommand::Preview { name, variables }) =
            parse_command(args("prompt preview weekly --vars team=Platform,date=2025-05-12"))
                .unwrap()
        else {
            panic!("expected prompt preview");
        };
        assert_eq!(name, "weekly");
        assert_eq!(variables["team"], "Platform");
        assert_eq!(variables["date"], "2025-05-12");
    }

    #[test]
    fn test_parse_errors() {
        for line in [
            "",
            "launch",
            "run openai",
            "validate",
            "start --config",
            "prompt",
            "prompt search",
            "prompt show",
            "prompt delete x",
            "prompt list --category",
        ] {
            assert!(parse_command(args(line)).is_err(), "{line:?}");
        }
        assert!(parse_command(args("run openai p console novalue")).is_err());
    }
}
