//! Gatekeeper CLI
//!
//! Drives fix-and-retry loops for tasks recorded in the repository's state
//! file, runs the gate suite on demand and repairs stuck plans.
//!
//! Machine-readable results go to stdout as JSON lines; human-readable
//! summaries and logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use gatekeeper::agent::CommandFixingAgent;
use gatekeeper::events::{
    BroadcastEventSink, EventSink, FanoutSink, TracingEventSink, EVENT_SCHEMA_VERSION,
};
use gatekeeper::gates::{run_qa_gates, GateStatus, GateSuiteResult, ShellGateRunner};
use gatekeeper::orchestrator::{LoopOutcome, LoopRegistry, OrchestratorConfig, RetryOrchestrator};
use gatekeeper::reconciler::{Reconciler, RECONCILE_BATCH_SIZE};
use gatekeeper::service::{QaService, TriggerResponse};
use gatekeeper::state::{
    FileStore, Plan, PlanStatus, PlanUpdate, StateStore, Task, TaskHistogram,
};
use gatekeeper::{GatekeeperError, RepositoryConfig};

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(version, about = "Bounded fix-and-retry loops behind quality gates")]
#[command(propagate_version = true)]
struct Cli {
    /// Repository directory
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fix-and-retry loop for a task
    Run {
        /// Task to drive
        task_id: String,

        /// Run the loop in the background and stream progress events
        #[arg(long)]
        detach: bool,

        /// Override the agent timeout from the repository config (seconds)
        #[arg(long)]
        agent_timeout: Option<u64>,

        /// Never send files matching this glob to the agent (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },

    /// Run the configured gate suite once
    Gates,

    /// Repair plans stuck in the failed state
    Reconcile {
        /// Number of most recent failed plans to inspect
        #[arg(long, default_value_t = RECONCILE_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Print the effective repository configuration
    Config,

    /// Show a task and its plan
    Status {
        /// Task to show
        task_id: String,
    },

    /// Manage plans
    Plan {
        #[command(subcommand)]
        action: PlanCommands,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Create a plan with ordered tasks
    Create {
        /// Plan title
        #[arg(long)]
        title: String,

        /// Task title, in execution order (repeatable)
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,

        /// Retry budget for every task in the plan
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Commit the tasks' changes are based on
        #[arg(long)]
        base_commit: Option<String>,
    },

    /// Move a paused plan back to pending
    Resume {
        /// Plan to resume
        plan_id: String,
    },

    /// List the most recently created plans
    List {
        /// Maximum number of plans
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    // Resolve repository path
    let repo_path = cli.repo.canonicalize().unwrap_or(cli.repo.clone());

    if !repo_path.exists() {
        eprintln!(
            "{} Repository directory does not exist: {}",
            "Error:".red().bold(),
            repo_path.display()
        );
        std::process::exit(2);
    }

    let code = match dispatch(cli.command, &repo_path).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            e.downcast_ref::<GatekeeperError>()
                .map_or(3, GatekeeperError::exit_code)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "gatekeeper=debug,info"
    } else {
        "gatekeeper=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(command: Commands, repo_path: &Path) -> anyhow::Result<i32> {
    match command {
        Commands::Run {
            task_id,
            detach,
            agent_timeout,
            exclude,
        } => {
            let config = RepositoryConfig::load(repo_path)?;

            let mut settings = OrchestratorConfig::new(repo_path);
            if let Some(secs) = agent_timeout {
                settings = settings.with_agent_timeout(Duration::from_secs(secs));
            }
            let globs: Vec<&str> = exclude.iter().map(String::as_str).collect();
            settings = settings.with_exclude_globs(&globs);

            let store: Arc<dyn StateStore> = Arc::new(FileStore::for_repo(repo_path));
            let orchestrator = RetryOrchestrator::new(
                store,
                Arc::new(ShellGateRunner::default()),
                Arc::new(CommandFixingAgent::new(config.agent.clone())),
                settings,
            )
            .with_config_loader(Arc::new(config));

            if detach {
                run_detached(orchestrator, &task_id).await
            } else {
                run_foreground(orchestrator, &task_id).await
            }
        }

        Commands::Gates => {
            let config = RepositoryConfig::load(repo_path)?;
            eprintln!(
                "{} Running {} gate(s) in {}",
                "Gates:".cyan().bold(),
                config.qa_gates.len(),
                repo_path.display()
            );

            let suite = GateSuiteResult::from_results(run_qa_gates(&config, repo_path).await);
            for result in &suite.results {
                let line = result.summary();
                match result.status {
                    GateStatus::Passed => eprintln!("  {}", line.green()),
                    GateStatus::Failed => eprintln!("  {}", line.red()),
                    GateStatus::Skipped => eprintln!("  {}", line.dimmed()),
                }
            }
            if suite.all_passed {
                eprintln!("{}", "All gates passed".green().bold());
            } else {
                eprintln!(
                    "{} {} gate(s) failed",
                    "FAILED".red().bold(),
                    suite.failures().len()
                );
            }

            print_json(&suite)?;
            Ok(if suite.all_passed { 0 } else { 1 })
        }

        Commands::Reconcile { batch_size } => {
            let store: Arc<dyn StateStore> = Arc::new(FileStore::for_repo(repo_path));
            let reconciler = Reconciler::new(store).with_batch_size(batch_size);
            let response = match reconciler.repair_stuck_plans().await {
                Ok(report) => {
                    eprintln!(
                        "{} checked {} plan(s), repaired {}",
                        "Reconcile:".cyan().bold(),
                        report.checked,
                        report.fixed
                    );
                    for failed in report.errors() {
                        eprintln!(
                            "  {} {}: {}",
                            "error".red(),
                            failed.plan_id,
                            failed.error.as_deref().unwrap_or("unknown")
                        );
                    }
                    TriggerResponse::Reconciled { report }
                }
                Err(e) => TriggerResponse::from_error("reconciliation", &e),
            };
            print_json(&response)?;
            Ok(response.exit_code())
        }

        Commands::Config => {
            let config = RepositoryConfig::load(repo_path)?;
            for gate in &config.qa_gates {
                let state = if gate.enabled {
                    "enabled".green()
                } else {
                    "disabled".dimmed()
                };
                eprintln!("  {} [{}] {}", gate.name.bold(), state, gate.display_command());
            }
            print_json(&config)?;
            Ok(0)
        }

        Commands::Status { task_id } => {
            let store = FileStore::for_repo(repo_path);
            let Some(task) = store.task(&task_id).await? else {
                return respond_error(&task_id, &GatekeeperError::task_not_found(&task_id));
            };
            let plan = store.plan(&task.plan_id).await?;
            let siblings = store.tasks_for_plan(&task.plan_id).await?;

            eprintln!(
                "{} {} ({}) attempt {}",
                "Task:".cyan().bold(),
                task.id,
                task.status,
                task.attempt
            );
            if let Some(plan) = &plan {
                eprintln!("{} {} ({})", "Plan:".cyan().bold(), plan.id, plan.status);
            }

            print_json(&StatusView {
                tasks: TaskHistogram::from_tasks(&siblings),
                task,
                plan,
            })?;
            Ok(0)
        }

        Commands::Plan { action } => plan_command(action, repo_path).await,
    }
}

async fn plan_command(action: PlanCommands, repo_path: &Path) -> anyhow::Result<i32> {
    let store = FileStore::for_repo(repo_path);

    match action {
        PlanCommands::Create {
            title,
            tasks,
            max_attempts,
            base_commit,
        } => {
            let plan = Plan::new(title);
            let tasks: Vec<Task> = tasks
                .into_iter()
                .map(|title| {
                    let mut task = Task::new(plan.id.clone(), title);
                    if let Some(max) = max_attempts {
                        task = task.with_max_attempts(max);
                    }
                    if let Some(commit) = &base_commit {
                        task = task.with_base_commit(commit.clone());
                    }
                    task
                })
                .collect();

            let created = CreatedPlan {
                plan_id: plan.id.clone(),
                task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            };
            store
                .insert_plan(plan, tasks)
                .await
                .context("Failed to create plan")?;

            eprintln!(
                "{} plan {} with {} task(s)",
                "Created".green().bold(),
                created.plan_id,
                created.task_ids.len()
            );
            print_json(&created)?;
            Ok(0)
        }

        PlanCommands::Resume { plan_id } => {
            let update = PlanUpdate::status(PlanStatus::Pending);
            match store.update_plan(&plan_id, PlanStatus::Paused, update).await {
                Ok(plan) => {
                    eprintln!("{} plan {}", "Resumed".green().bold(), plan.id);
                    print_json(&plan)?;
                    Ok(0)
                }
                Err(e) => respond_error(&plan_id, &e),
            }
        }

        PlanCommands::List { limit } => {
            let plans = store.recent_plans(None, limit).await?;
            for plan in &plans {
                eprintln!("  {} {} ({})", plan.id, plan.title.bold(), plan.status);
            }
            print_json(&plans)?;
            Ok(0)
        }
    }
}

async fn run_foreground(orchestrator: RetryOrchestrator, task_id: &str) -> anyhow::Result<i32> {
    let service = QaService::new(orchestrator);
    cancel_on_ctrl_c(service.orchestrator().registry().clone(), task_id);

    let response = service.trigger_sync(task_id).await;
    report_loop(task_id, &response);
    print_json(&response)?;
    Ok(response.exit_code())
}

async fn run_detached(orchestrator: RetryOrchestrator, task_id: &str) -> anyhow::Result<i32> {
    let broadcast = Arc::new(BroadcastEventSink::default());
    let mut rx = broadcast.subscribe();
    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingEventSink))
            .with(broadcast.clone()),
    );
    let service = QaService::new(orchestrator.with_events(sink));

    let accepted = service.trigger_async(task_id).await;
    print_json(&accepted)?;
    if !matches!(accepted, TriggerResponse::Accepted { .. }) {
        report_loop(task_id, &accepted);
        return Ok(accepted.exit_code());
    }
    cancel_on_ctrl_c(service.orchestrator().registry().clone(), task_id);

    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let line = EventLine {
                        schema_version: EVENT_SCHEMA_VERSION,
                        event: &event,
                    };
                    if let Ok(json) = serde_json::to_string(&line) {
                        println!("{json}");
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Progress stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let response = match service.wait(task_id).await {
        Some(Ok(result)) => TriggerResponse::Completed { result },
        Some(Err(e)) => TriggerResponse::from_error(task_id, &e),
        None => TriggerResponse::from_error(
            task_id,
            &GatekeeperError::Other(anyhow::anyhow!("no background loop for task {task_id}")),
        ),
    };

    // Close the channel so the printer drains and stops.
    drop(service);
    drop(broadcast);
    let _ = printer.await;

    report_loop(task_id, &response);
    print_json(&response)?;
    Ok(response.exit_code())
}

fn cancel_on_ctrl_c(registry: LoopRegistry, task_id: &str) {
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} cancelling loop for {}", "Interrupted:".yellow().bold(), task_id);
            registry.cancel(&task_id);
        }
    });
}

fn report_loop(task_id: &str, response: &TriggerResponse) {
    match response {
        TriggerResponse::Completed { result } => match result.outcome {
            LoopOutcome::Passed => eprintln!(
                "{} {} passed after {} attempt(s)",
                "PASSED".green().bold(),
                task_id,
                result.attempt
            ),
            LoopOutcome::MaxRetriesReached => eprintln!(
                "{} {} still failing after {} attempt(s)",
                "FAILED".red().bold(),
                task_id,
                result.attempt
            ),
            LoopOutcome::Cancelled => eprintln!(
                "{} {} cancelled during attempt {}",
                "CANCELLED".yellow().bold(),
                task_id,
                result.attempt
            ),
        },
        TriggerResponse::Accepted { .. } | TriggerResponse::Reconciled { .. } => {}
        TriggerResponse::NotFound { message } | TriggerResponse::Conflict { message } => {
            eprintln!("{} {}", "Error:".red().bold(), message);
        }
        TriggerResponse::InternalError { message } => {
            eprintln!("{} {}", "Internal error:".red().bold(), message);
        }
    }
}

fn respond_error(subject: &str, err: &GatekeeperError) -> anyhow::Result<i32> {
    let response = TriggerResponse::from_error(subject, err);
    report_loop(subject, &response);
    print_json(&response)?;
    Ok(response.exit_code())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedPlan {
    plan_id: String,
    task_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusView {
    task: Task,
    plan: Option<Plan>,
    tasks: TaskHistogram,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventLine<'a> {
    schema_version: u32,
    event: &'a gatekeeper::ProgressEvent,
}
