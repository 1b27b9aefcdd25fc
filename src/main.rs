use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use maestro::agents::AgentRegistry;
use maestro::execution::ExecutionService;
use maestro::validator::validate_with_retry;
use maestro::{
    mlog, mlog_debug, ExecutionStatus, Logger, MessageEnvelope, PlanStage, PlanningService, Result,
    Settings, Store,
};

/// Maestro - plan-driven orchestration of specialist agents
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Project directory holding .opencode/ (defaults to the current directory)
    #[arg(short = 'w', long, global = true)]
    pub workdir: Option<PathBuf>,

    /// Enable debug logging (writes to <workdir>/.opencode/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List plans, newest first
    Plans,

    /// Show a plan and its latest execution
    Show {
        /// Plan id or unique prefix
        plan: String,
    },

    /// Approve a proposal so it can be executed
    Approve { plan: String },

    /// Reject a proposal
    Reject {
        plan: String,

        /// Why the proposal was rejected
        #[arg(long, short = 'r')]
        reason: Option<String>,
    },

    /// Delete a plan and all of its executions
    Remove { plan: String },

    /// List executions of a plan, newest first
    Executions { plan: String },

    /// List the resolved agent registry
    Agents,

    /// Validate an agent response file against the envelope protocol
    Validate {
        file: PathBuf,

        /// Validate with this agent's policy
        #[arg(long, short = 'a', default_value = "planner")]
        agent: String,
    },
}

fn format_stage(stage: PlanStage) -> String {
    match stage {
        PlanStage::Draft => format!("\x1b[90m{}\x1b[0m", stage),    // Gray
        PlanStage::Proposal => format!("\x1b[33m{}\x1b[0m", stage), // Yellow
        PlanStage::Approved => format!("\x1b[32m{}\x1b[0m", stage), // Green
        PlanStage::Rejected => format!("\x1b[35m{}\x1b[0m", stage), // Magenta
    }
}

fn format_status(status: &ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),
        ExecutionStatus::Running { .. } => format!("\x1b[33m{}\x1b[0m", status),
        ExecutionStatus::Completed { .. } => format!("\x1b[32m{}\x1b[0m", status),
        ExecutionStatus::Failed { .. } => format!("\x1b[31m{}\x1b[0m", status),
        ExecutionStatus::Stopped { .. } => format!("\x1b[34m{}\x1b[0m", status),
    }
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// File logging when the project already has state or debugging is on.
fn init_logger(workdir: &Path, debug: bool) -> Logger {
    let level = Logger::level_for(debug);
    if debug || Settings::state_dir(workdir).is_dir() {
        Logger::to_file(Settings::log_path(workdir), level)
    } else {
        Logger::disabled()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let logger = init_logger(&workdir, cli.debug);
    mlog_debug!(logger, "maestro {:?} in {}", cli.command, workdir.display());

    let settings = Settings::load(&workdir, &logger)?;
    let store = Store::new(&workdir, logger.clone());
    let planning = PlanningService::new(store.clone(), logger.clone());
    let executions = ExecutionService::new(store, logger.clone());

    match cli.command {
        Command::Plans => run_plans(&planning).await,
        Command::Show { plan } => run_show(&planning, &executions, &plan).await,
        Command::Approve { plan } => {
            let id = planning.resolve_plan_id(&plan).await?;
            let plan = planning.approve(&id).await?;
            println!("Approved {} ({} steps)", plan.plan_id, plan.steps.len());
            Ok(())
        }
        Command::Reject { plan, reason } => {
            let id = planning.resolve_plan_id(&plan).await?;
            let plan = planning.reject(&id, reason).await?;
            println!("Rejected {}", plan.plan_id);
            Ok(())
        }
        Command::Remove { plan } => {
            let id = planning.resolve_plan_id(&plan).await?;
            planning.remove_plan(&id).await?;
            mlog!(logger, "Removed plan {} from the command line", id);
            println!("Removed {}", id);
            Ok(())
        }
        Command::Executions { plan } => run_executions(&planning, &executions, &plan).await,
        Command::Agents => {
            run_agents(&AgentRegistry::resolve(&settings, &logger), &settings);
            Ok(())
        }
        Command::Validate { file, agent } => {
            run_validate(&AgentRegistry::resolve(&settings, &logger), &file, &agent, &logger).await
        }
    }
}

async fn run_plans(planning: &PlanningService) -> Result<()> {
    let plans = planning.list_plans().await?;
    if plans.is_empty() {
        println!("No plans");
        return Ok(());
    }
    println!("{:<32} {:<10} {:>5}  {:<4} GOAL", "ID", "STAGE", "STEPS", "RUNS");
    for plan in plans {
        println!(
            "{:<32} {:<19} {:>5}  {:<4} {}",
            plan.plan_id,
            format_stage(plan.stage),
            plan.step_count,
            if plan.has_executions { "yes" } else { "-" },
            truncate_string(&plan.goal, 50)
        );
    }
    Ok(())
}

async fn run_show(
    planning: &PlanningService,
    executions: &ExecutionService,
    plan: &str,
) -> Result<()> {
    let id = planning.resolve_plan_id(plan).await?;
    let plan = planning.load(&id).await?;
    println!("{}", plan.to_markdown());
    println!("Created:  {}", plan.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:  {}", plan.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Stage:    {}", format_stage(plan.stage));

    if let Some(execution) = executions.latest_execution(&id).await? {
        println!();
        println!(
            "Latest execution {}: {} ({}/{} tasks completed)",
            execution.execution_id,
            format_status(&execution.status),
            execution.completed_count(),
            execution.tasks.len()
        );
        for (i, (task, step)) in execution.tasks.iter().zip(&plan.steps).enumerate() {
            println!(
                "  {}. [{:<9}] {} (retries: {})",
                i + 1,
                task.status_name(),
                truncate_string(&step.description, 50),
                task.retry_count()
            );
        }
        if let ExecutionStatus::Failed {
            error, failed_step, ..
        } = &execution.status
        {
            println!("  failed at step {}: {}", failed_step + 1, error);
        }
    }
    Ok(())
}

async fn run_executions(
    planning: &PlanningService,
    executions: &ExecutionService,
    plan: &str,
) -> Result<()> {
    let id = planning.resolve_plan_id(plan).await?;
    let summaries = executions.list_executions(&id).await?;
    if summaries.is_empty() {
        println!("No executions for {}", id);
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}  {:<10} {}/{} tasks  {}",
            summary.execution_id,
            summary.status,
            summary.completed_tasks,
            summary.total_tasks,
            summary.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn run_agents(registry: &AgentRegistry, settings: &Settings) {
    println!("{:<12} {:<9} {:<10} {:<8} DESCRIPTION", "NAME", "MODE", "SUPERVISED", "RETRIES");
    for agent in registry.iter() {
        println!(
            "{:<12} {:<9} {:<10} {:<8} {}",
            agent.name,
            agent.mode,
            if agent.is_supervised(settings.default_supervised) {
                "yes"
            } else {
                "no"
            },
            agent.validation.max_retries,
            agent.description
        );
    }
}

async fn run_validate(
    registry: &AgentRegistry,
    file: &Path,
    agent: &str,
    logger: &Logger,
) -> Result<()> {
    let Some(agent) = registry.get(agent) else {
        eprintln!(
            "Unknown agent: {}. Available agents: {}",
            agent,
            registry.names().join(", ")
        );
        std::process::exit(2);
    };
    let raw = tokio::fs::read_to_string(file).await?;
    let envelope = validate_with_retry(&raw, agent, None, logger).await?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    if let MessageEnvelope::Failure(_) = envelope {
        std::process::exit(1);
    }
    Ok(())
}
