use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use planwright::actors::ActorRegistry;
use planwright::approval::human::{ApprovalService, AutoApprove, ConsoleApprover};
use planwright::config::Config;
use planwright::decomposer::{Decomposer, FileDecomposer, LlmDecomposer};
use planwright::llm::create_generator;
use planwright::persistence::{PlanStore, SqliteStore};
use planwright::planning::{ActorRef, Plan, PlanEvent, Task};
use planwright::Coordinator;

#[derive(Parser)]
#[command(name = "planwright")]
#[command(about = "Plan execution with adaptive replanning", long_about = None)]
struct Cli {
    /// Config file (default: the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a task until it completes, fails or needs a human
    Run {
        /// Plan file (JSON or TOML); steps come from the file instead of the model
        #[arg(short, long)]
        plan: Option<PathBuf>,
        /// Task description
        #[arg(short, long)]
        task: Option<String>,
        /// Actor for plan-file action steps that name none
        #[arg(long)]
        actor: Option<String>,
        /// SQLite database (default: from config)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Approve every request without asking
        #[arg(long, default_value = "false")]
        auto_approve: bool,
        /// Autonomy level 0-4; 0 asks for every plan
        #[arg(long, default_value = "2")]
        autonomy: u8,
    },
    /// Show a task, its current plan and progress
    Status {
        #[arg(short, long)]
        task: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List every plan version of a task
    History {
        #[arg(short, long)]
        task: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show or write the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planwright=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run {
            plan,
            task,
            actor,
            db,
            auto_approve,
            autonomy,
        } => {
            run_task(config, plan, task, actor, db, auto_approve, autonomy).await?;
        }
        Commands::Status { task, db } => {
            show_status(&config, &task, db).await?;
        }
        Commands::History { task, db } => {
            show_history(&config, &task, db).await?;
        }
        Commands::Config { show } => {
            handle_config(&config, cli.config.as_deref(), show)?;
        }
    }

    Ok(())
}

async fn open_store(config: &Config, db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = match db {
        Some(path) => path,
        None => config.persistence.resolved_database_path()?,
    };
    SqliteStore::open(&path).await
}

async fn run_task(
    config: Config,
    plan_file: Option<PathBuf>,
    description: Option<String>,
    actor: Option<String>,
    db: Option<PathBuf>,
    auto_approve: bool,
    autonomy: u8,
) -> Result<()> {
    let registry = ActorRegistry::with_builtins(&config.actors);

    let (decomposer, description): (Arc<dyn Decomposer>, String) = match (plan_file, description) {
        (Some(path), description) => {
            let mut file = FileDecomposer::load(&path)?;
            if let Some(actor) = actor {
                file = file.with_default_actor(ActorRef::tool(actor));
            }
            let description =
                description.unwrap_or_else(|| format!("Run plan {}", path.display()));
            (Arc::new(file), description)
        }
        (None, Some(description)) => {
            let generator = create_generator(&config.llm)?;
            let decomposer =
                LlmDecomposer::new(Arc::new(generator)).with_environment(format!(
                    "Available actors:\n{}",
                    registry.describe()
                ));
            (Arc::new(decomposer), description)
        }
        (None, None) => anyhow::bail!("Either --plan or --task is required"),
    };

    let approvals: Arc<dyn ApprovalService> = if auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(ConsoleApprover::new())
    };
    let store: Arc<dyn PlanStore> = Arc::new(open_store(&config, db).await?);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("{}", describe_event(&event));
        }
    });

    let coordinator = Coordinator::new(
        &config,
        store,
        decomposer,
        Arc::new(registry),
        approvals,
        event_tx,
    );

    let task = Task::new(uuid::Uuid::new_v4().to_string(), description).with_autonomy(autonomy);
    let task_id = task.id.clone();
    println!("Task {}", task_id);

    let result = {
        let run = coordinator.submit_task(task);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                _ = tokio::signal::ctrl_c() => {
                    println!("\nCancelling task {}...", task_id);
                    coordinator.cancel_task(&task_id);
                }
            }
        }
    };

    drop(coordinator);
    let _ = printer.await;

    match result {
        Ok(task) => {
            println!("\nTask {} finished: {}", task.id, task.status);
            Ok(())
        }
        Err(e) if e.requires_human() => {
            println!("\n🙋 {}", e);
            println!("Inspect it with: planwright history --task {}", task_id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn show_status(config: &Config, task_id: &str, db: Option<PathBuf>) -> Result<()> {
    let store = open_store(config, db).await?;
    let task = store.require_task(task_id).await?;
    let current = store.latest_plan(task_id).await?;

    println!("Task {}: {}", task.id, task.description);
    println!("Status: {}", task.status);
    if let Some(reason) = &task.intervention_reason {
        println!("Needs a human: {}", reason);
    }
    println!(
        "Replan attempts: {} ({} consecutive failures)",
        task.replan_attempts, task.consecutive_failures
    );

    match current {
        Some(plan) => {
            println!(
                "\nPlan v{} [{}] {:.0}% done",
                plan.version,
                plan.status,
                plan.progress_percent()
            );
            print_steps(&plan);
        }
        None => println!("\nNo plan yet"),
    }
    Ok(())
}

async fn show_history(config: &Config, task_id: &str, db: Option<PathBuf>) -> Result<()> {
    let store = open_store(config, db).await?;
    let task = store.require_task(task_id).await?;
    let versions = store.plan_versions(task_id).await?;

    println!("Task {} ({}): {} plan versions", task.id, task.status, versions.len());
    for plan in &versions {
        let parent = plan
            .parent_plan_id
            .as_deref()
            .map(|id| format!(" <- {}", id))
            .unwrap_or_default();
        println!("\nv{} {} [{}]{}", plan.version, plan.id, plan.status, parent);
        println!("  {}", plan.summary());
        if let Some(error) = &plan.error {
            println!("  error: {}", error);
        }
    }

    if !task.failure_history.is_empty() {
        println!("\nFailures:");
        for failure in &task.failure_history {
            println!(
                "  v{} {} [{}/{}] {}",
                failure.plan_version,
                failure.step_id.as_deref().unwrap_or("-"),
                failure.severity,
                failure.category,
                failure.message
            );
        }
    }
    Ok(())
}

fn print_steps(plan: &Plan) {
    for step in &plan.steps {
        println!(
            "  {} {} ({}) {}",
            step.status.icon(),
            step.id,
            step.kind.as_str(),
            step.description
        );
        if let Some(error) = &step.error {
            println!("      {}", error);
        }
    }
}

fn describe_event(event: &PlanEvent) -> String {
    match event {
        PlanEvent::PlanCreated {
            version,
            total_steps,
            ..
        } => format!("📋 Plan v{} created ({} steps)", version, total_steps),
        PlanEvent::ApprovalRequested { step_id, .. } => match step_id {
            Some(step) => format!("⏸  Waiting for approval of step {}", step),
            None => "⏸  Waiting for plan approval".to_string(),
        },
        PlanEvent::ApprovalResolved { approved, .. } => {
            if *approved {
                "✓ Approved".to_string()
            } else {
                "✗ Rejected".to_string()
            }
        }
        PlanEvent::PlanClaimed { plan_id, .. } => format!("🔒 Plan {} claimed", plan_id),
        PlanEvent::PlanStarted { plan_id } => format!("▶ Executing plan {}", plan_id),
        PlanEvent::PlanPaused { .. } => "⏸  Paused".to_string(),
        PlanEvent::PlanResumed { .. } => "▶ Resumed".to_string(),
        PlanEvent::StepStarted {
            step_id,
            description,
            ..
        } => format!("  → {}: {}", step_id, description),
        PlanEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => format!("  ✓ {} ({}ms)", step_id, duration_ms),
        PlanEvent::StepFailed { step_id, error, .. } => format!("  ✗ {}: {}", step_id, error),
        PlanEvent::StepSkipped {
            step_id, reason, ..
        } => format!("  ⊘ {} skipped: {}", step_id, reason),
        PlanEvent::PlanCompleted {
            success, summary, ..
        } => {
            if *success {
                format!("✅ {}", summary)
            } else {
                format!("❌ {}", summary)
            }
        }
        PlanEvent::PlanCancelled { plan_id } => format!("⊘ Plan {} cancelled", plan_id),
        PlanEvent::ReplanTriggered { attempt, .. } => format!("🔄 Replanning (attempt {})", attempt),
        PlanEvent::HumanInterventionRequired { reason, .. } => {
            format!("🙋 Human intervention required: {}", reason)
        }
    }
}

fn handle_config(config: &Config, path: Option<&Path>, show: bool) -> Result<()> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
        return Ok(());
    }

    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    if path.exists() {
        println!("Configuration already exists at: {:?}", path);
        println!("Use --show to view it.");
        return Ok(());
    }

    config
        .save_to(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Configuration saved to: {:?}", path);
    Ok(())
}
