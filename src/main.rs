use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weave_agent::{AgentRuntime, CostEstimator, PricingTable, WorkflowDefinition};
use weave_core::config::AppConfig;
use weave_core::context::{agent_logic, AgentContext};
use weave_memory::InMemoryStore;
use weave_queue::{JobState, TaskQueue};

#[derive(Parser)]
#[command(name = "weave", version, about = "Agent execution and workflow orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition file (TOML or JSON)
    Validate {
        workflow: PathBuf,
        /// Also check that every step's agent is configured here
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Estimate the cost of running a workflow with the configured agents
    ///
    /// The CLI keeps no execution history, so every step is priced from
    /// the heuristic token estimate rather than past runs.
    Estimate {
        #[arg(short, long, default_value = "weave.toml")]
        config: PathBuf,
        workflow: PathBuf,
        /// Workflow input as JSON
        #[arg(long, default_value = "null")]
        input: String,
        /// Print the full estimate as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage the task queue
    Queue {
        #[arg(short, long, default_value = "weave.toml")]
        config: PathBuf,
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show job counts per state
    Stats,
    /// Stop workers from taking new jobs
    Pause,
    /// Let workers take jobs again
    Resume,
    /// Remove waiting jobs
    Drain {
        /// Remove delayed jobs as well
        #[arg(long)]
        delayed: bool,
    },
    /// Remove finished jobs
    Clean {
        #[arg(long, value_enum, default_value = "completed")]
        state: FinishedState,
        /// Only remove jobs finished at least this long ago
        #[arg(long, default_value = "0")]
        grace_ms: u64,
        /// Maximum number of jobs to remove (0 = all)
        #[arg(long, default_value = "0")]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FinishedState {
    Completed,
    Failed,
}

impl From<FinishedState> for JobState {
    fn from(state: FinishedState) -> Self {
        match state {
            FinishedState::Completed => JobState::Completed,
            FinishedState::Failed => JobState::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "weave", &mut std::io::stdout());
        }
        Commands::Validate { workflow, config } => validate(&workflow, config.as_deref())?,
        Commands::Estimate {
            config,
            workflow,
            input,
            json,
        } => estimate(&config, &workflow, &input, json).await?,
        Commands::Queue { config, action } => queue(&config, action).await?,
    }
    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    let definition = WorkflowDefinition::parse(&text)?;
    definition.validate()?;
    Ok(definition)
}

fn validate(path: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;

    if let Some(config) = config {
        let config = AppConfig::load(config)?;
        let missing: Vec<&str> = definition
            .steps
            .iter()
            .map(|step| step.agent.as_str())
            .filter(|agent| !config.agents.iter().any(|a| a.name == *agent))
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("workflow references unconfigured agents: {}", missing.join(", "));
        }
    }

    println!(
        "Workflow '{}' is valid: {} steps, entry '{}', {} terminal",
        definition.name,
        definition.steps.len(),
        definition.entry_point,
        definition.terminal_steps().count()
    );
    Ok(())
}

/// Build a runtime holding the configured agents. Their logic is never
/// run; estimation only reads their config.
fn runtime_from_config(config: &AppConfig) -> anyhow::Result<Arc<AgentRuntime>> {
    let runtime = Arc::new(AgentRuntime::new(config.runtime.clone()));
    for agent in &config.agents {
        let logic = agent_logic(|ctx: AgentContext| async move { Ok(ctx.input) });
        runtime
            .create_agent(agent.clone(), logic)
            .with_context(|| format!("invalid agent '{}'", agent.name))?;
    }
    Ok(runtime)
}

async fn estimate(config: &Path, workflow: &Path, input: &str, json: bool) -> anyhow::Result<()> {
    let config = AppConfig::load(config)?;
    let definition = load_workflow(workflow)?;
    let input: serde_json::Value =
        serde_json::from_str(input).context("--input must be valid JSON")?;

    let runtime = runtime_from_config(&config)?;
    // Empty store: there is no history to draw on here
    let estimator = CostEstimator::new(runtime.clone(), Arc::new(PricingTable::default()))
        .with_store(Arc::new(InMemoryStore::new()));
    let estimate = estimator.estimate_workflow_cost(&definition, &input).await?;
    runtime.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }

    println!("Workflow: {}", estimate.workflow);
    for step in &estimate.steps {
        println!(
            "  {:<20} {:<16} {:<24} {:>8} tokens  {:.6} {}  ({:?})",
            step.step_id,
            step.agent_name,
            step.model,
            step.token_usage.total_tokens,
            step.cost,
            estimate.currency,
            step.confidence
        );
    }
    println!(
        "Total: {:.6} {} for {} tokens, confidence {:?}, source {:?}",
        estimate.total_cost,
        estimate.currency,
        estimate.total_tokens.total_tokens,
        estimate.confidence,
        estimate.source
    );
    Ok(())
}

async fn queue(config: &Path, action: QueueAction) -> anyhow::Result<()> {
    let config = AppConfig::load(config)?;
    let queue_config = match config.queue {
        Some(queue) => queue,
        None => {
            warn!("No [queue] section in config, using defaults");
            Default::default()
        }
    };
    info!(queue = %queue_config.name, database = %queue_config.database_path().display(), "Opening queue");
    let queue = TaskQueue::open(queue_config)?;

    match action {
        QueueAction::Stats => {
            let counts = queue.counts().await?;
            let paused = queue.is_paused().await?;
            println!("Queue: {}{}", queue.name(), if paused { " (paused)" } else { "" });
            println!("  waiting:   {}", counts.waiting);
            println!("  delayed:   {}", counts.delayed);
            println!("  active:    {}", counts.active);
            println!("  completed: {}", counts.completed);
            println!("  failed:    {}", counts.failed);
        }
        QueueAction::Pause => {
            queue.pause().await?;
            println!("Queue '{}' paused", queue.name());
        }
        QueueAction::Resume => {
            queue.resume().await?;
            println!("Queue '{}' resumed", queue.name());
        }
        QueueAction::Drain { delayed } => {
            let removed = queue.drain(delayed).await?;
            println!("Removed {} jobs", removed);
        }
        QueueAction::Clean {
            state,
            grace_ms,
            limit,
        } => {
            let removed = queue.clean(grace_ms, state.into(), limit).await?;
            println!("Removed {} jobs", removed);
        }
    }

    queue.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn estimate_help_mentions_heuristic_pricing() {
        let cmd = Cli::command();
        let estimate = cmd.find_subcommand("estimate").unwrap();
        let help = estimate.get_long_about().unwrap().to_string();
        assert!(help.contains("heuristic"));
    }
}
