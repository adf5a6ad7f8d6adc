//! # memlab
//!
//! Command-line front end of the memory experiment harness.
//!
//! ## Commands
//!
//! - `memlab run` - Execute an experiment run and write its reports
//! - `memlab trend` - Cumulative curves of one run
//! - `memlab compare-modes` - Latest `low` and `high` runs side by side
//! - `memlab stats` - Error rates over every stored trial
//! - `memlab memories list|show|retire` - Inspect and retire rules
//! - `memlab execute` / `memlab judge` - Ad hoc trials
//! - `memlab reset` - Delete all experiment data
//!
//! Results are printed as JSON on stdout; logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use memlab_core::{
    ExperimentRequest, Group, Harness, HarnessConfig, RuleMode, RuleQuery, RunSelector, TaskKind,
};

/// Memory experiment harness
#[derive(Parser)]
#[command(name = "memlab")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "MEMLAB_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MEMLAB_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment
    Run {
        #[arg(long, default_value = "lottery")]
        task_type: String,
        #[arg(long)]
        action: Option<String>,
        /// Rounds per group
        #[arg(long)]
        rounds: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Comma-separated groups in execution order
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
        /// none, low or high
        #[arg(long, default_value = "none")]
        rule_mode: String,
        /// JSON file holding an array of input payloads, one per round
        #[arg(long, value_name = "FILE")]
        inputs: Option<PathBuf>,
    },

    /// Cumulative curves of a run (by id, or the latest run of a mode)
    Trend {
        #[arg(long)]
        run_id: Option<i64>,
        #[arg(long, default_value = "none")]
        mode: String,
    },

    /// Compare the latest low and high rule-change runs
    CompareModes,

    /// Error rates over all stored trials
    Stats {
        #[arg(long)]
        group: Option<String>,
    },

    /// Rule memory management
    Memories {
        #[command(subcommand)]
        command: MemoryCommand,
    },

    /// Execute one ad hoc trial
    Execute {
        #[arg(long, default_value = "lottery")]
        task_type: String,
        /// JSON payload
        #[arg(long)]
        input: String,
        #[arg(long, default_value = "C")]
        group: String,
        /// Answer without consulting memory
        #[arg(long)]
        no_memory: bool,
    },

    /// Judge a trial automatically and reflect when it is wrong
    Judge {
        trial_id: i64,
        /// Threshold to judge against (default: the trial's scheduled one)
        #[arg(long)]
        threshold: Option<i64>,
    },

    /// Delete all trials, judgments, rules, case logs and runs
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// List rules
    List {
        #[arg(long)]
        run_id: Option<i64>,
        #[arg(long)]
        task_type: Option<String>,
        #[arg(long)]
        include_deprecated: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one rule
    Show { id: i64 },
    /// Soft-deprecate a rule
    Retire { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = HarnessConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let harness = Harness::from_config(config).context("Failed to initialize harness")?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Run {
            task_type,
            action,
            rounds,
            seed,
            groups,
            rule_mode,
            inputs,
        } => {
            let inputs = match inputs {
                Some(path) => Some(read_inputs(&path)?),
                None => None,
            };
            let request = ExperimentRequest {
                task_type: Some(task_type),
                action,
                runs_per_group: rounds,
                seed,
                groups: (!groups.is_empty()).then_some(groups),
                rule_mode: Some(rule_mode),
                inputs,
            };
            let result = harness
                .run_experiment(&request, &cancel)
                .await
                .context("Experiment failed")?;
            info!(
                run_id = result.run_id,
                verdict = %result.conclusion.verdict,
                "Experiment complete"
            );
            print_json(&result)
        }
        Commands::Trend { run_id, mode } => {
            let selector = match run_id {
                Some(id) => RunSelector::Id(id),
                None => RunSelector::LatestOf(mode.parse::<RuleMode>()?),
            };
            print_json(&harness.trend(selector)?)
        }
        Commands::CompareModes => print_json(&harness.compare_modes()?),
        Commands::Stats { group } => {
            let group = group.map(|g| g.parse::<Group>()).transpose()?;
            print_json(&harness.stats(group)?)
        }
        Commands::Memories { command } => match command {
            MemoryCommand::List {
                run_id,
                task_type,
                include_deprecated,
                limit,
            } => {
                let query = RuleQuery {
                    run_id,
                    apply_to: task_type,
                    include_deprecated,
                    limit,
                };
                print_json(&harness.list_rules(&query)?)
            }
            MemoryCommand::Show { id } => print_json(&harness.get_rule(id)?),
            MemoryCommand::Retire { id } => print_json(&harness.retire_rule(id)?),
        },
        Commands::Execute {
            task_type,
            input,
            group,
            no_memory,
        } => {
            let task_type: TaskKind = task_type.parse()?;
            let group: Group = group.parse()?;
            let trial = harness
                .execute_task(task_type, &input, group, !no_memory, &cancel)
                .await?;
            print_json(&trial)
        }
        Commands::Judge {
            trial_id,
            threshold,
        } => print_json(&harness.auto_judge(trial_id, threshold).await?),
        Commands::Reset { yes } => {
            if !yes {
                bail!("Refusing to delete all experiment data without --yes");
            }
            let summary = harness.reset_all()?;
            warn!(?summary, "All experiment data deleted");
            print_json(&summary)
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

/// A token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; remaining trials will be recorded as cancelled");
            child.cancel();
        }
    });
    token
}

fn read_inputs(path: &Path) -> Result<Vec<String>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let values: Vec<serde_json::Value> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array", path.display()))?;
    Ok(values
        .into_iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
