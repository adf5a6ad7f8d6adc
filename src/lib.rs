//! # memlab-core
//!
//! A harness for measuring whether an LLM agent learns from feedback through
//! memory. Treatment groups answer the same seeded allow/deny tasks while the
//! ground-truth rule drifts on a schedule; mistakes are turned into versioned,
//! confidence-scored rules that later answers can consult.
//!
//! ## Core Components
//!
//! - **Normalize**: trigger merge keys and threshold extraction
//! - **Memory**: rule store, retrieval and ranking, reflection, evolution
//! - **Agent**: per-group recall, prompting and trial recording
//! - **Experiment**: schedules, the round runner, statistics and conclusions
//! - **Harness**: facade over all of the above for the CLI and embedders
//!
//! ## Example
//!
//! ```rust,ignore
//! use memlab_core::{ExperimentRequest, Group, Harness, HarnessConfig, RuleMode, TaskKind};
//! use tokio_util::sync::CancellationToken;
//!
//! let harness = Harness::from_config(HarnessConfig::load(None)?)?;
//! let request = ExperimentRequest::new(TaskKind::Lottery)
//!     .with_rounds(20)
//!     .with_groups(&[Group::A, Group::C])
//!     .with_rule_mode(RuleMode::Low);
//! let result = harness.run_experiment(&request, &CancellationToken::new()).await?;
//! println!("{}", result.conclusion.verdict);
//! ```

pub mod agent;
pub mod change_aware;
pub mod config;
pub mod error;
pub mod experiment;
pub mod external;
pub mod groups;
pub mod harness;
pub mod llm;
pub mod memory;
pub mod normalize;
pub mod task;

// Re-exports for convenience
pub use agent::{Agent, MemoryContext, TrialPlan};
pub use change_aware::{ChangeAwareConfig, ChangeDetector};
pub use config::{
    AppMode, BackendConfig, ConclusionThresholds, ExternalMemoryConfig, HarnessConfig, LifecycleConfig,
};
pub use error::{Error, Result};
pub use experiment::analysis::{RunSelector, RunTrend};
pub use experiment::{
    Conclusion, ConclusionVerdict, Curves, ExperimentRequest, ExperimentRunner, GroupStats, ModeCurve,
    RuleMode, RunResult, TestResult, ThresholdSchedule, TrialAndError,
};
pub use external::{ExternalHit, ExternalMemory, MemosClient};
pub use groups::{EvolutionTier, Group};
pub use harness::{AutoJudgeOutcome, Harness};
pub use llm::{BackendRequest, BackendResponse, DifyClient, ReasoningBackend};
pub use memory::{
    Judgment, JudgmentKind, MemoryEvolver, ResetSummary, RetrievalScope, Rule, RuleQuery, RuleStore,
    Run, SqliteStore, Store, Trial, TrialLedger,
};
pub use normalize::{extract_threshold, normalize_trigger_key};
pub use task::{judge, TaskKind, Verdict};
