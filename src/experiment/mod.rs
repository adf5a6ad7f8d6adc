//! Controlled experiments comparing treatment groups.
//!
//! A run executes the same seeded inputs for every group, round by round,
//! under a ground-truth threshold that may change on a schedule:
//!
//! 1. SCHEDULE: per-round thresholds and rule-version ids
//! 2. EXECUTE: every group answers the round's input in declared order
//! 3. JUDGE: answers are compared with the round's ground truth
//! 4. EVOLVE: incorrect answers drive the group's evolution tier
//! 5. REPORT: statistics, curves and a deterministic conclusion

pub mod analysis;
pub mod conclusion;
pub mod curves;
mod report;
mod request;
mod runner;
mod schedule;
pub mod stats;

#[cfg(test)]
mod proptest;

pub use conclusion::{synthesize_conclusion, Conclusion, ConclusionVerdict};
pub use curves::{
    build_cumulative_curves, compute_trial_and_error, extract_round_flags, first_error_round, Curves,
    ModeCurve, RoundFlags, TrialAndError,
};
pub use report::{render_conclusion_markdown, write_reports, ReportPaths};
pub use request::{ExperimentRequest, ResolvedRequest, DEFAULT_ROUNDS};
pub use runner::{ExperimentRunner, RunResult};
pub use schedule::{RuleMode, ThresholdSchedule, ALT_THRESHOLD, BASE_THRESHOLD, HIGH_MODE_CHANGES};
pub use stats::{compute_group_stats, two_prop_z_test, wilson_ci, GroupStats, TestResult};
