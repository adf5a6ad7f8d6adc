//! Run report artifacts: a pretty JSON summary and a markdown conclusion.

use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::runner::RunResult;
use crate::error::Result;
use crate::memory::Run;

/// Errors listed in the markdown before the rest are summarized.
const MAX_LISTED_ERRORS: usize = 20;

/// Where a run's reports were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub result: PathBuf,
    pub conclusion: PathBuf,
}

impl ReportPaths {
    pub fn for_run(output_dir: &Path, run_id: i64) -> Self {
        Self {
            result: output_dir.join(format!("experiment_run_{}.json", run_id)),
            conclusion: output_dir.join(format!("experiment_run_{}_conclusion.md", run_id)),
        }
    }
}

/// Human-readable summary of a finished run.
pub fn render_conclusion_markdown(run: &Run, result: &RunResult) -> Result<String> {
    let mut md = String::new();
    md.push_str("# Memory experiment conclusion\n\n");
    let _ = writeln!(md, "- run_id: {}", run.id);
    let _ = writeln!(md, "- task_type: {}", run.task_type);
    let _ = writeln!(md, "- rule_mode: {}", run.rule_mode);
    let _ = writeln!(md, "- runs_per_group: {}", run.runs_per_group);
    let _ = writeln!(md, "- seed: {}", run.seed);
    let _ = writeln!(md, "- created_at: {}\n", run.created_at.to_rfc3339());

    md.push_str("## Group statistics (this run only)\n\n");
    md.push_str("| group | N | Incorrect | ErrorRate | CI95 |\n");
    md.push_str("| --- | ---: | ---: | ---: | --- |\n");
    for group in &result.groups {
        let Some(s) = result.stats.get(group) else {
            continue;
        };
        let _ = writeln!(
            md,
            "| {} | {} | {} | {:.3} | [{:.3}, {:.3}] |",
            group, s.n, s.incorrect, s.error_rate, s.ci95_low, s.ci95_high
        );
    }
    md.push('\n');

    md.push_str("## Significance tests\n\n");
    if result.tests.is_empty() {
        md.push_str("- none (too few samples, or statistics failed)\n\n");
    } else {
        let body = serde_json::to_string_pretty(&result.tests)?;
        let _ = write!(md, "```json\n{}\n```\n\n", body);
    }

    md.push_str("## Conclusion\n\n");
    let _ = writeln!(md, "- verdict: {}", result.conclusion.verdict);
    if !result.conclusion.claims.is_empty() {
        md.push_str("\n### Claims\n\n");
        for claim in &result.conclusion.claims {
            let _ = writeln!(md, "- {}", claim);
        }
    }
    if !result.conclusion.caveats.is_empty() {
        md.push_str("\n### Caveats\n\n");
        for caveat in &result.conclusion.caveats {
            let _ = writeln!(md, "- {}", caveat);
        }
    }

    if !result.errors.is_empty() {
        md.push_str("\n## Execution errors\n\n");
        for error in result.errors.iter().take(MAX_LISTED_ERRORS) {
            let _ = writeln!(md, "- {}", error);
        }
        if result.errors.len() > MAX_LISTED_ERRORS {
            let _ = writeln!(md, "- ...({} more omitted)", result.errors.len() - MAX_LISTED_ERRORS);
        }
    }
    Ok(md)
}

/// Write both reports into `output_dir`, creating it if needed.
pub fn write_reports(output_dir: &Path, run: &Run, result: &RunResult) -> Result<ReportPaths> {
    std::fs::create_dir_all(output_dir)?;
    let paths = ReportPaths::for_run(output_dir, run.id);
    std::fs::write(&paths.result, serde_json::to_vec_pretty(result)?)?;
    std::fs::write(&paths.conclusion, render_conclusion_markdown(run, result)?)?;
    info!(
        run_id = run.id,
        result = %paths.result.display(),
        conclusion = %paths.conclusion.display(),
        "Wrote run reports"
    );
    Ok(paths)
}
