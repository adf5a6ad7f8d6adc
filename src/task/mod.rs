//! Classification tasks the agent is evaluated on.
//!
//! Every task is an allow/deny decision over a JSON payload. The scheduled
//! ground-truth threshold drifts during a run for the single-threshold task
//! kinds; `lottery_v2` has fixed multi-clause rules instead.

mod inputs;
mod judge;

pub use inputs::generate_inputs;
pub use judge::{
    effective_points, expected_allow, judge, parse_allow, predict_with_threshold, PointsLedger,
    Verdict, BONUS_CAP_DIVISOR, BONUS_DISCOUNT_DIVISOR, DEFAULT_THRESHOLD, NEAR_EXPIRY_DAYS,
    VIP_THRESHOLD,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Supported task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Allow iff points reach the scheduled threshold
    Lottery,
    /// Blacklist, daily limit and VIP-discounted threshold
    LotteryV2,
    /// Effective points computed from several partially-counted balances
    LotteryMulti,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Lottery, TaskKind::LotteryV2, TaskKind::LotteryMulti];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Lottery => "lottery",
            TaskKind::LotteryV2 => "lottery_v2",
            TaskKind::LotteryMulti => "lottery_multi",
        }
    }

    /// Whether the ground-truth threshold follows the run's rule-change schedule.
    pub fn follows_schedule(&self) -> bool {
        matches!(self, TaskKind::Lottery | TaskKind::LotteryMulti)
    }

    /// Whether a rule's embedded threshold can be replayed against past trials.
    pub fn supports_validation(&self) -> bool {
        self.follows_schedule()
    }

    /// The single numeric feature used for relevance re-ranking, if the task exposes one.
    pub fn feature(&self, input: &str) -> Option<f64> {
        match self {
            TaskKind::Lottery | TaskKind::LotteryV2 => {
                let value: serde_json::Value = serde_json::from_str(input).ok()?;
                value.get("points")?.as_f64()
            }
            TaskKind::LotteryMulti => None,
        }
    }

    /// Task-specific instructions appended to every agent prompt.
    pub fn instructions(&self) -> &'static str {
        match self {
            TaskKind::Lottery => {
                "Decide whether the user may enter the lottery and explain why. Consider whether the points are sufficient.\n"
            }
            TaskKind::LotteryV2 => {
                "Decide whether the user may enter the lottery according to the rules and explain why.\n\
                 Rule hints: blacklisted users are denied; VIP users have a lower threshold; \
                 users who reached the daily draw limit are denied.\n"
            }
            TaskKind::LotteryMulti => {
                "Decide whether the user may enter the lottery and explain why.\n\
                 The input carries several point balances; only some of them may count \
                 (the rule is not stated explicitly). Decide from the input.\n"
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "lottery" => Ok(TaskKind::Lottery),
            "lottery_v2" => Ok(TaskKind::LotteryV2),
            "lottery_multi" => Ok(TaskKind::LotteryMulti),
            other => Err(Error::InvalidRequest(format!("unsupported task type: {}", other))),
        }
    }
}
