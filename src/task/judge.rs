//! Ground-truth judges.

use serde::Deserialize;

use super::TaskKind;
use crate::error::{Error, Result};
use crate::memory::JudgmentKind;

/// Threshold used when no schedule applies.
pub const DEFAULT_THRESHOLD: i64 = 100;

/// VIP threshold for `lottery_v2`.
pub const VIP_THRESHOLD: i64 = 80;

/// Bonus points count at half value...
pub const BONUS_DISCOUNT_DIVISOR: i64 = 2;

/// ...capped at a fifth of the threshold.
pub const BONUS_CAP_DIVISOR: i64 = 5;

/// Expiring points count only when they expire within this many days.
pub const NEAR_EXPIRY_DAYS: i64 = 3;

/// Outcome of judging one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub expected_allow: bool,
    pub is_correct: bool,
    pub explanation: String,
}

impl Verdict {
    pub fn kind(&self) -> JudgmentKind {
        if self.is_correct {
            JudgmentKind::Correct
        } else {
            JudgmentKind::Incorrect
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LotteryInput {
    points: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LotteryV2Input {
    points: f64,
    is_vip: bool,
    is_blacklisted: bool,
    daily_draws: f64,
}

/// Point balances of a `lottery_multi` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PointsLedger {
    pub points_available: f64,
    pub points_bonus: f64,
    pub points_locked: f64,
    pub points_expiring: f64,
    pub expiring_days: f64,
    pub points_penalty: f64,
}

#[derive(Debug, Deserialize)]
struct AllowAnswer {
    allow: Option<bool>,
}

fn parse_payload<T: for<'de> Deserialize<'de> + Default>(input: &str) -> T {
    serde_json::from_str(input).unwrap_or_default()
}

fn scheduled(threshold: i64) -> i64 {
    if threshold > 0 {
        threshold
    } else {
        DEFAULT_THRESHOLD
    }
}

/// Points that count toward the threshold in a `lottery_multi` payload.
///
/// Integer arithmetic throughout: available points count fully, bonus points
/// count at half value up to a fifth of the threshold, expiring points count
/// only when they expire within [`NEAR_EXPIRY_DAYS`], penalties are
/// subtracted and locked points never count. The result is floored at zero.
pub fn effective_points(threshold: i64, ledger: &PointsLedger) -> i64 {
    let available = ledger.points_available as i64;
    let bonus = (ledger.points_bonus as i64).max(0);
    let expiring = (ledger.points_expiring as i64).max(0);
    let expiring_days = ledger.expiring_days as i64;
    let penalty = (ledger.points_penalty as i64).max(0);

    let counted_bonus = (bonus / BONUS_DISCOUNT_DIVISOR).min(threshold / BONUS_CAP_DIVISOR);
    let counted_expiring = if expiring_days <= NEAR_EXPIRY_DAYS {
        expiring
    } else {
        0
    };

    (available + counted_bonus + counted_expiring - penalty).max(0)
}

/// Parse a strict `{"allow": bool, "reason": ...}` answer.
pub fn parse_allow(output: &str) -> Result<bool> {
    let answer: AllowAnswer = serde_json::from_str(output.trim())
        .map_err(|e| Error::Parse(format!("answer is not strict JSON: {}", e)))?;
    answer
        .allow
        .ok_or_else(|| Error::Parse("answer has no allow field".to_string()))
}

/// Whether the ground truth allows the request under the given threshold.
pub fn expected_allow(kind: TaskKind, input: &str, threshold: i64) -> bool {
    match kind {
        TaskKind::Lottery => {
            let payload: LotteryInput = parse_payload(input);
            payload.points as i64 >= scheduled(threshold)
        }
        TaskKind::LotteryV2 => {
            let payload: LotteryV2Input = parse_payload(input);
            let bar = if payload.is_vip {
                VIP_THRESHOLD
            } else {
                DEFAULT_THRESHOLD
            };
            !payload.is_blacklisted && payload.daily_draws < 1.0 && payload.points as i64 >= bar
        }
        TaskKind::LotteryMulti => {
            let ledger: PointsLedger = parse_payload(input);
            let bar = scheduled(threshold);
            effective_points(bar, &ledger) >= bar
        }
    }
}

/// Decision a rule with the given threshold would make, for task kinds
/// whose rules reduce to a single threshold.
pub fn predict_with_threshold(kind: TaskKind, input: &str, threshold: i64) -> Option<bool> {
    if threshold <= 0 || !kind.supports_validation() {
        return None;
    }
    Some(expected_allow(kind, input, threshold))
}

fn describe(kind: TaskKind, input: &str, threshold: i64, expected: bool) -> String {
    match kind {
        TaskKind::Lottery => {
            let payload: LotteryInput = parse_payload(input);
            format!(
                "points={} requires allow={} (threshold={})",
                payload.points,
                expected,
                scheduled(threshold)
            )
        }
        TaskKind::LotteryV2 => {
            let payload: LotteryV2Input = parse_payload(input);
            let reason = if payload.is_blacklisted {
                "blacklisted users are denied".to_string()
            } else if payload.daily_draws >= 1.0 {
                "daily draw limit reached".to_string()
            } else if expected {
                "all rules satisfied".to_string()
            } else if payload.is_vip {
                format!("insufficient points, VIP threshold={}", VIP_THRESHOLD)
            } else {
                format!("insufficient points, threshold={}", DEFAULT_THRESHOLD)
            };
            format!(
                "points={} is_vip={} is_blacklisted={} daily_draws={} requires allow={} ({})",
                payload.points,
                payload.is_vip,
                payload.is_blacklisted,
                payload.daily_draws,
                expected,
                reason
            )
        }
        TaskKind::LotteryMulti => {
            let ledger: PointsLedger = parse_payload(input);
            let bar = scheduled(threshold);
            format!(
                "effective_points={} requires allow={} (threshold={})",
                effective_points(bar, &ledger),
                expected,
                bar
            )
        }
    }
}

/// Judge an answer against the ground truth in force for its round.
///
/// Output that cannot be parsed as a strict allow/deny answer is incorrect.
pub fn judge(kind: TaskKind, input: &str, output: &str, threshold: i64) -> Verdict {
    let expected = expected_allow(kind, input, threshold);
    let detail = describe(kind, input, threshold, expected);

    match parse_allow(output) {
        Ok(allow) if allow == expected => Verdict {
            expected_allow: expected,
            is_correct: true,
            explanation: format!("correct: {}", detail),
        },
        Ok(_) => Verdict {
            expected_allow: expected,
            is_correct: false,
            explanation: format!("incorrect: {}", detail),
        },
        Err(e) => Verdict {
            expected_allow: expected,
            is_correct: false,
            explanation: format!("incorrect ({}): {}", e, detail),
        },
    }
}
