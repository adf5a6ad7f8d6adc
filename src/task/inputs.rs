//! Seeded task payload generation.
//!
//! Boundary cases come first so that short runs still exercise the edges of
//! each rule; the remainder is drawn from a seeded RNG and is reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use super::TaskKind;

/// Generate `n` JSON payloads for the given task kind.
pub fn generate_inputs(kind: TaskKind, n: usize, seed: u64, action: &str) -> Vec<String> {
    let action = if action.trim().is_empty() {
        "lottery"
    } else {
        action
    };
    let mut rng = StdRng::seed_from_u64(seed);

    let base = boundary_cases(kind, action);
    let mut out: Vec<Value> = base.into_iter().take(n).collect();
    while out.len() < n {
        out.push(random_case(kind, action, &mut rng));
    }

    out.into_iter().map(|v| v.to_string()).collect()
}

fn boundary_cases(kind: TaskKind, action: &str) -> Vec<Value> {
    match kind {
        TaskKind::Lottery => [0, 1, 10, 50, 99, 100, 101, 150, 200]
            .into_iter()
            .map(|points| json!({"points": points, "action": action}))
            .collect(),
        TaskKind::LotteryV2 => vec![
            v2_case(action, 0, false, false, 0),
            v2_case(action, 79, true, false, 0),
            v2_case(action, 80, true, false, 0),
            v2_case(action, 99, false, false, 0),
            v2_case(action, 100, false, false, 0),
            v2_case(action, 150, false, false, 1),
            v2_case(action, 200, true, true, 0),
        ],
        TaskKind::LotteryMulti => vec![
            multi_case(action, [0, 0, 0, 0, 1, 0]),
            multi_case(action, [60, 80, 0, 0, 7, 0]),
            multi_case(action, [90, 30, 50, 0, 3, 0]),
            multi_case(action, [85, 10, 0, 20, 1, 0]),
            multi_case(action, [105, 0, 0, 0, 2, 10]),
            multi_case(action, [99, 50, 0, 5, 1, 0]),
        ],
    }
}

fn v2_case(action: &str, points: i64, is_vip: bool, is_blacklisted: bool, daily_draws: i64) -> Value {
    json!({
        "points": points,
        "action": action,
        "is_vip": is_vip,
        "is_blacklisted": is_blacklisted,
        "daily_draws": daily_draws,
    })
}

/// `[available, bonus, locked, expiring, expiring_days, penalty]`
fn multi_case(action: &str, p: [i64; 6]) -> Value {
    json!({
        "action": action,
        "points_available": p[0],
        "points_bonus": p[1],
        "points_locked": p[2],
        "points_expiring": p[3],
        "expiring_days": p[4],
        "points_penalty": p[5],
    })
}

fn random_case(kind: TaskKind, action: &str, rng: &mut StdRng) -> Value {
    match kind {
        TaskKind::Lottery => json!({"points": rng.gen_range(0..=200), "action": action}),
        TaskKind::LotteryV2 => {
            let points = rng.gen_range(0..=200);
            let is_vip = rng.gen_range(0..2) == 0;
            let is_blacklisted = rng.gen_range(0..10) == 0;
            let daily_draws = if rng.gen_range(0..3) == 0 { 1 } else { 0 };
            v2_case(action, points, is_vip, is_blacklisted, daily_draws)
        }
        TaskKind::LotteryMulti => {
            let available = rng.gen_range(0..=150);
            let bonus = rng.gen_range(0..=200);
            let locked = rng.gen_range(0..=100);
            let expiring = rng.gen_range(0..=50);
            let expiring_days = if rng.gen_range(0..3) != 0 {
                rng.gen_range(2..=15)
            } else {
                1
            };
            let penalty = if rng.gen_range(0..5) == 0 {
                rng.gen_range(0..=20)
            } else {
                0
            };
            multi_case(
                action,
                [available, bonus, locked, expiring, expiring_days, penalty],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_cases_first() {
        let inputs = generate_inputs(TaskKind::Lottery, 12, 7, "lottery");
        assert_eq!(inputs.len(), 12);
        let first: Value = serde_json::from_str(&inputs[0]).unwrap();
        assert_eq!(first["points"], 0);
        let ninth: Value = serde_json::from_str(&inputs[8]).unwrap();
        assert_eq!(ninth["points"], 200);
    }

    #[test]
    fn test_short_runs_truncate_boundaries() {
        let inputs = generate_inputs(TaskKind::LotteryV2, 3, 1, "");
        assert_eq!(inputs.len(), 3);
        let v: Value = serde_json::from_str(&inputs[2]).unwrap();
        assert_eq!(v["points"], 80);
        assert_eq!(v["action"], "lottery");
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let a = generate_inputs(TaskKind::LotteryMulti, 40, 42, "draw");
        let b = generate_inputs(TaskKind::LotteryMulti, 40, 42, "draw");
        assert_eq!(a, b);

        for raw in &a[6..] {
            let v: Value = serde_json::from_str(raw).unwrap();
            let days = v["expiring_days"].as_i64().unwrap();
            assert!((1..=15).contains(&days));
            assert!(v["points_available"].as_i64().unwrap() <= 150);
            assert!(v["points_penalty"].as_i64().unwrap() <= 20);
        }
    }

    #[test]
    fn test_random_points_in_range() {
        for raw in generate_inputs(TaskKind::Lottery, 100, 3, "lottery") {
            let v: Value = serde_json::from_str(&raw).unwrap();
            let p = v["points"].as_i64().unwrap();
            assert!((0..=200).contains(&p));
        }
    }
}
