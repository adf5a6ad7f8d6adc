//! Property-based tests for the statistics layer.
//!
//! - Wilson intervals stay inside [0, 1] and contain the point estimate
//! - z-tests never report significance for an empty sample
//! - Cumulative curves are probabilities and complement each other
//! - Rule schedules only ever increase their version id, and `high` mode
//!   changes at most five times, never on consecutive rounds

use proptest::prelude::*;

use crate::experiment::curves::{build_cumulative_curves, compute_trial_and_error, first_error_round};
use crate::experiment::schedule::{RuleMode, ThresholdSchedule, HIGH_MODE_CHANGES};
use crate::experiment::stats::{trend_test, two_prop_z_test, wilson_ci};
use crate::memory::clamp_confidence;

fn flags(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..=1, 0..max_len)
}

fn rule_mode() -> impl Strategy<Value = RuleMode> {
    prop_oneof![Just(RuleMode::None), Just(RuleMode::Low), Just(RuleMode::High)]
}

proptest! {
    #[test]
    fn wilson_interval_brackets_estimate(n in 1usize..500, k_frac in 0.0f64..=1.0) {
        let k = ((n as f64) * k_frac).floor() as usize;
        let (low, high) = wilson_ci(k, n, 1.96);
        let p = k as f64 / n as f64;
        prop_assert!((0.0..=1.0).contains(&low));
        prop_assert!((0.0..=1.0).contains(&high));
        prop_assert!(low <= p + 1e-12 && p <= high + 1e-12, "p={} not in [{}, {}]", p, low, high);
    }

    #[test]
    fn z_test_empty_sample_is_no_evidence(x in 0usize..50, n in 0usize..50) {
        prop_assert_eq!(two_prop_z_test(0, 0, x.min(n), n), (1.0, 0.0));
        prop_assert_eq!(two_prop_z_test(x.min(n), n, 0, 0), (1.0, 0.0));
    }

    #[test]
    fn z_test_p_value_is_probability(x1 in 0usize..40, n1 in 1usize..40, x2 in 0usize..40, n2 in 1usize..40) {
        let (p, z) = two_prop_z_test(x1.min(n1), n1, x2.min(n2), n2);
        prop_assert!((0.0..=1.0).contains(&p));
        prop_assert!(z.is_finite());
    }

    #[test]
    fn cumulative_curves_are_complementary(f in flags(40), extra in 0usize..10) {
        let rounds = f.len() + extra;
        let curves = build_cumulative_curves(&f, rounds);
        prop_assert_eq!(curves.cumulative_accuracy.len(), rounds);
        for (acc, err) in curves.cumulative_accuracy.iter().zip(&curves.cumulative_error) {
            prop_assert!((0.0..=1.0).contains(acc));
            prop_assert!((acc + err - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn first_error_round_points_at_an_error(f in flags(40)) {
        match first_error_round(&f) {
            -1 => prop_assert!(f.iter().all(|v| *v == 0)),
            i => {
                let i = i as usize;
                prop_assert_eq!(f[i], 1);
                prop_assert!(f[..i].iter().all(|v| *v == 0));
            }
        }
    }

    #[test]
    fn schedule_versions_never_decrease(rounds in 0usize..80, mode in rule_mode()) {
        let schedule = ThresholdSchedule::build(rounds, mode);
        prop_assert_eq!(schedule.len(), rounds);
        prop_assert!(schedule.versions.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));
        prop_assert!(schedule.versions.first().map_or(true, |v| *v == 1));
        let changes = schedule.change_points().len();
        match mode {
            RuleMode::None => prop_assert_eq!(changes, 0),
            RuleMode::Low => prop_assert!(changes <= 1),
            RuleMode::High => {
                prop_assert!(changes <= HIGH_MODE_CHANGES);
                let points = schedule.change_points();
                prop_assert!(points.windows(2).all(|w| w[1] - w[0] >= 2));
            }
        }
    }

    #[test]
    fn trial_and_error_attempts_fit_their_span(rounds in 2usize..60, f in flags(60), mode in rule_mode()) {
        let schedule = ThresholdSchedule::build(rounds, mode);
        let result = compute_trial_and_error(&schedule.versions, &f);
        prop_assert_eq!(result.attempts.len(), result.change_points.len());
        prop_assert!(result.attempts.iter().all(|a| *a <= rounds));
        prop_assert!(result.max_attempts as f64 >= result.avg_attempts);
    }

    #[test]
    fn trend_test_needs_minimum_rounds(f in flags(30), min in 2usize..20) {
        let result = trend_test(&f, min);
        prop_assert_eq!(result.is_some(), f.len() >= min);
    }

    #[test]
    fn confidence_always_clamped(value in prop::num::f64::ANY) {
        let clamped = clamp_confidence(value);
        prop_assert!((0.0..=1.0).contains(&clamped));
    }
}
