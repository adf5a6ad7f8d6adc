//! Text canonicalization shared by retrieval, evolution and validation.
//!
//! Rules whose triggers differ only by embedded numbers ("points<100" vs
//! "points<120") belong to the same evolving family, so the merge key drops
//! every digit run. Lessons are compared case- and whitespace-insensitively
//! when deciding whether a consolidation is repeated evidence.

use regex::Regex;
use std::sync::LazyLock;

/// Key used when a trigger normalizes to nothing.
pub const GENERAL_KEY: &str = "general";

/// Applies-to value matching every task type.
pub const WILDCARD_SCOPE: &str = "general";

/// Provenance prefix marking an entry of the cross-session pool.
pub const GLOBAL_PROVENANCE_PREFIX: &str = "global|";

/// Maximum length (in characters) of a trigger merge key.
pub const MAX_TRIGGER_KEY_CHARS: usize = 180;

/// Maximum length (in characters) of a normalized lesson.
pub const MAX_LESSON_CHARS: usize = 800;

/// Largest value accepted as an embedded threshold.
pub const MAX_THRESHOLD: i64 = 10_000;

static DIGIT_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").expect("invalid regex"));

static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("invalid regex"));

static THRESHOLD_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]{1,4}").expect("invalid regex"));

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Canonicalize a free-text trigger into its family merge key.
///
/// Total: every input yields a non-empty key.
pub fn normalize_trigger_key(trigger: &str) -> String {
    let lowered = trigger.trim().to_lowercase();
    let without_digits = DIGIT_RUNS.replace_all(&lowered, "");
    let collapsed = WHITESPACE_RUNS.replace_all(&without_digits, " ");
    let key = truncate_chars(collapsed.trim(), MAX_TRIGGER_KEY_CHARS);
    let key = key.trim_end().to_string();

    if key.is_empty() {
        GENERAL_KEY.to_string()
    } else {
        key
    }
}

/// Canonicalize a lesson for equality comparison during consolidation.
pub fn normalize_lesson_text(lesson: &str) -> String {
    let collapsed = WHITESPACE_RUNS.replace_all(lesson.trim(), " ");
    truncate_chars(&collapsed.to_lowercase(), MAX_LESSON_CHARS)
}

/// Extract the first plausible numeric threshold embedded in rule text.
///
/// Takes the first run of one to four digits; zero and values above
/// [`MAX_THRESHOLD`] are rejected.
pub fn extract_threshold(text: &str) -> Option<i64> {
    let m = THRESHOLD_CANDIDATE.find(text)?;
    let value: i64 = m.as_str().parse().ok()?;
    (value > 0 && value <= MAX_THRESHOLD).then_some(value)
}

/// Parse a comma-separated list of rule ids, skipping blanks, zeros and garbage.
pub fn parse_memory_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .collect()
}

/// Render rule ids in the comma-separated storage form.
pub fn format_memory_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether a provenance tag marks a cross-session pool entry.
pub fn is_global_provenance(derived_from: &str) -> bool {
    derived_from.starts_with(GLOBAL_PROVENANCE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_key_ignores_digits() {
        assert_eq!(
            normalize_trigger_key("points<100"),
            normalize_trigger_key("points<120")
        );
        assert_eq!(normalize_trigger_key("积分<100"), normalize_trigger_key("积分<120"));
        assert_eq!(normalize_trigger_key("  Points  <  100  deny "), "points < deny");
    }

    #[test]
    fn test_trigger_key_empty_falls_back() {
        assert_eq!(normalize_trigger_key(""), GENERAL_KEY);
        assert_eq!(normalize_trigger_key("   "), GENERAL_KEY);
        assert_eq!(normalize_trigger_key("12345"), GENERAL_KEY);
    }

    #[test]
    fn test_trigger_key_truncates() {
        let long = "a".repeat(500);
        assert_eq!(normalize_trigger_key(&long).chars().count(), MAX_TRIGGER_KEY_CHARS);

        let wide = "积".repeat(400);
        assert_eq!(normalize_trigger_key(&wide).chars().count(), MAX_TRIGGER_KEY_CHARS);
    }

    #[test]
    fn test_lesson_normalization() {
        assert_eq!(
            normalize_lesson_text("  Deny when\n points   BELOW 120 "),
            normalize_lesson_text("deny when points below 120")
        );
        assert_ne!(
            normalize_lesson_text("deny when points below 120"),
            normalize_lesson_text("deny when points below 100")
        );
        assert_eq!(normalize_lesson_text(&"x".repeat(2000)).len(), MAX_LESSON_CHARS);
    }

    #[test]
    fn test_extract_threshold() {
        assert_eq!(extract_threshold("if points < 120 then deny"), Some(120));
        assert_eq!(extract_threshold("threshold 80, then 100"), Some(80));
        assert_eq!(extract_threshold("no numbers here"), None);
        assert_eq!(extract_threshold("value 0 only"), None);
        // Only the first four digits of a longer run are considered.
        assert_eq!(extract_threshold("99999"), Some(9999));
    }

    #[test]
    fn test_memory_id_lists() {
        assert_eq!(parse_memory_ids("1, 2,,x,0,-3,7"), vec![1, 2, 7]);
        assert!(parse_memory_ids("").is_empty());
        assert_eq!(format_memory_ids(&[4, 5]), "4,5");
        assert_eq!(format_memory_ids(&[]), "");
    }

    #[test]
    fn test_global_provenance() {
        assert!(is_global_provenance("global|src_run_id=3"));
        assert!(!is_global_provenance("judgment text"));
    }
}
