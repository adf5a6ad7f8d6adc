//! Reflection prompts and tolerant parsing of the model's rule proposal.
//!
//! The model is asked for strict JSON `{trigger, lesson, apply_to, confidence}`
//! but routinely wraps it in prose or uses other field names. Parsing walks an
//! ordered table of key sets and reports which one matched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write;

use crate::experiment::RuleMode;
use crate::memory::types::{clamp_confidence, RoundStamp};
use crate::task::TaskKind;

/// Trigger used when the model provides none.
pub const DEFAULT_TRIGGER: &str = "general rule";

/// Which key set produced a parsed reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Canonical,
    Aliased,
    Defaulted,
}

/// A rule proposal extracted from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReflection {
    pub trigger: String,
    pub lesson: String,
    /// Scope the model claimed; never trusted, kept for diagnostics
    pub claimed_scope: Option<String>,
    pub confidence: f64,
    pub source: ParseSource,
}

struct KeySet {
    source: ParseSource,
    trigger: &'static [&'static str],
    lesson: &'static [&'static str],
    apply_to: &'static [&'static str],
    confidence: &'static [&'static str],
}

const KEY_SETS: [KeySet; 2] = [
    KeySet {
        source: ParseSource::Canonical,
        trigger: &["trigger"],
        lesson: &["lesson"],
        apply_to: &["apply_to"],
        confidence: &["confidence"],
    },
    KeySet {
        source: ParseSource::Aliased,
        trigger: &["condition", "when", "触发条件"],
        lesson: &["rule", "insight", "experience", "学到的经验"],
        apply_to: &["scope", "applies_to", "适用范围"],
        confidence: &["score", "certainty", "置信度"],
    },
];

/// Everything the reflection prompt needs to know about the mistake.
#[derive(Debug, Clone)]
pub struct ReflectionContext<'a> {
    pub task_type: TaskKind,
    pub input: &'a str,
    pub output: &'a str,
    pub explanation: &'a str,
    pub rule_mode: RuleMode,
    pub stamp: RoundStamp,
}

fn write_common(prompt: &mut String, ctx: &ReflectionContext<'_>) {
    let _ = writeln!(prompt, "Task type: {}", ctx.task_type);
    let _ = writeln!(prompt, "Input: {}", ctx.input);
    let _ = writeln!(prompt, "Answer given: {}", ctx.output);
    let _ = writeln!(prompt, "Feedback: {}", ctx.explanation);
    prompt.push('\n');
}

fn write_format(prompt: &mut String, task_type: TaskKind) {
    prompt.push_str("Reply with strict JSON only (no Markdown, no extra text):\n");
    let _ = writeln!(
        prompt,
        r#"{{"trigger": "...", "lesson": "...", "apply_to": "{}", "confidence": 0.8}}"#,
        task_type
    );
}

/// Prompt asking for a run-scoped rule.
pub fn build_reflection_prompt(ctx: &ReflectionContext<'_>) -> String {
    let mut prompt = String::from("You made a mistake. Distil one reusable rule from it.\n\n");
    write_common(&mut prompt, ctx);
    write_format(&mut prompt, ctx.task_type);
    prompt
}

/// Prompt asking for a rule that will be shared across runs; states the
/// ground truth in force so the rule carries its threshold.
pub fn build_global_reflection_prompt(ctx: &ReflectionContext<'_>) -> String {
    let mut prompt = String::from(
        "You made a mistake. Distil one reusable rule that stays correct in later sessions.\n\n",
    );
    write_common(&mut prompt, ctx);
    let _ = writeln!(
        prompt,
        "Ground truth in force: rule_mode={} rule_version={} threshold={} round={}",
        ctx.rule_mode, ctx.stamp.rule_version, ctx.stamp.rule_threshold, ctx.stamp.round
    );
    prompt.push_str(
        "Phrase the trigger as \"if <condition> then <decision>\" and include the numeric threshold.\n\n",
    );
    write_format(&mut prompt, ctx.task_type);
    prompt
}

/// Slice from the first `{` to the last `}`, if both exist in order.
fn outer_object(answer: &str) -> Option<&str> {
    let start = answer.find('{')?;
    let end = answer.rfind('}')?;
    (end > start).then(|| &answer[start..=end])
}

fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

fn first_number(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Parse a reflection, falling back to `fallback_lesson` and
/// `default_confidence` for missing fields.
pub fn parse_reflection(answer: &str, fallback_lesson: &str, default_confidence: f64) -> ParsedReflection {
    let object = outer_object(answer.trim())
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        });

    if let Some(obj) = object {
        for keys in &KEY_SETS {
            let trigger = first_string(&obj, keys.trigger);
            let lesson = first_string(&obj, keys.lesson);
            if trigger.is_none() && lesson.is_none() {
                continue;
            }
            return ParsedReflection {
                trigger: trigger.unwrap_or_else(|| DEFAULT_TRIGGER.to_string()),
                lesson: lesson.unwrap_or_else(|| fallback_lesson.to_string()),
                claimed_scope: first_string(&obj, keys.apply_to),
                confidence: clamp_confidence(
                    first_number(&obj, keys.confidence).unwrap_or(default_confidence),
                ),
                source: keys.source,
            };
        }
    }

    ParsedReflection {
        trigger: DEFAULT_TRIGGER.to_string(),
        lesson: fallback_lesson.to_string(),
        claimed_scope: None,
        confidence: clamp_confidence(default_confidence),
        source: ParseSource::Defaulted,
    }
}
