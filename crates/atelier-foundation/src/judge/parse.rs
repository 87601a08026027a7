//! Tolerant parsing of judge responses.
//!
//! Judges answer in free text around a JSON object. The parser extracts the
//! first balanced object, then reads keys case- and snake-insensitively so
//! `TOP_ISSUE`, `topIssue` and `top_issue` all resolve to the same field.

use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::judge::{ChecklistEntry, JudgeEvaluation, Severity, TopIssue};
use serde_json::Value;
use std::collections::BTreeMap;

/// Score substituted when a judge omits or mangles the score field.
const FALLBACK_SCORE: f64 = 50.0;

/// Extract the first balanced `{...}` object from free text.
///
/// Tracks string literals and escapes so braces inside strings do not
/// unbalance the scan.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a judge's raw response into a [`JudgeEvaluation`].
///
/// Fails with [`EngineError::JudgeParse`] when no JSON object is found;
/// the caller drops this judge's evaluation for the image and lets the
/// remaining judges vote.
pub fn parse_evaluation(text: &str) -> EngineResult<JudgeEvaluation> {
    let raw = extract_json_object(text)
        .ok_or_else(|| EngineError::JudgeParse("no JSON object in response".into()))?;
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| EngineError::JudgeParse(format!("invalid JSON object: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::JudgeParse("response JSON is not an object".into()))?;

    let fields: BTreeMap<String, &Value> = object
        .iter()
        .map(|(k, v)| (normalize_key(k), v))
        .collect();

    let score = fields
        .get("score")
        .and_then(|v| v.as_f64())
        .filter(|s| !s.is_nan())
        .map(|s| s.clamp(0.0, 100.0))
        .unwrap_or(FALLBACK_SCORE);

    let feedback = fields
        .get("feedback")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    let category_scores = fields.get("categoryscores").and_then(|v| v.as_object()).map(|map| {
        map.iter()
            .filter_map(|(k, v)| v.as_f64().map(|s| (k.clone(), s.clamp(0.0, 100.0))))
            .collect::<BTreeMap<String, f64>>()
    });

    let top_issue = fields.get("topissue").and_then(|v| parse_top_issue(v));

    let what_worked = fields
        .get("whatworked")
        .and_then(|v| v.as_array())
        .map(|items| string_list(items));

    let checklist = fields.get("checklist").and_then(|v| v.as_object()).map(|map| {
        map.iter()
            .filter_map(|(k, v)| parse_checklist_entry(v).map(|entry| (k.clone(), entry)))
            .collect::<BTreeMap<String, ChecklistEntry>>()
    });

    let prompt_instructions = fields
        .get("promptinstructions")
        .and_then(|v| v.as_array())
        .map(|items| string_list(items));

    Ok(JudgeEvaluation {
        score,
        feedback,
        category_scores: category_scores.filter(|m| !m.is_empty()),
        top_issue,
        what_worked: what_worked.filter(|l| !l.is_empty()),
        checklist: checklist.filter(|m| !m.is_empty()),
        prompt_instructions: prompt_instructions.filter(|l| !l.is_empty()),
    })
}

/// Lowercase and strip underscores so `TOP_ISSUE` matches `topIssue`.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn parse_top_issue(value: &Value) -> Option<TopIssue> {
    match value {
        Value::Object(map) => {
            let fields: BTreeMap<String, &Value> =
                map.iter().map(|(k, v)| (normalize_key(k), v)).collect();
            let problem = fields
                .get("problem")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            let fix = fields
                .get("fix")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            let severity = fields
                .get("severity")
                .and_then(|v| v.as_str())
                .map(Severity::parse_lenient)
                .unwrap_or(Severity::Moderate);
            if problem.is_empty() && fix.is_empty() {
                return None;
            }
            Some(TopIssue {
                problem,
                severity,
                fix,
            })
        }
        // A bare string is treated as the problem description.
        Value::String(s) if !s.trim().is_empty() => Some(TopIssue {
            problem: s.trim().to_string(),
            severity: Severity::Moderate,
            fix: String::new(),
        }),
        _ => None,
    }
}

fn parse_checklist_entry(value: &Value) -> Option<ChecklistEntry> {
    match value {
        Value::Bool(passed) => Some(ChecklistEntry {
            passed: *passed,
            note: None,
        }),
        Value::Object(map) => {
            let fields: BTreeMap<String, &Value> =
                map.iter().map(|(k, v)| (normalize_key(k), v)).collect();
            let passed = fields.get("passed").and_then(|v| v.as_bool())?;
            let note = fields
                .get("note")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            Some(ChecklistEntry { passed, note })
        }
        _ => None,
    }
}

fn string_list(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
