//! Bounded negative-prompt accumulator.
//!
//! After each iteration the winning image's top issues are folded into an
//! `AVOID:` list that steers subsequent prompts away from recurring flaws.

use atelier_kernel::request::EvaluationRecord;

/// New issues admitted per iteration.
const MAX_NEW_ISSUES: usize = 3;

/// Lines kept after accumulation (most recent last).
const MAX_LINES: usize = 10;

const AVOID_PREFIX: &str = "AVOID:";

/// Fold the winning image's evaluations into the accumulated negative
/// prompts.
///
/// Issues are severity-sorted, deduped case-insensitively against problems
/// already listed, capped at three new lines, and the whole list is capped
/// to its last ten lines. Returns `Some(updated)` only when the value
/// actually changed, so callers skip redundant persistence.
pub fn recompute_negative_prompts(
    existing: &str,
    evaluations: &[EvaluationRecord],
) -> Option<String> {
    let mut issues: Vec<(&EvaluationRecord, &atelier_kernel::judge::TopIssue)> = evaluations
        .iter()
        .filter_map(|record| record.top_issue.as_ref().map(|issue| (record, issue)))
        .filter(|(_, issue)| !issue.problem.trim().is_empty())
        .collect();
    issues.sort_by_key(|(_, issue)| issue.severity.rank());

    let existing_lines: Vec<&str> = existing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let known_problems: Vec<String> = existing_lines
        .iter()
        .filter_map(|line| extract_problem(line))
        .map(|p| p.to_lowercase())
        .collect();

    let mut added: Vec<String> = Vec::new();
    let mut seen_this_round: Vec<String> = Vec::new();
    for (record, issue) in issues {
        if added.len() >= MAX_NEW_ISSUES {
            break;
        }
        let key = issue.problem.trim().to_lowercase();
        if known_problems.contains(&key) || seen_this_round.contains(&key) {
            continue;
        }
        seen_this_round.push(key);
        let fix = if issue.fix.trim().is_empty() {
            "avoid this".to_string()
        } else {
            issue.fix.trim().to_string()
        };
        added.push(format!(
            "{AVOID_PREFIX} {} - {} (from {})",
            issue.problem.trim(),
            fix,
            record.agent_name
        ));
    }

    if added.is_empty() {
        return None;
    }

    let mut lines: Vec<String> = existing_lines.iter().map(|s| s.to_string()).collect();
    lines.extend(added);
    if lines.len() > MAX_LINES {
        lines.drain(..lines.len() - MAX_LINES);
    }

    let updated = lines.join("\n");
    if updated == existing.trim() {
        None
    } else {
        Some(updated)
    }
}

/// Pull the problem text out of an `AVOID: <problem> - <fix> (...)` line.
fn extract_problem(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(AVOID_PREFIX)?.trim_start();
    let end = rest.find(" - ").unwrap_or(rest.len());
    let problem = rest[..end].trim();
    (!problem.is_empty()).then_some(problem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_kernel::judge::{Severity, TopIssue};
    use uuid::Uuid;

    fn record(agent: &str, problem: &str, severity: Severity) -> EvaluationRecord {
        EvaluationRecord {
            agent_id: Uuid::new_v4(),
            agent_name: agent.into(),
            image_id: Uuid::new_v4(),
            overall_score: 50.0,
            weight: 50.0,
            feedback: String::new(),
            category_scores: None,
            top_issue: Some(TopIssue {
                problem: problem.into(),
                severity,
                fix: format!("fix {problem}"),
            }),
            what_worked: None,
            checklist: None,
            prompt_instructions: None,
        }
    }

    #[test]
    fn appends_severity_sorted_lines() {
        let evals = vec![
            record("a", "flat lighting", Severity::Minor),
            record("b", "wrong logo", Severity::Critical),
        ];
        let updated = recompute_negative_prompts("", &evals).unwrap();
        let lines: Vec<&str> = updated.lines().collect();
        assert!(lines[0].starts_with("AVOID: wrong logo - fix wrong logo (from b)"));
        assert!(lines[1].contains("flat lighting"));
    }

    #[test]
    fn caps_new_issues_at_three() {
        let evals: Vec<EvaluationRecord> = (0..5)
            .map(|i| record("j", &format!("problem {i}"), Severity::Major))
            .collect();
        let updated = recompute_negative_prompts("", &evals).unwrap();
        assert_eq!(updated.lines().count(), 3);
    }

    #[test]
    fn dedupes_against_existing_case_insensitively() {
        let existing = "AVOID: Wrong Logo - use the real one (from b)";
        let evals = vec![record("b", "wrong logo", Severity::Critical)];
        assert!(recompute_negative_prompts(existing, &evals).is_none());
    }

    #[test]
    fn dedupes_within_one_round() {
        let evals = vec![
            record("a", "muddy colors", Severity::Major),
            record("b", "Muddy Colors", Severity::Major),
        ];
        let updated = recompute_negative_prompts("", &evals).unwrap();
        assert_eq!(updated.lines().count(), 1);
    }

    #[test]
    fn caps_total_lines_at_ten_keeping_newest() {
        let existing: String = (0..9)
            .map(|i| format!("AVOID: old problem {i} - fix (from j)"))
            .collect::<Vec<_>>()
            .join("\n");
        let evals = vec![
            record("j", "fresh one", Severity::Critical),
            record("j", "fresh two", Severity::Critical),
        ];
        let updated = recompute_negative_prompts(&existing, &evals).unwrap();
        let lines: Vec<&str> = updated.lines().collect();
        assert_eq!(lines.len(), 10);
        // Oldest line fell off; newest lines are at the tail.
        assert!(!updated.contains("old problem 0"));
        assert!(lines[8].contains("fresh one"));
        assert!(lines[9].contains("fresh two"));
    }

    #[test]
    fn no_issues_means_no_update() {
        let eval = EvaluationRecord {
            top_issue: None,
            ..record("a", "ignored", Severity::Minor)
        };
        assert!(recompute_negative_prompts("", &[eval]).is_none());
    }

    #[test]
    fn extract_problem_reads_avoid_lines() {
        assert_eq!(
            extract_problem("AVOID: blurry text - sharpen (from j)"),
            Some("blurry text")
        );
        assert_eq!(extract_problem("not an avoid line"), None);
    }
}
