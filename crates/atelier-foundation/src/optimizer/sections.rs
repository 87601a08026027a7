//! Section-wise assembly of optimizer messages.
//!
//! The optimize message follows a fixed section order so the model sees the
//! highest-leverage information (critical issues, preserved elements) in a
//! stable position across iterations.

use atelier_kernel::judge::TopIssue;

/// Characters kept per previous attempt before truncation.
const PREVIOUS_PROMPT_PREVIEW: usize = 400;

/// Maximum issues rendered in an edit instruction.
pub const MAX_EDIT_ISSUES: usize = 5;

/// Sentence every edit instruction must end with.
pub const EDIT_SUFFIX: &str = "Keep everything else exactly the same.";

/// One judge's distilled feedback for the optimizer.
#[derive(Debug, Clone)]
pub struct JudgeFeedback {
    pub agent_name: String,
    pub weight: f64,
    pub feedback: String,
    pub top_issue: Option<TopIssue>,
    pub what_worked: Vec<String>,
    pub prompt_instructions: Vec<String>,
}

/// Everything the optimizer considers when writing the next prompt.
#[derive(Debug, Clone, Default)]
pub struct OptimizeInput {
    pub brief: String,
    pub current_prompt: Option<String>,
    pub feedback: Vec<JudgeFeedback>,
    pub previous_prompts: Vec<String>,
    pub negative_prompts: Option<String>,
    pub rag_context: Vec<String>,
    pub has_reference_images: bool,
}

/// Input for an edit instruction.
#[derive(Debug, Clone, Default)]
pub struct EditInput {
    pub brief: String,
    /// Issues paired with the reporting judge's weight.
    pub top_issues: Vec<(TopIssue, f64)>,
    pub what_worked: Vec<String>,
}

/// Order issues by severity (critical first), then judge weight descending.
pub fn order_issues(issues: &[(TopIssue, f64)]) -> Vec<(TopIssue, f64)> {
    let mut ordered = issues.to_vec();
    ordered.sort_by(|(a, wa), (b, wb)| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| wb.partial_cmp(wa).unwrap_or(std::cmp::Ordering::Equal))
    });
    ordered
}

/// Drop issues whose problem text repeats an already-kept issue.
///
/// Two problems are duplicates when, lowercased, one is a prefix of the
/// other — near-identical phrasings from different judges collapse to the
/// higher-priority line.
pub fn dedupe_issues(issues: Vec<(TopIssue, f64)>) -> Vec<(TopIssue, f64)> {
    let mut kept: Vec<(TopIssue, f64)> = Vec::new();
    for (issue, weight) in issues {
        let key = issue.problem.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let duplicate = kept.iter().any(|(existing, _)| {
            let existing_key = existing.problem.trim().to_lowercase();
            existing_key.starts_with(&key) || key.starts_with(&existing_key)
        });
        if !duplicate {
            kept.push((issue, weight));
        }
    }
    kept
}

/// Build the optimize-prompt user message in its fixed section order.
pub fn build_optimize_message(input: &OptimizeInput) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!("## Brief\n{}", input.brief.trim()));

    if input.has_reference_images {
        sections.push(
            "## Reference Images\nReference images are attached to generation; the prompt \
             must describe a result consistent with them."
                .to_string(),
        );
    }

    if let Some(current) = &input.current_prompt {
        if !current.trim().is_empty() {
            sections.push(format!("## Current Prompt\n{}", current.trim()));
        }
    }

    let issues: Vec<(TopIssue, f64)> = input
        .feedback
        .iter()
        .filter_map(|f| f.top_issue.clone().map(|i| (i, f.weight)))
        .collect();
    let issues = dedupe_issues(order_issues(&issues));
    if !issues.is_empty() {
        let lines = issues
            .iter()
            .enumerate()
            .map(|(i, (issue, _))| {
                format!(
                    "{}. [{}] {} — fix: {}",
                    i + 1,
                    severity_label(issue),
                    issue.problem,
                    issue.fix
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Critical Issues to Fix (priority order)\n{lines}"));
    }

    let preserved = dedupe_strings(
        input
            .feedback
            .iter()
            .flat_map(|f| f.what_worked.iter().cloned()),
    );
    if !preserved.is_empty() {
        let lines = preserved
            .iter()
            .map(|w| format!("- {w}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## What Worked (Preserve These)\n{lines}"));
    }

    if let Some(negative) = &input.negative_prompts {
        if !negative.trim().is_empty() {
            sections.push(format!("## Things to Avoid\n{}", negative.trim()));
        }
    }

    if !input.rag_context.is_empty() {
        let lines = input
            .rag_context
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Reference Guidelines\n{lines}"));
    }

    if !input.feedback.is_empty() {
        let mut detailed = input.feedback.clone();
        detailed.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let lines = detailed
            .iter()
            .filter(|f| !f.feedback.trim().is_empty())
            .map(|f| format!("- {} (weight {:.0}): {}", f.agent_name, f.weight, f.feedback.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        if !lines.is_empty() {
            sections.push(format!("## Detailed Judge Feedback\n{lines}"));
        }
    }

    if !input.previous_prompts.is_empty() {
        let lines = input
            .previous_prompts
            .iter()
            .enumerate()
            .map(|(i, p)| format!("Attempt {}: {}", i + 1, truncate(p, PREVIOUS_PROMPT_PREVIEW)))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Previous Attempts\n{lines}"));
    }

    let instructions = dedupe_strings(
        input
            .feedback
            .iter()
            .flat_map(|f| f.prompt_instructions.iter().cloned()),
    );
    if !instructions.is_empty() {
        let lines = instructions
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Judge Prompt Instructions (verbatim)\n{lines}"));
    }

    sections.push(
        "## Task\nWrite the next image-generation prompt. Requirements:\n\
         - At least 500 words, organized under labeled sections.\n\
         - Address every critical issue above, in priority order.\n\
         - Preserve each element listed under What Worked.\n\
         - Include every verbatim judge instruction exactly as written.\n\
         - Avoid everything listed under Things to Avoid.\n\
         - If reference images apply, describe a result that matches them.\n\
         Respond with the prompt text only."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Build the user message asking for a numbered edit instruction.
pub fn build_edit_message(input: &EditInput, issues: &[(TopIssue, f64)]) -> String {
    let mut sections: Vec<String> = Vec::new();

    let brief_excerpt = truncate(&input.brief, 300);
    sections.push(format!("## Brief (excerpt)\n{brief_excerpt}"));

    let lines = issues
        .iter()
        .enumerate()
        .map(|(i, (issue, _))| {
            format!(
                "{}. [{}] {} — fix: {}",
                i + 1,
                severity_label(issue),
                issue.problem,
                issue.fix
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    sections.push(format!("## Fixes to Apply\n{lines}"));

    let preserved = dedupe_strings(input.what_worked.iter().cloned());
    if !preserved.is_empty() {
        let lines = preserved
            .iter()
            .map(|w| format!("- {w}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Preserve\n{lines}"));
    }

    sections.push(format!(
        "## Task\nWrite a numbered-list instruction for an image editing model that applies \
         the fixes above to the existing image. Change nothing that is not listed. The \
         instruction must end with the exact sentence: \"{EDIT_SUFFIX}\""
    ));

    sections.join("\n\n")
}

fn severity_label(issue: &TopIssue) -> &'static str {
    match issue.severity {
        atelier_kernel::judge::Severity::Critical => "critical",
        atelier_kernel::judge::Severity::Major => "major",
        atelier_kernel::judge::Severity::Moderate => "moderate",
        atelier_kernel::judge::Severity::Minor => "minor",
    }
}

/// Case-insensitive order-preserving dedup.
fn dedupe_strings(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        let key = trimmed.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(trimmed);
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_kernel::judge::Severity;

    fn issue(problem: &str, severity: Severity) -> TopIssue {
        TopIssue {
            problem: problem.into(),
            severity,
            fix: format!("fix {problem}"),
        }
    }

    fn feedback(name: &str, weight: f64, top: Option<TopIssue>) -> JudgeFeedback {
        JudgeFeedback {
            agent_name: name.into(),
            weight,
            feedback: format!("{name} says things"),
            top_issue: top,
            what_worked: vec![],
            prompt_instructions: vec![],
        }
    }

    #[test]
    fn issues_order_by_severity_then_weight() {
        let issues = vec![
            (issue("minor thing", Severity::Minor), 90.0),
            (issue("critical thing", Severity::Critical), 10.0),
            (issue("major low", Severity::Major), 20.0),
            (issue("major high", Severity::Major), 80.0),
        ];
        let ordered = order_issues(&issues);
        assert_eq!(ordered[0].0.problem, "critical thing");
        assert_eq!(ordered[1].0.problem, "major high");
        assert_eq!(ordered[2].0.problem, "major low");
        assert_eq!(ordered[3].0.problem, "minor thing");
    }

    #[test]
    fn near_identical_problems_dedupe() {
        let issues = vec![
            (issue("The background is cluttered", Severity::Major), 50.0),
            (issue("the background is cluttered near the edges", Severity::Minor), 40.0),
            (issue("Lighting is flat", Severity::Minor), 30.0),
        ];
        let deduped = dedupe_issues(issues);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn section_order_is_fixed() {
        let input = OptimizeInput {
            brief: "A red apple".into(),
            current_prompt: Some("old prompt".into()),
            feedback: vec![feedback(
                "color",
                60.0,
                Some(issue("washed out", Severity::Critical)),
            )],
            previous_prompts: vec!["attempt one".into()],
            negative_prompts: Some("AVOID: blur - sharpen (from color)".into()),
            rag_context: vec!["Use brand red #CC0000.".into()],
            has_reference_images: true,
        };
        let message = build_optimize_message(&input);

        let order = [
            "## Brief",
            "## Reference Images",
            "## Current Prompt",
            "## Critical Issues to Fix (priority order)",
            "## Things to Avoid",
            "## Reference Guidelines",
            "## Detailed Judge Feedback",
            "## Previous Attempts",
            "## Task",
        ];
        let mut last = 0;
        for marker in order {
            let pos = message.find(marker).unwrap_or_else(|| panic!("missing {marker}"));
            assert!(pos > last || last == 0, "{marker} out of order");
            last = pos;
        }
        assert!(message.contains("At least 500 words"));
    }

    #[test]
    fn what_worked_dedupes_across_judges() {
        let mut a = feedback("a", 50.0, None);
        a.what_worked = vec!["Crisp lighting".into()];
        let mut b = feedback("b", 40.0, None);
        b.what_worked = vec!["crisp lighting".into(), "Good framing".into()];
        let input = OptimizeInput {
            brief: "x".into(),
            feedback: vec![a, b],
            ..Default::default()
        };
        let message = build_optimize_message(&input);
        assert_eq!(message.matches("risp lighting").count(), 1);
        assert!(message.contains("Good framing"));
    }

    #[test]
    fn detailed_feedback_sorts_by_weight_desc() {
        let input = OptimizeInput {
            brief: "x".into(),
            feedback: vec![feedback("light", 20.0, None), feedback("heavy", 90.0, None)],
            ..Default::default()
        };
        let message = build_optimize_message(&input);
        let heavy = message.find("- heavy").unwrap();
        let light = message.find("- light").unwrap();
        assert!(heavy < light);
    }

    #[test]
    fn previous_prompts_are_truncated() {
        let input = OptimizeInput {
            brief: "x".into(),
            previous_prompts: vec!["p".repeat(2000)],
            ..Default::default()
        };
        let message = build_optimize_message(&input);
        assert!(message.contains('…'));
        assert!(!message.contains(&"p".repeat(500)));
    }

    #[test]
    fn edit_message_names_the_suffix() {
        let input = EditInput {
            brief: "A red apple".into(),
            top_issues: vec![(issue("too dark", Severity::Moderate), 50.0)],
            what_worked: vec!["composition".into()],
        };
        let issues = dedupe_issues(order_issues(&input.top_issues));
        let message = build_edit_message(&input, &issues);
        assert!(message.contains("## Fixes to Apply"));
        assert!(message.contains(EDIT_SUFFIX));
        assert!(message.contains("## Preserve"));
    }
}
