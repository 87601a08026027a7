//! Judge prompt composition.

use atelier_kernel::judge::{IterationContext, JudgeAgent};

use crate::rag::RetrievedChunk;

/// Marker a judge-prompt override must carry to replace the default
/// scoring instructions.
pub const OUTPUT_FORMAT_MARKER: &str = "OUTPUT FORMAT";

/// Default scoring instructions appended to every judge lacking a usable
/// override. The JSON contract here is what the response parser accepts.
pub const DEFAULT_JUDGE_TEMPLATE: &str = r#"You evaluate one candidate image against the creative brief.

Score strictly and concretely. Identify the single most impactful flaw and
the specific change that would fix it. Note what already works so it is
preserved in the next attempt.

OUTPUT FORMAT
Respond with a single JSON object:
{
  "score": <0-100>,
  "feedback": "<two or three sentences>",
  "categoryScores": {"<category>": <0-100>},
  "topIssue": {"problem": "<flaw>", "severity": "critical|major|moderate|minor", "fix": "<concrete change>"},
  "whatWorked": ["<element to preserve>"],
  "promptInstructions": ["<verbatim instruction for the next prompt>"]
}"#;

/// Compose a judge's effective system message.
///
/// The agent's own system prompt always leads. A judge-prompt override is
/// honored only when it carries a recognizable OUTPUT FORMAT section;
/// otherwise the default template supplies the scoring contract.
pub fn effective_system_prompt(agent: &JudgeAgent) -> String {
    let instructions = match &agent.judge_prompt {
        Some(prompt) if prompt.contains(OUTPUT_FORMAT_MARKER) => prompt.as_str(),
        _ => DEFAULT_JUDGE_TEMPLATE,
    };
    format!("{}\n---\n{}", agent.system_prompt.trim(), instructions)
}

/// Build the evaluation user message for one image.
///
/// When previous scores exist, the iteration context leads the message with
/// an instruction to score on absolute merits rather than inflating across
/// iterations.
pub fn build_evaluation_prompt(
    brief: &str,
    prompt_used: &str,
    agent: &JudgeAgent,
    context: Option<&IterationContext>,
    rag_chunks: &[RetrievedChunk],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(ctx) = context {
        if !ctx.previous_scores.is_empty() {
            let scores = ctx
                .previous_scores
                .iter()
                .map(|s| format!("{s:.1}"))
                .collect::<Vec<_>>()
                .join(", ");
            sections.push(format!(
                "This is iteration {} of {}. Previous aggregate scores: [{}].\n\
                 Score this image on its absolute merits. Do not inflate the \
                 score simply because iterations have passed.",
                ctx.iteration, ctx.max_iterations, scores
            ));
        }
    }

    sections.push(format!("Brief:\n{brief}"));
    sections.push(format!("Prompt used to generate this image:\n{prompt_used}"));

    if let Some(categories) = &agent.evaluation_categories {
        if !categories.is_empty() {
            sections.push(format!(
                "Score these categories individually: {}",
                categories.join(", ")
            ));
        }
    }

    if !rag_chunks.is_empty() {
        let refs = rag_chunks
            .iter()
            .map(|c| format!("- {}", c.content))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Reference guidelines:\n{refs}"));
    }

    sections.push("Evaluate the attached image.".to_string());
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_kernel::judge::RagConfig;
    use uuid::Uuid;

    fn agent(judge_prompt: Option<&str>) -> JudgeAgent {
        JudgeAgent {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "composition".into(),
            system_prompt: "You judge composition.".into(),
            judge_prompt: judge_prompt.map(String::from),
            scoring_weight: 40.0,
            can_judge: true,
            evaluation_categories: None,
            rag: RagConfig::default(),
            model_tier: None,
            documents: vec![],
        }
    }

    #[test]
    fn override_with_output_format_is_honored() {
        let custom = "Rate harshly.\nOUTPUT FORMAT\n{\"score\": 0}";
        let system = effective_system_prompt(&agent(Some(custom)));
        assert!(system.contains("Rate harshly."));
        assert!(!system.contains("single most impactful flaw"));
    }

    #[test]
    fn override_without_output_format_falls_back_to_template() {
        let system = effective_system_prompt(&agent(Some("just my vibes")));
        assert!(system.contains(OUTPUT_FORMAT_MARKER));
        assert!(system.contains("You judge composition."));
        assert!(!system.contains("just my vibes"));
    }

    #[test]
    fn missing_override_uses_template() {
        let system = effective_system_prompt(&agent(None));
        assert!(system.starts_with("You judge composition."));
        assert!(system.contains(OUTPUT_FORMAT_MARKER));
    }

    #[test]
    fn iteration_context_leads_the_message() {
        let ctx = IterationContext {
            iteration: 3,
            max_iterations: 5,
            previous_scores: vec![40.0, 55.5],
        };
        let prompt = build_evaluation_prompt("a cat", "fluffy cat", &agent(None), Some(&ctx), &[]);
        assert!(prompt.starts_with("This is iteration 3 of 5."));
        assert!(prompt.contains("[40.0, 55.5]"));
        assert!(prompt.contains("absolute merits"));
    }

    #[test]
    fn first_iteration_has_no_context_preamble() {
        let ctx = IterationContext {
            iteration: 1,
            max_iterations: 5,
            previous_scores: vec![],
        };
        let prompt = build_evaluation_prompt("a cat", "fluffy cat", &agent(None), Some(&ctx), &[]);
        assert!(prompt.starts_with("Brief:"));
    }

    #[test]
    fn categories_and_rag_context_are_included() {
        let mut a = agent(None);
        a.evaluation_categories = Some(vec!["lighting".into(), "color".into()]);
        let chunks = vec![RetrievedChunk {
            document_id: Uuid::new_v4(),
            chunk_index: 0,
            content: "Logos need clear space.".into(),
            score: 0.9,
        }];
        let prompt = build_evaluation_prompt("a cat", "fluffy cat", &a, None, &chunks);
        assert!(prompt.contains("lighting, color"));
        assert!(prompt.contains("Logos need clear space."));
    }
}
