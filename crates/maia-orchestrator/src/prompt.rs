//! Prompt composition for a single turn.
//!
//! Fixed section order: system preamble, recent turns (newest last),
//! retrieved memory facts, executed expert summaries, the user's message.
//! When the assembled prompt exceeds the model's context budget, content is
//! dropped from the oldest non-essential section first; the preamble and the
//! current user message are never truncated.

use maia_memory::{ScoredFact, Turn};

/// Identity and safety rules. Refusals are limited to illegal, harmful, or
/// privacy-violating requests; productivity and memory tasks are always safe.
pub const SYSTEM_PREAMBLE: &str = "You are Maia, a personal assistant. You help with lists, \
calendars, reminders, journals, home devices, and remembering things for your user. \
Be concise and warm. Refuse only requests that are illegal, harmful, or violate \
someone's privacy; everyday productivity and memory tasks are always safe to help with. \
When actions have already been taken on the user's behalf, report them accurately \
and mention anything that failed.";

/// Default context budget in characters (roughly a 6k-token window).
pub const DEFAULT_BUDGET_CHARS: usize = 24_000;

#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    /// Newest-first, as returned by the turn store.
    pub recent_turns: &'a [Turn],
    pub facts: &'a [ScoredFact],
    /// One line per executed expert, in dispatcher merge order.
    pub expert_lines: &'a [String],
    pub user_message: &'a str,
}

#[derive(Debug, Clone)]
pub struct ComposedPrompt {
    pub system_prompt: String,
    pub prompt: String,
}

pub fn compose(inputs: &PromptInputs<'_>, budget_chars: usize) -> ComposedPrompt {
    // Oldest turn first so the conversation reads downward, newest last.
    // Each turn stays a (user, assistant) pair so truncation can only ever
    // drop whole turns, never leave a dangling assistant line.
    let mut turn_pairs: Vec<(String, String)> = inputs
        .recent_turns
        .iter()
        .rev()
        .map(|turn: &Turn| {
            (
                format!("User: {}", turn.user_text),
                format!("Assistant: {}", turn.assistant_text),
            )
        })
        .collect();

    let mut fact_lines: Vec<String> = inputs
        .facts
        .iter()
        .map(|f| format!("- {}", f.fact.text))
        .collect();

    let mut expert_lines: Vec<String> = inputs
        .expert_lines
        .iter()
        .map(|line| format!("- {line}"))
        .collect();

    let essential_len = SYSTEM_PREAMBLE.len() + inputs.user_message.len();
    let mut optional_len =
        pairs_len(&turn_pairs) + total_len(&fact_lines) + total_len(&expert_lines);

    // Drop oldest-first: conversation history, then facts, then expert lines.
    while essential_len + optional_len > budget_chars {
        if !turn_pairs.is_empty() {
            let (user, assistant) = turn_pairs.remove(0);
            optional_len -= user.len() + assistant.len() + 2;
        } else if !fact_lines.is_empty() {
            optional_len -= fact_lines.remove(0).len() + 1;
        } else if !expert_lines.is_empty() {
            optional_len -= expert_lines.remove(0).len() + 1;
        } else {
            break;
        }
    }

    let mut prompt = String::new();
    if !turn_pairs.is_empty() {
        prompt.push_str("## Recent conversation\n");
        for (user, assistant) in &turn_pairs {
            prompt.push_str(user);
            prompt.push('\n');
            prompt.push_str(assistant);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    if !fact_lines.is_empty() {
        prompt.push_str("## What you know about the user\n");
        for line in &fact_lines {
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    if !expert_lines.is_empty() {
        prompt.push_str("## Actions already taken this turn\n");
        for line in &expert_lines {
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str("User: ");
    prompt.push_str(inputs.user_message);

    ComposedPrompt {
        system_prompt: SYSTEM_PREAMBLE.to_string(),
        prompt,
    }
}

fn total_len(lines: &[String]) -> usize {
    lines.iter().map(|l| l.len() + 1).sum()
}

fn pairs_len(pairs: &[(String, String)]) -> usize {
    pairs.iter().map(|(u, a)| u.len() + a.len() + 2).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maia_memory::{MemoryFact, SubjectKind};

    fn turn(id: u32, user: &str, assistant: &str) -> Turn {
        Turn {
            id: id.to_string(),
            episode_id: "ep".to_string(),
            user_text: user.to_string(),
            assistant_text: assistant.to_string(),
            created_at: format!("2025-06-10T12:{:02}:00Z", id),
        }
    }

    fn fact(text: &str) -> ScoredFact {
        ScoredFact {
            fact: MemoryFact {
                id: 1,
                user_id: "alice".to_string(),
                subject_kind: SubjectKind::General,
                subject_id: None,
                text: text.to_string(),
                importance: 5.0,
                created_at: "2025-06-01T00:00:00Z".to_string(),
                last_accessed_at: "2025-06-01T00:00:00Z".to_string(),
                access_count: 0,
            },
            score: 1.0,
        }
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        // Newest-first input, as the store returns it.
        let turns = vec![turn(2, "second", "r2"), turn(1, "first", "r1")];
        let facts = vec![fact("prefers oat milk")];
        let lines = vec!["Added milk to your shopping list".to_string()];
        let composed = compose(
            &PromptInputs {
                recent_turns: &turns,
                facts: &facts,
                expert_lines: &lines,
                user_message: "thanks!",
            },
            DEFAULT_BUDGET_CHARS,
        );

        let conversation = composed.prompt.find("## Recent conversation").unwrap();
        let known = composed.prompt.find("## What you know").unwrap();
        let actions = composed.prompt.find("## Actions already taken").unwrap();
        let user = composed.prompt.find("User: thanks!").unwrap();
        assert!(conversation < known && known < actions && actions < user);

        // Newest turn last within the conversation block.
        let first = composed.prompt.find("User: first").unwrap();
        let second = composed.prompt.find("User: second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn over_budget_drops_history_but_keeps_essentials() {
        let long = "x".repeat(500);
        let turns: Vec<Turn> = (0..20).map(|i| turn(i, &long, &long)).collect();
        let facts = vec![fact("prefers oat milk")];
        let composed = compose(
            &PromptInputs {
                recent_turns: &turns,
                facts: &facts,
                expert_lines: &[],
                user_message: "what milk do I like?",
            },
            2_000,
        );

        // The preamble and the user message survive verbatim.
        assert_eq!(composed.system_prompt, SYSTEM_PREAMBLE);
        assert!(composed.prompt.contains("User: what milk do I like?"));
        // Small allowance for section headers, which sit outside the budget math.
        assert!(composed.prompt.len() + composed.system_prompt.len() <= 2_000 + 128);
    }

    #[test]
    fn truncation_prefers_dropping_turns_over_facts() {
        let long = "x".repeat(400);
        let turns: Vec<Turn> = (0..4).map(|i| turn(i, &long, &long)).collect();
        let facts = vec![fact("prefers oat milk")];
        let budget = SYSTEM_PREAMBLE.len() + 1_000;
        let composed = compose(
            &PromptInputs {
                recent_turns: &turns,
                facts: &facts,
                expert_lines: &[],
                user_message: "hi",
            },
            budget,
        );
        assert!(composed.prompt.contains("prefers oat milk"));
    }

    #[test]
    fn truncation_never_splits_a_turn() {
        // Long user halves and short assistant halves: a line-by-line drop
        // could satisfy the budget between the two halves of a turn. Whole
        // pairs must go together, so the conversation block always opens
        // with a user line and pairs stay balanced.
        let turns: Vec<Turn> = (0..6)
            .map(|i| turn(i, &"u".repeat(400), "ok"))
            .collect();
        for budget in (600..3_200).step_by(100) {
            let composed = compose(
                &PromptInputs {
                    recent_turns: &turns,
                    facts: &[],
                    expert_lines: &[],
                    user_message: "hi",
                },
                budget,
            );
            let user_lines = composed.prompt.matches("User: u").count();
            let assistant_lines = composed.prompt.matches("Assistant: ").count();
            assert_eq!(user_lines, assistant_lines, "budget {budget}");
            if let Some(section) = composed.prompt.strip_prefix("## Recent conversation\n") {
                assert!(section.starts_with("User: "), "budget {budget}");
            }
        }
    }

    #[test]
    fn empty_sections_are_omitted() {
        let composed = compose(
            &PromptInputs {
                recent_turns: &[],
                facts: &[],
                expert_lines: &[],
                user_message: "hello",
            },
            DEFAULT_BUDGET_CHARS,
        );
        assert!(!composed.prompt.contains("##"));
        assert_eq!(composed.prompt, "User: hello");
    }
}
