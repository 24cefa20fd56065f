//! `planning` expert: decomposes a goal into concrete steps. Pure: no side
//! effects and no collaborator calls.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;

use crate::experts::{clean_text, keyword_score};
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &[
    "help me plan",
    "make a plan",
    "plan my",
    "plan for",
    "break down",
    "break it down",
];
const WEAK: &[&str] = &["plan", "steps", "organize", "organise"];

static GOAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:plan|planning|break down|organize|organise)\s+(?:my|the|a|for)?\s*(.+)$")
        .expect("static regex")
});

pub struct PlanningExpert;

impl PlanningExpert {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }

    fn extract_goal(query: &str) -> Option<String> {
        let raw = GOAL_RE.captures(query).map(|caps| caps[1].to_string())?;
        let goal = clean_text(&raw, 500);
        if goal.is_empty() {
            None
        } else {
            Some(goal)
        }
    }

    /// Deterministic decomposition: compound goals split on their
    /// conjunctions; simple goals get a standard four-step scaffold.
    fn decompose(goal: &str) -> Vec<String> {
        let parts: Vec<&str> = goal
            .split(&[',', ';'][..])
            .flat_map(|part| part.split(" and then "))
            .flat_map(|part| part.split(" then "))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        if parts.len() > 1 {
            let mut steps: Vec<String> = parts
                .iter()
                .enumerate()
                .map(|(i, part)| format!("Step {}: {}", i + 1, part))
                .collect();
            steps.push(format!("Step {}: review progress on {goal}", parts.len() + 1));
            return steps;
        }

        vec![
            format!("Step 1: clarify what done looks like for {goal}"),
            format!("Step 2: list everything {goal} depends on"),
            format!("Step 3: schedule the first concrete task"),
            format!("Step 4: set a checkpoint to review progress"),
        ]
    }
}

#[async_trait]
impl Expert for PlanningExpert {
    fn name(&self) -> &'static str {
        "planning"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "planning",
            capabilities: vec!["planning.decompose"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.7,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, _ctx: &TurnContext) -> ActionResult {
        let Some(goal) = Self::extract_goal(query) else {
            return ActionResult::failed(
                ErrorKind::Invalid("missing goal".to_string()),
                "I couldn't tell what you want to plan",
            );
        };

        let steps = Self::decompose(&goal);
        ActionResult::ok(format!(
            "Broke \"{goal}\" into {} steps",
            steps.len()
        ))
        .with_artifact(json!({ "goal": goal, "steps": steps }))
        .with_action(ActionRecord::ok("planning.decompose", json!({ "goal": goal })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_planning_queries() {
        assert!(keyword_score("help me plan my week", STRONG, WEAK) >= 0.9);
        assert!(keyword_score("add milk to my shopping list", STRONG, WEAK) < 0.5);
    }

    #[test]
    fn compound_goals_split_into_their_parts() {
        let steps = PlanningExpert::decompose("pack the car, drive to the lake and then set up camp");
        assert_eq!(steps.len(), 4);
        assert!(steps[0].contains("pack the car"));
        assert!(steps[2].contains("set up camp"));
    }

    #[test]
    fn simple_goals_get_the_scaffold() {
        let steps = PlanningExpert::decompose("the garden");
        assert_eq!(steps.len(), 4);
        assert!(steps[0].contains("the garden"));
    }

    #[tokio::test]
    async fn execute_is_pure() {
        use maia_core::types::Session;
        use std::time::Duration;
        let expert = PlanningExpert::new();
        let ctx = TurnContext::new(Session::local_dev_default(), Duration::from_secs(30));
        let result = expert.execute("help me plan my week", &ctx).await;
        assert!(result.success);
        assert!(!result.caused_side_effects);
        assert_eq!(result.actions.len(), 1);
    }
}
