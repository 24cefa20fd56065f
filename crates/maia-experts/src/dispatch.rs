//! Scores, selects, and executes experts for a single turn.
//!
//! Selection is deterministic: experts at or above the selection threshold
//! run; a clear winner (top score ≥ 0.85 with the runner-up under 0.70) runs
//! alone. Execution is parallel under an overall deadline with a per-expert
//! sub-deadline. A single expert's failure never fails the dispatch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use maia_core::config::ExpertsConfig;
use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;

use crate::action_log::ActionLogger;
use crate::{ActionResult, Expert};

/// Minimum score for an expert to be selected at all.
const THETA_SELECT: f32 = 0.5;
/// Score at which a clear winner runs exclusively.
const THETA_EXCLUSIVE: f32 = 0.85;
/// The runner-up must be this far under the exclusive bar.
const EXCLUSIVE_MARGIN: f32 = 0.15;

/// One expert's contribution to a dispatch.
#[derive(Debug, Clone)]
pub struct ExpertOutcome {
    pub expert: String,
    pub score: f32,
    pub result: ActionResult,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    /// Outcomes ordered by score (desc), then expert name (asc).
    pub results: Vec<ExpertOutcome>,
    /// Names of the experts that executed successfully.
    pub executed_experts: Vec<String>,
    /// True when any selected expert timed out or hit an open circuit.
    pub partial: bool,
}

impl DispatchResult {
    /// One line per expert in merged order, for prompt composition and the
    /// template fallback.
    pub fn summary_lines(&self) -> Vec<String> {
        self.results.iter().map(|o| o.result.summary.clone()).collect()
    }
}

pub struct Dispatcher {
    experts: Vec<Arc<dyn Expert>>,
    logger: Arc<ActionLogger>,
    overall_deadline: Duration,
    expert_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        experts: Vec<Arc<dyn Expert>>,
        logger: Arc<ActionLogger>,
        config: &ExpertsConfig,
    ) -> Self {
        Self {
            experts,
            logger,
            overall_deadline: Duration::from_millis(config.parallel_deadline_ms),
            expert_deadline: Duration::from_millis(config.expert_deadline_ms),
        }
    }

    pub fn descriptors(&self) -> Vec<crate::ExpertDescriptor> {
        self.experts.iter().map(|e| e.descriptor()).collect()
    }

    /// Score a query against one expert without executing it (debug surface).
    pub fn probe(&self, name: &str, query: &str) -> Option<f32> {
        self.experts
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.can_handle(query))
    }

    /// Deterministic selection: threshold filter, exclusive-winner rule,
    /// stable (score desc, name asc) ordering.
    fn select(&self, query: &str) -> Vec<(Arc<dyn Expert>, f32)> {
        let mut scored: Vec<(Arc<dyn Expert>, f32)> = self
            .experts
            .iter()
            .map(|e| (e.clone(), e.can_handle(query)))
            .filter(|(_, score)| *score >= THETA_SELECT)
            .collect();

        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.0.name().cmp(b.0.name()))
        });

        if scored.len() > 1
            && scored[0].1 >= THETA_EXCLUSIVE
            && scored[1].1 < THETA_EXCLUSIVE - EXCLUSIVE_MARGIN
        {
            scored.truncate(1);
        }
        scored
    }

    /// Execute the selected experts in parallel and aggregate the outcomes.
    /// Never returns an error: failures are folded into the result.
    pub async fn dispatch(&self, query: &str, ctx: &TurnContext) -> DispatchResult {
        let selected = self.select(query);
        if selected.is_empty() {
            debug!(user_id = %ctx.user_id, "no expert selected");
            return DispatchResult::default();
        }

        info!(
            user_id = %ctx.user_id,
            experts = ?selected.iter().map(|(e, s)| (e.name(), *s)).collect::<Vec<_>>(),
            "dispatching experts"
        );

        let deadline = Instant::now() + self.overall_deadline;
        let handles: Vec<_> = selected
            .iter()
            .map(|(expert, score)| {
                let expert = expert.clone();
                let score = *score;
                let query = query.to_string();
                let ctx = ctx.clone();
                let per_expert = self.expert_deadline;
                tokio::spawn(async move {
                    let result = tokio::select! {
                        // Cancellation wins over a slow expert; in-flight HTTP
                        // futures are dropped with the execute future.
                        _ = ctx.cancel.cancelled() => ActionResult::failed(
                            ErrorKind::Cancelled,
                            format!("{} was cancelled", expert.name()),
                        ),
                        r = timeout(per_expert, expert.execute(&query, &ctx)) => match r {
                            Ok(result) => result,
                            Err(_) => ActionResult::failed(
                                ErrorKind::Timeout { ms: per_expert.as_millis() as u64 },
                                format!("{} timed out", expert.name()),
                            ),
                        },
                    };
                    ExpertOutcome {
                        expert: expert.name().to_string(),
                        score,
                        result,
                    }
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (handle, (expert, score)) in handles.into_iter().zip(selected.iter()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match timeout(remaining, handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_err)) => {
                    warn!(expert = expert.name(), "expert task failed: {join_err}");
                    ExpertOutcome {
                        expert: expert.name().to_string(),
                        score: *score,
                        result: ActionResult::failed(
                            ErrorKind::Internal(join_err.to_string()),
                            format!("{} failed unexpectedly", expert.name()),
                        ),
                    }
                }
                Err(_) => ExpertOutcome {
                    expert: expert.name().to_string(),
                    score: *score,
                    result: ActionResult::failed(
                        ErrorKind::Timeout {
                            ms: self.overall_deadline.as_millis() as u64,
                        },
                        format!("{} hit the dispatch deadline", expert.name()),
                    ),
                },
            };
            self.log_outcome(&outcome, ctx);
            outcomes.push(outcome);
        }

        // Merge order is stable regardless of completion order.
        outcomes.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.expert.cmp(&b.expert))
        });

        let executed_experts: Vec<String> = outcomes
            .iter()
            .filter(|o| o.result.success)
            .map(|o| o.expert.clone())
            .collect();
        let partial = outcomes.iter().any(|o| {
            o.result
                .error
                .as_ref()
                .map(|e| e.marks_partial())
                .unwrap_or(false)
        });

        DispatchResult {
            results: outcomes,
            executed_experts,
            partial,
        }
    }

    /// One action-log row per collaborator operation; experts that performed
    /// none still get a single row for the execution itself.
    fn log_outcome(&self, outcome: &ExpertOutcome, ctx: &TurnContext) {
        let context = json!({
            "expert": outcome.expert,
            "correlation_id": ctx.correlation_id,
            "error": outcome.result.error.as_ref().map(|e| e.code()),
        });

        if outcome.result.actions.is_empty() {
            self.logger.log(
                &ctx.user_id,
                &format!("{}.execute", outcome.expert),
                json!({}),
                outcome.result.success,
                context,
                Some(&ctx.session.session_id),
            );
            return;
        }

        for action in &outcome.result.actions {
            self.logger.log(
                &ctx.user_id,
                &action.tool_name,
                action.params.clone(),
                action.success,
                context.clone(),
                Some(&ctx.session.session_id),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionRecord, ExpertDescriptor};
    use async_trait::async_trait;
    use maia_core::types::Session;
    use rusqlite::Connection;

    struct StubExpert {
        name: &'static str,
        score: f32,
        result: ActionResult,
        delay: Option<Duration>,
    }

    impl StubExpert {
        fn ok(name: &'static str, score: f32) -> Arc<Self> {
            Arc::new(Self {
                name,
                score,
                result: ActionResult::ok(format!("{name} done"))
                    .with_action(ActionRecord::ok(format!("{name}.run"), json!({}))),
                delay: None,
            })
        }

        fn failing(name: &'static str, score: f32, error: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                name,
                score,
                result: ActionResult::failed(error, format!("{name} failed")),
                delay: None,
            })
        }

        fn slow(name: &'static str, score: f32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                score,
                result: ActionResult::ok(format!("{name} done")),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl Expert for StubExpert {
        fn name(&self) -> &'static str {
            self.name
        }
        fn descriptor(&self) -> ExpertDescriptor {
            ExpertDescriptor {
                name: self.name,
                capabilities: vec![],
                pattern_hints: vec![],
                default_confidence: self.score,
            }
        }
        fn can_handle(&self, _query: &str) -> f32 {
            self.score
        }
        async fn execute(&self, _query: &str, _ctx: &TurnContext) -> ActionResult {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        }
    }

    fn dispatcher(experts: Vec<Arc<dyn Expert>>) -> Dispatcher {
        let logger = Arc::new(ActionLogger::new(Connection::open_in_memory().unwrap()).unwrap());
        Dispatcher::new(experts, logger, &ExpertsConfig::default())
    }

    fn ctx() -> TurnContext {
        TurnContext::new(Session::local_dev_default(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn empty_selection_returns_empty_dispatch() {
        let d = dispatcher(vec![StubExpert::ok("list", 0.2)]);
        let result = d.dispatch("hello there", &ctx()).await;
        assert!(result.results.is_empty());
        assert!(result.executed_experts.is_empty());
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn clear_winner_runs_alone() {
        let d = dispatcher(vec![
            StubExpert::ok("list", 0.92),
            StubExpert::ok("reminder", 0.55),
        ]);
        let result = d.dispatch("add milk", &ctx()).await;
        assert_eq!(result.executed_experts, vec!["list"]);
        assert_eq!(result.results.len(), 1);
    }

    #[tokio::test]
    async fn close_scores_fan_out() {
        let d = dispatcher(vec![
            StubExpert::ok("list", 0.92),
            StubExpert::ok("reminder", 0.9),
        ]);
        let result = d.dispatch("add and remind", &ctx()).await;
        assert_eq!(result.results.len(), 2);
        assert!(result.executed_experts.contains(&"list".to_string()));
        assert!(result.executed_experts.contains(&"reminder".to_string()));
    }

    #[tokio::test]
    async fn merge_order_is_score_then_name() {
        let d = dispatcher(vec![
            StubExpert::ok("zeta", 0.8),
            StubExpert::ok("alpha", 0.8),
            StubExpert::ok("mid", 0.82),
        ]);
        let result = d.dispatch("anything", &ctx()).await;
        let order: Vec<&str> = result.results.iter().map(|o| o.expert.as_str()).collect();
        assert_eq!(order, vec!["mid", "alpha", "zeta"]);
    }

    #[tokio::test]
    async fn one_failure_never_fails_the_dispatch() {
        let d = dispatcher(vec![
            StubExpert::ok("list", 0.9),
            StubExpert::failing(
                "calendar",
                0.88,
                ErrorKind::CircuitOpen {
                    service: "calendar".into(),
                },
            ),
        ]);
        let result = d.dispatch("add and schedule", &ctx()).await;
        assert_eq!(result.executed_experts, vec!["list"]);
        assert!(result.partial);
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn invalid_errors_do_not_mark_partial() {
        let d = dispatcher(vec![StubExpert::failing(
            "list",
            0.9,
            ErrorKind::Invalid("bad".into()),
        )]);
        let result = d.dispatch("add", &ctx()).await;
        assert!(!result.partial);
        assert!(result.executed_experts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_expert_times_out_and_marks_partial() {
        let d = dispatcher(vec![
            StubExpert::ok("list", 0.9),
            StubExpert::slow("reminder", 0.9, Duration::from_secs(60)),
        ]);
        let result = d.dispatch("add and remind", &ctx()).await;
        assert_eq!(result.executed_experts, vec!["list"]);
        assert!(result.partial);
        let timed_out = result
            .results
            .iter()
            .find(|o| o.expert == "reminder")
            .unwrap();
        assert!(matches!(
            timed_out.result.error,
            Some(ErrorKind::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_experts_promptly() {
        let d = dispatcher(vec![StubExpert::slow(
            "list",
            0.9,
            Duration::from_secs(60),
        )]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let result = d.dispatch("add milk", &ctx).await;
        assert!(matches!(
            result.results[0].result.error,
            Some(ErrorKind::Cancelled)
        ));
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn every_execution_is_action_logged() {
        let logger = Arc::new(ActionLogger::new(Connection::open_in_memory().unwrap()).unwrap());
        let experts: Vec<Arc<dyn Expert>> = vec![
            StubExpert::ok("list", 0.9),
            StubExpert::failing("calendar", 0.88, ErrorKind::Unavailable("503".into())),
        ];
        let d = Dispatcher::new(experts, logger.clone(), &ExpertsConfig::default());
        let ctx = ctx();
        d.dispatch("add and schedule", &ctx).await;

        let rows = logger.recent(&ctx.user_id, None, 10).unwrap();
        assert_eq!(rows.len(), 2);
        let failed: Vec<_> = rows.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].tool_name, "calendar.execute");
    }

    #[tokio::test]
    async fn probe_scores_without_executing() {
        let d = dispatcher(vec![StubExpert::ok("list", 0.7)]);
        assert_eq!(d.probe("list", "anything"), Some(0.7));
        assert_eq!(d.probe("ghost", "anything"), None);
    }
}
