//! Expert routing & execution: the polymorphic `Expert` contract, the eight
//! built-in experts, the append-only action logger, and the dispatcher that
//! scores, selects, and runs experts in parallel for a single turn.

pub mod action_log;
pub mod dispatch;
pub mod experts;
pub mod timeparse;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_memory::MemoryManager;
use maia_outbound::OutboundClient;

pub use action_log::{ActionLogEntry, ActionLogger};
pub use dispatch::{DispatchResult, Dispatcher, ExpertOutcome};

/// Static description of an expert, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertDescriptor {
    pub name: &'static str,
    pub capabilities: Vec<&'static str>,
    pub pattern_hints: Vec<&'static str>,
    pub default_confidence: f32,
}

/// One collaborator operation performed while executing an expert.
/// The dispatcher writes exactly one action-log row per record.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub tool_name: String,
    pub params: Value,
    pub success: bool,
}

impl ActionRecord {
    pub fn ok(tool_name: impl Into<String>, params: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            success: true,
        }
    }

    pub fn failed(tool_name: impl Into<String>, params: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            success: false,
        }
    }
}

/// Outcome of executing one expert for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub success: bool,
    /// One-line, user-presentable summary of what happened.
    pub summary: String,
    /// Structured payloads (created rows, candidate lists, plans).
    pub artifacts: Vec<Value>,
    pub caused_side_effects: bool,
    pub error: Option<ErrorKind>,
    /// Collaborator operations performed, for the action log.
    pub actions: Vec<ActionRecord>,
}

impl ActionResult {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            artifacts: Vec::new(),
            caused_side_effects: false,
            error: None,
            actions: Vec::new(),
        }
    }

    pub fn failed(error: ErrorKind, summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            artifacts: Vec::new(),
            caused_side_effects: false,
            error: Some(error),
            actions: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Value) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_action(mut self, action: ActionRecord) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.caused_side_effects = true;
        self
    }
}

/// The polymorphic expert contract.
///
/// `can_handle` must be pure, deterministic, and fast (pattern work only):
/// it runs for every registered expert on every turn. `execute` performs the
/// actual work, reporting collaborator failures through `ActionResult.error`
/// rather than returning `Err`.
#[async_trait]
pub trait Expert: Send + Sync {
    fn name(&self) -> &'static str;

    fn descriptor(&self) -> ExpertDescriptor;

    /// Confidence in [0,1] that this expert should act on the query.
    fn can_handle(&self, query: &str) -> f32;

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult;
}

/// Shared dependencies handed to the built-in experts at registration.
#[derive(Clone)]
pub struct ExpertDeps {
    pub outbound: Arc<OutboundClient>,
    pub memory: Arc<MemoryManager>,
}

/// Compile-time registry: every built-in expert, assembled at process start.
/// No dynamic code loading.
pub fn builtin_experts(deps: &ExpertDeps) -> Vec<Arc<dyn Expert>> {
    vec![
        Arc::new(experts::list::ListExpert::new(deps.outbound.clone())),
        Arc::new(experts::calendar::CalendarExpert::new(deps.outbound.clone())),
        Arc::new(experts::reminder::ReminderExpert::new(deps.outbound.clone())),
        Arc::new(experts::journal::JournalExpert::new(deps.outbound.clone())),
        Arc::new(experts::memory::MemoryExpert::new(deps.memory.clone())),
        Arc::new(experts::planning::PlanningExpert::new()),
        Arc::new(experts::homeassistant::HomeAssistantExpert::new(
            deps.outbound.clone(),
        )),
        Arc::new(experts::birthday::BirthdayExpert::new(
            deps.outbound.clone(),
            deps.memory.clone(),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_result_builders_compose() {
        let r = ActionResult::ok("Added milk")
            .with_artifact(serde_json::json!({"item": "milk"}))
            .with_action(ActionRecord::ok("list.add", serde_json::json!({})))
            .with_side_effects();
        assert!(r.success);
        assert!(r.caused_side_effects);
        assert_eq!(r.actions.len(), 1);
        assert!(r.error.is_none());
    }
}
