//! End-to-end dispatch scenarios over the real experts, with the sibling
//! routers simulated at the transport layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use maia_core::config::{BreakerConfig, ExpertsConfig, EpisodeConfig, ServicesConfig};
use maia_core::error::ErrorKind;
use maia_core::types::{Session, TurnContext};
use maia_experts::{builtin_experts, ActionLogger, Dispatcher, ExpertDeps};
use maia_memory::MemoryManager;
use maia_outbound::{
    Method, OutboundClient, ServiceEndpoints, Transport, TransportError, TransportResponse,
};

/// Simulates the downstream CRUD routers: records every call and answers 200,
/// except for paths listed as failing (which answer 503).
struct RouterSim {
    calls: Mutex<Vec<(Method, String, Option<Value>)>>,
    failing_paths: Mutex<Vec<&'static str>>,
}

impl RouterSim {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failing_paths: Mutex::new(Vec::new()),
        })
    }

    fn fail_path(&self, fragment: &'static str) {
        self.failing_paths.lock().unwrap().push(fragment);
    }

    fn calls_to(&self, fragment: &str) -> Vec<(Method, String, Option<Value>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, url, _)| url.contains(fragment))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for RouterSim {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        _headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((method, url.to_string(), body.cloned()));

        let failing = self
            .failing_paths
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| url.contains(fragment));
        Ok(TransportResponse {
            status: if failing { 503 } else { 200 },
            body: json!({ "ok": !failing }),
        })
    }
}

struct Harness {
    sim: Arc<RouterSim>,
    outbound: Arc<OutboundClient>,
    logger: Arc<ActionLogger>,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let sim = RouterSim::new();
    let outbound = Arc::new(OutboundClient::new(
        sim.clone(),
        ServiceEndpoints::from_config(&ServicesConfig::default(), None),
        &BreakerConfig::default(),
    ));
    let memory = Arc::new(
        MemoryManager::new(
            rusqlite::Connection::open_in_memory().unwrap(),
            EpisodeConfig::default(),
        )
        .unwrap(),
    );
    let logger = Arc::new(
        ActionLogger::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap(),
    );
    let experts = builtin_experts(&ExpertDeps {
        outbound: outbound.clone(),
        memory,
    });
    let dispatcher = Dispatcher::new(experts, logger.clone(), &ExpertsConfig::default());
    Harness {
        sim,
        outbound,
        logger,
        dispatcher,
    }
}

fn ctx() -> TurnContext {
    TurnContext::new(Session::local_dev_default(), Duration::from_secs(30))
}

#[tokio::test]
async fn shopping_add_hits_the_lists_router_per_item() {
    let h = harness();
    let ctx = ctx();
    let result = h
        .dispatcher
        .dispatch("Add milk and eggs to my shopping list", &ctx)
        .await;

    assert_eq!(result.executed_experts, vec!["list"]);
    assert!(!result.partial);

    let posts = h.sim.calls_to("/api/lists/shopping/items");
    assert_eq!(posts.len(), 2);
    let bodies: Vec<String> = posts
        .iter()
        .map(|(_, _, body)| body.as_ref().unwrap()["text"].as_str().unwrap().to_string())
        .collect();
    assert!(bodies.contains(&"milk".to_string()));
    assert!(bodies.contains(&"eggs".to_string()));

    let summary = &result.results[0].result.summary;
    assert!(summary.contains("milk") && summary.contains("eggs"));

    let rows = h.logger.recent(&ctx.user_id, None, 10).unwrap();
    let adds: Vec<_> = rows.iter().filter(|r| r.tool_name == "list.add").collect();
    assert_eq!(adds.len(), 2);
    assert!(adds.iter().all(|r| r.success));
}

#[tokio::test]
async fn multi_expert_fan_out_adds_and_reminds() {
    let h = harness();
    let ctx = ctx();
    let result = h
        .dispatcher
        .dispatch(
            "Add bananas to my shopping list and remind me to buy them tomorrow at 9am",
            &ctx,
        )
        .await;

    assert!(result.executed_experts.contains(&"list".to_string()));
    assert!(result.executed_experts.contains(&"reminder".to_string()));
    assert!(!result.partial);

    let list_posts = h.sim.calls_to("/api/lists/shopping/items");
    assert_eq!(list_posts.len(), 1);
    assert_eq!(list_posts[0].2.as_ref().unwrap()["text"], "bananas");

    let reminder_posts = h.sim.calls_to("/api/reminders");
    assert_eq!(reminder_posts.len(), 1);
    let body = reminder_posts[0].2.as_ref().unwrap();
    assert_eq!(body["title"], "buy bananas");
    assert_eq!(body["due_time"], "09:00:00");
    let tomorrow = (Utc::now() + ChronoDuration::days(1))
        .date_naive()
        .format("%Y-%m-%d")
        .to_string();
    assert_eq!(body["due_date"], tomorrow.as_str());
}

#[tokio::test]
async fn device_command_infers_the_entity_id() {
    let h = harness();
    let result = h
        .dispatcher
        .dispatch("Turn on the living room lights", &ctx())
        .await;

    assert_eq!(result.executed_experts, vec!["homeassistant"]);
    let calls = h.sim.calls_to("/api/homeassistant/service");
    assert_eq!(calls.len(), 1);
    let body = calls[0].2.as_ref().unwrap();
    assert_eq!(body["service"], "light.turn_on");
    assert_eq!(body["entity_id"], "light.living_room");
    assert!(result.results[0].result.summary.contains("Living Room"));
}

#[tokio::test]
async fn open_calendar_circuit_yields_partial_without_losing_the_list_add() {
    let h = harness();
    let ctx = ctx();
    h.sim.fail_path("/api/calendar/");

    // Five consecutive failures open the calendar circuit.
    for _ in 0..5 {
        let _ = h
            .outbound
            .post(
                maia_outbound::Service::Calendar,
                "/api/calendar/events",
                json!({"title": "warm-up"}),
            )
            .await;
    }
    assert!(h.outbound.breaker().is_open("calendar"));
    let calls_before = h.sim.calls_to("/api/calendar/").len();

    let result = h
        .dispatcher
        .dispatch("Schedule a meeting tomorrow at 2pm and add it to my list", &ctx)
        .await;

    // The list add went through; the calendar was answered from the open
    // circuit without a row ever reaching the router.
    assert_eq!(result.executed_experts, vec!["list"]);
    assert!(result.partial);
    assert_eq!(h.sim.calls_to("/api/calendar/").len(), calls_before);

    let calendar_outcome = result
        .results
        .iter()
        .find(|o| o.expert == "calendar")
        .unwrap();
    assert!(matches!(
        calendar_outcome.result.error,
        Some(ErrorKind::CircuitOpen { .. })
    ));

    let rows = h.logger.recent(&ctx.user_id, None, 20).unwrap();
    assert!(rows.iter().any(|r| r.tool_name == "list.add" && r.success));
    assert!(rows
        .iter()
        .any(|r| r.tool_name == "calendar.create" && !r.success));
}

#[tokio::test]
async fn conversational_queries_select_no_expert() {
    let h = harness();
    let result = h.dispatcher.dispatch("how are you today?", &ctx()).await;
    assert!(result.results.is_empty());
    assert!(h.sim.calls.lock().unwrap().is_empty());
}
