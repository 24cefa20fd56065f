//! `list` expert: shopping and todo list CRUD via the lists router.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_outbound::{OutboundClient, Service};

use crate::experts::{clean_text, keyword_score};
use crate::timeparse::slugify;
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &[
    "shopping list",
    "grocery list",
    "groceries list",
    "todo list",
    "to-do list",
    "to my list",
    "on my list",
    "from my list",
    "off my list",
];
const WEAK: &[&str] = &["list", "buy", "shopping"];

static ADD_ITEMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:add|put|need)\s+(.+?)\s+(?:to|on)\s+(?:my|the)\b").expect("static regex")
});
static REMOVE_ITEMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:remove|delete|take)\s+(.+?)\s+(?:from|off)\s+(?:my|the)\b")
        .expect("static regex")
});
static QUANTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(.+)$").expect("static regex"));

pub struct ListExpert {
    outbound: Arc<OutboundClient>,
}

impl ListExpert {
    pub fn new(outbound: Arc<OutboundClient>) -> Self {
        Self { outbound }
    }

    fn list_type(lower: &str) -> &'static str {
        if lower.contains("todo") || lower.contains("to-do") {
            "todo"
        } else {
            "shopping"
        }
    }

    /// "milk and eggs" / "milk, eggs and bread" → ["milk", "eggs", "bread"].
    fn split_items(raw: &str) -> Vec<String> {
        raw.split(',')
            .flat_map(|part| part.split(" and "))
            .map(|item| clean_text(item, 200))
            .filter(|item| !item.is_empty())
            .collect()
    }

    async fn add_items(&self, items: Vec<String>, list_type: &str, ctx: &TurnContext) -> ActionResult {
        let mut added = Vec::new();
        let mut actions = Vec::new();
        let mut artifacts = Vec::new();
        let mut first_error: Option<ErrorKind> = None;

        for item in items {
            let (text, quantity) = match QUANTITY_RE.captures(&item) {
                Some(caps) => (
                    caps[2].to_string(),
                    caps[1].parse::<u32>().ok(),
                ),
                None => (item.clone(), None),
            };
            let mut body = json!({ "text": text, "user_id": ctx.user_id });
            if let Some(q) = quantity {
                body["quantity"] = json!(q);
            }
            let path = format!("/api/lists/{list_type}/items");

            match self.outbound.post(Service::Lists, &path, body.clone()).await {
                Ok(resp) => {
                    actions.push(ActionRecord::ok("list.add", body));
                    artifacts.push(json!({ "item": text, "response": resp }));
                    added.push(text);
                }
                Err(e) => {
                    actions.push(ActionRecord::failed("list.add", body));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let summary = if added.is_empty() {
            format!("Couldn't update your {list_type} list")
        } else {
            format!("Added {} to your {list_type} list", join_names(&added))
        };

        ActionResult {
            success: first_error.is_none() && !added.is_empty(),
            summary,
            artifacts,
            caused_side_effects: !added.is_empty(),
            error: first_error,
            actions,
        }
    }

    async fn remove_items(
        &self,
        items: Vec<String>,
        list_type: &str,
        _ctx: &TurnContext,
    ) -> ActionResult {
        let mut removed = Vec::new();
        let mut actions = Vec::new();
        let mut first_error: Option<ErrorKind> = None;

        for item in items {
            let path = format!("/api/lists/{list_type}/items/{}", slugify(&item));
            match self.outbound.delete(Service::Lists, &path).await {
                Ok(_) => {
                    actions.push(ActionRecord::ok("list.remove", json!({ "text": item })));
                    removed.push(item);
                }
                Err(e) => {
                    actions.push(ActionRecord::failed("list.remove", json!({ "text": item })));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let summary = if removed.is_empty() {
            format!("Couldn't remove anything from your {list_type} list")
        } else {
            format!("Removed {} from your {list_type} list", join_names(&removed))
        };

        ActionResult {
            success: first_error.is_none() && !removed.is_empty(),
            summary,
            artifacts: Vec::new(),
            caused_side_effects: !removed.is_empty(),
            error: first_error,
            actions,
        }
    }

    async fn show_list(&self, list_type: &str, ctx: &TurnContext) -> ActionResult {
        let path = format!("/api/lists/{list_type}?user_id={}", ctx.user_id);
        match self.outbound.get(Service::Lists, &path).await {
            Ok(body) => {
                let count = body
                    .get("items")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                ActionResult::ok(format!("Your {list_type} list has {count} item(s)"))
                    .with_artifact(body)
                    .with_action(ActionRecord::ok("list.show", json!({ "type": list_type })))
            }
            Err(e) => ActionResult::failed(
                e,
                format!("Couldn't read your {list_type} list right now"),
            )
            .with_action(ActionRecord::failed("list.show", json!({ "type": list_type }))),
        }
    }
}

fn join_names(names: &[String]) -> String {
    match names.len() {
        0 => String::new(),
        1 => names[0].clone(),
        _ => format!(
            "{} and {}",
            names[..names.len() - 1].join(", "),
            names[names.len() - 1]
        ),
    }
}

#[async_trait]
impl Expert for ListExpert {
    fn name(&self) -> &'static str {
        "list"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "list",
            capabilities: vec!["list.add", "list.remove", "list.show"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.9,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        let lower = query.to_lowercase();
        let list_type = Self::list_type(&lower);

        if let Some(caps) = REMOVE_ITEMS_RE.captures(query) {
            let items = Self::split_items(&caps[1]);
            if items.is_empty() {
                return ActionResult::failed(
                    ErrorKind::Invalid("no items to remove".to_string()),
                    "I couldn't tell which items to remove",
                );
            }
            return self.remove_items(items, list_type, ctx).await;
        }

        if let Some(caps) = ADD_ITEMS_RE.captures(query) {
            let items: Vec<String> = Self::split_items(&caps[1])
                .into_iter()
                .map(|item| crate::experts::replace_pronouns(&item, query))
                .collect();
            if items.is_empty() {
                return ActionResult::failed(
                    ErrorKind::Invalid("no items to add".to_string()),
                    "I couldn't tell which items to add",
                );
            }
            return self.add_items(items, list_type, ctx).await;
        }

        if lower.contains("show") || lower.contains("what's on") || lower.contains("what is on") {
            return self.show_list(list_type, ctx).await;
        }

        ActionResult::failed(
            ErrorKind::Invalid("unrecognized list request".to_string()),
            "I couldn't work out what to do with your list",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_shopping_list_queries_high() {
        let expert = test_expert();
        assert!(expert.can_handle("Add milk and eggs to my shopping list") >= 0.9);
        assert!(expert.can_handle("remove bread from my todo list") >= 0.9);
        assert!(expert.can_handle("turn on the lights") < 0.5);
    }

    #[test]
    fn can_handle_is_pure() {
        let expert = test_expert();
        let q = "Add milk to my shopping list";
        let first = expert.can_handle(q);
        assert_eq!(first, expert.can_handle(q));
        assert_eq!(first, expert.can_handle(q));
    }

    #[test]
    fn splits_items_on_and_and_commas() {
        assert_eq!(
            ListExpert::split_items("milk and eggs"),
            vec!["milk", "eggs"]
        );
        assert_eq!(
            ListExpert::split_items("milk, eggs and bread"),
            vec!["milk", "eggs", "bread"]
        );
    }

    #[test]
    fn extracts_items_from_add_phrase() {
        let caps = ADD_ITEMS_RE
            .captures("Add bananas to my shopping list")
            .unwrap();
        assert_eq!(&caps[1], "bananas");
    }

    #[test]
    fn detects_todo_lists() {
        assert_eq!(ListExpert::list_type("add x to my todo list"), "todo");
        assert_eq!(ListExpert::list_type("add x to my shopping list"), "shopping");
    }

    fn test_expert() -> ListExpert {
        use maia_core::config::{BreakerConfig, ServicesConfig};
        use maia_outbound::{HttpTransport, ServiceEndpoints};
        ListExpert::new(Arc::new(OutboundClient::new(
            Arc::new(HttpTransport::new()),
            ServiceEndpoints::from_config(&ServicesConfig::default(), None),
            &BreakerConfig::default(),
        )))
    }
}
