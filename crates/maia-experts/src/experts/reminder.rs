//! `reminder` expert: creates and lists reminders via the reminders router.
//! The router computes `reminder_time` from the `(due_date, due_time)` pair.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_outbound::{OutboundClient, Service};

use crate::experts::{clean_text, keyword_score, replace_pronouns};
use crate::timeparse::extract_when;
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &["remind me", "reminder", "don't forget to", "dont forget to"];
const WEAK: &[&str] = &["remind", "alert me", "notify me"];

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bremind me\s+(?:to\s+)?(.+?)(?:\s+(?:tomorrow|today|tonight|at|on|in the)\b|$)")
        .expect("static regex")
});

pub struct ReminderExpert {
    outbound: Arc<OutboundClient>,
}

impl ReminderExpert {
    pub fn new(outbound: Arc<OutboundClient>) -> Self {
        Self { outbound }
    }

    fn extract_title(query: &str) -> Option<String> {
        let raw = TITLE_RE.captures(query).map(|caps| caps[1].to_string())?;
        let title = clean_text(&replace_pronouns(&raw, query), 200);
        if title.is_empty() {
            None
        } else {
            Some(title)
        }
    }
}

#[async_trait]
impl Expert for ReminderExpert {
    fn name(&self) -> &'static str {
        "reminder"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "reminder",
            capabilities: vec!["reminder.create", "reminder.list"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.9,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        let lower = query.to_lowercase();

        if lower.contains("what reminders") || lower.contains("my reminders") {
            let path = format!("/api/reminders?user_id={}", ctx.user_id);
            return match self.outbound.get(Service::Reminders, &path).await {
                Ok(body) => ActionResult::ok("Here are your reminders")
                    .with_artifact(body)
                    .with_action(ActionRecord::ok("reminder.list", json!({}))),
                Err(e) => ActionResult::failed(e, "Couldn't fetch your reminders right now")
                    .with_action(ActionRecord::failed("reminder.list", json!({}))),
            };
        }

        let Some(title) = Self::extract_title(query) else {
            return ActionResult::failed(
                ErrorKind::Invalid("missing reminder text".to_string()),
                "I couldn't tell what to remind you about",
            );
        };

        // A reminder without a point in time is invalid, never guessed at.
        let Some(when) = extract_when(query, Utc::now()) else {
            return ActionResult::failed(
                ErrorKind::Invalid("missing reminder time".to_string()),
                format!("When should I remind you to {title}?"),
            );
        };

        let body = json!({
            "title": title,
            "user_id": ctx.user_id,
            "due_date": when.date_string(),
            "due_time": when.time_string(),
            "reminder_type": "once",
            "category": "general",
            "priority": "medium",
        });

        match self
            .outbound
            .post(Service::Reminders, "/api/reminders", body.clone())
            .await
        {
            Ok(resp) => ActionResult::ok(format!(
                "Set a reminder to {title} on {} at {}",
                when.date_string(),
                when.time_string()
            ))
            .with_artifact(json!({ "reminder": resp }))
            .with_action(ActionRecord::ok("reminder.create", body))
            .with_side_effects(),
            Err(e) => ActionResult::failed(
                e,
                format!("Couldn't set the reminder to {title}"),
            )
            .with_action(ActionRecord::failed("reminder.create", body)),
        }
    }
}
