//! `calendar` expert: event creation via the calendar router.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_outbound::{OutboundClient, Service};

use crate::experts::{clean_text, keyword_score};
use crate::timeparse::extract_when;
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &[
    "schedule",
    "meeting",
    "appointment",
    "calendar",
    "book a",
];
const WEAK: &[&str] = &["event", "plan for"];

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:schedule|book|add)\s+(?:a|an|the)?\s*(.+?)(?:\s+(?:tomorrow|today|tonight|at|on|for|with)\b|$)",
    )
    .expect("static regex")
});

pub struct CalendarExpert {
    outbound: Arc<OutboundClient>,
}

impl CalendarExpert {
    pub fn new(outbound: Arc<OutboundClient>) -> Self {
        Self { outbound }
    }

    fn extract_title(query: &str) -> Option<String> {
        let raw = TITLE_RE.captures(query).map(|caps| caps[1].to_string())?;
        let title = clean_text(&raw, 200);
        if title.is_empty() || crate::experts::is_pronoun(&title) {
            None
        } else {
            Some(title)
        }
    }
}

#[async_trait]
impl Expert for CalendarExpert {
    fn name(&self) -> &'static str {
        "calendar"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "calendar",
            capabilities: vec!["calendar.create", "calendar.list"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.85,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        let lower = query.to_lowercase();
        // "schedule" alone also fires for planning talk; require an object or
        // an explicit calendar word before full confidence.
        keyword_score(&lower, STRONG, WEAK)
    }

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        let lower = query.to_lowercase();

        if lower.contains("what's on my calendar") || lower.contains("my schedule") {
            let path = format!("/api/calendar/events?user_id={}", ctx.user_id);
            return match self.outbound.get(Service::Calendar, &path).await {
                Ok(body) => ActionResult::ok("Here's your calendar")
                    .with_artifact(body)
                    .with_action(ActionRecord::ok("calendar.list", json!({}))),
                Err(e) => ActionResult::failed(e, "Couldn't read your calendar right now")
                    .with_action(ActionRecord::failed("calendar.list", json!({}))),
            };
        }

        let Some(title) = Self::extract_title(query) else {
            return ActionResult::failed(
                ErrorKind::Invalid("missing event title".to_string()),
                "I couldn't tell what to put on your calendar",
            );
        };

        let Some(when) = extract_when(query, Utc::now()) else {
            return ActionResult::failed(
                ErrorKind::Invalid("missing event date".to_string()),
                format!("When should I schedule the {title}?"),
            );
        };

        let mut body = json!({
            "title": title,
            "user_id": ctx.user_id,
            "start_date": when.date_string(),
            "category": "general",
        });
        if when.time.is_some() {
            body["start_time"] = json!(when.time_string());
        }

        match self
            .outbound
            .post(Service::Calendar, "/api/calendar/events", body.clone())
            .await
        {
            Ok(resp) => {
                let at = match when.time {
                    Some(_) => format!("{} at {}", when.date_string(), when.time_string()),
                    None => when.date_string(),
                };
                ActionResult::ok(format!("Scheduled \"{title}\" for {at}"))
                    .with_artifact(json!({ "event": resp }))
                    .with_action(ActionRecord::ok("calendar.create", body))
                    .with_side_effects()
            }
            Err(e) => ActionResult::failed(
                e,
                format!("Couldn't reach the calendar to schedule \"{title}\""),
            )
            .with_action(ActionRecord::failed("calendar.create", body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_scheduling_queries_high() {
        assert!(keyword_score("schedule a meeting tomorrow at 2pm", STRONG, WEAK) >= 0.9);
        assert!(keyword_score("what kind of milk do i like", STRONG, WEAK) < 0.5);
    }

    #[test]
    fn extracts_event_title() {
        assert_eq!(
            CalendarExpert::extract_title("Schedule a meeting tomorrow at 2pm").as_deref(),
            Some("meeting")
        );
        assert_eq!(
            CalendarExpert::extract_title("book a dentist appointment on friday").as_deref(),
            Some("dentist appointment")
        );
    }

    #[test]
    fn pronoun_titles_are_rejected() {
        assert_eq!(
            CalendarExpert::extract_title("schedule it tomorrow"),
            None
        );
    }
}
