//! `birthday` expert: stores a person fact and puts the next occurrence of
//! the birthday on the calendar.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_memory::{MemoryManager, SubjectKind};
use maia_outbound::{OutboundClient, Service};

use crate::experts::keyword_score;
use crate::timeparse::slugify;
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &["birthday"];
const WEAK: &[&str] = &["born on", "turns"];

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z]+)'s\s+birthday|\bbirthday\s+for\s+([a-z]+)\b")
        .expect("static regex")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{1,2})\b",
    )
    .expect("static regex")
});

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: &[&str] = &[
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

/// Next occurrence of `(month, day)` on or after `today`.
fn next_occurrence(month: u32, day: u32, today: NaiveDate) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(today.year(), month, day);
    match this_year {
        Some(d) if d >= today => Some(d),
        _ => NaiveDate::from_ymd_opt(today.year() + 1, month, day),
    }
}

pub struct BirthdayExpert {
    outbound: Arc<OutboundClient>,
    memory: Arc<MemoryManager>,
}

impl BirthdayExpert {
    pub fn new(outbound: Arc<OutboundClient>, memory: Arc<MemoryManager>) -> Self {
        Self { outbound, memory }
    }

    fn parse(query: &str) -> Option<(String, u32, u32)> {
        let name_caps = NAME_RE.captures(query)?;
        let name = name_caps
            .get(1)
            .or_else(|| name_caps.get(2))
            .map(|m| m.as_str().to_string())?;
        let date_caps = DATE_RE.captures(query)?;
        let month = month_number(&date_caps[1])?;
        let day: u32 = date_caps[2].parse().ok()?;
        if day == 0 || day > 31 {
            return None;
        }
        Some((name, month, day))
    }
}

#[async_trait]
impl Expert for BirthdayExpert {
    fn name(&self) -> &'static str {
        "birthday"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "birthday",
            capabilities: vec!["birthday.setup"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.9,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        let Some((name, month, day)) = Self::parse(query) else {
            return ActionResult::failed(
                ErrorKind::Invalid("missing name or date".to_string()),
                "Tell me whose birthday and the date, e.g. \"Sam's birthday is June 3\"",
            );
        };

        let pretty = {
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().to_string() + chars.as_str(),
                None => name.clone(),
            }
        };

        let mut result_actions = Vec::new();
        let mut artifacts = Vec::new();
        let mut first_error: Option<ErrorKind> = None;

        // The durable half: a person fact that survives calendar churn.
        let fact_text = format!("{pretty}'s birthday is {}/{:02}", month, day);
        match self.memory.remember_fact(
            &ctx.user_id,
            SubjectKind::Person,
            Some(&slugify(&name)),
            &fact_text,
            8.0,
        ) {
            Ok(fact_id) => {
                result_actions.push(ActionRecord::ok(
                    "birthday.remember",
                    json!({ "person": pretty, "text": fact_text }),
                ));
                artifacts.push(json!({ "fact_id": fact_id }));
            }
            Err(e) => {
                result_actions.push(ActionRecord::failed(
                    "birthday.remember",
                    json!({ "person": pretty }),
                ));
                first_error = Some(ErrorKind::from(e));
            }
        }

        // The visible half: the next occurrence on the calendar.
        let today = Utc::now().date_naive();
        let event_created = match next_occurrence(month, day, today) {
            Some(date) => {
                let body = json!({
                    "title": format!("{pretty}'s birthday"),
                    "user_id": ctx.user_id,
                    "start_date": date.format("%Y-%m-%d").to_string(),
                    "category": "birthday",
                });
                match self
                    .outbound
                    .post(Service::Calendar, "/api/calendar/events", body.clone())
                    .await
                {
                    Ok(resp) => {
                        result_actions.push(ActionRecord::ok("birthday.calendar", body));
                        artifacts.push(json!({ "event": resp }));
                        true
                    }
                    Err(e) => {
                        result_actions.push(ActionRecord::failed("birthday.calendar", body));
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        false
                    }
                }
            }
            None => {
                if first_error.is_none() {
                    first_error = Some(ErrorKind::Invalid(format!(
                        "no such date: month {month} day {day}"
                    )));
                }
                false
            }
        };

        let summary = if event_created {
            format!("Saved {pretty}'s birthday and added it to your calendar")
        } else {
            format!("Saved {pretty}'s birthday, but couldn't update the calendar")
        };

        ActionResult {
            success: first_error.is_none(),
            summary,
            artifacts,
            caused_side_effects: event_created,
            error: first_error,
            actions: result_actions,
        }
    }
}
