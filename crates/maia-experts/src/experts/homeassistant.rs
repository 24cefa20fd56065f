//! `homeassistant` expert: device control through the Home-Assistant bridge.
//! Entity ids are inferred as `domain.slug(name)`.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_outbound::{OutboundClient, Service};

use crate::experts::keyword_score;
use crate::timeparse::slugify;
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &[
    "turn on",
    "turn off",
    "switch on",
    "switch off",
    "lights on",
    "lights off",
    "set the thermostat",
];
const WEAK: &[&str] = &["lights", "light", "thermostat", "fan", "dim"];

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:turn|switch)\s+(on|off)\s+(?:the\s+)?(.+?)\s*(lights?|lamps?|switch|plug|outlet|fans?|thermostat|heating)?\s*$",
    )
    .expect("static regex")
});

/// Device noun → Home-Assistant domain.
fn domain_for(noun: Option<&str>) -> &'static str {
    match noun.map(|n| n.to_lowercase()) {
        Some(n) if n.starts_with("lamp") || n.starts_with("light") => "light",
        Some(n) if n.starts_with("fan") => "fan",
        Some(n) if n == "thermostat" || n == "heating" => "climate",
        Some(n) if n == "switch" || n == "plug" || n == "outlet" => "switch",
        _ => "light",
    }
}

fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct HomeAssistantExpert {
    outbound: Arc<OutboundClient>,
}

impl HomeAssistantExpert {
    pub fn new(outbound: Arc<OutboundClient>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl Expert for HomeAssistantExpert {
    fn name(&self) -> &'static str {
        "homeassistant"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "homeassistant",
            capabilities: vec!["homeassistant.call_service"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.85,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, _ctx: &TurnContext) -> ActionResult {
        let Some(caps) = COMMAND_RE.captures(query.trim()) else {
            return ActionResult::failed(
                ErrorKind::Invalid("unrecognized device command".to_string()),
                "I couldn't tell which device to control",
            );
        };

        let action = caps[1].to_lowercase();
        let name = caps[2].trim().to_string();
        let noun = caps.get(3).map(|m| m.as_str());

        // A bare device noun ("turn on the lights") names no particular
        // device; the lazy capture lands the noun in `name` in that case.
        let bare_noun = matches!(
            slugify(&name).as_str(),
            "light" | "lights" | "lamp" | "lamps" | "switch" | "plug" | "outlet" | "fan"
                | "fans" | "thermostat" | "heating"
        );

        let slug = slugify(&name);
        if slug.is_empty() || bare_noun {
            // "turn on the lights" with no room: too many candidates to pick one.
            return ActionResult::failed(
                ErrorKind::Ambiguous("device name is ambiguous".to_string()),
                "Which device? Name the room, e.g. \"living room lights\"",
            )
            .with_artifact(json!({
                "candidates": [],
                "hint": "include the room or device name",
            }));
        }

        let domain = domain_for(noun);
        let entity_id = format!("{domain}.{slug}");
        let service = format!("{domain}.turn_{action}");
        let body = json!({ "service": service, "entity_id": entity_id });

        match self
            .outbound
            .post(Service::Homeassistant, "/api/homeassistant/service", body.clone())
            .await
        {
            Ok(resp) => {
                let pretty = title_case(&name);
                let device = noun.map(|n| n.to_lowercase()).unwrap_or_default();
                let summary = if device.is_empty() {
                    format!("Turned {action} the {pretty}")
                } else {
                    format!("Turned {action} the {pretty} {device}")
                };
                ActionResult::ok(summary)
                    .with_artifact(json!({ "entity_id": entity_id, "response": resp }))
                    .with_action(ActionRecord::ok("homeassistant.call_service", body))
                    .with_side_effects()
            }
            Err(e) => ActionResult::failed(
                e,
                format!("Couldn't reach the device controller for the {name}"),
            )
            .with_action(ActionRecord::failed("homeassistant.call_service", body)),
        }
    }
}
