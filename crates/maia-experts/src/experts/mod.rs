//! The built-in experts. Each one recognizes a class of user intents with
//! pure pattern scoring and acts on it through exactly one downstream
//! collaborator (or none, for the pure planning expert).

pub mod birthday;
pub mod calendar;
pub mod homeassistant;
pub mod journal;
pub mod list;
pub mod memory;
pub mod planning;
pub mod reminder;

use std::sync::LazyLock;

use regex::Regex;

static ADD_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:add|put)\s+(.+?)\s+(?:to|on)\s+(?:my|the)\b").expect("static regex")
});
static SCHEDULE_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:schedule|book)\s+(?:a|an|the)\s+(.+?)(?:\s+(?:tomorrow|today|at|on|for)\b|$)")
        .expect("static regex")
});
static PRONOUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:it|them|that|those)\b").expect("static regex"));

pub(crate) fn is_pronoun(s: &str) -> bool {
    matches!(
        s.to_lowercase().as_str(),
        "it" | "them" | "that" | "this" | "those"
    )
}

/// Best non-pronoun noun phrase a dangling "it"/"them" in a compound query
/// could refer to: the added items or the scheduled title.
pub(crate) fn pronoun_referent(query: &str) -> Option<String> {
    if let Some(caps) = ADD_PHRASE_RE.captures(query) {
        let candidate = clean_text(&caps[1], 200);
        if !candidate.is_empty() && !is_pronoun(&candidate) {
            return Some(candidate);
        }
    }
    if let Some(caps) = SCHEDULE_PHRASE_RE.captures(query) {
        let candidate = clean_text(&caps[1], 200);
        if !candidate.is_empty() && !is_pronoun(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Replace standalone pronouns in `text` with the referent found elsewhere in
/// the full query ("buy them" → "buy bananas"). Leaves `text` untouched when
/// no referent exists.
pub(crate) fn replace_pronouns(text: &str, query: &str) -> String {
    if !PRONOUN_RE.is_match(text) {
        return text.to_string();
    }
    match pronoun_referent(query) {
        Some(referent) => PRONOUN_RE.replace_all(text, referent.as_str()).to_string(),
        None => text.to_string(),
    }
}

/// Shared confidence scoring: a strong phrase hit lands at 0.9 (nudged up
/// slightly per additional weak hit); weak hits alone reach at most 0.6,
/// below the exclusive threshold but above selection when two hits stack.
pub(crate) fn keyword_score(lower: &str, strong: &[&str], weak: &[&str]) -> f32 {
    let weak_hits = weak.iter().filter(|p| lower.contains(*p)).count() as f32;
    if strong.iter().any(|p| lower.contains(p)) {
        (0.9 + weak_hits * 0.02).min(1.0)
    } else {
        (weak_hits * 0.3).min(0.6)
    }
}

/// Trim and length-cap a free-text field before it is sent downstream.
pub(crate) fn clean_text(raw: &str, max_len: usize) -> String {
    let trimmed = raw.trim();
    let mut out: String = trimmed.chars().take(max_len).collect();
    if let Some(stripped) = out.strip_suffix(['.', '!', '?']) {
        out = stripped.to_string();
    }
    out
}
