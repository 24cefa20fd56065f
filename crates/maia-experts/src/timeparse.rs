//! Natural-language time normalization shared by every expert.
//!
//! Accepted shapes: "3pm", "3 pm", "15:00", "3:30pm", the named times of day
//! ("morning" 09:00, "noon" 12:00, "evening" 19:00, "tonight" 20:00), and a
//! bare hour after "at"/"tomorrow"/"today" ("tomorrow 9"). "Tomorrow" is the
//! local date plus one day: UTC when the user's timezone is unknown.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use regex::Regex;

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}):(\d{2})\s*(am|pm)?\b").expect("static regex")
});
static HOUR_AMPM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})\s*(am|pm)\b").expect("static regex"));
static BARE_HOUR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:at|tomorrow|today)\s+(\d{1,2})\b").expect("static regex")
});

/// A resolved `(date, time?)` pair extracted from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedWhen {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

impl ParsedWhen {
    /// ISO `YYYY-MM-DD`.
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// ISO `HH:MM:SS`, defaulting to 09:00:00 when no time was given.
    pub fn time_string(&self) -> String {
        self.time
            .unwrap_or_else(|| NaiveTime::from_hms_opt(9, 0, 0).unwrap())
            .format("%H:%M:%S")
            .to_string()
    }
}

/// Extract a date/time reference from free text, relative to `now`.
/// Returns `None` when the query carries no temporal phrase at all.
pub fn extract_when(query: &str, now: DateTime<Utc>) -> Option<ParsedWhen> {
    let lower = query.to_lowercase();
    let today = now.date_naive();

    let date = if lower.contains("tomorrow") {
        Some(today + Duration::days(1))
    } else if lower.contains("today") || lower.contains("tonight") {
        Some(today)
    } else {
        None
    };

    let time = extract_time(&lower);

    match (date, time) {
        (None, None) => None,
        (d, t) => Some(ParsedWhen {
            date: d.unwrap_or(today),
            time: t,
        }),
    }
}

/// Normalize a time-of-day phrase within `lower` (already lowercased).
pub fn extract_time(lower: &str) -> Option<NaiveTime> {
    // Named times of day take precedence over stray digits.
    for (name, hour) in [
        ("morning", 9u32),
        ("noon", 12),
        ("afternoon", 14),
        ("evening", 19),
        ("tonight", 20),
        ("midnight", 0),
    ] {
        if lower.contains(name) {
            return NaiveTime::from_hms_opt(hour, 0, 0);
        }
    }

    if let Some(caps) = CLOCK_RE.captures(lower) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        let hour = apply_meridiem(hour, caps.get(3).map(|m| m.as_str()))?;
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    if let Some(caps) = HOUR_AMPM_RE.captures(lower) {
        let hour: u32 = caps[1].parse().ok()?;
        let hour = apply_meridiem(hour, Some(&caps[2]))?;
        return NaiveTime::from_hms_opt(hour, 0, 0);
    }

    if let Some(caps) = BARE_HOUR_RE.captures(lower) {
        let hour: u32 = caps[1].parse().ok()?;
        if hour < 24 {
            return NaiveTime::from_hms_opt(hour, 0, 0);
        }
    }

    None
}

fn apply_meridiem(hour: u32, meridiem: Option<&str>) -> Option<u32> {
    match meridiem.map(|m| m.to_lowercase()) {
        Some(m) if m == "pm" => {
            if hour > 12 {
                None
            } else if hour == 12 {
                Some(12)
            } else {
                Some(hour + 12)
            }
        }
        Some(m) if m == "am" => {
            if hour > 12 {
                None
            } else if hour == 12 {
                Some(0)
            } else {
                Some(hour)
            }
        }
        _ => {
            if hour < 24 {
                Some(hour)
            } else {
                None
            }
        }
    }
}

/// Slugify a device or entity name to `[a-z0-9_]+`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn clock_forms_normalize() {
        assert_eq!(extract_time("meet at 3pm"), Some(time(15, 0)));
        assert_eq!(extract_time("meet at 3 pm"), Some(time(15, 0)));
        assert_eq!(extract_time("meet at 15:00"), Some(time(15, 0)));
        assert_eq!(extract_time("meet at 3:30pm"), Some(time(15, 30)));
        assert_eq!(extract_time("meet at 12pm"), Some(time(12, 0)));
        assert_eq!(extract_time("meet at 12am"), Some(time(0, 0)));
    }

    #[test]
    fn named_times_normalize() {
        assert_eq!(extract_time("in the morning"), Some(time(9, 0)));
        assert_eq!(extract_time("this evening"), Some(time(19, 0)));
        assert_eq!(extract_time("at noon"), Some(time(12, 0)));
        assert_eq!(extract_time("tonight"), Some(time(20, 0)));
    }

    #[test]
    fn tomorrow_with_bare_hour() {
        let when = extract_when("remind me tomorrow 9", now()).unwrap();
        assert_eq!(when.date, NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
        assert_eq!(when.time, Some(time(9, 0)));
        assert_eq!(when.date_string(), "2025-06-11");
        assert_eq!(when.time_string(), "09:00:00");
    }

    #[test]
    fn tomorrow_at_9am() {
        let when = extract_when("buy them tomorrow at 9am", now()).unwrap();
        assert_eq!(when.date, NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
        assert_eq!(when.time_string(), "09:00:00");
    }

    #[test]
    fn time_without_date_defaults_to_today() {
        let when = extract_when("call mom at 2pm", now()).unwrap();
        assert_eq!(when.date, NaiveDate::from_ymd_opt(2025, 6, 10).unwrap());
        assert_eq!(when.time, Some(time(14, 0)));
    }

    #[test]
    fn tomorrow_without_time_has_no_time() {
        let when = extract_when("do it tomorrow", now()).unwrap();
        assert_eq!(when.date, NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
        assert_eq!(when.time, None);
        assert_eq!(when.time_string(), "09:00:00");
    }

    #[test]
    fn no_temporal_phrase_is_none() {
        assert!(extract_when("add milk to my list", now()).is_none());
    }

    #[test]
    fn invalid_hours_are_rejected() {
        assert_eq!(extract_time("at 25:00"), None);
        assert_eq!(extract_time("13pm nonsense"), None);
    }

    #[test]
    fn slugify_collapses_to_snake() {
        assert_eq!(slugify("Living Room"), "living_room");
        assert_eq!(slugify("  Kids'  Bedroom "), "kids_bedroom");
        assert_eq!(slugify("office-lamp"), "office_lamp");
    }
}
