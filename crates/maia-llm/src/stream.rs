/// Events emitted while streaming a generation.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// Incremental text from the model.
    Token { text: String },
    /// Stream completed successfully.
    Done,
    /// The stream broke mid-way; no more tokens will follow.
    Error { message: String },
}

/// Parse a single SSE line: `event: <type>` or `data: <payload>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_event_lines() {
        assert!(matches!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data(d)) if d == "{\"x\":1}"
        ));
        assert!(matches!(
            parse_sse_line("event: end"),
            Some(SseParsed::Event(e)) if e == "end"
        ));
        assert!(parse_sse_line(": comment").is_none());
    }
}
