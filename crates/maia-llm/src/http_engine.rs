use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{EngineError, GenerationRequest, LlmEngine};
use crate::stream::{parse_sse_line, SseParsed, TokenEvent};

/// OpenAI-compatible inference engine over HTTP.
///
/// Works against any endpoint speaking the `/v1/chat/completions` dialect:
/// local llama.cpp/Ollama servers and hosted gateways alike.
pub struct HttpEngine {
    client: reqwest::Client,
    engine_name: String,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEngine {
    /// `base_url` without trailing slash (e.g. "http://localhost:11434").
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url: String = base_url.into();
        let engine_name = base_url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        Self {
            client: reqwest::Client::new(),
            engine_name,
            base_url,
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_body(req: &GenerationRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": [
                { "role": "system", "content": req.system_prompt },
                { "role": "user", "content": req.prompt },
            ],
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": stream,
        });
        if !req.stop.is_empty() {
            body["stop"] = serde_json::json!(req.stop);
        }
        body
    }

    async fn post(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, EngineError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(engine = %self.engine_name, status, body = %text, "engine API error");
            return Err(classify_api_error(status, text));
        }
        Ok(resp)
    }
}

/// Distinguish OOM-like and invalid-request failures from generic outages so
/// the fallback chain can react per policy.
fn classify_api_error(status: u16, message: String) -> EngineError {
    let lower = message.to_lowercase();
    if status == 507 || lower.contains("out of memory") || lower.contains("cuda oom") {
        return EngineError::Oom;
    }
    match status {
        400 | 404 | 422 => EngineError::InvalidRequest(message),
        _ => EngineError::Api { status, message },
    }
}

#[async_trait]
impl LlmEngine for HttpEngine {
    fn name(&self) -> &str {
        &self.engine_name
    }

    async fn complete(&self, req: &GenerationRequest) -> Result<String, EngineError> {
        debug!(engine = %self.engine_name, model = %req.model, "completion request");
        let resp = self.post(&Self::build_body(req, false)).await?;
        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        api.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Parse("response carried no content".to_string()))
    }

    async fn stream(
        &self,
        req: &GenerationRequest,
        tx: mpsc::Sender<TokenEvent>,
    ) -> Result<(), EngineError> {
        debug!(engine = %self.engine_name, model = %req.model, "streaming request");
        let resp = self.post(&Self::build_body(req, true)).await?;
        forward_sse_stream(resp, tx).await;
        Ok(())
    }
}

/// Read the engine's SSE byte stream and emit `TokenEvent`s.
/// Chunks can split mid-line, so incomplete tails are buffered.
async fn forward_sse_stream(resp: reqwest::Response, tx: mpsc::Sender<TokenEvent>) {
    use futures_util::StreamExt;

    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(TokenEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                if data.trim() == "[DONE]" {
                    let _ = tx.send(TokenEvent::Done).await;
                    return;
                }
                if let Ok(delta) = serde_json::from_str::<StreamChunk>(&data) {
                    for choice in &delta.choices {
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty()
                                && tx
                                    .send(TokenEvent::Token {
                                        text: content.clone(),
                                    })
                                    .await
                                    .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx.send(TokenEvent::Done).await;
}

// OpenAI-compatible response types.

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_name_strips_scheme() {
        let engine = HttpEngine::new("http://localhost:11434", None);
        assert_eq!(engine.name(), "localhost:11434");
    }

    #[test]
    fn body_includes_stop_only_when_present() {
        let mut req = GenerationRequest {
            model: "m".into(),
            system_prompt: "sys".into(),
            prompt: "hi".into(),
            max_tokens: 64,
            temperature: 0.7,
            stop: Vec::new(),
        };
        let body = HttpEngine::build_body(&req, false);
        assert!(body.get("stop").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["stream"], false);

        req.stop = vec!["\n\n".to_string()];
        let body = HttpEngine::build_body(&req, true);
        assert_eq!(body["stop"][0], "\n\n");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn oom_is_classified_from_status_and_message() {
        assert!(matches!(
            classify_api_error(507, "insufficient storage".into()),
            EngineError::Oom
        ));
        assert!(matches!(
            classify_api_error(500, "CUDA Out of Memory".into()),
            EngineError::Oom
        ));
        assert!(matches!(
            classify_api_error(400, "bad params".into()),
            EngineError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_api_error(503, "overloaded".into()),
            EngineError::Api { status: 503, .. }
        ));
    }
}
