use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Sibling services the core calls out to. LLM engines have their own
/// transport in the gateway crate for them and are not routed through here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Auth,
    Lists,
    Calendar,
    Reminders,
    Journal,
    Homeassistant,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Service::Auth => "auth",
            Service::Lists => "lists",
            Service::Calendar => "calendar",
            Service::Reminders => "reminders",
            Service::Journal => "journal",
            Service::Homeassistant => "homeassistant",
        }
    }

    /// Authoritative per-service timeout ceiling. Not a per-call override.
    pub fn timeout(&self) -> Duration {
        match self {
            Service::Auth => Duration::from_secs(5),
            Service::Lists
            | Service::Calendar
            | Service::Reminders
            | Service::Journal
            | Service::Homeassistant => Duration::from_secs(5),
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// GET and HEAD are safe to retry without an idempotency key.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

/// Low-level failure reported by a transport, before policy classification.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Could not establish a connection.
    Connect(String),
    /// The per-service timeout ceiling elapsed.
    Timeout,
    /// Anything else at the transport layer (TLS, body decode, ...).
    Other(String),
}

/// A transport response: HTTP status plus the decoded JSON body (or Null for
/// empty bodies).
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

/// Swappable wire layer so tests can script responses without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// Production transport over a process-wide `reqwest::Client` with a bounded
/// connection pool, built once at startup and immutable afterwards.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut req = match method {
            Method::Get => self.client.get(url),
            Method::Head => self.client.head(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Delete => self.client.delete(url),
        }
        .timeout(timeout);

        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let body = if status == 204 {
            Value::Null
        } else {
            resp.json::<Value>().await.unwrap_or(Value::Null)
        };

        Ok(TransportResponse { status, body })
    }
}
