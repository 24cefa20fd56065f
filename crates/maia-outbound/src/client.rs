use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use maia_core::config::{BreakerConfig, ServicesConfig};
use maia_core::error::ErrorKind;

use crate::breaker::CircuitBreaker;
use crate::transport::{Method, Service, Transport, TransportError, TransportResponse};

const RETRY_BASE: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;

/// Base-URL resolution for each sibling service.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub auth: Option<String>,
    pub crud_base: String,
    pub homeassistant: String,
}

impl ServiceEndpoints {
    pub fn from_config(services: &ServicesConfig, auth_url: Option<&str>) -> Self {
        Self {
            auth: auth_url.map(String::from),
            crud_base: services.base_url.clone(),
            homeassistant: services.homeassistant().to_string(),
        }
    }

    fn resolve(&self, service: Service) -> Result<&str, ErrorKind> {
        match service {
            Service::Auth => self.auth.as_deref().ok_or_else(|| {
                ErrorKind::Unavailable("auth service is not configured".to_string())
            }),
            Service::Homeassistant => Ok(&self.homeassistant),
            _ => Ok(&self.crud_base),
        }
    }
}

/// Resilient client for sibling-service calls: per-service timeout ceiling,
/// retry-with-backoff for idempotent calls, circuit breaker per service.
pub struct OutboundClient {
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    endpoints: ServiceEndpoints,
}

impl OutboundClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: ServiceEndpoints,
        breaker: &BreakerConfig,
    ) -> Self {
        Self {
            transport,
            breaker: CircuitBreaker::new(breaker.failures, Duration::from_secs(breaker.cooldown_sec)),
            endpoints,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn get(&self, service: Service, path: &str) -> Result<Value, ErrorKind> {
        self.call(service, Method::Get, path, None, &[], None).await
    }

    pub async fn post(
        &self,
        service: Service,
        path: &str,
        body: Value,
    ) -> Result<Value, ErrorKind> {
        self.call(service, Method::Post, path, Some(body), &[], None)
            .await
    }

    pub async fn delete(&self, service: Service, path: &str) -> Result<Value, ErrorKind> {
        self.call(service, Method::Delete, path, None, &[], None)
            .await
    }

    /// Full-control entry point. Retries happen only when the method is
    /// idempotent or an `idempotency_key` is supplied; mutating calls without
    /// a key run at most once.
    pub async fn call(
        &self,
        service: Service,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Value, ErrorKind> {
        let base = self.endpoints.resolve(service)?;
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        let may_retry = method.is_idempotent() || idempotency_key.is_some();

        let mut all_headers: Vec<(String, String)> = headers.to_vec();
        if let Some(key) = idempotency_key {
            all_headers.push(("Idempotency-Key".to_string(), key.to_string()));
        }

        let mut last_err = ErrorKind::Unavailable(format!("{service}: no attempt made"));

        for attempt in 0..MAX_ATTEMPTS {
            self.breaker.check(service.name())?;

            debug!(%service, method = method.as_str(), %url, attempt, "outbound call");

            let outcome = self
                .transport
                .send(method, &url, body.as_ref(), &all_headers, service.timeout())
                .await;

            match classify(service, outcome) {
                Ok(value) => {
                    self.breaker.on_success(service.name());
                    return Ok(value);
                }
                Err(Classified {
                    kind,
                    retryable,
                    service_fault,
                }) => {
                    if service_fault {
                        self.breaker.on_failure(service.name());
                    }
                    warn!(%service, err = %kind, attempt, "outbound call failed");
                    let should_retry = retryable && may_retry && attempt + 1 < MAX_ATTEMPTS;
                    if !should_retry {
                        return Err(kind);
                    }
                    last_err = kind;
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }

        Err(last_err)
    }
}

/// Exponential backoff: base·2^k, capped.
fn backoff(attempt: u32) -> Duration {
    let raw = RETRY_BASE.saturating_mul(1 << attempt.min(16));
    raw.min(MAX_BACKOFF)
}

struct Classified {
    kind: ErrorKind,
    retryable: bool,
    /// Whether this failure counts against the service's circuit breaker.
    service_fault: bool,
}

/// Map a transport outcome onto the error taxonomy and retry policy.
/// Transient: connect failures, timeouts, and 5xx except 501/505.
fn classify(
    service: Service,
    outcome: Result<TransportResponse, TransportError>,
) -> Result<Value, Classified> {
    let resp = match outcome {
        Ok(r) => r,
        Err(TransportError::Timeout) => {
            return Err(Classified {
                kind: ErrorKind::Timeout {
                    ms: service.timeout().as_millis() as u64,
                },
                retryable: true,
                service_fault: true,
            })
        }
        Err(TransportError::Connect(msg)) => {
            return Err(Classified {
                kind: ErrorKind::Unavailable(format!("{service}: {msg}")),
                retryable: true,
                service_fault: true,
            })
        }
        Err(TransportError::Other(msg)) => {
            return Err(Classified {
                kind: ErrorKind::Unavailable(format!("{service}: {msg}")),
                retryable: false,
                service_fault: true,
            })
        }
    };

    match resp.status {
        200..=299 => Ok(resp.body),
        401 => Err(Classified {
            kind: ErrorKind::Unauthorized(format!("{service} rejected the session")),
            retryable: false,
            service_fault: false,
        }),
        403 => Err(Classified {
            kind: ErrorKind::Forbidden(format!("{service} denied access")),
            retryable: false,
            service_fault: false,
        }),
        404 => Err(Classified {
            kind: ErrorKind::NotFound(format!("{service}: no such resource")),
            retryable: false,
            service_fault: false,
        }),
        409 => Err(Classified {
            kind: ErrorKind::Conflict(format!("{service}: conflict")),
            retryable: false,
            service_fault: false,
        }),
        400..=499 => Err(Classified {
            kind: ErrorKind::Invalid(format!("{service} returned {}", resp.status)),
            retryable: false,
            service_fault: false,
        }),
        501 | 505 => Err(Classified {
            kind: ErrorKind::Unavailable(format!("{service} returned {}", resp.status)),
            retryable: false,
            service_fault: true,
        }),
        _ => Err(Classified {
            kind: ErrorKind::Unavailable(format!("{service} returned {}", resp.status)),
            retryable: true,
            service_fault: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted transport: pops one outcome per call, repeats the last.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Self {
            let mut script = script;
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _method: Method,
            _url: &str,
            _body: Option<&Value>,
            _headers: &[(String, String)],
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            match script.len() {
                0 => Err(TransportError::Other("script exhausted".to_string())),
                1 => script[0].clone(),
                _ => script.pop().unwrap(),
            }
        }
    }

    fn ok(status: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status,
            body: serde_json::json!({"ok": true}),
        })
    }

    fn client_with(
        transport: Arc<ScriptedTransport>,
        failures: u32,
        cooldown_sec: u64,
    ) -> OutboundClient {
        OutboundClient::new(
            transport,
            ServiceEndpoints {
                auth: Some("http://auth.local".to_string()),
                crud_base: "http://crud.local".to_string(),
                homeassistant: "http://ha.local".to_string(),
            },
            &BreakerConfig {
                failures,
                cooldown_sec,
            },
        )
    }

    #[tokio::test]
    async fn get_retries_transient_errors() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            ok(503),
            ok(200),
        ]));
        let client = client_with(transport.clone(), 10, 30);

        let result = client.get(Service::Lists, "/api/lists/shopping").await;
        assert!(result.is_ok());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn mutating_call_without_key_never_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(503), ok(200)]));
        let client = client_with(transport.clone(), 10, 30);

        let result = client
            .post(Service::Lists, "/api/lists/shopping/items", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(ErrorKind::Unavailable(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn mutating_call_with_key_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(503), ok(200)]));
        let client = client_with(transport.clone(), 10, 30);

        let result = client
            .call(
                Service::Reminders,
                Method::Post,
                "/api/reminders",
                Some(serde_json::json!({"title": "x"})),
                &[],
                Some("key-1"),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(404)]));
        let client = client_with(transport.clone(), 10, 30);

        let result = client.get(Service::Journal, "/api/journal/42").await;
        assert!(matches!(result, Err(ErrorKind::NotFound(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn breaker_opens_and_fails_fast() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(503)]));
        let client = client_with(transport.clone(), 5, 300);

        // Two GETs, three attempts each: five consecutive failures open
        // the circuit mid-way through the second call.
        let _ = client.get(Service::Calendar, "/api/calendar/events").await;
        let second = client.get(Service::Calendar, "/api/calendar/events").await;
        assert!(matches!(second, Err(ErrorKind::CircuitOpen { .. })));
        assert_eq!(transport.calls(), 5);

        // Further calls fail fast without touching the transport.
        let third = client.get(Service::Calendar, "/api/calendar/events").await;
        assert!(matches!(third, Err(ErrorKind::CircuitOpen { .. })));
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test]
    async fn not_implemented_is_terminal() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(501), ok(200)]));
        let client = client_with(transport.clone(), 10, 30);

        let result = client.get(Service::Homeassistant, "/api/states").await;
        assert!(matches!(result, Err(ErrorKind::Unavailable(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(200));
        assert_eq!(backoff(1), Duration::from_millis(400));
        assert_eq!(backoff(2), Duration::from_millis(800));
        assert_eq!(backoff(10), Duration::from_secs(5));
    }
}
