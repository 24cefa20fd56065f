//! Resilient outbound HTTP client for the sibling services.
//!
//! Every cross-service call goes through [`client::OutboundClient`], which
//! layers a per-service timeout ceiling, retry-with-backoff for idempotent
//! calls, and a per-service circuit breaker over a swappable transport.

pub mod breaker;
pub mod client;
pub mod transport;

pub use breaker::CircuitBreaker;
pub use client::{OutboundClient, ServiceEndpoints};
pub use transport::{
    HttpTransport, Method, Service, Transport, TransportError, TransportResponse,
};
