//! Uniform gateway over one or more backend inference engines: a single
//! request interface (non-streaming and token-stream), a fallback chain with
//! OOM cool-down, token watchdogs, and a start-up warm-up pass.

pub mod engine;
pub mod http_engine;
pub mod router;
pub mod stream;

pub use engine::{EngineError, GenerationRequest, LlmEngine};
pub use http_engine::HttpEngine;
pub use router::EngineRouter;
pub use stream::TokenEvent;
