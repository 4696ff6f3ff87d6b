pub mod cli;
pub mod http;
pub mod registry;

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::TestgenError;
use crate::parsers::ndjson::EnvelopeStats;

/// Internal request type. Every transport accepts this.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub deadline: Instant,
    pub temperature: f64,
    /// Token budget, sent as `options.num_predict`.
    pub num_predict: u32,
    /// Aborts the in-flight call when cancelled (e.g. by the run-level
    /// total timeout).
    pub cancellation_token: Option<CancellationToken>,
}

impl GenerateRequest {
    /// Remaining time before the deadline, or `Timeout(0)` when less than
    /// 100ms are left.
    pub fn remaining(&self) -> Result<Duration, TestgenError> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or(TestgenError::Timeout(0))
    }

    /// Wire body for the `generate` endpoint.
    pub fn body(&self, stream: bool) -> serde_json::Value {
        serde_json::to_value(GenerateBody {
            model: &self.model,
            prompt: &self.prompt,
            stream,
            options: GenerateOptions {
                temperature: self.temperature,
                num_predict: self.num_predict,
            },
        })
        .unwrap_or_default()
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

/// Internal result type. All transports return this.
#[derive(Debug)]
pub struct GenerateResult {
    pub text: String,
    pub model: String,
    pub strategy: Strategy,
    /// Envelope accounting for line-delimited transports. Buffered requests
    /// report a single envelope.
    pub stats: EnvelopeStats,
    pub latency_ms: u64,
}

/// One way of issuing a generation request. The orchestrator walks an
/// ordered list of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Streaming HTTP, newline-delimited envelopes.
    Stream,
    /// Single buffered HTTP request/response.
    Buffered,
    /// External command-line HTTP client.
    Process,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Buffered => "buffered",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
