use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::{GenerateRequest, GenerateResult, Strategy};
use crate::error::TestgenError;
use crate::parsers::ndjson::{EnvelopeDecoder, LineMode};
use crate::parsers::{BufferedParser, OutputParser, ParsedOutput};

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Direct HTTP transport to the generation server.
pub struct HttpDispatch {
    client: Client,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Option<Vec<Tag>>,
}

#[derive(Deserialize)]
struct Tag {
    name: String,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatch {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("failed to build tuned HTTP client, using defaults: {e}");
                Client::new()
            });

        Self { client }
    }

    /// Probe the tag listing endpoint. Connection failures and probe
    /// timeouts are `Unreachable`; any HTTP status counts as reachable and
    /// is returned to the caller.
    pub async fn health(&self, base_url: &str, timeout: Duration) -> Result<u16, TestgenError> {
        let url = format!("{base_url}/api/tags");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TestgenError::Unreachable {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }

    /// Installed model names from the tag listing.
    pub async fn list_models(
        &self,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, TestgenError> {
        let url = format!("{base_url}/api/tags");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_send_error(e, base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_capped(response).await;
            return Err(TestgenError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let tags: TagsResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TestgenError::SchemaParse(format!("tag listing: {e}")))?;

        Ok(tags
            .models
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    /// Issue one generation request, buffered or streaming.
    ///
    /// The whole call (connect, headers, body) races the request deadline
    /// and the optional cancellation token. Losing the race drops the
    /// in-flight future, which closes the connection, and surfaces
    /// `Timeout` rather than waiting for the server.
    pub async fn generate(
        &self,
        req: &GenerateRequest,
        base_url: &str,
        stream: bool,
    ) -> Result<GenerateResult, TestgenError> {
        let start = Instant::now();
        let timeout = req.remaining()?;
        let token = req.cancellation_token.clone().unwrap_or_default();

        let work = self.generate_inner(req, base_url, stream);

        let parsed = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(TestgenError::Timeout(start.elapsed().as_millis() as u64));
            }
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(inner) => inner?,
                Err(_) => {
                    return Err(TestgenError::Timeout(start.elapsed().as_millis() as u64));
                }
            },
        };

        Ok(GenerateResult {
            text: parsed.text,
            model: req.model.clone(),
            strategy: if stream {
                Strategy::Stream
            } else {
                Strategy::Buffered
            },
            stats: parsed.stats,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn generate_inner(
        &self,
        req: &GenerateRequest,
        base_url: &str,
        stream: bool,
    ) -> Result<ParsedOutput, TestgenError> {
        let url = format!("{base_url}/api/generate");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&req.body(stream))
            .send()
            .await
            .map_err(|e| classify_send_error(e, base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_capped(response).await;
            return Err(TestgenError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        if !stream {
            let bytes = response.bytes().await?;
            if bytes.len() > MAX_RESPONSE_BYTES {
                return Err(TestgenError::SchemaParse(format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    bytes.len()
                )));
            }
            return BufferedParser.parse(&bytes);
        }

        let mut decoder = EnvelopeDecoder::new(LineMode::Drop);
        let mut body = response.bytes_stream();
        let mut received = 0usize;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len();
            if received > MAX_RESPONSE_BYTES {
                tracing::warn!(received, "stream exceeded size cap, truncating");
                break;
            }
            decoder.push(&chunk);
            if decoder.is_done() {
                break;
            }
        }

        let stats = decoder.stats();
        if stats.discarded > 0 {
            tracing::debug!(
                discarded = stats.discarded,
                lines = stats.lines,
                "dropped malformed stream lines"
            );
        }
        decoder.finish()
    }
}

/// Connection refused and DNS failures mean the server is unreachable;
/// client-side timeouts map to `Timeout`.
fn classify_send_error(e: reqwest::Error, base_url: &str) -> TestgenError {
    if e.is_connect() {
        TestgenError::Unreachable {
            url: base_url.to_string(),
            message: e.to_string(),
        }
    } else if e.is_timeout() {
        TestgenError::Timeout(0)
    } else {
        TestgenError::Request(e)
    }
}

/// Read an error body, capped at MAX_RESPONSE_BYTES.
async fn read_capped(response: reqwest::Response) -> String {
    let bytes = response.bytes().await.unwrap_or_default();
    let truncated = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];
    String::from_utf8_lossy(truncated).to_string()
}
