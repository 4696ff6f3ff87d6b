pub mod ndjson;

use serde::Deserialize;

use crate::error::TestgenError;
use crate::parsers::ndjson::{EnvelopeDecoder, EnvelopeStats, LineMode};

/// Text recovered from a transport body plus envelope accounting.
#[derive(Debug, Default)]
pub struct ParsedOutput {
    pub text: String,
    pub stats: EnvelopeStats,
}

/// Trait for turning a raw transport body into model text.
/// Each wire shape (buffered JSON, line-delimited envelopes) has its own parser.
pub trait OutputParser: Send + Sync {
    /// Parse raw body bytes into model text.
    fn parse(&self, body: &[u8]) -> Result<ParsedOutput, TestgenError>;
}

/// Parses a buffered `generate` reply.
/// Expected shape: `{"response": "...", ...}`
pub struct BufferedParser;

#[derive(Deserialize)]
struct BufferedReply {
    response: Option<String>,
    error: Option<String>,
}

impl OutputParser for BufferedParser {
    fn parse(&self, body: &[u8]) -> Result<ParsedOutput, TestgenError> {
        let reply: BufferedReply = serde_json::from_slice(body)
            .map_err(|e| TestgenError::SchemaParse(format!("generate reply: {e}")))?;

        if let Some(err) = reply.error {
            return Err(TestgenError::Transport {
                status: 200,
                body: err,
            });
        }

        let text = reply.response.unwrap_or_default();
        Ok(ParsedOutput {
            stats: EnvelopeStats {
                lines: 1,
                fragments: usize::from(!text.is_empty()),
                done: true,
                ..EnvelopeStats::default()
            },
            text,
        })
    }
}

/// Parses a complete line-delimited envelope stream, e.g. the captured
/// stdout of the process transport.
pub struct NdjsonParser {
    pub mode: LineMode,
}

impl OutputParser for NdjsonParser {
    fn parse(&self, body: &[u8]) -> Result<ParsedOutput, TestgenError> {
        let mut decoder = EnvelopeDecoder::new(self.mode);
        decoder.push(body);
        decoder.finish()
    }
}
