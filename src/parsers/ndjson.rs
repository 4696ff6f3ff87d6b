use serde::Deserialize;

use crate::error::TestgenError;
use crate::parsers::ParsedOutput;

/// What to do with a line that is not a valid envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Drop it and count it as discarded.
    Drop,
    /// Append lines that do not look like JSON verbatim (models sometimes
    /// stop emitting envelopes near the end); JSON-looking garbage is still
    /// discarded.
    KeepVerbatim,
}

/// Envelope accounting. Lets callers assert how much of a stream was
/// unusable without inspecting logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeStats {
    /// Non-blank lines seen.
    pub lines: usize,
    /// Envelopes that contributed a non-empty payload fragment.
    pub fragments: usize,
    /// Malformed lines dropped.
    pub discarded: usize,
    /// Non-JSON lines appended verbatim.
    pub verbatim: usize,
    /// The final envelope (`"done": true`) was seen.
    pub done: bool,
}

#[derive(Deserialize)]
struct Envelope {
    response: Option<String>,
    error: Option<String>,
    done: Option<bool>,
}

/// Incremental decoder for newline-delimited generation envelopes.
///
/// Chunks may split lines anywhere; bytes are buffered until a newline
/// arrives, so a multi-byte character or an envelope spanning two network
/// chunks decodes correctly.
pub struct EnvelopeDecoder {
    mode: LineMode,
    pending: Vec<u8>,
    text: String,
    stats: EnvelopeStats,
    error: Option<String>,
}

impl EnvelopeDecoder {
    pub fn new(mode: LineMode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            text: String::new(),
            stats: EnvelopeStats::default(),
            error: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.decode_line(&line);
        }
    }

    /// True once the final envelope has been decoded.
    pub fn is_done(&self) -> bool {
        self.stats.done
    }

    pub fn stats(&self) -> EnvelopeStats {
        self.stats
    }

    /// Flush the trailing partial line and return the aggregate.
    /// An `error` envelope with no payload text becomes a transport error.
    pub fn finish(mut self) -> Result<ParsedOutput, TestgenError> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.decode_line(&rest);
        }

        if self.text.is_empty()
            && let Some(err) = self.error
        {
            return Err(TestgenError::Transport {
                status: 200,
                body: err,
            });
        }

        Ok(ParsedOutput {
            text: self.text,
            stats: self.stats,
        })
    }

    fn decode_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.stats.lines += 1;

        match serde_json::from_str::<Envelope>(line) {
            Ok(env) => {
                if let Some(fragment) = env.response
                    && !fragment.is_empty()
                {
                    self.text.push_str(&fragment);
                    self.stats.fragments += 1;
                }
                if let Some(err) = env.error {
                    tracing::warn!(error = %err, "generation server reported an error envelope");
                    self.error = Some(err);
                }
                if env.done == Some(true) {
                    self.stats.done = true;
                }
            }
            Err(_) if self.mode == LineMode::KeepVerbatim && !looks_like_json(line) => {
                self.text.push_str(line);
                self.text.push('\n');
                self.stats.verbatim += 1;
            }
            Err(_) => {
                self.stats.discarded += 1;
            }
        }
    }
}

fn looks_like_json(line: &str) -> bool {
    line.starts_with('{') || line.starts_with('[')
}
