use thiserror::Error;

/// Process exit code for an unreachable generation server.
pub const EXIT_UNREACHABLE: u8 = 3;

/// Process exit code for a missing or mismatched model.
pub const EXIT_MODEL: u8 = 2;

/// Process exit code for anything else that aborts the run.
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Error)]
pub enum TestgenError {
    #[error("generation server unreachable at {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("model not found: {model}")]
    ModelNotFound {
        model: String,
        installed: Vec<String>,
    },

    #[error("model '{resolved}' does not match expected '{expected}'")]
    ModelMismatch { resolved: String, expected: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("total generation timeout of {0}ms exceeded")]
    TotalTimeout(u64),

    #[error("transport error {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("process exited with code {code}: {stderr}")]
    ProcessExit { code: i32, stderr: String },

    #[error("failed to spawn {executable}: {message}")]
    Spawn { executable: String, message: String },

    #[error("model returned empty output ({0} chars)")]
    EmptyOutput(usize),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("expected exactly {expected} generated tests, received {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("write failed for {path}: {message}")]
    Write { path: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("context error: {0}")]
    Context(String),

    #[error("{0}")]
    Other(String),
}

impl TestgenError {
    /// Returns true for transport-level failures that the next strategy or
    /// retry round may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::Timeout(_)
                | Self::Transport { .. }
                | Self::Request(_)
                | Self::ProcessExit { .. }
                | Self::Spawn { .. }
                | Self::EmptyOutput(_)
                | Self::SchemaParse(_)
                | Self::Parse(_)
        )
    }

    /// Exit code used when this error aborts the whole run.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Unreachable { .. } => EXIT_UNREACHABLE,
            Self::ModelNotFound { .. } | Self::ModelMismatch { .. } => EXIT_MODEL,
            _ => EXIT_FAILURE,
        }
    }

    /// Pipeline stage the error belongs to, for operator diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "health-check",
            Self::ModelNotFound { .. } | Self::ModelMismatch { .. } => "model-resolve",
            Self::Timeout(_)
            | Self::TotalTimeout(_)
            | Self::Transport { .. }
            | Self::Request(_)
            | Self::ProcessExit { .. }
            | Self::Spawn { .. }
            | Self::EmptyOutput(_)
            | Self::SchemaParse(_) => "transport",
            Self::Parse(_) | Self::CountMismatch { .. } => "parse",
            Self::Validation(_) => "validate",
            Self::Write { .. } => "write",
            Self::Config(_) => "config",
            Self::Context(_) => "prompt",
            Self::Other(_) => "run",
        }
    }

    /// Short operator-facing message. Keeps only the tail of process stderr
    /// and never echoes full upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unreachable { url, .. } => {
                format!("could not reach generation server at {url} (start it with: ollama serve)")
            }
            Self::ModelNotFound { model, installed } => {
                let list = if installed.is_empty() {
                    "(none)".to_string()
                } else {
                    installed.join(", ")
                };
                format!(
                    "model '{model}' not found locally. Installed: {list}. Pull it first: ollama pull {model}"
                )
            }
            Self::Transport { status, body } => {
                let preview: String = body.chars().take(200).collect();
                format!("transport error {status}: {preview}")
            }
            Self::ProcessExit { code, stderr } => {
                if stderr.trim().is_empty() {
                    format!("process exited with code {code}")
                } else {
                    // CLI tools put the actual error last.
                    let preview: String = stderr
                        .chars()
                        .rev()
                        .take(200)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    let prefix = if preview.len() < stderr.len() {
                        "..."
                    } else {
                        ""
                    };
                    format!("process exited with code {code}: {prefix}{preview}")
                }
            }
            Self::Request(e) if e.is_timeout() => "request timed out".to_string(),
            Self::Request(_) => "request to generation server failed".to_string(),
            other => other.to_string(),
        }
    }
}
