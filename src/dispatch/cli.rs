use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::dispatch::{GenerateRequest, GenerateResult, Strategy};
use crate::error::TestgenError;
use crate::parsers::ndjson::LineMode;
use crate::parsers::{NdjsonParser, OutputParser};

pub const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Alternate transport: the same `generate` call issued through an external
/// command-line HTTP client, for environments where direct sockets from this
/// process are blocked. Output is the streaming envelope format.
pub struct CliDispatch {
    executable: String,
}

impl Default for CliDispatch {
    fn default() -> Self {
        Self::new("curl")
    }
}

impl CliDispatch {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// True if the client runs (`<executable> --version` exits 0).
    pub async fn is_available(&self) -> bool {
        Command::new(&self.executable)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }

    /// Arguments for a streaming POST with the body read from stdin.
    pub fn args_for(url: &str) -> Vec<String> {
        [
            "--silent",
            "--show-error",
            "--no-buffer",
            "-X",
            "POST",
            url,
            "-H",
            "Content-Type: application/json",
            "--data-binary",
            "@-",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
    }

    /// Run the client and aggregate its line-delimited stdout.
    ///
    /// - No shell: `Command::new` + args
    /// - Request body on stdin, never argv (ARG_MAX)
    /// - Own process group; the whole group is killed on deadline or cancel
    /// - stdout/stderr capped at MAX_OUTPUT_BYTES
    pub async fn generate(
        &self,
        req: &GenerateRequest,
        base_url: &str,
    ) -> Result<GenerateResult, TestgenError> {
        let start = Instant::now();
        let timeout = req.remaining()?;
        let executable = self.executable.as_str();

        let url = format!("{base_url}/api/generate");
        let body = serde_json::to_vec(&req.body(true))
            .map_err(|e| client_failure(executable, "failed to encode request", e))?;

        let mut cmd = Command::new(executable);
        cmd.args(Self::args_for(&url))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| TestgenError::Spawn {
            executable: executable.to_string(),
            message: e.to_string(),
        })?;

        let missing_pipe = || TestgenError::Spawn {
            executable: executable.to_string(),
            message: "child pipes unavailable".to_string(),
        };

        // Feed stdin from its own task: a body larger than the pipe buffer
        // would otherwise deadlock against an unread stdout.
        let mut stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        tokio::spawn(async move {
            let _ = stdin.write_all(&body).await;
            // drop closes the pipe, the child sees EOF
        });

        // process_group(0) makes the child its own group leader (pgid == pid).
        let child_pid = child.id();
        let stdout_pipe = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr_pipe = child.stderr.take().ok_or_else(missing_pipe)?;

        let read_future = async {
            let stdout_handle = tokio::spawn(read_pipe(stdout_pipe, "stdout"));
            let stderr_handle = tokio::spawn(read_pipe(stderr_pipe, "stderr"));

            let stdout_buf = stdout_handle.await.unwrap_or_default();
            // A capped stdout means the child may block on a full pipe.
            if stdout_buf.len() >= MAX_OUTPUT_BYTES {
                kill_group(child_pid);
            }
            let stderr_buf = stderr_handle.await.unwrap_or_default();
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout_buf, stderr_buf, status))
        };

        let token = req.cancellation_token.clone().unwrap_or_default();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout(timeout, read_future) => result.ok(),
        };

        let (stdout, stderr_raw, status) = match outcome {
            Some(result) => {
                result.map_err(|e| client_failure(executable, "failed to read output", e))?
            }
            None => {
                kill_group(child_pid);
                return Err(TestgenError::Timeout(start.elapsed().as_millis() as u64));
            }
        };

        let stderr_text = String::from_utf8_lossy(&stderr_raw).to_string();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            tracing::warn!(executable, code, "process transport failed");
            return Err(TestgenError::ProcessExit {
                code,
                stderr: stderr_text,
            });
        }

        if !stderr_text.is_empty() {
            tracing::debug!(executable, stderr = %stderr_text, "process transport stderr");
        }

        let parsed = NdjsonParser {
            mode: LineMode::KeepVerbatim,
        }
        .parse(&stdout)?;

        Ok(GenerateResult {
            text: parsed.text,
            model: req.model.clone(),
            strategy: Strategy::Process,
            stats: parsed.stats,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Local I/O failures around the client are classified like spawn failures,
/// so the fallback chain moves on to the next transport.
fn client_failure(executable: &str, what: &str, err: impl std::fmt::Display) -> TestgenError {
    TestgenError::Spawn {
        executable: executable.to_string(),
        message: format!("{what}: {err}"),
    }
}

async fn read_pipe<R>(pipe: R, name: &'static str) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(MAX_OUTPUT_BYTES.min(64 * 1024));
    let mut capped = pipe.take(MAX_OUTPUT_BYTES as u64);
    if let Err(e) = capped.read_to_end(&mut buf).await {
        tracing::warn!("{name} pipe read error: {e}");
    }
    buf
}

/// SIGKILL the whole process group, not just the leader: grandchildren
/// holding the pipes open would otherwise keep the readers blocked.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}
