use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "mistral";
pub const DEFAULT_OUTPUT_DIR: &str = "tests/api/generated";

/// Operating mode selector (`AI_MODE`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Rich context, long budgets.
    #[default]
    Full,
    /// Reduced context, small token budget, short deadlines, warm-up skipped.
    Smoke,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Smoke => "smoke",
        }
    }
}

/// Transport selector (`OLLAMA_TRANSPORT`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Direct HTTP first, external process last.
    #[default]
    Http,
    /// External command-line HTTP client first.
    Process,
}

/// Runtime configuration, constructed once at process entry and handed to
/// the orchestrator. No pipeline stage reads the environment itself.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub model: String,
    /// Required prefix of the resolved model name. `None` disables the check.
    pub expected_model: Option<String>,
    pub mode: Mode,
    pub incremental: bool,
    pub transport: TransportKind,
    /// Combined mode: try streaming before the buffered request.
    pub stream_first: bool,
    /// Per-call deadline in combined mode.
    pub call_timeout: Duration,
    /// Per-call deadline in incremental mode.
    pub single_timeout: Duration,
    /// Budget for a whole generation unit, retries included.
    pub total_timeout: Duration,
    pub health_timeout: Duration,
    pub warmup_timeout: Duration,
    pub retries: u32,
    pub single_retries: u32,
    pub max_tokens: u32,
    pub single_max_tokens: u32,
    pub temperature: f64,
    pub single_temperature: f64,
    pub backoff_base: Duration,
    pub skip_warmup: bool,
    pub force_warmup: bool,
    pub skip_model: bool,
    pub debug_output: bool,
    pub root_dir: PathBuf,
    /// Output root relative to `root_dir`.
    pub output_dir: PathBuf,
    /// Context files relative to `root_dir`.
    pub context_files: Vec<PathBuf>,
    pub tasks_file: Option<PathBuf>,
    pub curl_bin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Tests inject a map here
    /// instead of mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mode = match get("AI_MODE").as_deref() {
            Some(m) if m.eq_ignore_ascii_case("smoke") => Mode::Smoke,
            Some(m) if !m.eq_ignore_ascii_case("full") && !m.eq_ignore_ascii_case("default") => {
                tracing::warn!(mode = m, "unknown AI_MODE, using full mode");
                Mode::Full
            }
            _ => Mode::Full,
        };

        let transport = match get("OLLAMA_TRANSPORT").as_deref() {
            Some(t) if t.eq_ignore_ascii_case("curl") || t.eq_ignore_ascii_case("process") => {
                TransportKind::Process
            }
            _ => TransportKind::Http,
        };

        let flag = |key: &str| get(key).is_some_and(|v| parse_flag(&v));
        let num = |key: &str, default: u64| parse_or(key, get(key), default);
        let ms = |key: &str, default: u64| Duration::from_millis(num(key, default));

        let expected_model = match lookup("EXPECTED_MODEL") {
            // Explicitly empty disables the constraint.
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
            None => Some(DEFAULT_MODEL.to_string()),
        };

        let max_tokens = ["OLLAMA_MAX_TOKENS", "AI_MAX_TOKENS"]
            .into_iter()
            .find_map(|key| get(key).map(|v| (key, v)))
            .map_or(400, |(key, v)| parse_or(key, Some(v), 400));

        let total_default = match mode {
            Mode::Smoke => 20_000,
            Mode::Full => 300_000,
        };

        let root_dir = get("TESTGEN_ROOT")
            .map(PathBuf::from)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let context_files = match get("AI_CONTEXT_FILES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => default_context_files(mode),
        };

        Config {
            server_url: get("OLLAMA_URL")
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: get("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            expected_model,
            mode,
            incremental: flag("AI_INCREMENTAL"),
            transport,
            stream_first: flag("OLLAMA_STREAM_FIRST"),
            call_timeout: ms("OLLAMA_TIMEOUT_MS", 180_000),
            single_timeout: ms("AI_SINGLE_TIMEOUT_MS", 90_000),
            total_timeout: ms("AI_TOTAL_TIMEOUT_MS", total_default),
            health_timeout: ms("OLLAMA_HEALTH_TIMEOUT_MS", 5_000),
            warmup_timeout: ms("OLLAMA_WARMUP_TIMEOUT_MS", 45_000),
            retries: clamp_u32(num("OLLAMA_RETRIES", 0)),
            single_retries: clamp_u32(num("AI_INCREMENTAL_RETRIES", 1)),
            max_tokens: clamp_u32(max_tokens),
            single_max_tokens: clamp_u32(num("AI_INCREMENTAL_MAX_TOKENS", 400)),
            temperature: parse_or("OLLAMA_TEMPERATURE", get("OLLAMA_TEMPERATURE"), 0.2),
            single_temperature: parse_or(
                "AI_INCREMENTAL_TEMPERATURE",
                get("AI_INCREMENTAL_TEMPERATURE"),
                0.1,
            ),
            backoff_base: ms("AI_BACKOFF_MS", 700),
            skip_warmup: flag("OLLAMA_SKIP_WARMUP"),
            force_warmup: flag("OLLAMA_FORCE_WARMUP"),
            skip_model: flag("AI_SKIP_MODEL"),
            debug_output: flag("DEBUG_AI_OUTPUT"),
            root_dir,
            output_dir: get("TESTGEN_OUTPUT_DIR")
                .map_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR), PathBuf::from),
            context_files,
            tasks_file: get("TESTGEN_TASKS_FILE").map(PathBuf::from),
            curl_bin: get("TESTGEN_CURL_BIN").unwrap_or_else(|| "curl".to_string()),
        }
    }

    pub fn is_smoke(&self) -> bool {
        self.mode == Mode::Smoke
    }

    /// Incremental generation only exists as a sub-mode of smoke.
    pub fn is_incremental(&self) -> bool {
        self.is_smoke() && self.incremental
    }

    /// Warm-up runs unless skipped explicitly; smoke mode skips it unless forced.
    pub fn should_warm_up(&self) -> bool {
        if self.skip_warmup {
            return false;
        }
        !self.is_smoke() || self.force_warmup
    }

    /// Absolute output root.
    pub fn output_root(&self) -> PathBuf {
        self.root_dir.join(&self.output_dir)
    }

    /// Per-call deadline for the active mode.
    pub fn attempt_timeout(&self) -> Duration {
        if self.is_incremental() {
            self.single_timeout
        } else {
            self.call_timeout
        }
    }

    /// Retry rounds for the active mode.
    pub fn attempt_retries(&self) -> u32 {
        if self.is_incremental() {
            self.single_retries
        } else {
            self.retries
        }
    }
}

fn default_context_files(mode: Mode) -> Vec<PathBuf> {
    let paths: &[&str] = match mode {
        Mode::Smoke => &["src/api/clients/http.ts", "src/api/endpoints/pets.ts"],
        Mode::Full => &[
            "tests/api/pet.crud.spec.ts",
            "tests/api/user.crud.spec.ts",
            "src/api/clients/http.ts",
            "src/api/endpoints/pets.ts",
            "src/api/endpoints/users.ts",
        ],
    };
    paths.iter().map(PathBuf::from).collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<T: FromStr + Copy>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "invalid numeric setting, using default");
            default
        }),
        None => default,
    }
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}
