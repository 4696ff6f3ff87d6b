use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{Config, TransportKind};
use crate::context::{MAX_CONTEXT_BYTES, preview, read_context_files, render_context};
use crate::dispatch::registry::{TransportRegistry, strategy_chain};
use crate::dispatch::{GenerateRequest, GenerateResult, Strategy};
use crate::error::TestgenError;
use crate::parser::{GeneratedTest, parse_response};
use crate::prompt::{Prompt, single_prompt, system_prompt, user_prompt};
use crate::salvage::salvage;
use crate::sanitize::sanitize;
use crate::task::{GenerationTask, TaskFamily};
use crate::writer::Writer;

/// Outputs shorter than this (non-whitespace chars) count as a failed attempt.
const MIN_OUTPUT_CHARS: usize = 5;

/// Upper bound on the pause between retry rounds.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How long a cancelled attempt gets to tear down its transport.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Bytes of raw/sanitized output logged with `DEBUG_AI_OUTPUT`.
const DEBUG_PREVIEW_BYTES: usize = 500;

/// File name for a salvaged combined-mode answer.
const SMOKE_SALVAGE_NAME: &str = "pet.smoke.generated.spec.ts";
const FULL_SALVAGE_NAME: &str = "generated.spec.ts";

/// Run stage, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    HealthChecking,
    ModelResolving,
    WarmingUp,
    Prompting,
    Transporting,
    Parsing,
    Validating,
    Writing,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthChecking => "health-check",
            Self::ModelResolving => "model-resolve",
            Self::WarmingUp => "warm-up",
            Self::Prompting => "prompt",
            Self::Transporting => "transport",
            Self::Parsing => "parse",
            Self::Validating => "validate",
            Self::Writing => "write",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a written file's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Parsed from the model's structured answer.
    Model,
    /// Extracted from unstructured model output.
    Salvaged,
    /// Deterministic template.
    Template,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Salvaged => "salvaged",
            Self::Template => "template",
        }
    }
}

#[derive(Debug)]
pub enum TaskResult {
    Written { path: PathBuf, source: Source },
    Failed { error: TestgenError },
}

#[derive(Debug)]
pub struct TaskOutcome {
    /// Task label, or the record's file name when no task owns it.
    pub label: String,
    pub result: TaskResult,
}

impl TaskOutcome {
    pub fn source(&self) -> Option<Source> {
        match &self.result {
            TaskResult::Written { source, .. } => Some(*source),
            TaskResult::Failed { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub model: String,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunSummary {
    pub fn written_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, TaskResult::Written { .. }))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, TaskResult::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

/// Sampling settings for one generation unit.
#[derive(Debug, Clone, Copy)]
struct Sampling {
    temperature: f64,
    num_predict: u32,
}

/// Drives a run: health check, model resolution, optional warm-up, then
/// per-task or combined generation with fallbacks.
///
/// Tasks run sequentially; the output directory is only touched by the
/// writer, one record at a time.
pub struct Orchestrator {
    config: Config,
    family: TaskFamily,
    registry: TransportRegistry,
    writer: Writer,
}

impl Orchestrator {
    pub fn new(config: Config, family: TaskFamily) -> Self {
        let registry = TransportRegistry::from_config(&config);
        let writer = Writer::new(config.root_dir.clone(), config.output_dir.clone());
        Self {
            config,
            family,
            registry,
            writer,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, TestgenError> {
        let start = Instant::now();
        tracing::info!(
            mode = self.config.mode.as_str(),
            incremental = self.config.is_incremental(),
            family = %self.family.name,
            server = %self.config.server_url,
            "starting generation run"
        );

        self.health_check().await?;
        let model = self.resolve_model().await?;

        if self.config.transport == TransportKind::Process && !self.registry.cli().is_available().await
        {
            tracing::warn!(
                executable = self.registry.cli().executable(),
                "process transport client not runnable, falling back to HTTP"
            );
        }

        if self.config.should_warm_up() {
            self.warm_up(&model).await;
        } else {
            tracing::info!("skipping warm-up");
        }

        let outcomes = if self.config.skip_model {
            tracing::info!("model generation disabled, writing templates");
            self.write_templates().await
        } else if self.config.is_incremental() {
            self.run_incremental(&model).await
        } else {
            self.run_combined(&model).await?
        };

        let summary = RunSummary { model, outcomes };
        for outcome in &summary.outcomes {
            match &outcome.result {
                TaskResult::Written { path, source } => tracing::info!(
                    task = %outcome.label,
                    source = source.as_str(),
                    path = %path.display(),
                    "task complete"
                ),
                TaskResult::Failed { error } => tracing::error!(
                    task = %outcome.label,
                    stage = error.stage(),
                    "task failed: {}",
                    error.user_message()
                ),
            }
        }
        tracing::info!(
            phase = %Phase::Done,
            output = %self.config.output_root().display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generated: {}/{}",
            summary.written_count(),
            summary.outcomes.len()
        );
        Ok(summary)
    }

    // -- Run-level checks --

    async fn health_check(&self) -> Result<(), TestgenError> {
        tracing::info!(phase = %Phase::HealthChecking, url = %self.config.server_url);
        let status = self
            .registry
            .http()
            .health(self.registry.base_url(), self.config.health_timeout)
            .await?;
        if (200..300).contains(&status) {
            tracing::info!(status, "generation server reachable");
        } else {
            tracing::warn!(status, "health probe returned non-success status, continuing");
        }
        Ok(())
    }

    async fn resolve_model(&self) -> Result<String, TestgenError> {
        tracing::info!(phase = %Phase::ModelResolving, model = %self.config.model);
        let requested = &self.config.model;

        let resolved = match self
            .registry
            .http()
            .list_models(self.registry.base_url(), self.config.health_timeout)
            .await
        {
            Ok(installed) => match pick_model(requested, &installed) {
                Some(name) => name,
                None => {
                    return Err(TestgenError::ModelNotFound {
                        model: requested.clone(),
                        installed,
                    });
                }
            },
            Err(e) => {
                tracing::warn!("could not list installed models, using '{requested}': {e}");
                requested.clone()
            }
        };

        if let Some(expected) = &self.config.expected_model
            && !resolved.starts_with(expected.as_str())
        {
            return Err(TestgenError::ModelMismatch {
                resolved,
                expected: expected.clone(),
            });
        }

        if resolved != *requested {
            tracing::info!(requested = %requested, resolved = %resolved, "resolved model variant");
        }
        Ok(resolved)
    }

    /// Prime the model with a tiny request. Never fatal.
    async fn warm_up(&self, model: &str) {
        tracing::info!(phase = %Phase::WarmingUp, model);
        let attempt = |strategy: Strategy| {
            let req = GenerateRequest {
                prompt: "PING".to_string(),
                model: model.to_string(),
                deadline: Instant::now() + self.config.warmup_timeout,
                temperature: 0.0,
                num_predict: 5,
                cancellation_token: None,
            };
            async move { self.registry.generate(strategy, &req).await }
        };

        let result = match attempt(Strategy::Buffered).await {
            Err(e) if self.config.transport == TransportKind::Process => {
                tracing::warn!("warm-up over HTTP failed, retrying via process: {e}");
                attempt(Strategy::Process).await
            }
            other => other,
        };

        match result {
            Ok(r) => tracing::info!(latency_ms = r.latency_ms, "model warmed up"),
            Err(e) => tracing::warn!("warm-up failed, continuing: {}", e.user_message()),
        }
    }

    // -- Generation modes --

    async fn write_templates(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(self.family.tasks.len());
        for task in &self.family.tasks {
            let record = self.family.fallback(task);
            outcomes.push(self.write_outcome(&task.label, &record, Source::Template).await);
        }
        outcomes
    }

    /// One request per task; any task failure degrades to its template.
    async fn run_incremental(&self, model: &str) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(self.family.tasks.len());

        for task in &self.family.tasks {
            tracing::info!(task = %task.label, file = %task.file_name, "generating");
            let token = CancellationToken::new();
            let result = self
                .race_total_timeout(&token, self.generate_task(model, task, &token))
                .await;

            let (record, source) = match result {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        task = %task.label,
                        stage = e.stage(),
                        "generation failed, writing template: {}",
                        e.user_message()
                    );
                    (self.family.fallback(task), Source::Template)
                }
            };
            outcomes.push(self.write_outcome(&task.label, &record, source).await);
        }
        outcomes
    }

    /// Transport rounds for one task. Each round walks the strategy chain;
    /// unusable output (parse, salvage, or validation failure) consumes a round.
    async fn generate_task(
        &self,
        model: &str,
        task: &GenerationTask,
        token: &CancellationToken,
    ) -> Result<(GeneratedTest, Source), TestgenError> {
        tracing::debug!(phase = %Phase::Prompting, task = %task.label);
        let prompt = single_prompt(&self.family, task, &self.output_dir_label());
        let sampling = Sampling {
            temperature: self.config.single_temperature,
            num_predict: self.config.single_max_tokens,
        };

        let mut last_err = None;
        for round in 0..=self.config.attempt_retries() {
            if round > 0 && !self.backoff(round, token).await {
                break;
            }

            let result = match self.try_chain(&prompt, model, sampling, token).await {
                Ok(result) => result,
                Err(e) if e.is_retryable() => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.log_debug_output(&result.text);

            match self.extract_for_task(task, &result.text) {
                Ok(found) => return Ok(found),
                Err(e) => {
                    tracing::warn!(task = %task.label, round, "unusable output: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TestgenError::Other("generation cancelled".to_string())))
    }

    /// Parse (or salvage) one record for `task` and validate it.
    fn extract_for_task(
        &self,
        task: &GenerationTask,
        raw: &str,
    ) -> Result<(GeneratedTest, Source), TestgenError> {
        tracing::debug!(phase = %Phase::Parsing, task = %task.label);
        let (mut record, source) = match parse_response(raw) {
            Ok(resp) => match resp.tests.into_iter().next() {
                Some(record) => (record, Source::Model),
                None => {
                    return Err(TestgenError::CountMismatch {
                        expected: 1,
                        actual: 0,
                    });
                }
            },
            Err(parse_err) => {
                match salvage(raw, &task.file_name, task.relative_dir.as_deref()) {
                    Some(record) => (record, Source::Salvaged),
                    None => return Err(parse_err),
                }
            }
        };

        // The task owns the file identity; the model only supplies code.
        // `None` lands in the writer's default directory, like the template.
        record.file_name = task.file_name.clone();
        record.relative_dir = task.relative_dir.clone();

        tracing::debug!(phase = %Phase::Validating, task = %task.label);
        self.family.rules.check(&record.code)?;
        Ok((record, source))
    }

    /// One request for every file. Record count and parse failures are fatal
    /// here; only validation failures fall back per record.
    async fn run_combined(&self, model: &str) -> Result<Vec<TaskOutcome>, TestgenError> {
        tracing::debug!(phase = %Phase::Prompting);
        let context = read_context_files(
            &self.config.root_dir,
            &self.config.context_files,
            MAX_CONTEXT_BYTES,
        )
        .await?;
        if !context.missing.is_empty() {
            tracing::debug!(missing = ?context.missing, "some context files were not found");
        }

        let prompt = Prompt {
            system: system_prompt(&self.family, &self.output_dir_label()),
            user: user_prompt(self.config.mode, &self.family, &render_context(&context.files)),
        }
        .render();
        let sampling = Sampling {
            temperature: self.config.temperature,
            num_predict: self.config.max_tokens,
        };

        let token = CancellationToken::new();
        let result = self
            .race_total_timeout(&token, self.combined_call(&prompt, model, sampling, &token))
            .await?;
        self.log_debug_output(&result.text);

        tracing::debug!(phase = %Phase::Parsing);
        let (records, source) = match parse_response(&result.text) {
            Ok(resp) => (resp.tests, Source::Model),
            Err(parse_err) => {
                let name = if self.config.is_smoke() {
                    SMOKE_SALVAGE_NAME
                } else {
                    FULL_SALVAGE_NAME
                };
                match salvage(&result.text, name, None) {
                    Some(record) => {
                        tracing::warn!("structured parse failed, salvaged a single file: {parse_err}");
                        (vec![record], Source::Salvaged)
                    }
                    None => return Err(parse_err),
                }
            }
        };

        if self.config.is_smoke() && records.len() != self.family.expected_count() {
            return Err(TestgenError::CountMismatch {
                expected: self.family.expected_count(),
                actual: records.len(),
            });
        }
        if records.is_empty() {
            return Err(TestgenError::Parse("model returned no tests".to_string()));
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            tracing::debug!(phase = %Phase::Validating, file = %record.file_name);
            let task = self.family.task_for_file(&record.file_name);
            let label = task.map_or_else(|| record.file_name.clone(), |t| t.label.clone());

            match self.family.rules.check(&record.code) {
                Ok(()) => outcomes.push(self.write_outcome(&label, &record, source).await),
                Err(e) => match task {
                    Some(task) => {
                        tracing::warn!(task = %label, "{e}, writing template");
                        let fallback = self.family.fallback(task);
                        outcomes.push(self.write_outcome(&label, &fallback, Source::Template).await);
                    }
                    None => {
                        tracing::warn!(file = %record.file_name, "{e}, record skipped");
                        outcomes.push(TaskOutcome {
                            label,
                            result: TaskResult::Failed { error: e },
                        });
                    }
                },
            }
        }
        Ok(outcomes)
    }

    async fn combined_call(
        &self,
        prompt: &str,
        model: &str,
        sampling: Sampling,
        token: &CancellationToken,
    ) -> Result<GenerateResult, TestgenError> {
        let mut last_err = None;
        for round in 0..=self.config.attempt_retries() {
            if round > 0 && !self.backoff(round, token).await {
                break;
            }
            match self.try_chain(prompt, model, sampling, token).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| TestgenError::Other("no generation attempts made".to_string())))
    }

    // -- Transport plumbing --

    /// Walk the strategy chain once. Each call gets its own deadline.
    async fn try_chain(
        &self,
        prompt: &str,
        model: &str,
        sampling: Sampling,
        token: &CancellationToken,
    ) -> Result<GenerateResult, TestgenError> {
        let mut last_err = None;

        for strategy in strategy_chain(&self.config) {
            if token.is_cancelled() {
                return Err(TestgenError::Timeout(0));
            }
            let req = GenerateRequest {
                prompt: prompt.to_string(),
                model: model.to_string(),
                deadline: Instant::now() + self.config.attempt_timeout(),
                temperature: sampling.temperature,
                num_predict: sampling.num_predict,
                cancellation_token: Some(token.clone()),
            };

            tracing::debug!(phase = %Phase::Transporting, strategy = %strategy);
            let err = match self.registry.generate(strategy, &req).await {
                Ok(result) if meaningful(&result.text) => {
                    tracing::info!(
                        strategy = %result.strategy,
                        latency_ms = result.latency_ms,
                        chars = result.text.len(),
                        discarded = result.stats.discarded,
                        "generation succeeded"
                    );
                    return Ok(result);
                }
                Ok(result) => TestgenError::EmptyOutput(result.text.trim().chars().count()),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            tracing::warn!(strategy = %strategy, "attempt failed: {}", err.user_message());
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| TestgenError::Other("empty strategy chain".to_string())))
    }

    /// Race `work` against the total timeout. On expiry the token is
    /// cancelled and the attempt gets a short grace period to tear down
    /// its transport (e.g. kill a child process group) before being dropped.
    async fn race_total_timeout<T, F>(
        &self,
        token: &CancellationToken,
        work: F,
    ) -> Result<T, TestgenError>
    where
        F: Future<Output = Result<T, TestgenError>>,
    {
        let total = self.config.total_timeout;
        tokio::pin!(work);

        tokio::select! {
            biased;
            result = &mut work => result,
            _ = tokio::time::sleep(total) => {
                token.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut work).await.is_err() {
                    tracing::warn!("attempt ignored cancellation, abandoning it");
                }
                Err(TestgenError::TotalTimeout(total.as_millis() as u64))
            }
        }
    }

    /// Pause before retry `round`. Returns false if cancelled first.
    async fn backoff(&self, round: u32, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        let delay = backoff_delay(self.config.backoff_base, round);
        tracing::debug!(round, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    // -- Output --

    async fn write_outcome(&self, label: &str, record: &GeneratedTest, source: Source) -> TaskOutcome {
        tracing::debug!(phase = %Phase::Writing, file = %record.file_name);
        let result = match self.writer.write(record).await {
            Ok(path) => TaskResult::Written { path, source },
            Err(error) => TaskResult::Failed { error },
        };
        TaskOutcome {
            label: label.to_string(),
            result,
        }
    }

    fn output_dir_label(&self) -> String {
        self.config.output_dir.to_string_lossy().replace('\\', "/")
    }

    fn log_debug_output(&self, raw: &str) {
        if !self.config.debug_output {
            return;
        }
        let cleaned = sanitize(raw);
        tracing::info!(
            raw = preview(raw, DEBUG_PREVIEW_BYTES),
            sanitized = preview(&cleaned, DEBUG_PREVIEW_BYTES),
            "model output"
        );
    }
}

/// Exact name, then `<name>:latest`, then the first `<name>:<tag>` variant.
pub fn pick_model(requested: &str, installed: &[String]) -> Option<String> {
    if installed.iter().any(|m| m == requested) {
        return Some(requested.to_string());
    }
    if requested.contains(':') {
        return None;
    }
    let latest = format!("{requested}:latest");
    if installed.contains(&latest) {
        return Some(latest);
    }
    let prefix = format!("{requested}:");
    installed.iter().find(|m| m.starts_with(&prefix)).cloned()
}

/// `base * 2^(round - 1)`, capped.
pub fn backoff_delay(base: Duration, round: u32) -> Duration {
    let factor = 1u32 << round.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

fn meaningful(text: &str) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() >= MIN_OUTPUT_CHARS
}
