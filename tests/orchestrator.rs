//! End-to-end runs against a raw TCP mock of the generation server.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use testgen::config::{Config, Mode, TransportKind};
use testgen::error::{EXIT_FAILURE, EXIT_MODEL, EXIT_UNREACHABLE, TestgenError};
use testgen::orchestrator::{Orchestrator, Source, TaskResult};
use testgen::task::TaskFamily;

const GENERATED: &str = "tests/api/generated";

struct Request {
    line: String,
    body: String,
}

impl Request {
    fn is_stream(&self) -> bool {
        self.body.contains(r#""stream":true"#)
    }
}

enum Answer {
    Text(String),
    Status(u16),
    Hang,
}

struct MockOllama {
    base: String,
    generate_calls: Arc<AtomicUsize>,
    _server: JoinHandle<()>,
}

/// Helper: serve `/api/tags` from `tags` and `/api/generate` from `generate`.
async fn mock_ollama<F>(tags: &[&str], generate: F) -> MockOllama
where
    F: Fn(&Request) -> Answer + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tags_body = serde_json::json!({
        "models": tags.iter().map(|t| serde_json::json!({ "name": t })).collect::<Vec<_>>()
    })
    .to_string();

    let generate = Arc::new(generate);
    let generate_calls = Arc::new(AtomicUsize::new(0));
    let calls = generate_calls.clone();

    let server = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let generate = generate.clone();
            let calls = calls.clone();
            let tags_body = tags_body.clone();
            tokio::spawn(async move {
                handle(socket, &tags_body, generate.as_ref(), &calls).await;
            });
        }
    });

    MockOllama {
        base: format!("http://127.0.0.1:{port}"),
        generate_calls,
        _server: server,
    }
}

async fn handle<F>(mut socket: TcpStream, tags_body: &str, generate: &F, calls: &AtomicUsize)
where
    F: Fn(&Request) -> Answer,
{
    let Some(req) = read_request(&mut socket).await else {
        return;
    };

    if req.line.starts_with("GET /api/tags") {
        let _ = socket.write_all(json_response(200, tags_body).as_bytes()).await;
        return;
    }

    calls.fetch_add(1, Ordering::SeqCst);
    match generate(&req) {
        Answer::Text(text) if req.is_stream() => {
            let mut out = String::from(
                "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n",
            );
            out.push_str(&serde_json::json!({ "response": text, "done": false }).to_string());
            out.push('\n');
            out.push_str("{\"response\":\"\",\"done\":true}\n");
            let _ = socket.write_all(out.as_bytes()).await;
        }
        Answer::Text(text) => {
            let body = serde_json::json!({ "response": text, "done": true }).to_string();
            let _ = socket.write_all(json_response(200, &body).as_bytes()).await;
        }
        Answer::Status(status) => {
            let _ = socket
                .write_all(json_response(status, r#"{"error":"mock failure"}"#).as_bytes())
                .await;
        }
        Answer::Hang => tokio::time::sleep(Duration::from_secs(60)).await,
    }
}

/// Read one full HTTP request (headers plus Content-Length body).
async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_string();
            let len = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    if k.eq_ignore_ascii_case("content-length") {
                        v.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + len {
                return Some(Request {
                    line: head.lines().next().unwrap_or_default().to_string(),
                    body: String::from_utf8_lossy(&data[end + 4..end + 4 + len]).to_string(),
                });
            }
        }
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    }
}

fn json_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn smoke_config(base: &str, root: &Path, incremental: bool) -> Config {
    Config {
        server_url: base.to_string(),
        model: "mistral".to_string(),
        expected_model: Some("mistral".to_string()),
        mode: Mode::Smoke,
        incremental,
        stream_first: false,
        call_timeout: Duration::from_secs(3),
        single_timeout: Duration::from_secs(3),
        total_timeout: Duration::from_secs(10),
        health_timeout: Duration::from_secs(2),
        warmup_timeout: Duration::from_secs(2),
        retries: 0,
        single_retries: 1,
        backoff_base: Duration::from_millis(10),
        skip_warmup: true,
        skip_model: false,
        root_dir: root.to_path_buf(),
        context_files: vec![],
        curl_bin: "/nonexistent/testgen-fake-curl".to_string(),
        ..Config::default()
    }
}

/// The task a single-file prompt is about.
fn task_in(req: &Request) -> testgen::task::GenerationTask {
    TaskFamily::pet_status()
        .tasks
        .into_iter()
        .find(|t| req.body.contains(&t.file_name))
        .unwrap()
}

fn envelope_json(records: &[(String, String)]) -> String {
    let tests: Vec<_> = records
        .iter()
        .map(|(name, code)| {
            serde_json::json!({ "fileName": name, "relativeDir": GENERATED, "code": code })
        })
        .collect();
    serde_json::json!({ "tests": tests }).to_string()
}

fn generated(root: &Path, name: &str) -> std::path::PathBuf {
    root.join(GENERATED).join(name)
}

/// Helper: a `/bin/sh` stand-in for curl. A single-file prompt is answered
/// with the template of the task it names, wrapped in one streaming envelope;
/// a warm-up ping appends to `pings` and gets a short reply.
fn fake_curl(root: &Path, pings: &Path) -> String {
    let family = TaskFamily::pet_status();
    let mut script = String::from(
        "#!/bin/sh\n[ \"$1\" = \"--version\" ] && exit 0\nbody=$(cat)\n",
    );
    script.push_str(&format!(
        "case \"$body\" in *'\"prompt\":\"PING\"'*) echo ping >> '{}'; printf '%s\\n' '{{\"response\":\"pong\",\"done\":true}}'; exit 0;; esac\n",
        pings.display()
    ));
    for task in &family.tasks {
        let reply = root.join(format!("{}.ndjson", task.label));
        let answer = envelope_json(&[(task.file_name.clone(), family.render(task))]);
        let line = serde_json::json!({ "response": answer, "done": true }).to_string();
        std::fs::write(&reply, format!("{line}\n")).unwrap();
        script.push_str(&format!(
            "case \"$body\" in *{}*) cat '{}'; exit 0;; esac\n",
            task.file_name,
            reply.display()
        ));
    }
    script.push_str("echo 'curl: (22) unexpected prompt' >&2\nexit 22\n");

    let path = root.join("fake-curl");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

// ---------------------------------------------------------------------------
// Run-level failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_server_exits_with_unreachable_code_and_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    drop(listener);

    let orch = Orchestrator::new(smoke_config(&base, tmp.path(), true), TaskFamily::pet_status());
    let err = orch.run().await.unwrap_err();

    assert!(matches!(err, TestgenError::Unreachable { .. }), "got {err:?}");
    assert_eq!(err.exit_code(), EXIT_UNREACHABLE);
    assert_eq!(err.stage(), "health-check");
    assert!(!tmp.path().join(GENERATED).exists());
}

#[tokio::test]
async fn model_mismatch_exits_before_generation() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["llama3:8b"], |_| Answer::Text("unused".to_string())).await;

    let config = Config {
        model: "llama3".to_string(),
        ..smoke_config(&mock.base, tmp.path(), true)
    };
    let err = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap_err();

    match &err {
        TestgenError::ModelMismatch { resolved, expected } => {
            assert_eq!(resolved, "llama3:8b");
            assert_eq!(expected, "mistral");
        }
        other => panic!("expected ModelMismatch, got {other:?}"),
    }
    assert_eq!(err.exit_code(), EXIT_MODEL);
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 0);
    assert!(!tmp.path().join(GENERATED).exists());
}

#[tokio::test]
async fn missing_model_lists_installed_models() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["llama3:8b", "phi3:mini"], |_| Answer::Status(500)).await;

    let err = Orchestrator::new(
        smoke_config(&mock.base, tmp.path(), true),
        TaskFamily::pet_status(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, TestgenError::ModelNotFound { .. }));
    assert_eq!(err.exit_code(), EXIT_MODEL);
    let msg = err.user_message();
    assert!(msg.contains("llama3:8b, phi3:mini"));
    assert!(msg.contains("ollama pull mistral"));
}

#[tokio::test]
async fn combined_smoke_with_empty_tests_is_count_mismatch() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| {
        Answer::Text(r#"{"tests":[]}"#.to_string())
    })
    .await;

    let config = Config {
        stream_first: true,
        ..smoke_config(&mock.base, tmp.path(), false)
    };
    let err = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap_err();

    match err {
        TestgenError::CountMismatch { expected, actual } => {
            assert_eq!(expected, 3);
            assert_eq!(actual, 0);
        }
        other => panic!("expected CountMismatch, got {other:?}"),
    }
    assert!(!tmp.path().join(GENERATED).exists());
}

#[tokio::test]
async fn combined_total_timeout_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Hang).await;

    let config = Config {
        mode: Mode::Full,
        total_timeout: Duration::from_millis(500),
        ..smoke_config(&mock.base, tmp.path(), false)
    };

    let start = Instant::now();
    let err = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, TestgenError::TotalTimeout(500)), "got {err:?}");
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    assert!(start.elapsed() < Duration::from_secs(4));
}

// ---------------------------------------------------------------------------
// Incremental generation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn structured_answers_are_written_as_model_output() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |req| {
        let task = task_in(req);
        let code = TaskFamily::pet_status().render(&task);
        Answer::Text(envelope_json(&[(task.file_name, code)]))
    })
    .await;

    let family = TaskFamily::pet_status();
    let summary = Orchestrator::new(smoke_config(&mock.base, tmp.path(), true), family.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.model, "mistral:latest");
    assert_eq!(summary.written_count(), 3);
    assert!(!summary.has_failures());
    for (outcome, task) in summary.outcomes.iter().zip(&family.tasks) {
        assert_eq!(outcome.label, task.label);
        assert_eq!(outcome.source(), Some(Source::Model));
        let written = std::fs::read_to_string(generated(tmp.path(), &task.file_name)).unwrap();
        assert_eq!(written, family.render(task));
    }
}

#[tokio::test]
async fn prose_around_fenced_file_is_salvaged() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |req| {
        let task = task_in(req);
        let code = TaskFamily::pet_status().render(&task);
        Answer::Text(format!(
            "Sure! Here is the test file you asked for:\n```typescript\n{code}```\nLet me know if you need changes."
        ))
    })
    .await;

    let family = TaskFamily::pet_status();
    let summary = Orchestrator::new(smoke_config(&mock.base, tmp.path(), true), family.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    for (outcome, task) in summary.outcomes.iter().zip(&family.tasks) {
        assert_eq!(outcome.source(), Some(Source::Salvaged), "{}", task.label);
        let written = std::fs::read_to_string(generated(tmp.path(), &task.file_name)).unwrap();
        assert_eq!(written, family.render(task).trim());
        assert!(!written.contains("Sure!"));
        family.rules.check(&written).unwrap();
    }
}

#[tokio::test]
async fn forbidden_mocking_call_falls_back_to_template() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |req| {
        let task = task_in(req);
        let code = format!(
            "{}\njest.mock(\"../../../src/api/clients/http\");\n",
            TaskFamily::pet_status().render(&task)
        );
        Answer::Text(envelope_json(&[(task.file_name, code)]))
    })
    .await;

    let family = TaskFamily::pet_status();
    let summary = Orchestrator::new(smoke_config(&mock.base, tmp.path(), true), family.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    assert!(!summary.has_failures());
    for (outcome, task) in summary.outcomes.iter().zip(&family.tasks) {
        assert_eq!(outcome.source(), Some(Source::Template));
        let written = std::fs::read_to_string(generated(tmp.path(), &task.file_name)).unwrap();
        assert!(!written.contains("jest.mock"));
        assert_eq!(written, family.render(task));
    }
}

#[tokio::test]
async fn always_failing_transport_still_writes_every_file() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Status(500)).await;

    let family = TaskFamily::pet_status();
    let summary = Orchestrator::new(smoke_config(&mock.base, tmp.path(), true), family.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), family.tasks.len());
    assert!(
        summary
            .outcomes
            .iter()
            .all(|o| o.source() == Some(Source::Template))
    );
    // 3 tasks x 2 rounds x (stream + buffered); the process client never starts.
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 12);
    for task in &family.tasks {
        assert!(generated(tmp.path(), &task.file_name).exists());
    }
}

#[tokio::test]
async fn total_timeout_per_task_falls_back_without_hanging() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Hang).await;

    let config = Config {
        single_timeout: Duration::from_secs(30),
        total_timeout: Duration::from_millis(400),
        ..smoke_config(&mock.base, tmp.path(), true)
    };

    let start = Instant::now();
    let summary = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    assert!(
        summary
            .outcomes
            .iter()
            .all(|o| o.source() == Some(Source::Template))
    );
    assert!(start.elapsed() < Duration::from_secs(6), "took {:?}", start.elapsed());
}

#[tokio::test]
async fn model_chosen_directory_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |req| {
        let task = task_in(req);
        let code = TaskFamily::pet_status().render(&task);
        let answer = serde_json::json!({
            "tests": [{ "fileName": "whatever.ts", "relativeDir": "src/api", "code": code }]
        });
        Answer::Text(answer.to_string())
    })
    .await;

    let family = TaskFamily::pet_status();
    let summary = Orchestrator::new(smoke_config(&mock.base, tmp.path(), true), family.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    for (outcome, task) in summary.outcomes.iter().zip(&family.tasks) {
        assert_eq!(outcome.source(), Some(Source::Model));
        match &outcome.result {
            TaskResult::Written { path, .. } => {
                assert_eq!(*path, generated(tmp.path(), &task.file_name));
            }
            TaskResult::Failed { error } => panic!("{} failed: {error}", task.label),
        }
    }
    assert!(!tmp.path().join("src").exists());
}

#[tokio::test]
async fn backoff_yields_to_total_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Status(500)).await;

    let config = Config {
        backoff_base: Duration::from_secs(5),
        total_timeout: Duration::from_millis(300),
        ..smoke_config(&mock.base, tmp.path(), true)
    };

    let start = Instant::now();
    let summary = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    // One round per task; the backoff sleep is cut short by cancellation.
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 6);
    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
}

#[tokio::test]
async fn process_transport_recovers_after_http_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Status(500)).await;
    let pings = tmp.path().join("pings");

    let config = Config {
        curl_bin: fake_curl(tmp.path(), &pings),
        ..smoke_config(&mock.base, tmp.path(), true)
    };
    let family = TaskFamily::pet_status();
    let summary = Orchestrator::new(config, family.clone()).run().await.unwrap();

    assert_eq!(summary.written_count(), 3);
    for (outcome, task) in summary.outcomes.iter().zip(&family.tasks) {
        assert_eq!(outcome.source(), Some(Source::Model), "{}", task.label);
        let written = std::fs::read_to_string(generated(tmp.path(), &task.file_name)).unwrap();
        assert_eq!(written, family.render(task));
    }
    // stream + buffered per task before the process client answers.
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn process_transport_first_skips_http_generate() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Status(500)).await;
    let pings = tmp.path().join("pings");

    let config = Config {
        transport: TransportKind::Process,
        curl_bin: fake_curl(tmp.path(), &pings),
        ..smoke_config(&mock.base, tmp.path(), true)
    };
    let summary = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    assert!(
        summary
            .outcomes
            .iter()
            .all(|o| o.source() == Some(Source::Model))
    );
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 0);
    assert!(!pings.exists());
}

#[tokio::test]
async fn warm_up_retries_via_process_transport() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Status(500)).await;
    let pings = tmp.path().join("pings");

    let config = Config {
        transport: TransportKind::Process,
        skip_warmup: false,
        force_warmup: true,
        curl_bin: fake_curl(tmp.path(), &pings),
        ..smoke_config(&mock.base, tmp.path(), true)
    };
    let summary = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    // Only the warm-up's buffered attempt reaches HTTP generate.
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read_to_string(&pings).unwrap(), "ping\n");
}

#[tokio::test]
async fn skip_model_writes_templates_without_generating() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| Answer::Status(500)).await;

    let config = Config {
        skip_model: true,
        ..smoke_config(&mock.base, tmp.path(), true)
    };
    let summary = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 3);
    assert_eq!(mock.generate_calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Combined generation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn combined_smoke_replaces_invalid_records_with_templates() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| {
        let family = TaskFamily::pet_status();
        let records: Vec<_> = family
            .tasks
            .iter()
            .map(|t| {
                let mut code = family.render(t);
                if t.label == "pending" {
                    code.push_str("\nimport axios from \"axios\";\n");
                }
                (t.file_name.clone(), code)
            })
            .collect();
        Answer::Text(format!("```json\n{}\n```", envelope_json(&records)))
    })
    .await;

    let summary = Orchestrator::new(
        smoke_config(&mock.base, tmp.path(), false),
        TaskFamily::pet_status(),
    )
    .run()
    .await
    .unwrap();

    let sources: Vec<_> = summary
        .outcomes
        .iter()
        .map(|o| (o.label.as_str(), o.source()))
        .collect();
    assert_eq!(
        sources,
        vec![
            ("available", Some(Source::Model)),
            ("pending", Some(Source::Template)),
            ("invalid", Some(Source::Model)),
        ]
    );
    let pending =
        std::fs::read_to_string(generated(tmp.path(), "pet.findByStatus.pending.smoke.spec.ts"))
            .unwrap();
    assert!(!pending.contains("axios"));
}

#[tokio::test]
async fn full_mode_skips_unowned_invalid_records() {
    let tmp = tempfile::tempdir().unwrap();
    let mock = mock_ollama(&["mistral:latest"], |_| {
        let family = TaskFamily::pet_status();
        let good = family.render(&family.tasks[0]);
        Answer::Text(envelope_json(&[
            ("pets.update.spec.ts".to_string(), good),
            ("store.spec.ts".to_string(), "jest.mock(\"x\");".to_string()),
        ]))
    })
    .await;

    let config = Config {
        mode: Mode::Full,
        ..smoke_config(&mock.base, tmp.path(), false)
    };
    let summary = Orchestrator::new(config, TaskFamily::pet_status())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written_count(), 1);
    assert!(summary.has_failures());
    let failed: Vec<_> = summary.failed().collect();
    assert_eq!(failed[0].label, "store.spec.ts");
    assert!(matches!(
        failed[0].result,
        TaskResult::Failed {
            error: TestgenError::Validation(_)
        }
    ));
    assert!(generated(tmp.path(), "pets.update.spec.ts").exists());
    assert!(!generated(tmp.path(), "store.spec.ts").exists());
}
