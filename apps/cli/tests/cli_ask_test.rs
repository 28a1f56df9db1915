//! Integration tests for the `docintel` commands against a mock backend.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ANSWER_BODY: &str = r#"{
    "message_id": "m2",
    "session_id": "s1",
    "role": "assistant",
    "content": "Revenue was $10M [1]",
    "citations": [{
        "citation_id": "[1]",
        "chunk_id": "c1",
        "document_id": "d1",
        "document_name": "q3.pdf",
        "page_number": 4,
        "text_snippet": "Revenue of $10M"
    }]
}"#;

fn history_body() -> String {
    format!(
        r#"{{"session_id":"s1","title":"Quarterly review","messages":[
            {{"message_id":"m1","session_id":"s1","role":"user","content":"What is the Q3 revenue?"}},
            {}
        ]}}"#,
        ANSWER_BODY
    )
}

/// Writes a config pointing at `base_url` with fast polling.
fn write_config(temp_dir: &TempDir, base_url: &str) -> String {
    let path = temp_dir.path().join("docintel.toml");
    fs::write(
        &path,
        format!(
            r#"base_url = "{}"

[progress]
fallback_initial_delay_ms = 10
poll_interval_ms = 10
max_poll_attempts = 5
"#,
            base_url
        ),
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("docintel-cli").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ask"))
        .stdout(predicate::str::contains("history"));
}

#[test]
fn test_config_prints_defaults() {
    let mut cmd = Command::cargo_bin("docintel-cli").unwrap();
    cmd.arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"base_url = "http://127.0.0.1:8000/api/chat""#))
        .stdout(predicate::str::contains("max_reconnect_attempts = 2"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    fs::write(&path, "base_url = \"ftp://example.com\"\n").unwrap();

    let mut cmd = Command::cargo_bin("docintel-cli").unwrap();
    cmd.arg("config")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid base_url"));
}

#[test]
fn test_history_prints_messages() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("GET", "/sessions/s1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(history_body())
        .create();

    let mut cmd = Command::cargo_bin("docintel-cli").unwrap();
    cmd.arg("history")
        .arg("s1")
        .arg("--base-url")
        .arg(server.url())
        .assert()
        .success()
        .stdout(predicate::str::contains("Quarterly review"))
        .stdout(predicate::str::contains("Revenue was $10M [1]"));
}

#[test]
fn test_ask_falls_back_when_stream_is_missing() {
    let mut server = mockito::Server::new();
    let _stream = server
        .mock("GET", mockito::Matcher::Regex(r"^/sessions/s1/stream/.+$".to_string()))
        .with_status(404)
        .create();
    let _post = server
        .mock("POST", "/sessions/s1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(ANSWER_BODY)
        .create();
    let _history = server
        .mock("GET", "/sessions/s1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(history_body())
        .create();

    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir, &server.url());

    let mut cmd = Command::cargo_bin("docintel-cli").unwrap();
    cmd.arg("--config")
        .arg(config)
        .arg("ask")
        .arg("s1")
        .arg("What is the Q3 revenue?")
        .assert()
        .success()
        .stdout(predicate::str::contains("Revenue was $10M [1]"))
        .stdout(predicate::str::contains("q3.pdf"));
}

#[test]
fn test_ask_reports_backend_failure() {
    let mut server = mockito::Server::new();
    let _stream = server
        .mock("GET", mockito::Matcher::Regex(r"^/sessions/s1/stream/.+$".to_string()))
        .with_status(404)
        .create();
    let _post = server
        .mock("POST", "/sessions/s1/messages")
        .with_status(500)
        .with_body("Error processing message")
        .create();
    let _history = server
        .mock("GET", "/sessions/s1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"session_id":"s1","messages":[]}"#)
        .create();

    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir, &server.url());

    let mut cmd = Command::cargo_bin("docintel-cli").unwrap();
    cmd.arg("--config")
        .arg(config)
        .arg("ask")
        .arg("s1")
        .arg("What is the Q3 revenue?")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Question failed"));
}
