//! CLI integration tests
//!
//! Runs the `rde` binary with assert_cmd, against a mock broker where a
//! network is involved.

use std::net::SocketAddr;

use assert_cmd::Command;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn rde(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rde")
        .expect("Failed to locate rde binary - ensure it's built before running tests");
    cmd.env("HOME", home.path())
        .env_remove("RDE_TOKEN")
        .env_remove("RDE_SERVER")
        .env_remove("RUST_LOG");
    cmd
}

async fn agent_stats(Path(agent_id): Path<String>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer test-token") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_token", "message": "token signature invalid", "retryable": false })),
        );
    }
    if agent_id != "user-alice-dev" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": "agent never connected", "retryable": false })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "agent_id": agent_id,
            "online": true,
            "last_activity": "2026-03-01T12:00:00Z",
            "last_access": null,
            "bytes_received": 10,
            "bytes_sent": 20,
            "open_streams": 1
        })),
    )
}

/// Serve a mock management API on a background runtime
fn mock_broker() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let address = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let app = Router::new().route("/mgmt/agents/:agent_id", get(agent_stats));
            axum::serve(listener, app).await.unwrap();
        });
    });
    address
}

#[test]
fn test_cli_help() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("rde"))
        .stdout(predicate::str::contains("remote development environments"));
}

#[test]
fn test_cli_version() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rde"));
}

#[test]
fn test_cli_connect_help() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .args(["connect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--wait"))
        .stdout(predicate::str::contains("stdin/stdout"));
}

#[test]
fn test_cli_unknown_command() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .arg("teleport")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_cli_invalid_wait() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .args(["connect", "user-alice-dev", "--wait", "soon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--wait"));
}

#[test]
fn test_cli_requires_server() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .args(["status", "user-alice-dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("RDE_SERVER"));
}

#[test]
fn test_cli_requires_token() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .args(["--server", "http://127.0.0.1:9", "connect", "user-alice-dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No token found"));
}

#[test]
fn test_cli_expired_token_file() {
    let home = TempDir::new().unwrap();
    std::fs::create_dir(home.path().join(".kuberde")).unwrap();
    std::fs::write(
        home.path().join(".kuberde/token.json"),
        r#"{"access_token":"old","expiry":"2020-01-01T00:00:00Z"}"#,
    )
    .unwrap();
    rde(&home)
        .args(["--server", "http://127.0.0.1:9", "status", "user-alice-dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expired"));
}

#[test]
fn test_cli_rejects_malformed_agent_id() {
    let home = TempDir::new().unwrap();
    rde(&home)
        .args(["--server", "http://127.0.0.1:9", "--token", "t", "status", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid agent id"));
}

#[test]
fn test_cli_status_prints_agent_json() {
    let home = TempDir::new().unwrap();
    let broker = mock_broker();
    rde(&home)
        .env("RDE_TOKEN", "test-token")
        .args(["--server", &format!("http://{}", broker), "status", "user-alice-dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""agent_id": "user-alice-dev""#))
        .stdout(predicate::str::contains(r#""open_streams": 1"#));
}

#[test]
fn test_cli_status_reports_broker_errors() {
    let home = TempDir::new().unwrap();
    let broker = mock_broker();
    std::fs::create_dir(home.path().join(".kuberde")).unwrap();
    std::fs::write(home.path().join(".kuberde/token"), "wrong-token\n").unwrap();
    rde(&home)
        .args(["--server", &format!("http://{}", broker), "status", "user-alice-dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("token signature invalid"));

    rde(&home)
        .env("RDE_TOKEN", "test-token")
        .args(["--server", &format!("http://{}", broker), "status", "user-bob-box"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("agent never connected"));
}
