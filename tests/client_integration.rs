// Client facade against a scripted engine: probes, status, and counts.
#![cfg(unix)]

mod common;

use common::{FakeEngine, SURICATA_SCHEMAS, suricata_engine};
use std::time::{Duration, Instant};
use tenzir_client::api::{Client, ClientConfig, ErrorKind, Query};

fn client(engine: &FakeEngine) -> Client {
    Client::new("localhost:42000")
        .expect("client")
        .with_program(engine.program())
}

#[tokio::test]
async fn probe_reports_a_reachable_node() {
    let engine = suricata_engine();
    assert!(client(&engine).test_connection().await);
    assert_eq!(engine.last_args(), ["status"]);
}

#[tokio::test]
async fn probe_is_false_when_the_node_refuses() {
    let engine = FakeEngine::new(
        "echo 'client failed to connect to node at localhost:42000' >&2\nexit 1\n",
    );
    assert!(!client(&engine).test_connection().await);
}

#[tokio::test]
async fn probe_is_false_without_the_program() {
    let client = Client::new("localhost").expect("client").with_program("/nonexistent/tenzir-ctl");
    assert!(!client.test_connection().await);
}

#[tokio::test]
async fn probe_gives_up_after_the_timeout() {
    let engine = FakeEngine::new("exec sleep 30\n");
    let config = ClientConfig::new()
        .with_program(engine.program())
        .with_probe_timeout(Duration::from_millis(200))
        .with_grace_period(Duration::from_millis(200));
    let client = Client::new("localhost").expect("client").with_config(config);
    let started = Instant::now();
    assert!(!client.test_connection().await);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn status_is_decoded_json() {
    let engine = suricata_engine();
    let status = client(&engine).status().await.expect("status");
    assert_eq!(status["version"], "v4.0.0");
    assert_eq!(status["endpoint"], "localhost:42000");
}

#[tokio::test]
async fn count_matches_the_fixture_size() {
    let engine = suricata_engine();
    let count = client(&engine).count(&Query::all()).await.expect("count");
    assert_eq!(count, SURICATA_SCHEMAS.len() as u64);
    assert_eq!(engine.last_args(), ["count"]);
}

#[tokio::test]
async fn count_passes_the_expression_verbatim() {
    let engine = suricata_engine();
    engine.write("count.txt", "1\n");
    let query = Query::new(r#"#schema == "suricata.alert""#);
    assert_eq!(client(&engine).count(&query).await.expect("count"), 1);
    assert_eq!(engine.last_args(), ["count", r#"#schema == "suricata.alert""#]);
}

#[tokio::test]
async fn count_with_garbage_output_is_a_protocol_error() {
    let engine = suricata_engine();
    engine.write("count.txt", "not a number\n");
    let err = client(&engine).count(&Query::all()).await.expect_err("err");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.raw(), Some(&b"not a number\n"[..]));
}

#[tokio::test]
async fn count_failure_carries_stderr() {
    let engine = FakeEngine::new("echo 'error: unknown field foo' >&2\nexit 2\n");
    let err = client(&engine)
        .count(&Query::new("foo == 1"))
        .await
        .expect_err("err");
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(err.exit_code(), Some(2));
    assert!(err.stderr().expect("stderr").contains("unknown field foo"));
}

#[tokio::test]
async fn count_against_a_dead_node_is_unreachable() {
    let engine =
        FakeEngine::new("echo 'failed to connect to node: connection refused' >&2\nexit 1\n");
    let err = client(&engine).count(&Query::all()).await.expect_err("err");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[tokio::test]
async fn count_times_out() {
    let engine = FakeEngine::new("exec sleep 30\n");
    let config = ClientConfig::new()
        .with_program(engine.program())
        .with_count_timeout(Duration::from_millis(200))
        .with_grace_period(Duration::from_millis(200));
    let client = Client::new("localhost").expect("client").with_config(config);
    let err = client.count(&Query::all()).await.expect_err("err");
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn missing_program_is_unreachable() {
    let client = Client::new("localhost").expect("client").with_program("/nonexistent/tenzir-ctl");
    let err = client.count(&Query::all()).await.expect_err("err");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(err.hint().is_some());
}
