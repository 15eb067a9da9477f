//! Purpose: Run a Cortex analyzer job against the node.
//! Exports: `run_job`, `JobOutcome`.
//! Role: Glue between TheHive/Cortex job documents and the client API.
//! Invariants: Every job yields exactly one report document, success or failure.
//! Invariants: Jobs without a supported `dataType` are rejected; an analyzer
//!             never exports the whole database.

use super::ClientSettings;
use serde::Deserialize;
use serde_json::{Value, json};
use tenzir_client::api::{DataType, Encoding, Error, ErrorKind, ExportRequest, Predicate};
use tracing::debug;

const DEFAULT_MAX_EVENTS: u64 = 30;
const TAXONOMY_NAMESPACE: &str = "Tenzir";
const TAXONOMY_PREDICATE: &str = "Hits";

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(rename = "dataType", default)]
    data_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    config: JobConfig,
}

#[derive(Debug, Default, Deserialize)]
struct JobConfig {
    endpoint: Option<String>,
    max_events: Option<u64>,
}

pub(crate) struct JobOutcome {
    pub(crate) success: bool,
    pub(crate) report: Value,
}

pub(crate) async fn run_job(input: &str, settings: &ClientSettings) -> JobOutcome {
    let document: Value = match serde_json::from_str(input) {
        Ok(document) => document,
        Err(err) => return failure(format!("invalid job: {err}"), json!(input)),
    };
    let job: Job = match serde_json::from_value(document.clone()) {
        Ok(job) => job,
        Err(err) => return failure(format!("invalid job: {err}"), document),
    };
    match lookup(&job, settings).await {
        Ok(values) => JobOutcome {
            success: true,
            report: success_report(values),
        },
        Err(err) => failure(err.to_string(), document),
    }
}

async fn lookup(job: &Job, settings: &ClientSettings) -> Result<Vec<Value>, Error> {
    let Some(data_type) = DataType::from_hint(&job.data_type) else {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "unsupported dataType `{}`; expected ip, subnet, hash, or domain",
            job.data_type
        )));
    };
    let observable = observable_text(&job.data)?;

    let client = match job.config.endpoint.as_deref() {
        Some(endpoint) => settings.client_for(endpoint)?,
        None => settings.client()?,
    };
    if !client.test_connection().await {
        return Err(Error::new(ErrorKind::Unreachable)
            .with_message("Could not connect to Tenzir Server Endpoint")
            .with_input(client.endpoint().to_string()));
    }

    let predicate = Predicate::for_observable(Some(data_type), &observable);
    let max_events = job.config.max_events.unwrap_or(DEFAULT_MAX_EVENTS);
    debug!(%predicate, max_events, "analyzing observable");
    let request = ExportRequest::new(predicate.to_query())
        .max_events(max_events)
        .encoding(Encoding::Json);

    let mut session = client.export(request);
    let mut values = Vec::new();
    while let Some(record) = session.next_record().await? {
        values.push(Value::Object(record.into_data()));
    }
    Ok(values)
}

fn observable_text(data: &Value) -> Result<String, Error> {
    let text = match data {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    };
    if text.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("job carries no observable data"));
    }
    Ok(text)
}

fn summary(hits: usize) -> Value {
    let level = if hits > 0 { "suspicious" } else { "safe" };
    json!({
        "taxonomies": [{
            "level": level,
            "namespace": TAXONOMY_NAMESPACE,
            "predicate": TAXONOMY_PREDICATE,
            "value": hits.to_string(),
        }]
    })
}

fn success_report(values: Vec<Value>) -> Value {
    json!({
        "success": true,
        "summary": summary(values.len()),
        "artifacts": [],
        "operations": [],
        "full": { "values": values },
    })
}

fn failure(message: String, input: Value) -> JobOutcome {
    JobOutcome {
        success: false,
        report: json!({
            "success": false,
            "input": input,
            "errorMessage": message,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientSettings, run_job, success_report, summary};
    use serde_json::json;
    use std::time::Duration;

    fn settings() -> ClientSettings {
        ClientSettings {
            endpoint: "localhost:5158".to_string(),
            program: "/nonexistent/tenzir-ctl".into(),
            timeout: Some(Duration::from_millis(500)),
        }
    }

    #[test]
    fn summary_levels_follow_hit_count() {
        assert_eq!(summary(0)["taxonomies"][0]["level"], "safe");
        let hits = summary(3);
        assert_eq!(hits["taxonomies"][0]["level"], "suspicious");
        assert_eq!(hits["taxonomies"][0]["namespace"], "Tenzir");
        assert_eq!(hits["taxonomies"][0]["predicate"], "Hits");
        assert_eq!(hits["taxonomies"][0]["value"], "3");
    }

    #[test]
    fn success_report_carries_values() {
        let report = success_report(vec![json!({"src_ip": "147.32.84.165"})]);
        assert_eq!(report["success"], true);
        assert_eq!(report["full"]["values"][0]["src_ip"], "147.32.84.165");
    }

    #[tokio::test]
    async fn unsupported_data_type_is_rejected() {
        let input = r#"{"dataType":"mail","data":"a@example.org","config":{}}"#;
        let outcome = run_job(input, &settings()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.report["success"], false);
        assert_eq!(outcome.report["input"]["dataType"], "mail");
        let message = outcome.report["errorMessage"].as_str().expect("message");
        assert!(message.contains("unsupported dataType"));
    }

    #[tokio::test]
    async fn missing_data_type_is_rejected() {
        let outcome = run_job(r#"{"data":"10.0.0.1"}"#, &settings()).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let outcome = run_job("{not json", &settings()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.report["input"], "{not json");
    }

    #[tokio::test]
    async fn unreachable_engine_is_reported() {
        let input = r#"{"dataType":"ip","data":"10.0.0.1","config":{"max_events":5}}"#;
        let outcome = run_job(input, &settings()).await;
        assert!(!outcome.success);
        let message = outcome.report["errorMessage"].as_str().expect("message");
        assert!(message.contains("Could not connect"));
    }
}
