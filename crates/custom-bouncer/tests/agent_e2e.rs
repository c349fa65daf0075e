use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use bouncer_core::BouncerConfig;
use custom_bouncer::{Agent, AgentError};
use supervisor::SupervisorError;

const API_KEY: &str = "e2e-key";
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Authority {
    responses: Mutex<Vec<Value>>,
}

async fn stream(State(authority): State<Arc<Authority>>, headers: HeaderMap) -> (StatusCode, String) {
    let key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if key != API_KEY {
        return (
            StatusCode::FORBIDDEN,
            json!({"message": "access forbidden"}).to_string(),
        );
    }
    let mut responses = authority.responses.lock().unwrap();
    let body = if responses.is_empty() {
        json!({"new": null, "deleted": null})
    } else {
        responses.remove(0)
    };
    (StatusCode::OK, body.to_string())
}

async fn start_authority(responses: Vec<Value>) -> String {
    let authority = Arc::new(Authority {
        responses: Mutex::new(responses),
    });
    let app = Router::new()
        .route("/v1/decisions/stream", get(stream))
        .with_state(authority);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

fn decisions(ids: std::ops::RangeInclusive<i64>) -> Value {
    Value::Array(
        ids.map(|id| {
            json!({
                "id": id,
                "value": format!("1.2.3.{id}"),
                "scope": "Ip",
                "type": "ban",
                "origin": "cscli",
                "scenario": "manual 'ban' from 'localhost'",
                "duration": "3h59m59s",
                "simulated": false,
            })
        })
        .collect(),
    )
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn stream_config(api_url: &str, api_key: &str, script: &Path, data: &Path, extra: &str) -> BouncerConfig {
    BouncerConfig::from_yaml_str(&format!(
        "api_url: {api_url}\n\
         api_key: {api_key}\n\
         bin_path: /bin/sh\n\
         bin_args: ['{}', '{}']\n\
         feed_via_stdin: true\n\
         update_frequency: 100ms\n\
         {extra}",
        script.display(),
        data.display()
    ))
    .unwrap()
}

fn read_records(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn wait_for_records(path: &Path, count: usize) -> Vec<Value> {
    for _ in 0..200 {
        let records = read_records(path);
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    read_records(path)
}

#[tokio::test]
async fn test_decisions_are_added_then_deleted_in_stream_mode() {
    let api_url = start_authority(vec![
        json!({"new": decisions(1..=5), "deleted": null}),
        // replayed adds are suppressed by the cache
        json!({"new": decisions(1..=5), "deleted": []}),
        json!({"new": null, "deleted": decisions(1..=5)}),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data.txt");
    let script = write_script(
        dir.path(),
        "custom-stream.sh",
        "while read -r line; do printf '%s\\n' \"$line\" >> \"$1\"; done\n",
    );
    let config = stream_config(&api_url, API_KEY, &script, &data, "");
    let credentials = config.validate().unwrap();
    let agent = Agent::new(&config, &credentials).unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(agent.run(async move {
        let _ = stop_rx.await;
    }));

    let records = wait_for_records(&data, 10).await;
    assert_eq!(records.len(), 10);
    for (index, record) in records.iter().enumerate() {
        let id = (index % 5 + 1) as i64;
        let action = if index < 5 { "add" } else { "del" };
        assert_eq!(record["action"], action);
        assert_eq!(record["id"], id);
        assert_eq!(record["value"], format!("1.2.3.{id}"));
        assert_eq!(record["type"], "ban");
        assert_eq!(record["scope"], "Ip");
        assert_eq!(record["origin"], "cscli");
        assert!(record.get("simulated").is_none());
    }

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_rejected_api_key_halts_the_bouncer() {
    let api_url = start_authority(Vec::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data.txt");
    let script = write_script(dir.path(), "custom-stream.sh", "cat >> \"$1\"\n");
    let config = stream_config(&api_url, "badkey", &script, &data, "");
    let credentials = config.validate().unwrap();
    let agent = Agent::new(&config, &credentials).unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, agent.run(std::future::pending::<()>()))
        .await
        .unwrap();
    assert!(matches!(result, Err(AgentError::StreamHalted)));
    assert!(read_records(&data).is_empty());
}

#[tokio::test]
async fn test_crashing_program_exhausts_retry_budget() {
    let api_url = start_authority(Vec::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("spawns.txt");
    let script = write_script(dir.path(), "crash.sh", "echo '{}' >> \"$1\"\nexit 3\n");
    let config = stream_config(&api_url, API_KEY, &script, &data, "total_retries: 2\n");
    let credentials = config.validate().unwrap();
    let agent = Agent::new(&config, &credentials).unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, agent.run(std::future::pending::<()>()))
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(AgentError::Supervisor(SupervisorError::RetriesExhausted))
    ));
    assert_eq!(read_records(&data).len(), 3);
}

#[test]
fn test_missing_binary_fails_before_any_activity() {
    let config = BouncerConfig::from_yaml_str(
        "api_url: http://127.0.0.1:1/\napi_key: key\nbin_path: /does/not/exist\n",
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert_eq!(err.to_string(), "binary '/does/not/exist' doesn't exist");
}
