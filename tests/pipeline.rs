//! End-to-end tests: buffer, publisher and pruner against a local HTTP endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use edge_telemetry::config::{AuthMode, HttpSinkConfig, SinkConfig};
use edge_telemetry::pruner::Pruner;
use edge_telemetry::publisher::{PublishOutcome, Publisher};
use edge_telemetry::reading::{Measurement, NewReading, ReadingId};
use edge_telemetry::sink::{build_slots, HttpSink, PayloadMode, Sink, SinkError};
use edge_telemetry::store::ReadingStore;

#[derive(Clone)]
struct Endpoint {
    status: StatusCode,
    bodies: Arc<Mutex<Vec<Value>>>,
    api_keys: Arc<Mutex<Vec<String>>>,
}

async fn ingest(State(endpoint): State<Endpoint>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    endpoint.bodies.lock().unwrap().push(value);
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        endpoint.api_keys.lock().unwrap().push(key.to_string());
    }
    endpoint.status
}

/// Serve `/device_data` on an ephemeral port, answering every POST with `status`.
async fn spawn_endpoint(status: StatusCode) -> (String, Endpoint) {
    let endpoint = Endpoint {
        status,
        bodies: Arc::new(Mutex::new(Vec::new())),
        api_keys: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/device_data", post(ingest))
        .with_state(endpoint.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/device_data", addr), endpoint)
}

fn http_config(url: &str, payload: PayloadMode) -> SinkConfig {
    SinkConfig::Http(HttpSinkConfig {
        name: "cloud".to_string(),
        enabled: true,
        url: url.to_string(),
        auth: AuthMode::XApiKey {
            key: "test-key".to_string(),
        },
        payload,
        timeout_secs: Some(5),
    })
}

fn open_store() -> (TempDir, ReadingStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ReadingStore::open_default(dir.path().join("buffer.db")).unwrap();
    (dir, store)
}

fn append_samples(store: &ReadingStore, count: usize) -> Vec<ReadingId> {
    let readings: Vec<_> = (0..count)
        .map(|i| {
            let mut m = Measurement::new();
            m.insert("temperature".to_string(), json!(20.0 + i as f64));
            NewReading::from_measurement(Utc::now(), "NSA_ETP", &m).unwrap()
        })
        .collect();
    store.append(&readings).unwrap()
}

#[tokio::test]
async fn delivered_readings_are_marked_and_pruned() {
    let (url, endpoint) = spawn_endpoint(StatusCode::OK).await;
    let (_dir, store) = open_store();
    let ids = append_samples(&store, 3);

    let sinks = build_slots(
        &[http_config(&url, PayloadMode::Enveloped)],
        "NSA_ETP",
        Duration::from_secs(10),
    )
    .unwrap();
    let mut publisher = Publisher::new(store.clone(), sinks, 50);

    assert_eq!(publisher.tick().await, PublishOutcome::Committed { count: 3 });
    assert_eq!(store.count_unsent().unwrap(), 0);
    assert_eq!(store.count_sent().unwrap(), 3);

    let bodies = endpoint.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    let items = bodies[0].as_array().unwrap();
    let delivered: Vec<ReadingId> = items.iter().map(|i| i["id"].as_i64().unwrap()).collect();
    assert_eq!(delivered, ids);
    assert_eq!(items[0]["station_id"], "NSA_ETP");
    assert_eq!(items[2]["data"]["temperature"], 22.0);
    assert_eq!(endpoint.api_keys.lock().unwrap().as_slice(), ["test-key"]);

    // A second cycle has nothing left to deliver
    assert_eq!(publisher.tick().await, PublishOutcome::Idle);
    assert_eq!(endpoint.bodies.lock().unwrap().len(), 1);

    let pruner = Pruner::new(store.clone(), 100, 1_000);
    let outcome = pruner.tick(false).await.unwrap();
    assert_eq!(outcome.deleted, 3);
    assert_eq!(store.count_unsent().unwrap(), 0);
    assert_eq!(store.count_sent().unwrap(), 0);
}

#[tokio::test]
async fn server_error_leaves_readings_unsent() {
    let (url, endpoint) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
    let (_dir, store) = open_store();
    let ids = append_samples(&store, 2);

    let sinks = build_slots(
        &[http_config(&url, PayloadMode::Direct)],
        "NSA_ETP",
        Duration::from_secs(10),
    )
    .unwrap();
    let mut publisher = Publisher::new(store.clone(), sinks, 50);

    match publisher.tick().await {
        PublishOutcome::Aborted { sink, reason } => {
            assert_eq!(sink, "cloud");
            assert!(reason.contains("500"));
        }
        other => panic!("expected abort, got {:?}", other),
    }

    assert_eq!(store.count_unsent().unwrap(), 2);
    assert_eq!(store.count_sent().unwrap(), 0);
    let pending: Vec<ReadingId> = store.fetch_unsent(10).unwrap().iter().map(|r| r.id).collect();
    assert_eq!(pending, ids);
    assert_eq!(endpoint.bodies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn any_success_status_is_an_acknowledgment() {
    for status in [StatusCode::CREATED, StatusCode::NO_CONTENT] {
        let (url, _endpoint) = spawn_endpoint(status).await;
        let (_dir, store) = open_store();
        append_samples(&store, 1);

        let config = HttpSinkConfig {
            name: "cloud".to_string(),
            enabled: true,
            url,
            auth: AuthMode::None,
            payload: PayloadMode::Direct,
            timeout_secs: None,
        };
        let sink = HttpSink::new(&config, Duration::from_secs(5)).unwrap();
        let batch = store.fetch_unsent(10).unwrap();
        assert!(sink.deliver(&batch).await.is_ok(), "status {} should ack", status);
    }
}

#[tokio::test]
async fn direct_payload_posts_raw_measurements() {
    let (url, endpoint) = spawn_endpoint(StatusCode::OK).await;
    let (_dir, store) = open_store();
    append_samples(&store, 2);

    let sinks = build_slots(
        &[http_config(&url, PayloadMode::Direct)],
        "NSA_ETP",
        Duration::from_secs(10),
    )
    .unwrap();
    let mut publisher = Publisher::new(store.clone(), sinks, 50);
    assert_eq!(publisher.tick().await, PublishOutcome::Committed { count: 2 });

    let bodies = endpoint.bodies.lock().unwrap().clone();
    assert_eq!(
        bodies[0],
        json!([{"temperature": 20.0}, {"temperature": 21.0}])
    );
}

#[tokio::test]
async fn rejected_status_is_reported() {
    let (url, _endpoint) = spawn_endpoint(StatusCode::UNAUTHORIZED).await;
    let (_dir, store) = open_store();
    append_samples(&store, 1);

    let config = HttpSinkConfig {
        name: "cloud".to_string(),
        enabled: true,
        url,
        auth: AuthMode::Bearer {
            key: "wrong".to_string(),
        },
        payload: PayloadMode::Enveloped,
        timeout_secs: None,
    };
    let sink = HttpSink::new(&config, Duration::from_secs(5)).unwrap();
    let batch = store.fetch_unsent(10).unwrap();

    match sink.deliver(&batch).await {
        Err(SinkError::Rejected { status, .. }) => assert_eq!(status, Some(401)),
        other => panic!("expected rejection, got {:?}", other),
    }
}
