//! End-to-end checks against a running server.
//!
//! Start the service (any backend) and run with
//! `BASE_URL=http://localhost:8080 cargo test -- --ignored`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct Sensor {
    id: String,
    status: String,
    latitude: f64,
    longitude: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Reading {
    id: i64,
    sensor_id: String,
    humidity: i32,
}

fn base_url() -> String {
    std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into())
}

/// Unique per run so repeated runs against one database do not collide.
fn unique_sensor_id(prefix: &str) -> String {
    format!("{prefix}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore = "requires a running server at BASE_URL"]
async fn health_reports_ok() -> Result<()> {
    // ---
    let body: Value = Client::new()
        .get(format!("{}/health", base_url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running server at BASE_URL"]
async fn sensor_lifecycle() -> Result<()> {
    // ---
    let base = base_url();
    let client = Client::new();
    let id = unique_sensor_id("it-sensor");

    let resp = client
        .post(format!("{base}/v1/sensor"))
        .json(&json!({ "id": id, "status": "online", "latitude": 54.78, "longitude": 9.43 }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let sensor: Sensor = resp.json().await?;
    assert_eq!(sensor.id, id);
    assert_eq!(sensor.status, "online");
    assert_eq!(sensor.latitude, 54.78);
    assert_eq!(sensor.longitude, 9.43);
    assert!(sensor.updated_at >= sensor.created_at);

    let fetched: Sensor = client
        .get(format!("{base}/v1/sensor/{id}"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(fetched.id, id);

    let resp = client.delete(format!("{base}/v1/sensor/{id}")).send().await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client.get(format!("{base}/v1/sensor/{id}")).send().await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], 404);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a running server at BASE_URL"]
async fn readings_are_deduplicated_and_latest_follows_receive_time() -> Result<()> {
    // ---
    let base = base_url();
    let client = Client::new();
    let id = unique_sensor_id("it-reading");

    client
        .post(format!("{base}/v1/sensor"))
        .json(&json!({ "id": id, "latitude": 54.78, "longitude": 9.43 }))
        .send()
        .await?
        .error_for_status()?;

    let newer = json!({ "sensor_id": id, "humidity": 62, "received_at": "2024-06-01T12:00:00Z" });
    let older = json!({ "sensor_id": id, "humidity": 38, "received_at": "2024-06-01T08:00:00Z" });

    let first = client.post(format!("{base}/v1/data")).json(&newer).send().await?;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: Reading = first.json().await?;

    let repeat = client.post(format!("{base}/v1/data")).json(&newer).send().await?;
    assert_eq!(repeat.status(), StatusCode::OK);
    let repeat: Reading = repeat.json().await?;
    assert_eq!(repeat.id, first.id);

    client
        .post(format!("{base}/v1/data"))
        .json(&older)
        .send()
        .await?
        .error_for_status()?;

    let latest: Reading = client
        .get(format!("{base}/v1/sensor/{id}/latest"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(latest.sensor_id, id);
    assert_eq!(latest.humidity, 62);

    client
        .delete(format!("{base}/v1/sensor/{id}"))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
