//! Integration tests for IPC server command dispatch and authentication.
//!
//! Validates:
//! - a valid auth token is accepted; a wrong or missing one is rejected
//! - `stats` returns per-status counts
//! - `get` returns a row or a not-found error
//! - `reconcile` runs one tick and returns its summary

use std::sync::Arc;

use chrono::Utc;
use interaction_relay::config::GlobalConfig;
use interaction_relay::ipc::server::spawn_ipc_server;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    app_state, memory_broker, memory_db, seed_lead, seed_organization, store_interaction,
    RecordingTarget,
};

const TOKEN: &str = "ctl-secret";

struct IpcFixture {
    name: String,
    ct: CancellationToken,
    target: Arc<RecordingTarget>,
    stored_id: String,
}

impl Drop for IpcFixture {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

async fn start() -> IpcFixture {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    let stored = store_interaction(&db, "lead-1", Utc::now() - chrono::Duration::seconds(1)).await;

    let name = format!("relay-test-{}", uuid::Uuid::new_v4());
    let config = GlobalConfig {
        ipc_name: name.clone(),
        ipc_auth_token: Some(TOKEN.into()),
        ..GlobalConfig::default()
    };
    let (broker, topology) = memory_broker().await;
    let target = RecordingTarget::new();
    let state = app_state(&db, Arc::new(broker), topology, target.clone(), config);

    let ct = CancellationToken::new();
    spawn_ipc_server(state, ct.clone()).expect("ipc server");

    IpcFixture {
        name,
        ct,
        target,
        stored_id: stored.id,
    }
}

async fn call(name: &str, request: &Value) -> Value {
    let socket = name
        .to_ns_name::<GenericNamespaced>()
        .expect("socket name");
    let stream = interprocess::local_socket::tokio::Stream::connect(socket)
        .await
        .expect("connect");
    let (reader, mut writer) = stream.split();

    let mut line = request.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await.expect("write");

    let mut response = String::new();
    BufReader::new(reader)
        .read_line(&mut response)
        .await
        .expect("read");
    serde_json::from_str(response.trim()).expect("json response")
}

#[tokio::test]
async fn stats_with_valid_token() {
    let fixture = start().await;

    let response = call(&fixture.name, &json!({ "command": "stats", "auth_token": TOKEN })).await;

    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["pending"], 1);
    assert_eq!(response["data"]["delivered"], 0);
}

#[tokio::test]
async fn wrong_or_missing_token_is_rejected() {
    let fixture = start().await;

    let wrong = call(&fixture.name, &json!({ "command": "stats", "auth_token": "guess" })).await;
    let missing = call(&fixture.name, &json!({ "command": "stats" })).await;

    for response in [wrong, missing] {
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "unauthorized");
    }
}

#[tokio::test]
async fn get_returns_row_or_not_found() {
    let fixture = start().await;

    let found = call(
        &fixture.name,
        &json!({ "command": "get", "id": fixture.stored_id.clone(), "auth_token": TOKEN }),
    )
    .await;
    assert_eq!(found["ok"], true);
    assert_eq!(found["data"]["id"], fixture.stored_id.as_str());
    assert_eq!(found["data"]["status"], "pending");

    let missing = call(
        &fixture.name,
        &json!({ "command": "get", "id": "nope", "auth_token": TOKEN }),
    )
    .await;
    assert_eq!(missing["ok"], false);
    assert!(missing["error"].as_str().is_some_and(|e| e.contains("not found")));
}

#[tokio::test]
async fn reconcile_runs_one_tick() {
    let fixture = start().await;

    let response = call(&fixture.name, &json!({ "command": "reconcile", "auth_token": TOKEN })).await;

    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["delivered"], 1);
    assert_eq!(fixture.target.call_count(), 1);
}

#[tokio::test]
async fn unknown_command_is_reported() {
    let fixture = start().await;

    let response = call(&fixture.name, &json!({ "command": "purge", "auth_token": TOKEN })).await;

    assert_eq!(response["ok"], false);
    assert!(response["error"].as_str().is_some_and(|e| e.contains("unknown command")));
}
