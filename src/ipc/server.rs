//! Local IPC server for `interaction-relay-ctl`.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "reconcile", "auth_token": "..."}
//! {"command": "get", "id": "6f1c...", "auth_token": "..."}
//! {"command": "stats", "auth_token": "..."}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::api::AppState;
use crate::models::interaction::ClaimSource;
use crate::{AppError, Result};

/// Inbound IPC request from `interaction-relay-ctl`.
#[derive(Debug, Deserialize)]
pub(crate) struct IpcRequest {
    /// Command verb.
    command: String,
    /// Interaction identifier (for `get`).
    id: Option<String>,
    /// Shared-secret authentication token.
    auth_token: Option<String>,
}

/// Outbound IPC response.
#[derive(Debug, Serialize)]
pub(crate) struct IpcResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Spawn the IPC server task on `config.ipc_name`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, Arc::clone(&state)));
                            }
                            Err(err) => warn!(%err, "IPC accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<AppState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// Authenticate and route one command.
pub(crate) async fn dispatch_command(request: &IpcRequest, state: &AppState) -> IpcResponse {
    if let Some(ref expected) = state.config.ipc_auth_token {
        match request.auth_token {
            Some(ref provided) if provided == expected => {}
            _ => {
                warn!(command = %request.command, "IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }
    }

    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "reconcile" => handle_reconcile(state).await,
            "get" => handle_get(request, state).await,
            "stats" => handle_stats(state).await,
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

async fn handle_reconcile(state: &AppState) -> IpcResponse {
    match state.reconciler.tick(ClaimSource::Manual).await {
        Ok(summary) => {
            info!(delivered = summary.delivered, failed = summary.failed, "manual reconcile via IPC");
            to_response(&summary)
        }
        Err(err) => IpcResponse::error(format!("reconcile failed: {err}")),
    }
}

async fn handle_get(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let Some(ref id) = request.id else {
        return IpcResponse::error("missing required 'id' field");
    };

    match state.interactions.get_by_id(id).await {
        Ok(Some(item)) => to_response(&item),
        Ok(None) => IpcResponse::error(format!("interaction {id} not found")),
        Err(err) => IpcResponse::error(format!("failed to load interaction: {err}")),
    }
}

async fn handle_stats(state: &AppState) -> IpcResponse {
    match state.interactions.count_by_status().await {
        Ok(counts) => to_response(&counts),
        Err(err) => IpcResponse::error(format!("failed to count interactions: {err}")),
    }
}

fn to_response(value: &impl Serialize) -> IpcResponse {
    match serde_json::to_value(value) {
        Ok(data) => IpcResponse::success(data),
        Err(err) => IpcResponse::error(format!("serialization failed: {err}")),
    }
}
