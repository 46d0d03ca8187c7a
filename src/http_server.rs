//! HTTP server implementation using Axum.

use crate::error::ShellError;
use crate::framer::{OutputStream, ShellExecResult};
use crate::session::SessionInfo;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// Request/Response types
#[derive(Deserialize)]
struct ExecRequest {
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    start_new: bool,
}

/// Frames sent back over the streaming socket.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamFrame {
    Delta { stream: OutputStream, chunk: String },
    Result(ShellExecResult),
    Error { message: String },
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/exec", post(exec))
        .route("/exec/ws", get(exec_ws))
        .route("/session", get(get_session).delete(delete_session))
        .route("/session/reset", post(reset_session))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port until Ctrl-C or SIGTERM.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Resolves on the first Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

fn rejection(err: ShellError) -> (StatusCode, String) {
    let status = match err {
        ShellError::SessionInit { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ShellError::StdinWrite(_) | ShellError::Stream(_) => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}

async fn health() -> &'static str {
    "OK"
}

async fn exec(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ShellExecResult>, (StatusCode, String)> {
    info!("POST /exec - command: {:?}", req.command);
    let timeout = state.manager().config().resolve_timeout(req.timeout_ms);
    let executor = state.executor.clone();

    // Detached so a dropped connection cannot cut the protocol short.
    let result = tokio::spawn(async move {
        executor
            .execute_with_timeout(&req.command, timeout, |_, _| {})
            .await
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(rejection)?;

    info!("POST /exec - result: exit={:?}", result.exit_code);
    Ok(Json(result))
}

async fn exec_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_commands(socket, state))
}

async fn stream_commands(mut socket: WebSocket, state: AppState) {
    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let req: ExecRequest = match serde_json::from_str(&text) {
            Ok(req) => req,
            Err(e) => {
                let frame = StreamFrame::Error {
                    message: format!("invalid request: {}", e),
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
                continue;
            }
        };

        info!("WS /exec/ws - command: {:?}", req.command);
        let timeout = state.manager().config().resolve_timeout(req.timeout_ms);
        let executor = state.executor.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let deltas = tx.clone();
            let result = executor
                .execute_with_timeout(&req.command, timeout, move |stream, chunk| {
                    let _ = deltas.send(StreamFrame::Delta {
                        stream,
                        chunk: chunk.to_string(),
                    });
                })
                .await;
            let frame = match result {
                Ok(result) => StreamFrame::Result(result),
                Err(e) => StreamFrame::Error { message: e.to_string() },
            };
            let _ = tx.send(frame);
        });

        while let Some(frame) = rx.recv().await {
            if send_frame(&mut socket, &frame).await.is_err() {
                return;
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}

async fn get_session(State(state): State<AppState>) -> Result<Json<SessionInfo>, StatusCode> {
    let session = state.manager().current().await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(session.info()))
}

async fn delete_session(State(state): State<AppState>) -> StatusCode {
    if state.manager().terminate().await {
        info!("Deleted session");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn reset_session(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<Response, (StatusCode, String)> {
    match state.manager().reset(req.start_new).await.map_err(rejection)? {
        Some(session) => Ok(Json(session.info()).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
