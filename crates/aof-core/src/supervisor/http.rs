//! HTTP surface for the supervisor: `/metrics`, `/aof/status`, `/health`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use aof_store::TaskStatus;

use super::Supervisor;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    scheduler: super::SupervisorStatus,
    tasks: TaskCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskCounts {
    backlog: usize,
    ready: usize,
    in_progress: usize,
    blocked: usize,
    review: usize,
    done: usize,
    total: usize,
}

pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/aof/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}

/// Serve until ctrl-c.
pub async fn run_serve(supervisor: Arc<Supervisor>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(supervisor);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("aof serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("aof serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

async fn health(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    if supervisor.is_running() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not running")
    }
}

async fn metrics(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let text = supervisor.scheduler().metrics().encode();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
}

async fn status(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let scheduler = supervisor.status();
    let last_error = scheduler.last_error.clone();

    let mut counts = TaskCounts::default();
    match supervisor.store().count_by_status() {
        Ok(by_status) => {
            for (status, count) in by_status {
                match status {
                    TaskStatus::Backlog => counts.backlog = count,
                    TaskStatus::Ready => counts.ready = count,
                    TaskStatus::InProgress => counts.in_progress = count,
                    TaskStatus::Blocked => counts.blocked = count,
                    TaskStatus::Review => counts.review = count,
                    TaskStatus::Done => counts.done = count,
                }
                counts.total += count;
            }
        }
        Err(e) => tracing::warn!(error = %e, "status endpoint could not count tasks"),
    }

    Json(StatusResponse {
        scheduler,
        tasks: counts,
        last_error,
    })
}
