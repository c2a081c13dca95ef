use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use appforge_core::lock::TargetKey;
use appforge_core::progress::topic;
use appforge_core::{CreateNovelAppRequest, Orchestrator};
use appforge_db::models::{CreationTask, TaskLogEntry};
use appforge_db::queries::creation_tasks as task_db;

/// How long shutdown waits for running creations to finish or roll back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Default page size for `GET /api/tasks`.
const DEFAULT_TASK_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and wire types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Orchestrator,
    /// Cancelled on shutdown; running creations stop at the next phase
    /// boundary and roll back.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub task_id: Uuid,
    pub topic: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AfterQuery {
    pub after: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/apps", post(create_app))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/logs", get(get_task_logs))
        .route("/build-logs/{id}", get(stream_build_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let locks = state.orchestrator.locks().clone();
    let app = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("appforge serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Spawned creations outlive the listener; let them settle.
    shutdown.cancel();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while !locks.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::error!(
            running = locks.len(),
            "creations still running at shutdown, their tasks stay in running status"
        );
    }

    tracing::info!("appforge serve shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
            }
        }
        _ = shutdown.cancelled() => {}
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_creation_tasks(&state.pool, DEFAULT_TASK_LIMIT)
        .await
        .map_err(AppError::internal)?;

    let rows = if tasks.is_empty() {
        "<tr><td colspan=\"3\">No creation tasks yet.</td></tr>".to_string()
    } else {
        tasks
            .iter()
            .map(|t| {
                format!(
                    "<tr><td><a href=\"/api/tasks/{id}\">{user}/{app}</a></td><td>{status}</td><td><a href=\"/api/tasks/{id}/logs\">{id}</a></td></tr>",
                    id = t.id,
                    user = html_escape(&t.user_id),
                    app = html_escape(&t.app_name),
                    status = t.status,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>appforge</title></head><body>\
<h1>appforge</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a></p>\
<table><tr><th>Target</th><th>Status</th><th>Task</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Validate, then run the creation in the background and hand back the
/// task id and its progress topic.
async fn create_app(
    State(state): State<AppState>,
    Json(request): Json<CreateNovelAppRequest>,
) -> Result<axum::response::Response, AppError> {
    request
        .validate()
        .map_err(|e| AppError::bad_request(format!("invalid request: {e}")))?;

    let target = TargetKey::for_request(&request);
    if state.orchestrator.locks().is_held(&target) {
        return Err(AppError::conflict(format!(
            "task in progress: another creation is already running for {target}"
        )));
    }

    let task_id = Uuid::new_v4();
    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        match orchestrator.run(task_id, &request, &cancel).await {
            Ok(created) => {
                tracing::info!(task_id = %task_id, app_id = ?created.app_id(), "creation finished");
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "creation did not commit");
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            task_id,
            topic: topic(task_id),
        }),
    )
        .into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<CreationTask>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_TASK_LIMIT).clamp(1, 500);
    let tasks = task_db::list_creation_tasks(&state.pool, limit)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CreationTask>, AppError> {
    let task = find_task(&state.pool, id).await?;
    Ok(Json(task))
}

async fn get_task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AfterQuery>,
) -> Result<Json<Vec<TaskLogEntry>>, AppError> {
    let entries = state
        .orchestrator
        .log()
        .replay(id, query.after)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(entries))
}

async fn find_task(pool: &PgPool, id: Uuid) -> Result<CreationTask, AppError> {
    task_db::get_creation_task(pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("creation task {id} not found")))
}

/// Server-sent events for one task: persisted entries after `?after=N`
/// first, then live entries until the task finishes.
///
/// A finished task only replays. A subscriber that lags behind the
/// broadcaster re-reads what it missed from the database.
async fn stream_build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AfterQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let log = state.orchestrator.log().clone();

    let mut live = None;
    if !find_task(&state.pool, id).await?.status.is_terminal() {
        let rx = log.subscribe(id);
        // The task may have finished before we subscribed, in which case
        // nothing will ever close this channel.
        if find_task(&state.pool, id).await?.status.is_terminal() {
            log.finish(id);
        } else {
            live = Some(rx);
        }
    }

    let backlog = log.replay(id, query.after).await.map_err(AppError::internal)?;

    let stream = async_stream::stream! {
        let mut last_seq = query.after.unwrap_or(0);
        for entry in backlog {
            last_seq = entry.seq;
            yield Ok(log_event(&entry));
        }

        if let Some(mut rx) = live {
            loop {
                match rx.recv().await {
                    Ok(entry) => {
                        if entry.seq > last_seq {
                            last_seq = entry.seq;
                            yield Ok(log_event(&entry));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(task_id = %id, skipped, "subscriber lagged, replaying");
                        match log.replay(id, Some(last_seq)).await {
                            Ok(missed) => {
                                for entry in missed {
                                    last_seq = entry.seq;
                                    yield Ok(log_event(&entry));
                                }
                            }
                            Err(e) => {
                                tracing::warn!(task_id = %id, error = %format!("{e:#}"), "replay after lag failed");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }

        yield Ok(Event::default().event("end").data(last_seq.to_string()));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn log_event(entry: &TaskLogEntry) -> Event {
    let data = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event("log")
        .id(entry.seq.to_string())
        .data(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
