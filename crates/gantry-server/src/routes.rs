//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;

use gantry_dot::AttrValue;
use gantry_pipeline::{Answer, EventEnvelope};
use gantry_types::StageStatus;

use crate::runs::{RunManager, SubmitError};

pub fn router(manager: Arc<RunManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pipelines", post(submit_pipeline).get(list_pipelines))
        .route("/pipelines/:id", get(get_pipeline))
        .route("/pipelines/:id/events", get(stream_events))
        .route("/pipelines/:id/graph", get(render_graph))
        .route("/pipelines/:id/cancel", post(cancel_pipeline))
        .route("/pipelines/:id/human/:node_id", post(answer_human))
        .with_state(manager)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn error_body(error: impl ToString, diagnostics: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"error": error.to_string(), "diagnostics": diagnostics})
}

async fn submit_pipeline(
    State(manager): State<Arc<RunManager>>,
    body: String,
) -> impl IntoResponse {
    match manager.submit(body, None) {
        Ok(id) => (StatusCode::ACCEPTED, Json(serde_json::json!({"id": id}))),
        Err(SubmitError::Parse(e)) => (
            StatusCode::BAD_REQUEST,
            Json(error_body(e, serde_json::json!([]))),
        ),
        Err(SubmitError::Validation(diags)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(error_body(
                "pipeline validation failed",
                serde_json::to_value(&diags).unwrap_or_default(),
            )),
        ),
    }
}

async fn list_pipelines(State(manager): State<Arc<RunManager>>) -> Json<serde_json::Value> {
    let runs: Vec<serde_json::Value> = manager
        .list()
        .into_iter()
        .map(|r| {
            serde_json::json!({
                "id": r.id,
                "status": r.status,
                "started_at": r.started_at,
                "completed_at": r.completed_at,
                "pipeline_file": r.pipeline_file,
            })
        })
        .collect();
    Json(serde_json::json!(runs))
}

async fn get_pipeline(
    State(manager): State<Arc<RunManager>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match manager.snapshot(&id).await {
        Some(body) => (StatusCode::OK, Json(body)),
        None => (
            StatusCode::NOT_FOUND,
            Json(error_body("run not found", serde_json::json!([]))),
        ),
    }
}

#[derive(serde::Deserialize, Default)]
struct EventsQuery {
    since: Option<u64>,
}

async fn stream_events(
    State(manager): State<Arc<RunManager>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let handle = manager.handle(&id).ok_or(StatusCode::NOT_FOUND)?;

    // Subscribe before snapshotting history so no ordinal can fall in the
    // gap; the monotonic filter below drops the overlap.
    let rx = handle.emitter.subscribe();
    let since = query.since;
    let history: Vec<EventEnvelope> = {
        let buffer = handle.history.lock().unwrap();
        buffer
            .iter()
            .filter(|e| since.is_none_or(|s| e.ordinal > s))
            .cloned()
            .collect()
    };

    let next_expected = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(
        history
            .last()
            .map(|e| e.ordinal + 1)
            .or(since.map(|s| s + 1))
            .unwrap_or(0),
    ));

    let replay = futures::stream::iter(history.into_iter().map(|e| Ok(to_sse_event(&e))));
    let live = BroadcastStream::new(rx).filter_map(move |result| {
        let next_expected = next_expected.clone();
        async move {
            match result {
                Ok(envelope) => {
                    let expected =
                        next_expected.load(std::sync::atomic::Ordering::SeqCst);
                    if envelope.ordinal < expected {
                        None
                    } else {
                        next_expected.store(
                            envelope.ordinal + 1,
                            std::sync::atomic::Ordering::SeqCst,
                        );
                        Some(Ok(to_sse_event(&envelope)))
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SSE subscriber lagged");
                    None
                }
            }
        }
    });

    Ok(Sse::new(replay.chain(live)).keep_alive(KeepAlive::default()))
}

fn to_sse_event(envelope: &EventEnvelope) -> Event {
    Event::default()
        .id(envelope.ordinal.to_string())
        .event(envelope.event.kind())
        .data(serde_json::to_string(envelope).unwrap_or_default())
}

#[derive(serde::Deserialize, Default)]
struct GraphQuery {
    format: Option<String>,
}

async fn render_graph(
    State(manager): State<Arc<RunManager>>,
    Path(id): Path<String>,
    Query(query): Query<GraphQuery>,
) -> impl IntoResponse {
    let format = query.format.as_deref().unwrap_or("dot");
    if format != "dot" {
        return (
            StatusCode::NOT_IMPLEMENTED,
            [("content-type", "application/json")],
            error_body(
                format!("format '{format}' requires a graphviz renderer"),
                serde_json::json!([]),
            )
            .to_string(),
        );
    }

    let source = match manager.handle(&id) {
        Some(handle) => handle.source.clone(),
        None => match manager.record(&id) {
            Some(record) => record.source,
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    [("content-type", "application/json")],
                    error_body("run not found", serde_json::json!([])).to_string(),
                )
            }
        },
    };

    let mut ast = match gantry_dot::parse(&source) {
        Ok(ast) => ast,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "application/json")],
                error_body(e, serde_json::json!([])).to_string(),
            )
        }
    };

    // Color nodes by outcome status class.
    if let Some(handle) = manager.handle(&id) {
        let outcomes = handle.run.outcomes();
        let current = handle.run.current_node();
        for (node_id, def) in ast.nodes.iter_mut() {
            let fill = match outcomes.get(node_id).map(|o| o.status) {
                Some(StageStatus::Success) => Some("palegreen"),
                Some(StageStatus::Fail) => Some("lightcoral"),
                Some(StageStatus::Skipped) => Some("khaki"),
                Some(StageStatus::Cancelled) => Some("lightgray"),
                Some(StageStatus::Retrying) => Some("gold"),
                None if current.as_deref() == Some(node_id) => Some("lightblue"),
                None => None,
            };
            if let Some(color) = fill {
                def.attrs
                    .insert("style".to_string(), AttrValue::Str("filled".into()));
                def.attrs
                    .insert("fillcolor".to_string(), AttrValue::Str(color.into()));
            }
        }
    }

    (
        StatusCode::OK,
        [("content-type", "text/vnd.graphviz")],
        gantry_dot::to_dot(&ast),
    )
}

async fn cancel_pipeline(
    State(manager): State<Arc<RunManager>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if manager.cancel(&id) {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"id": id, "cancelling": true})),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(error_body("run not live", serde_json::json!([]))),
        )
    }
}

#[derive(serde::Deserialize, Default)]
struct AnswerBody {
    #[serde(default)]
    choice: Option<String>,
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    data: Option<std::collections::HashMap<String, serde_json::Value>>,
}

async fn answer_human(
    State(manager): State<Arc<RunManager>>,
    Path((id, node_id)): Path<(String, String)>,
    Json(body): Json<AnswerBody>,
) -> impl IntoResponse {
    let answer = Answer {
        choice: body
            .choice
            .or(body.decision)
            .unwrap_or_else(|| "Continue".to_string()),
        text: body.text,
        data: body.data.unwrap_or_default(),
    };

    if manager.answer_human(&id, &node_id, answer) {
        (StatusCode::ACCEPTED, Json(serde_json::json!({"ok": true})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(error_body(
                "no pending question for that node",
                serde_json::json!([]),
            )),
        )
    }
}
