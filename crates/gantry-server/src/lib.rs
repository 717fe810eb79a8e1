//! HTTP control plane for Gantry pipelines.
//!
//! Wraps a [`RunManager`] in an axum router: submit DOT pipelines, list
//! and inspect runs, stream engine events over SSE, render status-colored
//! DOT, cancel runs, and answer pending human gates. Run state persists
//! under `<data_dir>/runs/<run_id>/` so a restart recovers both finished
//! and in-flight runs.

mod routes;
mod run_store;
mod runs;

pub use routes::router;
pub use run_store::{RunRecord, RunStateStore};
pub use runs::{RunHandle, RunManager, SubmitError};

use std::net::SocketAddr;
use std::sync::Arc;

/// Serve the control plane until the process is stopped.
pub async fn serve(manager: Arc<RunManager>, addr: SocketAddr) -> gantry_types::Result<()> {
    manager.recover_runs();
    let app = router(manager);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Control plane listening");
    axum::serve(listener, app)
        .await
        .map_err(gantry_types::GantryError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gantry_pipeline::{EngineConfig, SimulationBackend};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_app() -> (tempfile::TempDir, Arc<RunManager>, axum::Router) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RunManager::new(
            dir.path(),
            Arc::new(SimulationBackend),
            EngineConfig::default(),
        );
        let app = router(manager.clone());
        (dir, manager, app)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    const LINEAR: &str =
        r#"digraph p { start [shape="Mdiamond"]; done [shape="Msquare"]; start -> done }"#;

    #[tokio::test]
    async fn health_endpoint() {
        let (_dir, _manager, app) = test_app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn submit_accepts_valid_pipeline() {
        let (_dir, manager, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/pipelines")
                    .body(Body::from(LINEAR))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let id = body["id"].as_str().unwrap().to_string();

        // Wait for the background run to finish.
        for _ in 0..100 {
            if manager
                .record(&id)
                .is_some_and(|r| r.status.is_terminal())
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let record = manager.record(&id).unwrap();
        assert_eq!(record.status, gantry_pipeline::PipelineStatus::Completed);
        assert_eq!(record.completed_nodes, vec!["start", "done"]);
    }

    #[tokio::test]
    async fn submit_rejects_parse_error_with_400() {
        let (_dir, _manager, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/pipelines")
                    .body(Body::from("this is not dot"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("parse error"));
    }

    #[tokio::test]
    async fn submit_rejects_validation_error_with_422() {
        // Two start sentinels cannot be fixed by transforms.
        let source = r#"digraph G {
            a [shape="Mdiamond"]
            b [shape="Mdiamond"]
            done [shape="Msquare"]
            a -> done
            b -> done
        }"#;
        let (_dir, _manager, app) = test_app();
        let response = app
            .oneshot(Request::post("/pipelines").body(Body::from(source)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(!body["diagnostics"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_and_get_pipeline() {
        let (_dir, manager, app) = test_app();
        let id = manager.submit(LINEAR.to_string(), None).unwrap();
        for _ in 0..100 {
            if manager.record(&id).is_some_and(|r| r.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = app
            .clone()
            .oneshot(Request::get("/pipelines").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list = body_json(response).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::get(format!("/pipelines/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = body_json(response).await;
        assert_eq!(detail["status"], "completed");
        assert_eq!(detail["completed_nodes"][0], "start");
    }

    #[tokio::test]
    async fn get_unknown_pipeline_is_404() {
        let (_dir, _manager, app) = test_app();
        let response = app
            .oneshot(
                Request::get("/pipelines/01ARZ3NDEKTSV4RRFFQ69G5FAV")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn graph_endpoint_serves_colored_dot() {
        let (_dir, manager, app) = test_app();
        let id = manager.submit(LINEAR.to_string(), None).unwrap();
        for _ in 0..100 {
            if manager.record(&id).is_some_and(|r| r.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/pipelines/{id}/graph?format=dot"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let dot = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("fillcolor"));

        // Unsupported formats are explicit about the missing renderer.
        let response = app
            .oneshot(
                Request::get(format!("/pipelines/{id}/graph?format=svg"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_404() {
        let (_dir, _manager, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/pipelines/01ARZ3NDEKTSV4RRFFQ69G5FAV/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn human_gate_answered_over_http() {
        let source = r#"digraph G {
            start [shape="Mdiamond"]
            gate [shape="hexagon", prompt="Approve?"]
            ship [prompt="ship"]
            done [shape="Msquare"]
            start -> gate
            gate -> ship [label="approve"]
            ship -> done
        }"#;
        let (_dir, manager, app) = test_app();
        let id = manager.submit(source.to_string(), None).unwrap();

        // Wait for the gate to park its question.
        let mut asked = false;
        for _ in 0..200 {
            if manager
                .pending_questions()
                .contains(&(id.clone(), "gate".to_string()))
            {
                asked = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(asked, "gate never parked a question");

        let response = app
            .oneshot(
                Request::post(format!("/pipelines/{id}/human/gate"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"decision":"approve"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        for _ in 0..200 {
            if manager.record(&id).is_some_and(|r| r.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let record = manager.record(&id).unwrap();
        assert_eq!(record.status, gantry_pipeline::PipelineStatus::Completed);
        assert!(record.completed_nodes.contains(&"ship".to_string()));
    }

    #[tokio::test]
    async fn events_stream_replays_history() {
        let (_dir, manager, _app) = test_app();
        let id = manager.submit(LINEAR.to_string(), None).unwrap();
        for _ in 0..100 {
            if manager.record(&id).is_some_and(|r| r.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let handle = manager.handle(&id).unwrap();
        let history = handle.history.lock().unwrap();
        assert!(!history.is_empty());
        assert_eq!(history[0].ordinal, 0);
        assert!(history
            .iter()
            .any(|e| e.event.kind() == "PipelineCompleted"));
    }
}
