use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::pipeline::{Pipeline, PipelineError};

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    success: bool,
    #[serde(rename = "sessionId")]
    session_id: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

/// Build the trigger router. CORS is wide open and preflight OPTIONS
/// requests get 204, matching what browser clients expect.
pub fn app(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/process",
            post(process_handler).options(preflight_handler),
        )
        .route("/api/health", get(health_handler))
        .layer(cors)
        .with_state(pipeline)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn preflight_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn process_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<ProcessRequest>,
) -> Response {
    let (session_id, user_id) = match (request.session_id, request.user_id) {
        (Some(session_id), Some(user_id)) => (session_id, user_id),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "sessionId and userId required".to_string(),
            )
        }
    };

    let response_session = session_id.clone();
    let task =
        tokio::task::spawn_blocking(move || pipeline.process(&session_id, &user_id)).await;

    match task {
        Ok(Ok(result)) => (
            StatusCode::OK,
            Json(ProcessResponse {
                success: true,
                session_id: result.session_id,
                status: "completed".to_string(),
            }),
        )
            .into_response(),
        Ok(Err(e @ PipelineError::AlreadyProcessing(_))) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => {
            error!("processing task panicked for session {}: {}", response_session, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "processing task failed".to_string(),
            )
        }
    }
}

/// Run the trigger server on the given port (IPv4 + IPv6)
pub fn serve(pipeline: Arc<Pipeline>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", port);
    println!("Endpoints:");
    println!("  POST /api/process  - trigger processing for a session");
    println!("  GET  /api/health   - health check");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", port, e))?;
        axum::serve(listener, app(pipeline))
            .await
            .map_err(|e| format!("Server error: {}", e))?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
