//! HTTP surface: OpenAI-compatible inference endpoints plus the catalog and
//! lifecycle management API.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lemonade_catalog::Catalog;
use lemonade_common::{
    CompletionRouting, DeleteRequest, Error, ErrorResponse, HealthResponse, ModelList, PullRequest,
};
use lemonade_runtime::ModelManager;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::streaming;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ModelManager>,
    pub catalog: Arc<RwLock<Catalog>>,
    pub shutdown: mpsc::Sender<()>,
    pub start_time: SystemTime,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/pull", post(pull_model))
        .route("/api/v1/delete", post(delete_model))
        .route("/api/v1/health", get(health))
        .route("/health", get(health))
        .route("/internal/shutdown", post(internal_shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(err))).into_response()
}

/// Backend responses come back as JSON either way; surface wrapped errors
/// with their recorded status code.
fn backend_json_response(value: Value) -> Response {
    let status = value
        .pointer("/error/code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok());

    match status {
        Some(status) => (status, Json(value)).into_response(),
        None if value.get("error").is_some() => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(value)).into_response()
        }
        None => Json(value).into_response(),
    }
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    completion_entry(state, "/v1/chat/completions", body).await
}

async fn completions(State(state): State<AppState>, body: Bytes) -> Response {
    completion_entry(state, "/v1/completions", body).await
}

/// Shared path for the two completion endpoints: route on `model`, then
/// forward the original body bytes untouched.
async fn completion_entry(state: AppState, endpoint: &'static str, body: Bytes) -> Response {
    let routing = match CompletionRouting::from_body(&body) {
        Ok(routing) => routing,
        Err(e) => return error_response(&e),
    };

    let server = match state.manager.ensure_loaded(&routing.model).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to load {}: {}", routing.model, e);
            return error_response(&e);
        }
    };

    if routing.stream {
        streaming::sse_passthrough(server, endpoint, body)
    } else {
        // The body already parsed once for routing; a second parse cannot fail
        let request: Value = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return error_response(&Error::BadRequest(e.to_string())),
        };
        backend_json_response(server.forward_request(endpoint, &request, None).await)
    }
}

async fn embeddings(State(state): State<AppState>, body: Bytes) -> Response {
    non_streaming_entry(state, "/v1/embeddings", body).await
}

async fn rerank(State(state): State<AppState>, body: Bytes) -> Response {
    non_streaming_entry(state, "/v1/rerank", body).await
}

async fn non_streaming_entry(state: AppState, endpoint: &'static str, body: Bytes) -> Response {
    let routing = match CompletionRouting::from_body(&body) {
        Ok(routing) => routing,
        Err(e) => return error_response(&e),
    };

    let server = match state.manager.ensure_loaded(&routing.model).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to load {}: {}", routing.model, e);
            return error_response(&e);
        }
    };

    let request: Value = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&Error::BadRequest(e.to_string())),
    };
    backend_json_response(server.forward_request(endpoint, &request, None).await)
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    show_all: bool,
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Json<ModelList> {
    let data = state.catalog.read().await.list(query.show_all);
    Json(ModelList { data })
}

async fn pull_model(State(state): State<AppState>, Json(request): Json<PullRequest>) -> Response {
    match state.catalog.write().await.pull(&request) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_model(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return error_response(&e);
    }

    // Drop any live slot before touching the artifact
    state.manager.unload(&request.model).await;

    match state.catalog.write().await.delete(&request.model) {
        Ok(()) => Json(json!({"status": "deleted", "model": request.model})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().unwrap_or_default().as_secs();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        models_loaded: state.manager.list_loaded().await,
    })
}

/// Answer 200 immediately; unloading and process exit happen asynchronously
async fn internal_shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("Shutdown requested");
    tokio::spawn(async move {
        state.manager.unload_all().await;
        let _ = state.shutdown.send(()).await;
    });
    Json(json!({"status": "ok"}))
}
