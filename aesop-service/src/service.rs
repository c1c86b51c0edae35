use std::sync::Arc;

use agent_flow::{Graph, GraphError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::models::OrchestratorState;
use crate::stores::session::SessionStore;
use crate::workflow::{self, EngineDeps};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
    pub route_taken: String,
    pub intent: Option<String>,
    pub intent_confidence: Option<f64>,
    pub papers_count: usize,
    pub critic_decision: Option<String>,
    pub avg_quality: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SessionProjection {
    pub session_id: String,
    pub original_query: String,
    pub turn_count: i64,
    pub papers_count: usize,
    pub synthesis_summary: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct AppState {
    graph: Arc<Graph>,
    session_store: Arc<dyn SessionStore>,
    /// Serializes concurrent requests on the same session
    session_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(deps: &EngineDeps) -> Self {
        Self {
            graph: Arc::new(workflow::build_orchestrator_graph(deps)),
            session_store: deps.session_store.clone(),
            session_locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: &str, session_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message, "session_id": session_id })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message, "details": details })),
    )
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route(
            "/session/{session_id}",
            get(get_session).delete(delete_session),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let message = request.message.trim().to_string();
    if message.is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let session_id = match request.session_id {
        Some(raw) => Uuid::parse_str(raw.trim())
            .map_err(|_| bad_request("session_id must be a valid UUID"))?
            .to_string(),
        None => Uuid::new_v4().to_string(),
    };

    info!(session_id = session_id.as_str(), "chat request received");

    // Messages within one session are processed strictly in order
    let lock = state.lock_for(&session_id);
    let _guard = lock.lock().await;

    let session_context = match state.session_store.get(&session_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            // Degrade to a stateless turn
            error!(session_id = session_id.as_str(), error = %e, "session load failed");
            None
        }
    };

    let initial = OrchestratorState::new(message, session_id, session_context);

    match workflow::run_message(&state.graph, initial).await {
        Ok(outcome) => Ok(Json(ChatResponse {
            response: outcome.response,
            session_id: outcome.session_id,
            route_taken: outcome.route_taken,
            intent: outcome.intent,
            intent_confidence: outcome.intent_confidence,
            papers_count: outcome.papers_count,
            critic_decision: outcome.critic_decision,
            avg_quality: outcome.avg_quality,
        })),
        Err(e @ (GraphError::TaskNotFound(_) | GraphError::StepLimitExceeded(_))) => {
            // A broken graph wiring is a logic invariant violation
            error!(error = %e, "orchestrator invariant violated");
            Err(internal_error("orchestrator invariant violated", &e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "request failed");
            Err(internal_error("request failed", &e.to_string()))
        }
    }
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionProjection> {
    match state.session_store.get(&session_id).await {
        Ok(Some(context)) => Ok(Json(SessionProjection {
            session_id: context.session_id,
            original_query: context.original_query,
            turn_count: context.turn_count,
            papers_count: context.retrieved_papers.len(),
            synthesis_summary: context.synthesis_summary,
            created_at: context.created_at,
            updated_at: context.updated_at,
        })),
        Ok(None) => Err(not_found("session not found", &session_id)),
        Err(e) => {
            error!(session_id = session_id.as_str(), error = %e, "session lookup failed");
            Err(internal_error("failed to load session", &e.to_string()))
        }
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    match state.session_store.delete(&session_id).await {
        Ok(removed) => {
            info!(session_id = session_id.as_str(), removed, "session delete");
        }
        Err(e) => {
            error!(session_id = session_id.as_str(), error = %e, "session delete failed");
        }
    }
    // Idempotent by contract: deleting a missing session is still a delete
    Json(json!({ "status": "deleted", "session_id": session_id }))
}
