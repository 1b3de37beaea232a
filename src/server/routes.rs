//! HTTP routes.

use super::AppState;
use super::manager::AgentError;
use super::stream::StreamSession;
use crate::protocol::{
    AgentResponse, AgentsResponse, ErrorBody, HistoryResponse, SendInputResponse, StartRequest,
    StartResponse, StopRequest, StopResponse,
};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info};

static X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Error response: a status code and an [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: Option<&'static str>,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: Option<&'static str>, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, None, message)
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let (status, code) = match &err {
            AgentError::NotFound(_) => (StatusCode::NOT_FOUND, "AGENT_NOT_FOUND"),
            AgentError::Disabled(_) => (StatusCode::BAD_REQUEST, "AGENT_DISABLED"),
            AgentError::MissingEnvironment { .. } => {
                (StatusCode::BAD_REQUEST, "MISSING_ENVIRONMENT")
            }
            AgentError::AlreadyRunning { .. } => (StatusCode::CONFLICT, "AGENT_ALREADY_RUNNING"),
            AgentError::AlreadyStarting(_) => (StatusCode::CONFLICT, "AGENT_STARTING"),
            AgentError::AlreadyStopped(_) => (StatusCode::CONFLICT, "AGENT_ALREADY_STOPPED"),
            AgentError::AlreadyStopping(_) => (StatusCode::CONFLICT, "AGENT_STOPPING"),
            AgentError::NotRunning(_) => (StatusCode::BAD_REQUEST, "AGENT_NOT_RUNNING"),
            AgentError::InputQueueFull(_) => (StatusCode::BAD_REQUEST, "AGENT_INPUT_FULL"),
            AgentError::Spawn { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_START_ERROR"),
            AgentError::Signal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_STOP_ERROR"),
        };
        Self::new(status, Some(code), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "Request failed");
        } else {
            debug!(status = %self.status, message = %self.message, "Request rejected");
        }
        let body = ErrorBody {
            error: self.message,
            code: self.code.map(str::to_string),
            timestamp: Utc::now(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/start", post(start_agent))
        .route("/agents/{id}/stop", post(stop_agent))
        .route("/agents/{id}/stream", get(stream_output).post(send_input))
        .route("/agents/{id}/output", get(output_history).delete(clear_output))
        .with_state(state)
}

/// Agent ids are opaque, but must be non-blank and printable.
pub fn validate_agent_id(id: &str) -> Result<&str, ApiError> {
    let id = id.trim();
    if id.is_empty() || id.chars().any(char::is_control) {
        return Err(ApiError::bad_request("Invalid agent ID"));
    }
    Ok(id)
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request("Invalid request body"))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn list_agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: state.manager.list(),
        timestamp: Utc::now(),
    })
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentResponse>, ApiError> {
    let id = validate_agent_id(&id)?;
    let agent = state
        .manager
        .get(id)
        .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
    Ok(Json(AgentResponse {
        agent,
        timestamp: Utc::now(),
    }))
}

async fn start_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let id = validate_agent_id(&id)?;
    let request: StartRequest = optional_body(&body)?;
    let job_id = state.manager.start(id, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            success: true,
            message: format!("Agent {id} is starting"),
            job_id,
            agent_id: id.to_string(),
            timestamp: Utc::now(),
        }),
    ))
}

async fn stop_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<StopResponse>, ApiError> {
    let id = validate_agent_id(&id)?;
    let request: StopRequest = optional_body(&body)?;
    state.manager.stop(id, request.force).await?;
    Ok(Json(StopResponse {
        success: true,
        agent_id: id.to_string(),
        message: format!("Agent {id} is stopping"),
        timestamp: Utc::now(),
    }))
}

async fn stream_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = validate_agent_id(&id)?;
    let session = StreamSession::open(id, &state.hub, state.status.as_ref(), state.settings);
    let keep_alive = KeepAlive::new()
        .interval(state.settings.keep_alive)
        .text("ping");

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (X_ACCEL_BUFFERING.clone(), "no"),
        ],
        Sse::new(session.into_stream()).keep_alive(keep_alive),
    )
        .into_response())
}

async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SendInputResponse>, ApiError> {
    let id = validate_agent_id(&id)?;
    let value: Value =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("Invalid request body"))?;
    let command = value
        .get("command")
        .and_then(Value::as_str)
        .filter(|command| !command.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Invalid command"))?;

    state
        .manager
        .send_input(id, command.to_string())
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to send command: {e}")))?;
    info!(agent_id = %id, "Command sent");

    Ok(Json(SendInputResponse {
        success: true,
        agent_id: id.to_string(),
        command: command.to_string(),
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn output_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let id = validate_agent_id(&id)?;
    let limit = query
        .limit
        .unwrap_or(state.settings.history_replay)
        .min(state.hub.capacity());
    Ok(Json(HistoryResponse {
        agent_id: id.to_string(),
        messages: state.hub.history(id, limit),
    }))
}

async fn clear_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = validate_agent_id(&id)?;
    state.hub.clear(id);
    info!(agent_id = %id, "Cleared output buffer");
    Ok(StatusCode::NO_CONTENT)
}
