//! HTTP route handlers for the agent API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use chrono::Utc;
use mitosis::core::types::{StepResult, TaskView};
use mitosis::error::EngineError;
use mitosis::io::store::{ConversationMessage, FileRecord};
use mitosis::task::Step;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::state::AppState;

/// Build the API router (mounted under `/api`).
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/agent/health", get(health))
        .route("/agent/status", get(health))
        .route("/agent/chat", post(chat))
        .route("/agent/generate-plan", post(generate_plan))
        .route("/agent/execute-step/{task_id}/{step_id}", post(execute_step))
        .route("/agent/retry-step/{task_id}/{step_id}", post(retry_step))
        .route("/agent/get-task-status/{task_id}", get(get_task_status))
        .route("/agent/update-task-progress", post(update_task_progress))
        .route("/agent/start-task/{task_id}", post(start_task))
        .route("/agent/cancel-task/{task_id}", post(cancel_task))
        .route("/agent/delete-task/{task_id}", delete(delete_task))
        .route("/agent/conversation/{task_id}", get(conversation))
        .route("/agent/files/{task_id}", get(files))
        .route("/agent/events/{task_id}", get(crate::sse::events_handler))
        .route("/socket.io/", get(crate::ws::ws_handler))
}

/// Engine errors rendered as `{ "success": false, "error": ... }`.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::TaskNotFound { .. } | EngineError::StepNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            EngineError::RetryExhausted { .. }
            | EngineError::StepOutOfOrder { .. }
            | EngineError::StepAlreadyCompleted { .. }
            | EngineError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            EngineError::StepAlreadyExecuting { .. }
            | EngineError::StepNotExecuting { .. }
            | EngineError::TaskCancelled { .. } => StatusCode::CONFLICT,
            EngineError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(err = %self.0, "request failed");
        }
        let body = json!({ "success": false, "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: bool,
    store_backend: &'static str,
    llm: bool,
    model: String,
    tools: std::collections::BTreeMap<String, bool>,
    websocket_connections: usize,
    uptime_secs: i64,
}

/// GET /api/health, /api/agent/health, /api/agent/status.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let services = &state.services;
    let database = services.store.ping().await.is_ok();
    let llm = services.llm.health().await;
    let tools = services.engine.tools().availability().await;
    let status = if database { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status,
        database,
        store_backend: services.store.backend(),
        llm,
        model: services.llm.model().to_string(),
        tools,
        websocket_connections: services.events.connection_count(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    task_id: Option<String>,
    plan: Vec<Step>,
    memory_used: bool,
    timestamp: chrono::DateTime<Utc>,
}

/// POST /api/agent/chat - small talk is answered, work requests become tasks.
async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    if body.message.trim().is_empty() {
        return bad_request("message must not be empty");
    }
    match state.services.chat(&body.message, body.task_id).await {
        Ok(outcome) => Json(ChatResponse {
            response: outcome.response,
            task_id: outcome.task.as_ref().map(|task| task.task_id.clone()),
            plan: outcome.task.map(|task| task.plan).unwrap_or_default(),
            memory_used: outcome.memory_used,
            timestamp: Utc::now(),
        })
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

#[derive(Deserialize)]
struct GeneratePlanRequest {
    task_title: String,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Serialize)]
struct GeneratePlanResponse {
    plan: Vec<Step>,
    task_id: String,
    enhanced_title: String,
    task_type: mitosis::core::planner::TaskType,
    complexity: mitosis::core::planner::Complexity,
}

/// POST /api/agent/generate-plan - plan and create a task without starting it.
async fn generate_plan(
    State(state): State<AppState>,
    Json(body): Json<GeneratePlanRequest>,
) -> Response {
    if body.task_title.trim().is_empty() {
        return bad_request("task_title must not be empty");
    }
    match state
        .services
        .create_planned_task(&body.task_title, body.task_id)
        .await
    {
        Ok((task, draft)) => Json(GeneratePlanResponse {
            plan: task.plan,
            task_id: task.task_id,
            enhanced_title: draft.enhanced_title,
            task_type: draft.task_type,
            complexity: draft.complexity,
        })
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

/// POST /api/agent/execute-step/:task_id/:step_id
async fn execute_step(
    State(state): State<AppState>,
    Path((task_id, step_id)): Path<(String, String)>,
) -> Result<Json<StepResult>, ApiError> {
    let result = state.engine().execute_step(&task_id, &step_id).await?;
    Ok(Json(result))
}

/// POST /api/agent/retry-step/:task_id/:step_id
async fn retry_step(
    State(state): State<AppState>,
    Path((task_id, step_id)): Path<(String, String)>,
) -> Result<Json<StepResult>, ApiError> {
    let result = state.engine().retry_step(&task_id, &step_id).await?;
    Ok(Json(result))
}

/// GET /api/agent/get-task-status/:task_id
async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.engine().get_task_status(&task_id).await?))
}

#[derive(Deserialize)]
struct UpdateProgressRequest {
    task_id: String,
    step_id: String,
    completed: bool,
}

/// POST /api/agent/update-task-progress - manual step override.
async fn update_task_progress(
    State(state): State<AppState>,
    Json(body): Json<UpdateProgressRequest>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine();
    let updated = engine
        .update_step_progress(&body.task_id, &body.step_id, body.completed)
        .await?;
    let view = engine.get_task_status(&body.task_id).await?;
    Ok(Json(json!({ "success": true, "updated": updated, "task": view })))
}

/// POST /api/agent/start-task/:task_id - queue a task for the worker.
async fn start_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.engine().start_task(&task_id).await?;
    let queued = !task.status.is_terminal() && state.worker().enqueue(&task_id);
    Ok(Json(json!({
        "success": true,
        "task_id": task_id,
        "status": task.status,
        "queued": queued,
    })))
}

/// POST /api/agent/cancel-task/:task_id
async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.engine().cancel_task(&task_id).await?;
    Ok(Json(json!({ "success": true, "task_id": task_id, "status": task.status })))
}

/// DELETE /api/agent/delete-task/:task_id
async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.engine().delete_task(&task_id).await?;
    Ok(Json(json!({ "success": true, "task_id": task_id })))
}

/// GET /api/agent/conversation/:task_id
async fn conversation(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<ConversationMessage>>, ApiError> {
    Ok(Json(state.engine().conversation(&task_id).await?))
}

/// GET /api/agent/files/:task_id
async fn files(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<FileRecord>>, ApiError> {
    Ok(Json(state.engine().files(&task_id).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use mitosis::test_support::ScriptedTool;
    use tower::ServiceExt;

    use super::*;
    use crate::state::testing::{state, state_with};

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");
        let app = Router::new().nest("/api", api_router()).with_state(state.clone());
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn planned_task(state: &AppState) -> (String, Vec<String>) {
        let (status, body) = call(
            state,
            "POST",
            "/api/agent/generate-plan",
            Some(json!({ "task_title": "research rust async runtimes" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let task_id = body["task_id"].as_str().expect("task_id").to_string();
        let steps = body["plan"]
            .as_array()
            .expect("plan")
            .iter()
            .map(|step| step["id"].as_str().expect("id").to_string())
            .collect();
        (task_id, steps)
    }

    #[tokio::test]
    async fn health_reports_collaborators() {
        let state = state();
        let (status, body) = call(&state, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], true);
        assert_eq!(body["llm"], true);
        assert_eq!(body["tools"]["web_search"], true);
    }

    #[tokio::test]
    async fn generate_plan_returns_classified_plan() {
        let state = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/agent/generate-plan",
            Some(json!({ "task_title": "research rust async runtimes" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task_type"], "research");
        assert!(body["plan"].as_array().expect("plan").len() >= 3);
        assert_eq!(body["plan"][0]["status"], "pending");
    }

    #[tokio::test]
    async fn execute_step_reports_retry_state() {
        let state = state_with(|| ScriptedTool::always_failing("search down"));
        let (task_id, steps) = planned_task(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/agent/execute-step/{task_id}/{}", steps[0]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["should_retry"], true);
        assert_eq!(body["retry_count"], 1);
        assert_eq!(body["remaining_retries"], 4);
        assert_eq!(body["step_failed_permanently"], false);
    }

    #[tokio::test]
    async fn exhausted_retry_is_bad_request() {
        let state = state_with(|| ScriptedTool::always_failing("down"));
        let (task_id, steps) = planned_task(&state).await;
        let uri = format!("/api/agent/execute-step/{task_id}/{}", steps[0]);
        for _ in 0..5 {
            call(&state, "POST", &uri, None).await;
        }

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/agent/retry-step/{task_id}/{}", steps[0]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(
            body["error"]
                .as_str()
                .expect("error")
                .contains("exceeded maximum retries")
        );
    }

    #[tokio::test]
    async fn out_of_order_step_is_rejected() {
        let state = state();
        let (task_id, steps) = planned_task(&state).await;
        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/agent/execute-step/{task_id}/{}", steps[1]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let state = state();
        let (status, body) = call(&state, "GET", "/api/agent/get-task-status/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn status_view_has_stats() {
        let state = state();
        let (task_id, steps) = planned_task(&state).await;
        call(
            &state,
            "POST",
            &format!("/api/agent/execute-step/{task_id}/{}", steps[0]),
            None,
        )
        .await;

        let (status, body) = call(
            &state,
            "GET",
            &format!("/api/agent/get-task-status/{task_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "executing");
        assert_eq!(body["stats"]["completed_steps"], 1);
        assert_eq!(body["stats"]["total_steps"], steps.len());
    }

    #[tokio::test]
    async fn manual_override_completes_step() {
        let state = state();
        let (task_id, steps) = planned_task(&state).await;
        let (status, body) = call(
            &state,
            "POST",
            "/api/agent/update-task-progress",
            Some(json!({ "task_id": task_id, "step_id": steps[0], "completed": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], true);
        assert_eq!(body["task"]["plan"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn cancelled_task_rejects_execution() {
        let state = state();
        let (task_id, steps) = planned_task(&state).await;
        let (status, body) = call(&state, "POST", &format!("/api/agent/cancel-task/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/agent/execute-step/{task_id}/{}", steps[0]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_then_status_is_not_found() {
        let state = state();
        let (task_id, _) = planned_task(&state).await;
        let (status, _) = call(&state, "DELETE", &format!("/api/agent/delete-task/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&state, "GET", &format!("/api/agent/get-task-status/{task_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, messages) = call(&state, "GET", &format!("/api/agent/conversation/{task_id}"), None).await;
        assert_eq!(messages, json!([]));
    }

    #[tokio::test]
    async fn chat_greeting_has_no_task() {
        let state = state();
        let (status, body) = call(&state, "POST", "/api/agent/chat", Some(json!({ "message": "hello" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "hello!");
        assert_eq!(body["task_id"], Value::Null);
        assert_eq!(body["memory_used"], false);
    }

    #[tokio::test]
    async fn chat_task_request_returns_plan() {
        let state = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/agent/chat",
            Some(json!({ "message": "write a short report about rust ownership rules" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["task_id"].is_string());
        assert!(!body["plan"].as_array().expect("plan").is_empty());
    }

    #[tokio::test]
    async fn empty_chat_message_is_rejected() {
        let state = state();
        let (status, _) = call(&state, "POST", "/api/agent/chat", Some(json!({ "message": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
