//! Command Surface (§4.14): an HTTP transport binding for the core's
//! in-process API. No business logic lives here beyond request
//! validation and translating HTTP semantics to core calls.

use crate::agents::AgentRegistry;
use crate::models::{AgentDefinition, PreferredAgent, Priority};
use crate::monitoring::HealthReporter;
use crate::orchestrator::Orchestrator;
use crate::tasks::TaskManager;
use crate::OrchestratorError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_APPROVE: &str = "/tasks/{task_id}/approve";
const ROUTE_TASK_REJECT: &str = "/tasks/{task_id}/reject";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENT_BY_ID: &str = "/agents/{agent_id}";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";
const ROUTE_AUTO_APPROVE: &str = "/system/auto-approve";

#[derive(Clone)]
pub struct ApiServer {
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
    orchestrator: Arc<Orchestrator>,
    health: Arc<HealthReporter>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleAutoApproveRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<OrchestratorError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Validation(_) | OrchestratorError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: err.to_string() }))
    }
}

impl ApiServer {
    pub fn new(
        host: String,
        port: u16,
        allowed_origins: Vec<String>,
        agents: Arc<AgentRegistry>,
        tasks: Arc<TaskManager>,
        orchestrator: Arc<Orchestrator>,
        health: Arc<HealthReporter>,
    ) -> Self {
        Self {
            host,
            port,
            allowed_origins,
            agents,
            tasks,
            orchestrator,
            health,
        }
    }

    pub fn build_router(&self) -> Router {
        let cors = if self.allowed_origins.is_empty() {
            CorsLayer::permissive()
        } else {
            let origins: Vec<_> = self
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        };

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_APPROVE, post(approve_task))
            .route(ROUTE_TASK_REJECT, post(reject_task))
            .route(ROUTE_AGENTS, post(add_agent).get(list_agents))
            .route(ROUTE_AGENT_BY_ID, get(get_agent))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .route(ROUTE_AUTO_APPROVE, post(toggle_auto_approve))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.clone())
    }

    pub async fn run(&self) -> crate::Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "command surface listening");
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn health_check(State(api): State<ApiServer>) -> Json<crate::monitoring::SystemHealth> {
    Json(api.health.report().await)
}

async fn create_task(
    State(api): State<ApiServer>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), (StatusCode, Json<ErrorResponse>)> {
    if req.title.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "title must not be empty".to_string(),
            }),
        ));
    }
    let preferred = req
        .agent_id
        .map(|id| PreferredAgent::from_str_field(&id))
        .unwrap_or(PreferredAgent::Auto);
    let task = api
        .tasks
        .create(
            req.title,
            req.description,
            req.priority.unwrap_or(Priority::Medium),
            crate::models::CreatedBy::User,
            None,
            0,
            preferred,
            Vec::new(),
        )
        .await
        .map_err(<(StatusCode, Json<ErrorResponse>)>::from)?;
    Ok((StatusCode::CREATED, Json(CreateTaskResponse { task_id: task.id })))
}

async fn list_tasks(State(api): State<ApiServer>) -> Json<Vec<crate::models::Task>> {
    Json(api.tasks.list().await)
}

async fn get_task(
    State(api): State<ApiServer>,
    Path(task_id): Path<String>,
) -> Result<Json<crate::models::Task>, (StatusCode, Json<ErrorResponse>)> {
    api.tasks
        .get(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| OrchestratorError::NotFound(task_id).into())
}

async fn approve_task(
    State(api): State<ApiServer>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    api.orchestrator
        .approve_task(&task_id)
        .await
        .map_err(<(StatusCode, Json<ErrorResponse>)>::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reject_task(
    State(api): State<ApiServer>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    api.orchestrator
        .reject_task(&task_id)
        .await
        .map_err(<(StatusCode, Json<ErrorResponse>)>::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_agent(State(api): State<ApiServer>, Json(def): Json<AgentDefinition>) -> StatusCode {
    let env_snapshot = crate::config::snapshot_env(std::slice::from_ref(&def));
    let credential = crate::config::resolve_credential(&def, &env_snapshot);
    api.agents.add(def, credential).await;
    StatusCode::CREATED
}

async fn list_agents(State(api): State<ApiServer>) -> Json<Vec<crate::models::AgentState>> {
    Json(api.agents.list().await)
}

async fn get_agent(
    State(api): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> Result<Json<crate::models::AgentState>, (StatusCode, Json<ErrorResponse>)> {
    api.agents
        .get(&agent_id)
        .await
        .map(Json)
        .ok_or_else(|| OrchestratorError::NotFound(agent_id).into())
}

async fn system_status(State(api): State<ApiServer>) -> Json<crate::monitoring::SystemHealth> {
    Json(api.health.report().await)
}

async fn toggle_auto_approve(State(api): State<ApiServer>, Json(req): Json<ToggleAutoApproveRequest>) -> StatusCode {
    api.tasks.set_auto_approve_all(req.enabled);
    StatusCode::NO_CONTENT
}
