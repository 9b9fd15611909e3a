use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::{
    registry::WorkflowTemplate,
    store::{ExceptionResolution, ExceptionSeverity},
    Error,
};

use super::AppState;

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::TemplateNotFound(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::StepNotReady(_)
        | Error::AlreadyTerminal(_)
        | Error::WorkflowAlreadyTerminal(_)
        | Error::ExceptionAlreadyResolved(_) => StatusCode::CONFLICT,
        Error::CyclicDependency { .. } | Error::Validation(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!("Internal error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> String {
    crate::metrics::gather_metrics()
}

pub async fn register_template(
    State(state): State<Arc<AppState>>,
    Json(template): Json<WorkflowTemplate>,
) -> Response {
    let name = template.name.clone();
    match state.registry.register(template) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({ "name": name, "message": "Template registered" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.get(&name) {
        Ok(template) => Json(template.as_ref().clone()).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub employee_id: Uuid,
    pub template_name: String,
}

pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWorkflowRequest>,
) -> Response {
    match state
        .engine
        .create_workflow(request.employee_id, &request.template_name)
        .await
    {
        Ok(detail) => (StatusCode::CREATED, Json(detail)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Response {
    match state
        .engine
        .list_workflows(page.limit.unwrap_or(50), page.offset.unwrap_or(0))
        .await
    {
        Ok(workflows) => Json(workflows).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.engine.get_workflow(id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelWorkflowRequest {
    pub reason: String,
}

pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelWorkflowRequest>,
) -> Response {
    match state.engine.cancel_workflow(id, &request.reason).await {
        Ok(instance) => Json(instance).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_exceptions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.engine.workflow_exceptions(id).await {
        Ok(exceptions) => Json(exceptions).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteStepRequest {
    pub completed_by: String,
}

pub async fn complete_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CompleteStepRequest>,
) -> Response {
    match state.engine.complete_step(id, &request.completed_by).await {
        Ok(step) => Json(step).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RaiseExceptionRequest {
    pub workflow_id: Uuid,
    pub step_id: Option<Uuid>,
    pub kind: String,
    pub severity: ExceptionSeverity,
    pub title: String,
    pub description: Option<String>,
}

pub async fn raise_exception(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RaiseExceptionRequest>,
) -> Response {
    match state
        .engine
        .raise_exception(
            request.workflow_id,
            request.step_id,
            &request.kind,
            request.severity,
            &request.title,
            request.description,
        )
        .await
    {
        Ok(exception) => (StatusCode::CREATED, Json(exception)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveExceptionRequest {
    pub resolution: ExceptionResolution,
    pub resolved_by: String,
    pub notes: Option<String>,
}

pub async fn resolve_exception(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveExceptionRequest>,
) -> Response {
    match state
        .engine
        .resolve_exception(
            id,
            request.resolution,
            &request.resolved_by,
            request.notes.as_deref(),
        )
        .await
    {
        Ok((exception, step)) => {
            Json(json!({ "exception": exception, "step": step })).into_response()
        }
        Err(e) => error_response(e),
    }
}
