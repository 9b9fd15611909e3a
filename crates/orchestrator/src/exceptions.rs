//! Workflow exceptions: human-actionable records for steps that cannot
//! proceed automatically.
//!
//! The manager owns the records; the engine applies the step-level effect of
//! a resolution under the instance's serialization point.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::metrics;
use crate::store::{
    ExceptionSeverity, ResolutionStatus, Store, WorkflowException,
};
use crate::{Error, Result};

pub struct ExceptionManager {
    store: Arc<dyn Store>,
}

impl ExceptionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn raise(
        &self,
        workflow_id: Uuid,
        step_id: Option<Uuid>,
        kind: impl Into<String>,
        severity: ExceptionSeverity,
        title: impl Into<String>,
        description: Option<String>,
    ) -> Result<WorkflowException> {
        let exception = WorkflowException {
            id: Uuid::new_v4(),
            workflow_id,
            step_id,
            kind: kind.into(),
            severity,
            title: title.into(),
            description,
            resolution_status: ResolutionStatus::Open,
            assigned_to: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: Utc::now(),
        };

        self.store.save_exception(&exception).await?;
        metrics::EXCEPTIONS_RAISED_TOTAL.inc();
        info!(
            "Raised {} exception {} for workflow {} (step {:?}): {}",
            exception.severity, exception.id, workflow_id, step_id, exception.title
        );

        Ok(exception)
    }

    /// Mark an open exception resolved. The caller applies the step-level
    /// effect afterwards; this method only owns the record transition.
    pub async fn mark_resolved(
        &self,
        exception_id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<WorkflowException> {
        let exception = self
            .store
            .get_exception(exception_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("exception {}", exception_id)))?;

        if exception.resolution_status == ResolutionStatus::Resolved {
            return Err(Error::ExceptionAlreadyResolved(exception_id));
        }

        let resolved_at = Utc::now();
        self.store
            .resolve_exception(exception_id, resolved_by, notes, resolved_at)
            .await?;

        Ok(WorkflowException {
            resolution_status: ResolutionStatus::Resolved,
            resolved_at: Some(resolved_at),
            resolved_by: Some(resolved_by.to_string()),
            resolution_notes: notes.map(|n| n.to_string()),
            ..exception
        })
    }

    pub async fn get(&self, exception_id: Uuid) -> Result<WorkflowException> {
        self.store
            .get_exception(exception_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("exception {}", exception_id)))
    }

    pub async fn for_workflow(&self, workflow_id: Uuid) -> Result<Vec<WorkflowException>> {
        self.store.list_exceptions(workflow_id).await
    }

    pub async fn open_count(&self, workflow_id: Uuid) -> Result<i64> {
        self.store.count_open_exceptions(workflow_id).await
    }
}
