mod config;
mod models;
mod postgres;
mod sqlite;
mod factory;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use models::*;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    // Workflow instance operations. Creation persists the instance and all of
    // its steps in one transaction; a failed step insert rolls everything back.
    async fn create_workflow(
        &self,
        instance: &WorkflowInstance,
        steps: &[WorkflowStep],
    ) -> crate::Result<()>;
    async fn get_workflow(&self, id: Uuid) -> crate::Result<Option<WorkflowInstance>>;
    async fn list_workflows(&self, limit: i64, offset: i64) -> crate::Result<Vec<WorkflowInstance>>;
    async fn update_workflow_progress(
        &self,
        id: Uuid,
        progress: i32,
        current_stage: &str,
    ) -> crate::Result<()>;
    async fn complete_workflow(&self, id: Uuid, completed_at: DateTime<Utc>) -> crate::Result<()>;
    async fn cancel_workflow(&self, id: Uuid, reason: &str) -> crate::Result<()>;

    // Step operations
    async fn get_step(&self, id: Uuid) -> crate::Result<Option<WorkflowStep>>;
    async fn list_steps(&self, workflow_id: Uuid) -> crate::Result<Vec<WorkflowStep>>;
    async fn update_step_status(&self, id: Uuid, status: StepStatus) -> crate::Result<()>;
    async fn mark_step_started(&self, id: Uuid, started_at: DateTime<Utc>) -> crate::Result<()>;
    async fn complete_step(
        &self,
        id: Uuid,
        status: StepStatus,
        completed_at: DateTime<Utc>,
        completed_by: Option<&str>,
    ) -> crate::Result<()>;

    // Integration attempt operations. One record per step, keyed by step_id.
    async fn upsert_attempt(&self, attempt: &IntegrationAttempt) -> crate::Result<()>;
    async fn get_attempt_for_step(&self, step_id: Uuid) -> crate::Result<Option<IntegrationAttempt>>;
    async fn reset_attempt_for_step(&self, step_id: Uuid) -> crate::Result<()>;
    async fn list_attempts(&self, workflow_id: Uuid) -> crate::Result<Vec<IntegrationAttempt>>;

    // Exception operations
    async fn save_exception(&self, exception: &WorkflowException) -> crate::Result<()>;
    async fn get_exception(&self, id: Uuid) -> crate::Result<Option<WorkflowException>>;
    async fn resolve_exception(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> crate::Result<()>;
    async fn list_exceptions(&self, workflow_id: Uuid) -> crate::Result<Vec<WorkflowException>>;
    async fn count_open_exceptions(&self, workflow_id: Uuid) -> crate::Result<i64>;
}
