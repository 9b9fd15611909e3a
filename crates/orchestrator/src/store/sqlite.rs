use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    store::{
        AttemptStatus, IntegrationAttempt, ResolutionStatus, StepStatus, Store, WorkflowException,
        WorkflowInstance, WorkflowStep,
    },
    Result,
};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(crate::Error::Sqlx)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to SQLite: {}", e);
                crate::Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }
}

fn row_to_instance(r: &SqliteRow) -> Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: r.get::<String, _>("id").parse()?,
        employee_id: r.get::<String, _>("employee_id").parse()?,
        template_name: r.get("template_name"),
        status: r.get::<String, _>("status").parse()?,
        current_stage: r.get("current_stage"),
        progress_percentage: r.get("progress_percentage"),
        started_at: r.get("started_at"),
        expected_completion: r.get("expected_completion"),
        actual_completion: r.get("actual_completion"),
        cancellation_reason: r.get("cancellation_reason"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_step(r: &SqliteRow) -> Result<WorkflowStep> {
    let depends_on: Vec<Uuid> = serde_json::from_str(r.get("depends_on"))?;
    let integration = r
        .get::<Option<String>, _>("integration")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    let metadata = r
        .get::<Option<String>, _>("metadata")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(WorkflowStep {
        id: r.get::<String, _>("id").parse()?,
        workflow_id: r.get::<String, _>("workflow_id").parse()?,
        step_order: r.get("step_order"),
        name: r.get("name"),
        step_type: r.get::<String, _>("step_type").parse()?,
        stage: r.get("stage"),
        status: r.get::<String, _>("status").parse()?,
        depends_on,
        assigned_to: r.get("assigned_to"),
        integration,
        max_retries: r.get("max_retries"),
        due_date: r.get("due_date"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
        completed_by: r.get("completed_by"),
        metadata,
        created_at: r.get("created_at"),
    })
}

fn row_to_attempt(r: &SqliteRow) -> Result<IntegrationAttempt> {
    let request_payload = r
        .get::<Option<String>, _>("request_payload")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    let response_payload = r
        .get::<Option<String>, _>("response_payload")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(IntegrationAttempt {
        id: r.get::<String, _>("id").parse()?,
        workflow_id: r.get::<String, _>("workflow_id").parse()?,
        step_id: r.get::<String, _>("step_id").parse()?,
        integration_type: r.get::<String, _>("integration_type").parse()?,
        external_id: r.get("external_id"),
        status: r.get::<String, _>("status").parse()?,
        request_payload,
        response_payload,
        error_message: r.get("error_message"),
        retry_count: r.get("retry_count"),
        max_retries: r.get("max_retries"),
        last_attempt_at: r.get("last_attempt_at"),
        created_at: r.get("created_at"),
    })
}

fn row_to_exception(r: &SqliteRow) -> Result<WorkflowException> {
    Ok(WorkflowException {
        id: r.get::<String, _>("id").parse()?,
        workflow_id: r.get::<String, _>("workflow_id").parse()?,
        step_id: r
            .get::<Option<String>, _>("step_id")
            .map(|s| s.parse())
            .transpose()?,
        kind: r.get("kind"),
        severity: r.get::<String, _>("severity").parse()?,
        title: r.get("title"),
        description: r.get("description"),
        resolution_status: r.get::<String, _>("resolution_status").parse()?,
        assigned_to: r.get("assigned_to"),
        resolved_at: r.get("resolved_at"),
        resolved_by: r.get("resolved_by"),
        resolution_notes: r.get("resolution_notes"),
        created_at: r.get("created_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                crate::Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn create_workflow(
        &self,
        instance: &WorkflowInstance,
        steps: &[WorkflowStep],
    ) -> Result<()> {
        debug!("Creating workflow {} with {} steps", instance.id, steps.len());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, employee_id, template_name, status, current_stage,
                progress_percentage, started_at, expected_completion,
                actual_completion, cancellation_reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.employee_id.to_string())
        .bind(&instance.template_name)
        .bind(instance.status.to_string())
        .bind(&instance.current_stage)
        .bind(instance.progress_percentage)
        .bind(instance.started_at)
        .bind(instance.expected_completion)
        .bind(instance.actual_completion)
        .bind(&instance.cancellation_reason)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            let depends_on = serde_json::to_string(&step.depends_on)?;
            let integration = step
                .integration
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let metadata = step
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                r#"
                INSERT INTO workflow_steps (
                    id, workflow_id, step_order, name, step_type, stage, status,
                    depends_on, assigned_to, integration, max_retries, due_date,
                    started_at, completed_at, completed_by, metadata, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                "#,
            )
            .bind(step.id.to_string())
            .bind(step.workflow_id.to_string())
            .bind(step.step_order)
            .bind(&step.name)
            .bind(step.step_type.to_string())
            .bind(&step.stage)
            .bind(step.status.to_string())
            .bind(depends_on)
            .bind(&step.assigned_to)
            .bind(integration)
            .bind(step.max_retries)
            .bind(step.due_date)
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(&step.completed_by)
            .bind(metadata)
            .bind(step.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_instance).transpose()
    }

    async fn list_workflows(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn update_workflow_progress(
        &self,
        id: Uuid,
        progress: i32,
        current_stage: &str,
    ) -> Result<()> {
        debug!(
            "Updating workflow {} progress to {}% (stage {})",
            id, progress, current_stage
        );

        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET progress_percentage = ?1, current_stage = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(progress)
        .bind(current_stage)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_workflow(&self, id: Uuid, completed_at: DateTime<Utc>) -> Result<()> {
        debug!("Completing workflow {}", id);

        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'completed', actual_completion = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(completed_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_workflow(&self, id: Uuid, reason: &str) -> Result<()> {
        debug!("Cancelling workflow {}: {}", id, reason);

        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'cancelled', cancellation_reason = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<WorkflowStep>> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_step).transpose()
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let rows =
            sqlx::query("SELECT * FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order")
                .bind(workflow_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(row_to_step).collect()
    }

    async fn update_step_status(&self, id: Uuid, status: StepStatus) -> Result<()> {
        debug!("Updating step {} status -> {}", id, status);

        sqlx::query("UPDATE workflow_steps SET status = ?1 WHERE id = ?2")
            .bind(status.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_step_started(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        debug!("Marking step {} in progress", id);

        sqlx::query(
            "UPDATE workflow_steps SET status = ?1, started_at = ?2 WHERE id = ?3",
        )
        .bind(StepStatus::InProgress.to_string())
        .bind(started_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_step(
        &self,
        id: Uuid,
        status: StepStatus,
        completed_at: DateTime<Utc>,
        completed_by: Option<&str>,
    ) -> Result<()> {
        debug!("Completing step {} with status {}", id, status);

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, completed_at = ?2, completed_by = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.to_string())
        .bind(completed_at)
        .bind(completed_by)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_attempt(&self, attempt: &IntegrationAttempt) -> Result<()> {
        let request_payload = attempt
            .request_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let response_payload = attempt
            .response_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO integration_attempts (
                id, workflow_id, step_id, integration_type, external_id, status,
                request_payload, response_payload, error_message,
                retry_count, max_retries, last_attempt_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(step_id) DO UPDATE SET
                external_id = excluded.external_id,
                status = excluded.status,
                request_payload = excluded.request_payload,
                response_payload = excluded.response_payload,
                error_message = excluded.error_message,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.workflow_id.to_string())
        .bind(attempt.step_id.to_string())
        .bind(attempt.integration_type.to_string())
        .bind(&attempt.external_id)
        .bind(attempt.status.to_string())
        .bind(request_payload)
        .bind(response_payload)
        .bind(&attempt.error_message)
        .bind(attempt.retry_count)
        .bind(attempt.max_retries)
        .bind(attempt.last_attempt_at)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_attempt_for_step(&self, step_id: Uuid) -> Result<Option<IntegrationAttempt>> {
        let row = sqlx::query("SELECT * FROM integration_attempts WHERE step_id = ?1")
            .bind(step_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn reset_attempt_for_step(&self, step_id: Uuid) -> Result<()> {
        debug!("Re-arming integration attempt for step {}", step_id);

        sqlx::query(
            r#"
            UPDATE integration_attempts
            SET status = ?1, retry_count = 0, external_id = NULL,
                response_payload = NULL, error_message = NULL
            WHERE step_id = ?2
            "#,
        )
        .bind(AttemptStatus::Pending.to_string())
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_attempts(&self, workflow_id: Uuid) -> Result<Vec<IntegrationAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM integration_attempts WHERE workflow_id = ?1 ORDER BY created_at",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    async fn save_exception(&self, exception: &WorkflowException) -> Result<()> {
        debug!(
            "Saving exception {} for workflow {}",
            exception.id, exception.workflow_id
        );

        sqlx::query(
            r#"
            INSERT INTO workflow_exceptions (
                id, workflow_id, step_id, kind, severity, title, description,
                resolution_status, assigned_to, resolved_at, resolved_by,
                resolution_notes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(exception.id.to_string())
        .bind(exception.workflow_id.to_string())
        .bind(exception.step_id.map(|id| id.to_string()))
        .bind(&exception.kind)
        .bind(exception.severity.to_string())
        .bind(&exception.title)
        .bind(&exception.description)
        .bind(exception.resolution_status.to_string())
        .bind(&exception.assigned_to)
        .bind(exception.resolved_at)
        .bind(&exception.resolved_by)
        .bind(&exception.resolution_notes)
        .bind(exception.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_exception(&self, id: Uuid) -> Result<Option<WorkflowException>> {
        let row = sqlx::query("SELECT * FROM workflow_exceptions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_exception).transpose()
    }

    async fn resolve_exception(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        debug!("Resolving exception {}", id);

        sqlx::query(
            r#"
            UPDATE workflow_exceptions
            SET resolution_status = ?1, resolved_by = ?2, resolution_notes = ?3, resolved_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(ResolutionStatus::Resolved.to_string())
        .bind(resolved_by)
        .bind(notes)
        .bind(resolved_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_exceptions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowException>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_exceptions WHERE workflow_id = ?1 ORDER BY created_at",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_exception).collect()
    }

    async fn count_open_exceptions(&self, workflow_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS open_count FROM workflow_exceptions WHERE workflow_id = ?1 AND resolution_status = 'open'",
        )
        .bind(workflow_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("open_count"))
    }
}
