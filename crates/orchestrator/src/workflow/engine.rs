//! Step executor / scheduler.
//!
//! The engine is the single owner of per-instance mutation. Every transition
//! event (manual completion, integration outcome, exception resolution,
//! cancellation) runs under that instance's lock and ends with a scheduler
//! pass that recomputes the ready set, dispatches newly-ready integration
//! steps, and re-derives current stage and progress from step state.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::exceptions::ExceptionManager;
use crate::integration::{
    IntegrationInvoker, IntegrationJob, IntegrationOutcome, InvokerSettings, ProviderRegistry,
};
use crate::metrics;
use crate::registry::TemplateRegistry;
use crate::store::{
    ExceptionResolution, ExceptionSeverity, StepStatus, StepType, Store, WorkflowException,
    WorkflowInstance, WorkflowStep,
};
use crate::workflow::context::EmployeeDirectory;
use crate::workflow::{graph, progress};
use crate::{Error, Result};

/// A workflow instance together with its steps, as exposed to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDetail {
    pub instance: WorkflowInstance,
    pub steps: Vec<WorkflowStep>,
}

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    registry: Arc<TemplateRegistry>,
    exceptions: ExceptionManager,
    invoker: Arc<IntegrationInvoker>,
    /// Per-instance serialization points.
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Per-instance cancellation signals; set once, on cancellation.
    cancel_signals: RwLock<HashMap<Uuid, watch::Sender<bool>>>,
    outcome_rx: Mutex<Option<mpsc::Receiver<IntegrationOutcome>>>,
    default_max_retries: i32,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<TemplateRegistry>,
        directory: Arc<dyn EmployeeDirectory>,
        providers: ProviderRegistry,
        settings: InvokerSettings,
    ) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = mpsc::channel(256);
        let default_max_retries = settings.default_max_retries;
        let invoker = Arc::new(IntegrationInvoker::new(
            store.clone(),
            providers,
            directory,
            outcome_tx,
            settings,
        ));

        Arc::new(Self {
            exceptions: ExceptionManager::new(store.clone()),
            store,
            registry,
            invoker,
            locks: RwLock::new(HashMap::new()),
            cancel_signals: RwLock::new(HashMap::new()),
            outcome_rx: Mutex::new(Some(outcome_rx)),
            default_max_retries,
        })
    }

    /// Start the event loop consuming integration outcomes.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let rx = engine.outcome_rx.lock().await.take();
            let Some(mut rx) = rx else {
                warn!("Workflow engine event loop already started");
                return;
            };

            info!("Workflow engine event loop started");
            while let Some(outcome) = rx.recv().await {
                if let Err(e) = engine.apply_outcome(outcome).await {
                    error!("Failed to apply integration outcome: {}", e);
                }
            }
        });
    }

    // ── Instantiation ────────────────────────────────────────────────

    /// Create a workflow instance from a registered template. The instance
    /// and all of its steps are persisted atomically, then root integration
    /// steps are dispatched.
    pub async fn create_workflow(
        &self,
        employee_id: Uuid,
        template_name: &str,
    ) -> Result<WorkflowDetail> {
        let template = self.registry.get(template_name)?;
        let now = Utc::now();
        let workflow_id = Uuid::new_v4();

        let mut blueprints: Vec<_> = template.steps.iter().collect();
        blueprints.sort_by_key(|b| b.order);

        // Blueprint orders become step ids; dependency references follow.
        let ids: HashMap<u32, Uuid> = blueprints
            .iter()
            .map(|b| (b.order, Uuid::new_v4()))
            .collect();

        let steps: Vec<WorkflowStep> = blueprints
            .iter()
            .map(|b| WorkflowStep {
                id: ids[&b.order],
                workflow_id,
                step_order: b.order as i32,
                name: b.name.clone(),
                step_type: b.step_type,
                stage: b.stage.clone(),
                status: StepStatus::Pending,
                depends_on: b.depends_on.iter().map(|order| ids[order]).collect(),
                assigned_to: b.default_assignee.clone(),
                integration: b.integration.clone(),
                max_retries: b.max_retries,
                due_date: b.due_in_days.map(|days| now + ChronoDuration::days(days)),
                started_at: None,
                completed_at: None,
                completed_by: None,
                metadata: None,
                created_at: now,
            })
            .collect();

        let current_stage = blueprints
            .first()
            .map(|b| b.stage.clone())
            .ok_or_else(|| Error::Validation("template has no steps".into()))?;

        let instance = WorkflowInstance {
            id: workflow_id,
            employee_id,
            template_name: template.name.clone(),
            status: crate::store::InstanceStatus::Active,
            current_stage,
            progress_percentage: 0,
            started_at: now,
            expected_completion: template
                .expected_duration_days
                .map(|days| now + ChronoDuration::days(days)),
            actual_completion: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.store.create_workflow(&instance, &steps).await?;
        metrics::WORKFLOWS_STARTED_TOTAL.inc();
        info!(
            "Created workflow {} for employee {} from template '{}'",
            workflow_id, employee_id, template_name
        );

        {
            let lock = self.instance_lock(workflow_id).await;
            let _guard = lock.lock().await;
            self.run_scheduler_pass(workflow_id).await?;
        }

        self.get_workflow(workflow_id).await
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowDetail> {
        let instance = self
            .store
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;
        let steps = self.store.list_steps(id).await?;
        Ok(WorkflowDetail { instance, steps })
    }

    pub async fn list_workflows(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowInstance>> {
        self.store.list_workflows(limit, offset).await
    }

    pub async fn workflow_exceptions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowException>> {
        self.exceptions.for_workflow(workflow_id).await
    }

    // ── Manual completion ────────────────────────────────────────────

    /// Complete a manual or document step on behalf of an external actor.
    pub async fn complete_step(&self, step_id: Uuid, completed_by: &str) -> Result<WorkflowStep> {
        let step = self
            .store
            .get_step(step_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))?;
        let workflow_id = step.workflow_id;

        let lock = self.instance_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let instance = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))?;
        if instance.is_terminal() {
            return Err(Error::WorkflowAlreadyTerminal(workflow_id));
        }

        // Re-read the whole step set under the lock for a consistent snapshot.
        let steps = self.store.list_steps(workflow_id).await?;
        let step = steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))?;

        if step.is_terminal() {
            return Err(Error::AlreadyTerminal(step_id));
        }
        if !graph::ready_set(&steps).contains(&step_id) {
            return Err(Error::StepNotReady(step_id));
        }

        self.store
            .complete_step(step_id, StepStatus::Completed, Utc::now(), Some(completed_by))
            .await?;
        metrics::STEPS_COMPLETED_TOTAL.inc();
        info!("Step {} completed by {}", step_id, completed_by);

        self.run_scheduler_pass(workflow_id).await?;

        self.store
            .get_step(step_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Cancel an active workflow. Pending retry timers are aborted, external
    /// calls with a recorded id are voided best-effort, and any outcome that
    /// still arrives for this instance is ignored.
    pub async fn cancel_workflow(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance> {
        let lock = self.instance_lock(id).await;
        let _guard = lock.lock().await;

        let instance = self
            .store
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;
        if instance.is_terminal() {
            return Err(Error::WorkflowAlreadyTerminal(id));
        }

        self.store.cancel_workflow(id, reason).await?;
        metrics::WORKFLOWS_CANCELLED_TOTAL.inc();
        info!("Workflow {} cancelled: {}", id, reason);

        if let Some(signal) = self.cancel_signals.read().await.get(&id) {
            let _ = signal.send(true);
        }

        let attempts: Vec<_> = self
            .store
            .list_attempts(id)
            .await?
            .into_iter()
            .filter(|a| a.external_id.is_some())
            .collect();
        let voids = attempts
            .iter()
            .map(|attempt| self.invoker.void_attempt(attempt, reason));
        futures::future::join_all(voids).await;

        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))
    }

    // ── Exceptions ───────────────────────────────────────────────────

    pub async fn raise_exception(
        &self,
        workflow_id: Uuid,
        step_id: Option<Uuid>,
        kind: &str,
        severity: ExceptionSeverity,
        title: &str,
        description: Option<String>,
    ) -> Result<WorkflowException> {
        let instance = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))?;
        if instance.is_terminal() {
            return Err(Error::WorkflowAlreadyTerminal(workflow_id));
        }

        if let Some(step_id) = step_id {
            let step = self
                .store
                .get_step(step_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))?;
            if step.workflow_id != workflow_id {
                return Err(Error::Validation(format!(
                    "step {} does not belong to workflow {}",
                    step_id, workflow_id
                )));
            }
        }

        self.exceptions
            .raise(workflow_id, step_id, kind, severity, title, description)
            .await
    }

    /// Resolve an open exception and apply the step-level effect of the
    /// chosen resolution. Returns the resolved record and the affected step,
    /// if any.
    pub async fn resolve_exception(
        &self,
        exception_id: Uuid,
        resolution: ExceptionResolution,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(WorkflowException, Option<WorkflowStep>)> {
        let exception = self.exceptions.get(exception_id).await?;
        let workflow_id = exception.workflow_id;

        let lock = self.instance_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let resolved = self
            .exceptions
            .mark_resolved(exception_id, resolved_by, notes)
            .await?;

        let instance = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))?;
        if instance.is_terminal() {
            debug!(
                "Exception {} resolved on terminal workflow {}; no step effect",
                exception_id, workflow_id
            );
            return Ok((resolved, None));
        }

        let step = match resolved.step_id {
            None => None,
            Some(step_id) => {
                let step = self
                    .store
                    .get_step(step_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))?;

                if step.is_terminal() {
                    debug!(
                        "Exception {} resolved but step {} is already terminal",
                        exception_id, step_id
                    );
                    Some(step)
                } else {
                    match resolution {
                        ExceptionResolution::Retry => {
                            // Re-arm: back to pending, existing attempt record
                            // reset rather than duplicated.
                            self.store
                                .update_step_status(step_id, StepStatus::Pending)
                                .await?;
                            self.store.reset_attempt_for_step(step_id).await?;
                            info!("Step {} re-armed for retry by {}", step_id, resolved_by);
                        }
                        ExceptionResolution::Skip => {
                            self.store
                                .complete_step(
                                    step_id,
                                    StepStatus::Skipped,
                                    Utc::now(),
                                    Some(resolved_by),
                                )
                                .await?;
                            info!("Step {} skipped by {}", step_id, resolved_by);
                        }
                        ExceptionResolution::ManualComplete => {
                            self.store
                                .complete_step(
                                    step_id,
                                    StepStatus::Completed,
                                    Utc::now(),
                                    Some(resolved_by),
                                )
                                .await?;
                            metrics::STEPS_COMPLETED_TOTAL.inc();
                            info!("Step {} manually completed by {}", step_id, resolved_by);
                        }
                    }
                    self.store.get_step(step_id).await?
                }
            }
        };

        self.run_scheduler_pass(workflow_id).await?;

        Ok((resolved, step))
    }

    // ── Event loop ───────────────────────────────────────────────────

    /// Apply a terminal integration outcome. Idempotent: outcomes for steps
    /// no longer in progress, or for terminal instances, are ignored.
    async fn apply_outcome(&self, outcome: IntegrationOutcome) -> Result<()> {
        let (workflow_id, step_id) = match &outcome {
            IntegrationOutcome::Succeeded {
                workflow_id,
                step_id,
                ..
            }
            | IntegrationOutcome::Failed {
                workflow_id,
                step_id,
                ..
            } => (*workflow_id, *step_id),
        };

        let lock = self.instance_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let Some(instance) = self.store.get_workflow(workflow_id).await? else {
            warn!("Integration outcome for unknown workflow {}", workflow_id);
            return Ok(());
        };
        if instance.is_terminal() {
            debug!(
                "Ignoring late integration outcome for {} workflow {}",
                instance.status, workflow_id
            );
            return Ok(());
        }

        let Some(step) = self.store.get_step(step_id).await? else {
            warn!("Integration outcome for unknown step {}", step_id);
            return Ok(());
        };
        if step.status != StepStatus::InProgress {
            debug!(
                "Ignoring integration outcome for step {} in status {}",
                step_id, step.status
            );
            return Ok(());
        }

        match outcome {
            IntegrationOutcome::Succeeded { external_id, .. } => {
                self.store
                    .complete_step(step_id, StepStatus::Completed, Utc::now(), Some("system"))
                    .await?;
                metrics::STEPS_COMPLETED_TOTAL.inc();
                info!(
                    "Integration step {} completed (external id {})",
                    step_id, external_id
                );
            }
            IntegrationOutcome::Failed { error, .. } => {
                // The step parks in blocked until a human resolves the
                // exception; it never silently fails.
                self.store
                    .update_step_status(step_id, StepStatus::Blocked)
                    .await?;
                let kind = if error.is_transient() {
                    "integration_retries_exhausted"
                } else {
                    "integration_permanent_failure"
                };
                let error: Error = error.into();
                self.exceptions
                    .raise(
                        workflow_id,
                        Some(step_id),
                        kind,
                        ExceptionSeverity::High,
                        format!("Integration step '{}' requires attention", step.name),
                        Some(error.to_string()),
                    )
                    .await?;
            }
        }

        self.run_scheduler_pass(workflow_id).await
    }

    // ── Scheduler pass ───────────────────────────────────────────────

    /// Must run under the instance lock. Recomputes the ready set,
    /// dispatches newly-ready integration steps, re-derives current stage
    /// and progress, and completes the instance when nothing remains.
    async fn run_scheduler_pass(&self, workflow_id: Uuid) -> Result<()> {
        let instance = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))?;
        if instance.is_terminal() {
            return Ok(());
        }

        let steps = self.store.list_steps(workflow_id).await?;
        let ready = graph::ready_set(&steps);

        for step in steps.iter().filter(|s| ready.contains(&s.id)) {
            match step.step_type {
                StepType::Integration => {
                    let Some(config) = step.integration.clone() else {
                        // Template validation rejects this shape; an instance
                        // migrated from elsewhere could still carry it.
                        self.store
                            .update_step_status(step.id, StepStatus::Blocked)
                            .await?;
                        self.exceptions
                            .raise(
                                workflow_id,
                                Some(step.id),
                                "missing_integration_config",
                                ExceptionSeverity::High,
                                format!("Integration step '{}' has no config", step.name),
                                None,
                            )
                            .await?;
                        continue;
                    };

                    self.store.mark_step_started(step.id, Utc::now()).await?;
                    let job = IntegrationJob {
                        workflow_id,
                        step_id: step.id,
                        step_name: step.name.clone(),
                        employee_id: instance.employee_id,
                        config,
                        max_retries: step.max_retries.unwrap_or(self.default_max_retries),
                    };
                    let cancelled = self.cancel_receiver(workflow_id).await;
                    self.invoker.dispatch(job, cancelled);
                    debug!("Dispatched integration step {} ('{}')", step.id, step.name);
                }
                // Manual and document steps stay pending until an external
                // actor completes them through the API.
                StepType::Manual | StepType::Document => {}
            }
        }

        // Stage and progress come from a fresh snapshot; dispatch above may
        // have moved steps to in_progress.
        let steps = self.store.list_steps(workflow_id).await?;
        let stage = progress::current_stage(&steps).unwrap_or_else(|| instance.current_stage.clone());
        let pct = progress::percentage(&steps).max(instance.progress_percentage);
        if pct != instance.progress_percentage || stage != instance.current_stage {
            self.store
                .update_workflow_progress(workflow_id, pct, &stage)
                .await?;
        }

        if progress::all_steps_terminal(&steps) {
            let open = self.exceptions.open_count(workflow_id).await?;
            if open == 0 {
                self.store.complete_workflow(workflow_id, Utc::now()).await?;
                metrics::WORKFLOWS_COMPLETED_TOTAL.inc();
                info!("Workflow {} completed", workflow_id);
            } else {
                debug!(
                    "Workflow {} finished its steps but has {} open exceptions",
                    workflow_id, open
                );
            }
        }

        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn instance_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.write().await;
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cancel_receiver(&self, id: Uuid) -> watch::Receiver<bool> {
        let mut signals = self.cancel_signals.write().await;
        signals
            .entry(id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}
