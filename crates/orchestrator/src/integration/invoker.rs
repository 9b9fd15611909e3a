//! Asynchronous integration execution with bounded retry.
//!
//! The invoker owns a bounded worker pool. Work never runs under an
//! instance's serialization point: the engine dispatches a job, the invoker
//! drives the external call (with per-call timeout and exponential backoff
//! between transient failures), and the terminal outcome comes back to the
//! engine as a discrete event on the outcome channel.

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::integration::{IntegrationError, IntegrationRequest, ProviderRegistry};
use crate::metrics;
use crate::store::{
    AttemptStatus, IntegrationAttempt, IntegrationConfig, IntegrationKind, Store,
};
use crate::workflow::context::{render_field, EmployeeContext, EmployeeDirectory};
use crate::Result;

#[derive(Debug, Clone)]
pub struct InvokerSettings {
    /// Upper bound on concurrently executing integration calls.
    pub max_concurrency: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub default_max_retries: i32,
    pub esignature_timeout: Duration,
    pub document_timeout: Duration,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            default_max_retries: 3,
            esignature_timeout: Duration::from_secs(30),
            document_timeout: Duration::from_secs(20),
        }
    }
}

impl InvokerSettings {
    pub fn call_timeout(&self, kind: IntegrationKind) -> Duration {
        match kind {
            IntegrationKind::Esignature => self.esignature_timeout,
            IntegrationKind::Document => self.document_timeout,
        }
    }
}

/// One dispatched integration step.
#[derive(Debug, Clone)]
pub struct IntegrationJob {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub employee_id: Uuid,
    pub config: IntegrationConfig,
    pub max_retries: i32,
}

/// Terminal outcome reported back to the scheduler.
#[derive(Debug)]
pub enum IntegrationOutcome {
    Succeeded {
        workflow_id: Uuid,
        step_id: Uuid,
        external_id: String,
    },
    Failed {
        workflow_id: Uuid,
        step_id: Uuid,
        error: IntegrationError,
    },
}

pub struct IntegrationInvoker {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    directory: Arc<dyn EmployeeDirectory>,
    outcome_tx: mpsc::Sender<IntegrationOutcome>,
    permits: Arc<Semaphore>,
    settings: InvokerSettings,
}

impl IntegrationInvoker {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        directory: Arc<dyn EmployeeDirectory>,
        outcome_tx: mpsc::Sender<IntegrationOutcome>,
        settings: InvokerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrency));
        Self {
            store,
            providers,
            directory,
            outcome_tx,
            permits,
            settings,
        }
    }

    /// Hand a job to the worker pool. Returns immediately; the terminal
    /// outcome arrives on the outcome channel unless the workflow is
    /// cancelled first.
    pub fn dispatch(self: &Arc<Self>, job: IntegrationJob, cancelled: watch::Receiver<bool>) {
        let invoker = self.clone();
        tokio::spawn(async move {
            let _permit = match invoker.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let mut cancelled = cancelled;
            match invoker.run_job(&job, &mut cancelled).await {
                Some(outcome) => {
                    if invoker.outcome_tx.send(outcome).await.is_err() {
                        warn!("Outcome channel closed; dropping result for step {}", job.step_id);
                    }
                }
                None => debug!(
                    "Integration job for step {} abandoned after cancellation",
                    job.step_id
                ),
            }
        });
    }

    /// Drive one job to a terminal outcome. Returns `None` when the workflow
    /// was cancelled mid-flight; no outcome event is emitted in that case.
    async fn run_job(
        &self,
        job: &IntegrationJob,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Option<IntegrationOutcome> {
        let kind = job.config.kind();
        let mut attempt = self.initial_attempt(job, kind).await;

        let request = match self.build_request(job, kind).await {
            Ok(request) => request,
            Err(e) => {
                let error = IntegrationError::Permanent(e.to_string());
                return Some(self.record_failure(&mut attempt, job, error).await);
            }
        };
        attempt.request_payload = Some(request.payload.clone());

        let provider = match self.providers.get(kind) {
            Some(provider) => provider,
            None => {
                let error = IntegrationError::Permanent(format!(
                    "no provider registered for integration type '{}'",
                    kind
                ));
                return Some(self.record_failure(&mut attempt, job, error).await);
            }
        };

        let call_timeout = self.settings.call_timeout(kind);

        loop {
            if *cancelled.borrow() {
                return None;
            }

            attempt.last_attempt_at = Some(Utc::now());
            self.persist_attempt(&attempt).await;

            let result = timeout(call_timeout, provider.send(&request)).await;

            // The workflow may have been cancelled while the call was in
            // flight; a late result must not mutate anything.
            if *cancelled.borrow() {
                return None;
            }

            let error = match result {
                Ok(Ok(response)) => {
                    attempt.status = AttemptStatus::Success;
                    attempt.external_id = Some(response.external_id.clone());
                    attempt.response_payload = Some(response.payload);
                    attempt.error_message = None;
                    self.persist_attempt(&attempt).await;

                    debug!(
                        "Integration step {} succeeded (external id {})",
                        job.step_id, response.external_id
                    );
                    return Some(IntegrationOutcome::Succeeded {
                        workflow_id: job.workflow_id,
                        step_id: job.step_id,
                        external_id: response.external_id,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => IntegrationError::Transient(format!(
                    "call timed out after {:?}",
                    call_timeout
                )),
            };

            match error {
                IntegrationError::Transient(detail)
                    if attempt.retry_count < attempt.max_retries =>
                {
                    attempt.retry_count += 1;
                    attempt.error_message = Some(detail.clone());
                    self.persist_attempt(&attempt).await;
                    metrics::INTEGRATION_RETRIES_TOTAL.inc();

                    let delay = self.backoff_delay(attempt.retry_count);
                    warn!(
                        "Integration step {} failed transiently (attempt {}/{}), retrying in {:?}: {}",
                        job.step_id, attempt.retry_count, attempt.max_retries, delay, detail
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = cancelled.changed() => {
                            if changed.is_err() || *cancelled.borrow() {
                                return None;
                            }
                        }
                    }
                }
                IntegrationError::Transient(detail) => {
                    let error = IntegrationError::Transient(format!(
                        "retry budget exhausted after {} retries: {}",
                        attempt.retry_count, detail
                    ));
                    return Some(self.record_failure(&mut attempt, job, error).await);
                }
                error @ IntegrationError::Permanent(_) => {
                    return Some(self.record_failure(&mut attempt, job, error).await);
                }
            }
        }
    }

    /// Best-effort void of an attempt's external call, used on cancellation.
    pub async fn void_attempt(&self, attempt: &IntegrationAttempt, reason: &str) {
        let Some(external_id) = attempt.external_id.as_deref() else {
            return;
        };
        let Some(provider) = self.providers.get(attempt.integration_type) else {
            return;
        };
        if let Err(e) = provider.void(external_id, reason).await {
            warn!(
                "Failed to void external call {} for step {}: {}",
                external_id, attempt.step_id, e
            );
        }
    }

    /// One attempt record per step: re-dispatch reuses the existing row.
    async fn initial_attempt(&self, job: &IntegrationJob, kind: IntegrationKind) -> IntegrationAttempt {
        let existing = match self.store.get_attempt_for_step(job.step_id).await {
            Ok(existing) => existing,
            Err(e) => {
                error!("Failed to load attempt for step {}: {}", job.step_id, e);
                None
            }
        };

        let (id, created_at) = existing
            .map(|a| (a.id, a.created_at))
            .unwrap_or_else(|| (Uuid::new_v4(), Utc::now()));

        IntegrationAttempt {
            id,
            workflow_id: job.workflow_id,
            step_id: job.step_id,
            integration_type: kind,
            external_id: None,
            status: AttemptStatus::Pending,
            request_payload: None,
            response_payload: None,
            error_message: None,
            retry_count: 0,
            max_retries: job.max_retries,
            last_attempt_at: None,
            created_at,
        }
    }

    async fn build_request(
        &self,
        job: &IntegrationJob,
        kind: IntegrationKind,
    ) -> Result<IntegrationRequest> {
        let employee = self.directory.employee_context(job.employee_id).await?;
        let payload = build_payload(&job.config, &employee)?;

        Ok(IntegrationRequest {
            workflow_id: job.workflow_id,
            step_id: job.step_id,
            integration_type: kind,
            payload,
        })
    }

    async fn record_failure(
        &self,
        attempt: &mut IntegrationAttempt,
        job: &IntegrationJob,
        error: IntegrationError,
    ) -> IntegrationOutcome {
        error!("Integration step {} failed: {}", job.step_id, error);

        attempt.status = AttemptStatus::Failed;
        attempt.error_message = Some(error.to_string());
        attempt.last_attempt_at = Some(Utc::now());
        self.persist_attempt(attempt).await;

        IntegrationOutcome::Failed {
            workflow_id: job.workflow_id,
            step_id: job.step_id,
            error,
        }
    }

    async fn persist_attempt(&self, attempt: &IntegrationAttempt) {
        if let Err(e) = self.store.upsert_attempt(attempt).await {
            error!("Failed to persist attempt for step {}: {}", attempt.step_id, e);
        }
    }

    /// base × 2^retry_count, capped, plus up to one base delay of jitter.
    fn backoff_delay(&self, retry_count: i32) -> Duration {
        let factor = 2u32.checked_pow(retry_count as u32).unwrap_or(u32::MAX);
        let exp = self
            .settings
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.settings.max_delay);
        let capped = exp.min(self.settings.max_delay);

        let jitter_ms = self.settings.base_delay.as_millis().max(1) as u64;
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

fn build_payload(config: &IntegrationConfig, employee: &EmployeeContext) -> Result<JsonValue> {
    let payload = match config {
        IntegrationConfig::Esignature(cfg) => {
            let mut payload = Map::new();
            payload.insert(
                "template_id".to_string(),
                json!(render_field(&cfg.template_id, employee)?),
            );
            if let Some(subject) = &cfg.subject {
                payload.insert("subject".to_string(), json!(render_field(subject, employee)?));
            }
            if let Some(role) = &cfg.signer_role {
                payload.insert("signer_role".to_string(), json!(role));
            }
            payload.insert(
                "signer".to_string(),
                json!({ "name": employee.full_name, "email": employee.email }),
            );
            payload.insert("employee_id".to_string(), json!(employee.employee_id));
            payload.extend(cfg.extra.clone());
            payload
        }
        IntegrationConfig::Document(cfg) => {
            let mut payload = Map::new();
            payload.insert("document_kind".to_string(), json!(cfg.document_kind));
            if let Some(query) = &cfg.query {
                payload.insert("query".to_string(), json!(render_field(query, employee)?));
            }
            if let Some(source) = &cfg.source {
                payload.insert("source".to_string(), json!(source));
            }
            payload.insert("employee_id".to_string(), json!(employee.employee_id));
            payload.extend(cfg.extra.clone());
            payload
        }
    };

    Ok(JsonValue::Object(payload))
}
