use async_trait::async_trait;
use serde_json::{json, Map};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use onboard_orchestrator::{
    integration::{
        IntegrationError, IntegrationProvider, IntegrationRequest, InvokerSettings,
        ProviderRegistry, SendResponse,
    },
    registry::{StepBlueprint, TemplateRegistry, WorkflowTemplate},
    store::{
        create_store, AttemptStatus, DatabaseConfig, DatabaseType, EsignatureConfig,
        ExceptionResolution, ExceptionSeverity, InstanceStatus, IntegrationConfig,
        IntegrationKind, ResolutionStatus, StepStatus, StepType, Store,
    },
    workflow::{graph, EmployeeContext, InMemoryDirectory, WorkflowEngine},
    Error,
};

struct ScriptedProvider {
    script: Mutex<VecDeque<Result<SendResponse, IntegrationError>>>,
    voided: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<SendResponse, IntegrationError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            voided: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, outcome: Result<SendResponse, IntegrationError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    fn success(external_id: &str) -> Result<SendResponse, IntegrationError> {
        Ok(SendResponse {
            external_id: external_id.to_string(),
            status: "accepted".to_string(),
            payload: json!({ "external_id": external_id }),
        })
    }
}

#[async_trait]
impl IntegrationProvider for ScriptedProvider {
    async fn send(&self, _request: &IntegrationRequest) -> Result<SendResponse, IntegrationError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(IntegrationError::Transient("scripted outage".to_string())))
    }

    async fn get_status(&self, _external_id: &str) -> Result<String, IntegrationError> {
        Ok("completed".to_string())
    }

    async fn void(&self, external_id: &str, _reason: &str) -> Result<(), IntegrationError> {
        self.voided.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}

/// Provider that parks in `send` until released, to model an in-flight call.
struct BlockingProvider {
    started: Notify,
    release: Notify,
}

impl BlockingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl IntegrationProvider for BlockingProvider {
    async fn send(&self, _request: &IntegrationRequest) -> Result<SendResponse, IntegrationError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(SendResponse {
            external_id: "late-123".to_string(),
            status: "accepted".to_string(),
            payload: json!({}),
        })
    }

    async fn get_status(&self, _external_id: &str) -> Result<String, IntegrationError> {
        Ok("completed".to_string())
    }

    async fn void(&self, _external_id: &str, _reason: &str) -> Result<(), IntegrationError> {
        Ok(())
    }
}

struct Harness {
    engine: Arc<WorkflowEngine>,
    store: Arc<dyn Store>,
    registry: Arc<TemplateRegistry>,
    directory: Arc<InMemoryDirectory>,
}

async fn harness(provider: Arc<dyn IntegrationProvider>) -> Harness {
    let database = DatabaseConfig {
        db_type: DatabaseType::Sqlite,
        sqlite_path: Some(PathBuf::from(":memory:")),
        connection_string: None,
        // A single connection keeps every query on the same in-memory database.
        max_connections: 1,
    };
    let store = create_store(&database).await.expect("create store");
    store.init().await.expect("init store");

    let registry = Arc::new(TemplateRegistry::new());
    let directory = Arc::new(InMemoryDirectory::new());

    let mut providers = ProviderRegistry::new();
    providers.register(IntegrationKind::Esignature, provider.clone());
    providers.register(IntegrationKind::Document, provider);

    let settings = InvokerSettings {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..Default::default()
    };

    let engine = WorkflowEngine::new(
        store.clone(),
        registry.clone(),
        directory.clone(),
        providers,
        settings,
    );
    engine.start();

    Harness {
        engine,
        store,
        registry,
        directory,
    }
}

fn manual_step(order: u32, name: &str, stage: &str, deps: &[u32]) -> StepBlueprint {
    StepBlueprint {
        order,
        name: name.to_string(),
        step_type: StepType::Manual,
        stage: stage.to_string(),
        depends_on: deps.to_vec(),
        integration: None,
        default_assignee: None,
        due_in_days: None,
        max_retries: None,
    }
}

fn esignature_step(order: u32, name: &str, deps: &[u32], max_retries: Option<i32>) -> StepBlueprint {
    StepBlueprint {
        order,
        name: name.to_string(),
        step_type: StepType::Integration,
        stage: "pre_boarding".to_string(),
        depends_on: deps.to_vec(),
        integration: Some(IntegrationConfig::Esignature(EsignatureConfig {
            template_id: "offer-letter".to_string(),
            subject: Some("Offer for {{ employee.full_name }}".to_string()),
            signer_role: None,
            extra: Map::new(),
        })),
        default_assignee: None,
        due_in_days: None,
        max_retries,
    }
}

fn template(name: &str, steps: Vec<StepBlueprint>) -> WorkflowTemplate {
    WorkflowTemplate {
        name: name.to_string(),
        description: None,
        expected_duration_days: Some(14),
        steps,
    }
}

fn employee(directory: &InMemoryDirectory) -> Uuid {
    let id = Uuid::new_v4();
    directory.insert(EmployeeContext {
        employee_id: id,
        full_name: "Priya Raman".to_string(),
        email: "priya@example.com".to_string(),
        department: Some("Engineering".to_string()),
        manager_email: None,
        start_date: None,
        extra: Map::new(),
    });
    id
}

async fn wait_for_step_status(store: &Arc<dyn Store>, step_id: Uuid, status: StepStatus) {
    for _ in 0..500 {
        let current = store.get_step(step_id).await.unwrap().map(|s| s.status);
        if current == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("step {step_id} did not reach {status} within timeout");
}

async fn wait_for_instance_status(store: &Arc<dyn Store>, id: Uuid, status: InstanceStatus) {
    for _ in 0..500 {
        let current = store.get_workflow(id).await.unwrap().map(|w| w.status);
        if current == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {id} did not reach {status} within timeout");
}

#[tokio::test]
async fn ready_set_and_progress_walk_the_dependency_chain() {
    let h = harness(ScriptedProvider::new(vec![])).await;
    h.registry
        .register(template(
            "chain",
            vec![
                manual_step(1, "a", "pre_boarding", &[]),
                manual_step(2, "b", "pre_boarding", &[1]),
                manual_step(3, "c", "first_day", &[1, 2]),
            ],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h.engine.create_workflow(employee_id, "chain").await.unwrap();
    assert_eq!(detail.instance.progress_percentage, 0);
    assert_eq!(detail.instance.current_stage, "pre_boarding");

    let ready = graph::ready_set(&detail.steps);
    assert_eq!(ready.len(), 1);
    let step_a = detail.steps.iter().find(|s| s.name == "a").unwrap();
    let step_b = detail.steps.iter().find(|s| s.name == "b").unwrap();
    let step_c = detail.steps.iter().find(|s| s.name == "c").unwrap();
    assert_eq!(ready[0], step_a.id);

    // Dependencies unsatisfied: completing b or c up front is rejected.
    assert!(matches!(
        h.engine.complete_step(step_c.id, "hr").await,
        Err(Error::StepNotReady(_))
    ));

    h.engine.complete_step(step_a.id, "hr").await.unwrap();
    let detail = h.engine.get_workflow(detail.instance.id).await.unwrap();
    assert_eq!(graph::ready_set(&detail.steps), vec![step_b.id]);
    assert_eq!(detail.instance.progress_percentage, 33);

    h.engine.complete_step(step_b.id, "hr").await.unwrap();
    let detail = h.engine.get_workflow(detail.instance.id).await.unwrap();
    assert_eq!(graph::ready_set(&detail.steps), vec![step_c.id]);
    assert_eq!(detail.instance.progress_percentage, 66);
    assert_eq!(detail.instance.current_stage, "first_day");

    h.engine.complete_step(step_c.id, "hr").await.unwrap();
    let detail = h.engine.get_workflow(detail.instance.id).await.unwrap();
    assert_eq!(detail.instance.progress_percentage, 100);
    assert_eq!(detail.instance.status, InstanceStatus::Completed);
    assert!(detail.instance.actual_completion.is_some());
}

#[tokio::test]
async fn completing_a_completed_step_is_a_rejected_no_op() {
    let h = harness(ScriptedProvider::new(vec![])).await;
    h.registry
        .register(template(
            "pair",
            vec![
                manual_step(1, "a", "pre_boarding", &[]),
                manual_step(2, "b", "pre_boarding", &[1]),
            ],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h.engine.create_workflow(employee_id, "pair").await.unwrap();
    let step_a = detail.steps.iter().find(|s| s.name == "a").unwrap();

    h.engine.complete_step(step_a.id, "hr").await.unwrap();
    let before = h.engine.get_workflow(detail.instance.id).await.unwrap();

    assert!(matches!(
        h.engine.complete_step(step_a.id, "hr").await,
        Err(Error::AlreadyTerminal(_))
    ));

    // Idempotence: the rejected completion changed nothing.
    let after = h.engine.get_workflow(detail.instance.id).await.unwrap();
    assert_eq!(
        before.instance.progress_percentage,
        after.instance.progress_percentage
    );
    assert_eq!(before.instance.current_stage, after.instance.current_stage);
    let completed_at = |d: &onboard_orchestrator::workflow::WorkflowDetail| {
        d.steps
            .iter()
            .map(|s| (s.id, s.status, s.completed_at))
            .collect::<Vec<_>>()
    };
    assert_eq!(completed_at(&before), completed_at(&after));
}

#[tokio::test]
async fn unknown_template_is_rejected() {
    let h = harness(ScriptedProvider::new(vec![])).await;
    let result = h.engine.create_workflow(Uuid::new_v4(), "missing").await;
    assert!(matches!(result, Err(Error::TemplateNotFound(_))));
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let provider = ScriptedProvider::new(vec![
        Err(IntegrationError::Transient("connection reset".into())),
        Err(IntegrationError::Transient("gateway timeout".into())),
        ScriptedProvider::success("env-42"),
    ]);
    let h = harness(provider).await;
    h.registry
        .register(template(
            "sign-only",
            vec![esignature_step(1, "sign-offer", &[], Some(3))],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h
        .engine
        .create_workflow(employee_id, "sign-only")
        .await
        .unwrap();
    let workflow_id = detail.instance.id;
    let step_id = detail.steps[0].id;

    wait_for_step_status(&h.store, step_id, StepStatus::Completed).await;

    let attempt = h
        .store
        .get_attempt_for_step(step_id)
        .await
        .unwrap()
        .expect("attempt record");
    assert_eq!(attempt.status, AttemptStatus::Success);
    assert_eq!(attempt.retry_count, 2);
    assert_eq!(attempt.external_id.as_deref(), Some("env-42"));

    wait_for_instance_status(&h.store, workflow_id, InstanceStatus::Completed).await;
}

#[tokio::test]
async fn exhausted_retries_block_the_step_and_raise_one_exception() {
    // Script is empty: every call fails transiently.
    let h = harness(ScriptedProvider::new(vec![])).await;
    h.registry
        .register(template(
            "sign-then-badge",
            vec![
                esignature_step(1, "sign-offer", &[], Some(2)),
                manual_step(2, "issue-badge", "first_day", &[1]),
            ],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h
        .engine
        .create_workflow(employee_id, "sign-then-badge")
        .await
        .unwrap();
    let workflow_id = detail.instance.id;
    let step_id = detail.steps[0].id;
    let progress_before = detail.instance.progress_percentage;

    wait_for_step_status(&h.store, step_id, StepStatus::Blocked).await;

    let attempt = h
        .store
        .get_attempt_for_step(step_id)
        .await
        .unwrap()
        .expect("attempt record");
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.retry_count, 2);

    let exceptions = h.engine.workflow_exceptions(workflow_id).await.unwrap();
    let open: Vec<_> = exceptions
        .iter()
        .filter(|e| e.resolution_status == ResolutionStatus::Open)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].step_id, Some(step_id));

    let instance = h.store.get_workflow(workflow_id).await.unwrap().unwrap();
    assert_eq!(instance.progress_percentage, progress_before);
    assert_eq!(instance.status, InstanceStatus::Active);
}

#[tokio::test]
async fn sibling_completion_order_converges() {
    let steps = vec![
        manual_step(1, "laptop", "pre_boarding", &[]),
        manual_step(2, "accounts", "pre_boarding", &[]),
        manual_step(3, "orientation", "first_day", &[1, 2]),
    ];
    let h = harness(ScriptedProvider::new(vec![])).await;
    h.registry.register(template("siblings", steps)).unwrap();
    let employee_id = employee(&h.directory);

    let mut outcomes = Vec::new();
    for order in [[1, 2], [2, 1]] {
        let detail = h
            .engine
            .create_workflow(employee_id, "siblings")
            .await
            .unwrap();
        for target in order {
            let step = detail
                .steps
                .iter()
                .find(|s| s.step_order == target)
                .unwrap();
            h.engine.complete_step(step.id, "hr").await.unwrap();
        }
        let detail = h.engine.get_workflow(detail.instance.id).await.unwrap();
        let ready_names: Vec<_> = {
            let ready = graph::ready_set(&detail.steps);
            detail
                .steps
                .iter()
                .filter(|s| ready.contains(&s.id))
                .map(|s| s.name.clone())
                .collect()
        };
        outcomes.push((
            ready_names,
            detail.instance.progress_percentage,
            detail.instance.current_stage.clone(),
        ));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, vec!["orientation".to_string()]);
    assert_eq!(outcomes[0].1, 66);
    assert_eq!(outcomes[0].2, "first_day");
}

#[tokio::test]
async fn retry_resolution_rearms_the_step_without_duplicating_attempts() {
    let provider = ScriptedProvider::new(vec![]);
    let h = harness(provider.clone()).await;
    h.registry
        .register(template(
            "sign-only",
            vec![esignature_step(1, "sign-offer", &[], Some(1))],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h
        .engine
        .create_workflow(employee_id, "sign-only")
        .await
        .unwrap();
    let workflow_id = detail.instance.id;
    let step_id = detail.steps[0].id;

    wait_for_step_status(&h.store, step_id, StepStatus::Blocked).await;

    let exception = h
        .engine
        .workflow_exceptions(workflow_id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.resolution_status == ResolutionStatus::Open)
        .expect("open exception");

    // The outage is over; the next dispatch succeeds.
    provider.push(ScriptedProvider::success("env-99"));

    let (resolved, _step) = h
        .engine
        .resolve_exception(exception.id, ExceptionResolution::Retry, "ops", None)
        .await
        .unwrap();
    assert_eq!(resolved.resolution_status, ResolutionStatus::Resolved);

    wait_for_step_status(&h.store, step_id, StepStatus::Completed).await;

    // Still exactly one attempt record for the step.
    let attempts = h.store.list_attempts(workflow_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Success);
    assert_eq!(attempts[0].external_id.as_deref(), Some("env-99"));

    // Resolving again is rejected.
    assert!(matches!(
        h.engine
            .resolve_exception(exception.id, ExceptionResolution::Retry, "ops", None)
            .await,
        Err(Error::ExceptionAlreadyResolved(_))
    ));

    wait_for_instance_status(&h.store, workflow_id, InstanceStatus::Completed).await;
}

#[tokio::test]
async fn skip_resolution_unblocks_dependents() {
    let h = harness(ScriptedProvider::new(vec![])).await;
    h.registry
        .register(template(
            "sign-then-badge",
            vec![
                esignature_step(1, "sign-offer", &[], Some(1)),
                manual_step(2, "issue-badge", "first_day", &[1]),
            ],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h
        .engine
        .create_workflow(employee_id, "sign-then-badge")
        .await
        .unwrap();
    let workflow_id = detail.instance.id;
    let sign_id = detail.steps[0].id;
    let badge_id = detail.steps[1].id;

    wait_for_step_status(&h.store, sign_id, StepStatus::Blocked).await;

    let exception = h
        .engine
        .workflow_exceptions(workflow_id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.resolution_status == ResolutionStatus::Open)
        .expect("open exception");

    h.engine
        .resolve_exception(
            exception.id,
            ExceptionResolution::Skip,
            "ops",
            Some("signed on paper instead"),
        )
        .await
        .unwrap();

    let step = h.store.get_step(sign_id).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Skipped);

    // Skipped dependencies satisfy the dependent step.
    let steps = h.store.list_steps(workflow_id).await.unwrap();
    assert_eq!(graph::ready_set(&steps), vec![badge_id]);

    h.engine.complete_step(badge_id, "hr").await.unwrap();
    let instance = h.store.get_workflow(workflow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.progress_percentage, 100);
}

#[tokio::test]
async fn cancellation_ignores_late_integration_results() {
    let provider = BlockingProvider::new();
    let h = harness(provider.clone()).await;
    h.registry
        .register(template(
            "sign-only",
            vec![esignature_step(1, "sign-offer", &[], Some(3))],
        ))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h
        .engine
        .create_workflow(employee_id, "sign-only")
        .await
        .unwrap();
    let workflow_id = detail.instance.id;
    let step_id = detail.steps[0].id;

    // The call is in flight.
    provider.started.notified().await;

    let cancelled = h
        .engine
        .cancel_workflow(workflow_id, "candidate withdrew")
        .await
        .unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some("candidate withdrew")
    );

    // Now let the external call come back; the late result must be ignored.
    provider.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let step = h.store.get_step(step_id).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::InProgress);
    assert!(step.completed_at.is_none());

    let attempt = h
        .store
        .get_attempt_for_step(step_id)
        .await
        .unwrap()
        .expect("attempt record");
    assert_eq!(attempt.status, AttemptStatus::Pending);
    assert!(attempt.external_id.is_none());

    let instance = h.store.get_workflow(workflow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);

    // Further mutation of a terminal instance is rejected.
    assert!(matches!(
        h.engine.cancel_workflow(workflow_id, "again").await,
        Err(Error::WorkflowAlreadyTerminal(_))
    ));
    assert!(matches!(
        h.engine.complete_step(step_id, "hr").await,
        Err(Error::WorkflowAlreadyTerminal(_))
    ));
}

#[tokio::test]
async fn open_exceptions_gate_instance_completion() {
    let h = harness(ScriptedProvider::new(vec![])).await;
    h.registry
        .register(template("solo", vec![manual_step(1, "a", "pre_boarding", &[])]))
        .unwrap();
    let employee_id = employee(&h.directory);

    let detail = h.engine.create_workflow(employee_id, "solo").await.unwrap();
    let workflow_id = detail.instance.id;
    let step_id = detail.steps[0].id;

    h.engine
        .raise_exception(
            workflow_id,
            None,
            "missing_paperwork",
            ExceptionSeverity::Medium,
            "Visa paperwork incomplete",
            None,
        )
        .await
        .unwrap();

    h.engine.complete_step(step_id, "hr").await.unwrap();

    // All steps are terminal, but the open exception holds completion back.
    let instance = h.store.get_workflow(workflow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.progress_percentage, 100);

    let exception = h.engine.workflow_exceptions(workflow_id).await.unwrap()[0].clone();
    h.engine
        .resolve_exception(exception.id, ExceptionResolution::Skip, "hr", None)
        .await
        .unwrap();

    let instance = h.store.get_workflow(workflow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}
