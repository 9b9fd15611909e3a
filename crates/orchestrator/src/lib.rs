pub mod config;
pub mod exceptions;
pub mod integration;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod store;
pub mod workflow;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("cyclic dependency between steps: {}", .steps.join(", "))]
    CyclicDependency { steps: Vec<String> },
    #[error("step {0} is not ready: unsatisfied dependencies")]
    StepNotReady(Uuid),
    #[error("step {0} is already terminal")]
    AlreadyTerminal(Uuid),
    #[error("workflow {0} is already terminal")]
    WorkflowAlreadyTerminal(Uuid),
    #[error("exception {0} is already resolved")]
    ExceptionAlreadyResolved(Uuid),
    #[error("integration error (permanent): {0}")]
    IntegrationPermanent(String),
    #[error("integration error (transient): {0}")]
    IntegrationTransient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("template rendering error: {0}")]
    Render(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
