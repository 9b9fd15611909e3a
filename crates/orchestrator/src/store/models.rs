use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

// Workflow instance lifecycle tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub employee_id: Uuid,
    pub template_name: String,
    pub status: InstanceStatus,

    /// Stage of the lowest-order step that is not yet completed or skipped.
    pub current_stage: String,
    /// Derived from step statuses; monotonic non-decreasing while active.
    pub progress_percentage: i32,

    // Timing
    pub started_at: DateTime<Utc>,
    pub expected_completion: Option<DateTime<Utc>>,
    pub actual_completion: Option<DateTime<Utc>>,

    pub cancellation_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, InstanceStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Completed,
    Cancelled,
}

// A single unit of work within a workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_order: i32,
    pub name: String,
    pub step_type: StepType,
    pub stage: String,
    pub status: StepStatus,

    /// Step ids that must be completed or skipped before this step is ready.
    pub depends_on: Vec<Uuid>,

    pub assigned_to: Option<String>,
    pub integration: Option<IntegrationConfig>,
    pub max_retries: Option<i32>,
    pub due_date: Option<DateTime<Utc>>,

    // Execution details
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub metadata: Option<JsonValue>,

    pub created_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// Completed and skipped are the only terminal step states.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Manual,
    Integration,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

/// Integration configuration, tagged by integration type. Unknown extension
/// fields are preserved in the `extra` bag of each variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "integration_type", rename_all = "lowercase")]
pub enum IntegrationConfig {
    Esignature(EsignatureConfig),
    Document(DocumentConfig),
}

impl IntegrationConfig {
    pub fn kind(&self) -> IntegrationKind {
        match self {
            IntegrationConfig::Esignature(_) => IntegrationKind::Esignature,
            IntegrationConfig::Document(_) => IntegrationKind::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsignatureConfig {
    /// Provider-side document template to send for signature.
    pub template_id: String,
    /// Subject line; may reference employee context, e.g. "Offer for {{ employee.full_name }}".
    pub subject: Option<String>,
    pub signer_role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentConfig {
    pub document_kind: String,
    /// Search/collection query; may reference employee context.
    pub query: Option<String>,
    pub source: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Esignature,
    Document,
}

// One execution record per integration step, tracking retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationAttempt {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub integration_type: IntegrationKind,
    pub external_id: Option<String>,
    pub status: AttemptStatus,

    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
    pub error_message: Option<String>,

    pub retry_count: i32,
    pub max_retries: i32,

    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Success,
    Failed,
}

// Human-actionable record raised when a step cannot proceed automatically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowException {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: Option<Uuid>,
    pub kind: String,
    pub severity: ExceptionSeverity,
    pub title: String,
    pub description: Option<String>,

    pub resolution_status: ResolutionStatus,
    pub assigned_to: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Open,
    Resolved,
}

/// How an open exception is resolved, and what happens to its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionResolution {
    /// Re-arm the step: back to pending, attempt record reset.
    Retry,
    /// Mark the step skipped; dependents treat it as satisfied.
    Skip,
    /// Complete the step on behalf of the resolver.
    ManualComplete,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $text)),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(Error::Internal(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(InstanceStatus {
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

string_enum!(StepType {
    Manual => "manual",
    Integration => "integration",
    Document => "document",
});

string_enum!(StepStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Blocked => "blocked",
    Skipped => "skipped",
});

string_enum!(IntegrationKind {
    Esignature => "esignature",
    Document => "document",
});

string_enum!(AttemptStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
});

string_enum!(ExceptionSeverity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

string_enum!(ResolutionStatus {
    Open => "open",
    Resolved => "resolved",
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integration_config_round_trips_with_extra_fields() {
        let value = json!({
            "integration_type": "esignature",
            "template_id": "offer-letter-v2",
            "subject": "Offer for {{ employee.full_name }}",
            "signer_role": "employee",
            "cc_manager": true,
        });

        let config: IntegrationConfig = serde_json::from_value(value.clone()).unwrap();
        match &config {
            IntegrationConfig::Esignature(cfg) => {
                assert_eq!(cfg.template_id, "offer-letter-v2");
                assert_eq!(cfg.extra.get("cc_manager"), Some(&json!(true)));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(config.kind(), IntegrationKind::Esignature);

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Blocked,
            StepStatus::Skipped,
        ] {
            assert_eq!(status.to_string().parse::<StepStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<StepStatus>().is_err());
    }
}
