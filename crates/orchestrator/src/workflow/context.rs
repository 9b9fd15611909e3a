//! Employee context used to build integration requests.
//!
//! The HR application owns employee records; the engine only needs a
//! read-only lookup to fill integration payloads.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::RwLock;
use tera::Tera;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeContext {
    pub employee_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub department: Option<String>,
    pub manager_email: Option<String>,
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}

/// Read-only lookup supplying the fields needed to build integration
/// requests. Implementations live in the surrounding HR application.
#[async_trait]
pub trait EmployeeDirectory: Send + Sync {
    async fn employee_context(&self, employee_id: Uuid) -> Result<EmployeeContext>;
}

/// Directory backed by a map; used in tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryDirectory {
    employees: RwLock<HashMap<Uuid, EmployeeContext>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, employee: EmployeeContext) {
        self.employees
            .write()
            .expect("employee directory poisoned")
            .insert(employee.employee_id, employee);
    }
}

#[async_trait]
impl EmployeeDirectory for InMemoryDirectory {
    async fn employee_context(&self, employee_id: Uuid) -> Result<EmployeeContext> {
        self.employees
            .read()
            .expect("employee directory poisoned")
            .get(&employee_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("employee {}", employee_id)))
    }
}

/// Render a templated config field against the employee context, e.g.
/// "Offer for {{ employee.full_name }}".
pub fn render_field(template: &str, employee: &EmployeeContext) -> Result<String> {
    // Fast path: nothing to substitute.
    if !template.contains("{{") {
        return Ok(template.to_string());
    }

    let mut context = tera::Context::new();
    context.insert("employee", employee);

    Tera::one_off(template, &context, false)
        .map_err(|e| Error::Render(format!("failed to render '{}': {}", template, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn employee() -> EmployeeContext {
        EmployeeContext {
            employee_id: Uuid::new_v4(),
            full_name: "Dana Whitfield".to_string(),
            email: "dana@example.com".to_string(),
            department: Some("Engineering".to_string()),
            manager_email: None,
            start_date: None,
            extra: json!({"office": "Berlin"}).as_object().unwrap().clone(),
        }
    }

    #[tokio::test]
    async fn in_memory_directory_lookup() {
        let directory = InMemoryDirectory::new();
        let context = employee();
        let id = context.employee_id;
        directory.insert(context);

        let found = directory.employee_context(id).await.unwrap();
        assert_eq!(found.full_name, "Dana Whitfield");

        let missing = directory.employee_context(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn render_field_substitutes_employee_fields() {
        let rendered =
            render_field("Offer for {{ employee.full_name }}", &employee()).unwrap();
        assert_eq!(rendered, "Offer for Dana Whitfield");
    }

    #[test]
    fn render_field_passes_plain_strings_through() {
        let rendered = render_field("static-subject", &employee()).unwrap();
        assert_eq!(rendered, "static-subject");
    }

    #[test]
    fn render_field_reports_bad_templates() {
        let result = render_field("{{ employee.unknown.deep }}", &employee());
        assert!(matches!(result, Err(Error::Render(_))));
    }
}
