//! Named workflow templates.
//!
//! Templates are validated at registration and immutable afterwards. Running
//! instances keep their own copy of every blueprint field, so replacing a
//! template never affects workflows already in flight.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::store::{IntegrationConfig, StepType};
use crate::workflow::graph;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Used to derive an instance's expected completion date.
    #[serde(default)]
    pub expected_duration_days: Option<i64>,
    pub steps: Vec<StepBlueprint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBlueprint {
    /// Unique within the template; also the instantiation order.
    pub order: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub stage: String,
    /// Orders of prerequisite blueprints.
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub integration: Option<IntegrationConfig>,
    #[serde(default)]
    pub default_assignee: Option<String>,
    #[serde(default)]
    pub due_in_days: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new template. Fails on duplicate names; use [`replace`]
    /// for the administrative swap.
    ///
    /// [`replace`]: TemplateRegistry::replace
    pub fn register(&self, template: WorkflowTemplate) -> Result<()> {
        validate_template(&template)?;

        let mut templates = self.templates.write().expect("template registry poisoned");
        if templates.contains_key(&template.name) {
            return Err(Error::Validation(format!(
                "template '{}' is already registered",
                template.name
            )));
        }
        info!("Registered workflow template '{}'", template.name);
        templates.insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    /// Administrative operation: swap a template under an existing name.
    /// Running instances are unaffected.
    pub fn replace(&self, template: WorkflowTemplate) -> Result<()> {
        validate_template(&template)?;

        let mut templates = self.templates.write().expect("template registry poisoned");
        info!("Replaced workflow template '{}'", template.name);
        templates.insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<WorkflowTemplate>> {
        self.templates
            .read()
            .expect("template registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<WorkflowTemplate>> {
        let mut templates: Vec<_> = self
            .templates
            .read()
            .expect("template registry poisoned")
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// Load every `*.yaml`/`*.yml` template file from a directory.
    /// Returns the number of templates registered.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let raw = std::fs::read_to_string(&path)?;
            let template: WorkflowTemplate = serde_yaml::from_str(&raw)?;
            info!("Loading template '{}' from {}", template.name, path.display());
            self.register(template)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_template(template: &WorkflowTemplate) -> Result<()> {
    if template.name.trim().is_empty() {
        return Err(Error::Validation("template name must not be empty".into()));
    }
    if template.steps.is_empty() {
        return Err(Error::Validation(format!(
            "template '{}' must have at least one step",
            template.name
        )));
    }

    let mut names = HashSet::new();
    for step in &template.steps {
        if step.name.trim().is_empty() {
            return Err(Error::Validation(format!(
                "template '{}' has a step with an empty name",
                template.name
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(Error::Validation(format!(
                "template '{}' has duplicate step name '{}'",
                template.name, step.name
            )));
        }
        match step.step_type {
            StepType::Integration if step.integration.is_none() => {
                return Err(Error::Validation(format!(
                    "integration step '{}' is missing its integration config",
                    step.name
                )));
            }
            StepType::Manual | StepType::Document if step.integration.is_some() => {
                return Err(Error::Validation(format!(
                    "step '{}' is not an integration step but carries integration config",
                    step.name
                )));
            }
            _ => {}
        }
    }

    graph::validate_blueprints(&template.steps)
}
