use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};

use weave_core::error::{Result, WeaveError};

use super::condition::StepCondition;

/// A named DAG of agent steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(alias = "entryPoint")]
    pub entry_point: String,
}

/// One step of a workflow, bound to an agent by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub agent: String,
    /// Successor step ids. Accepts a single id or a list.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Informational. Ready steps always run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            next: Vec::new(),
            condition: None,
            parallel: None,
        }
    }

    /// Add a successor.
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_empty()
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            entry_point: entry_point.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Parse a definition from JSON or TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim_start().starts_with('{') {
            serde_json::from_str(text).map_err(|e| WeaveError::InvalidWorkflow(e.to_string()))
        } else {
            toml::from_str(text).map_err(|e| WeaveError::InvalidWorkflow(e.to_string()))
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps whose `next` includes `id`.
    pub fn predecessors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WorkflowStep> + 'a {
        self.steps
            .iter()
            .filter(move |s| s.next.iter().any(|n| n == id))
    }

    pub fn terminal_steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter().filter(|s| s.is_terminal())
    }

    /// Structural checks done at registration, before any execution.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WeaveError::InvalidWorkflow("name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(WeaveError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "workflow '{}' has a step with an empty id",
                    self.name
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "workflow '{}' has duplicate step id '{}'",
                    self.name, step.id
                )));
            }
            if step.agent.trim().is_empty() {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "step '{}' of workflow '{}' names no agent",
                    step.id, self.name
                )));
            }
        }

        if !ids.contains(self.entry_point.as_str()) {
            return Err(WeaveError::InvalidWorkflow(format!(
                "entry point '{}' of workflow '{}' is not a step",
                self.entry_point, self.name
            )));
        }

        for step in &self.steps {
            if let Some(missing) = step.next.iter().find(|n| !ids.contains(n.as_str())) {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "step '{}' of workflow '{}' points to unknown step '{}'",
                    step.id, self.name, missing
                )));
            }
        }
        Ok(())
    }
}
