use std::fmt;

use serde::{Deserialize, Serialize};

use weave_core::error::{Result, WeaveError};

/// What a [`StepCondition`] checks on the referenced step's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionCheck {
    /// The step produced a non-null output.
    Succeeded,
    /// The named top-level field of the output is truthy.
    Truthy(String),
}

/// Guard on a workflow step, written `"<stepId>.<property>"`.
///
/// Evaluated against the outputs of steps that already ran. A reference to
/// a step with no recorded output (unknown, skipped, or not yet run) is
/// unsatisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepCondition {
    pub step_id: String,
    pub check: ConditionCheck,
}

impl StepCondition {
    pub fn succeeded(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            check: ConditionCheck::Succeeded,
        }
    }

    pub fn truthy(step_id: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            check: ConditionCheck::Truthy(property.into()),
        }
    }

    /// Parse `"<stepId>.<property>"`. The property `success` checks for a
    /// non-null output; anything after the first `.` is the field name.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let (step_id, property) = expr.split_once('.').ok_or_else(|| {
            WeaveError::InvalidWorkflow(format!(
                "condition '{}' must have the form <stepId>.<property>",
                expr
            ))
        })?;
        if step_id.is_empty() || property.is_empty() {
            return Err(WeaveError::InvalidWorkflow(format!(
                "condition '{}' must have the form <stepId>.<property>",
                expr
            )));
        }

        Ok(match property {
            "success" => Self::succeeded(step_id),
            field => Self::truthy(step_id, field),
        })
    }

    pub fn evaluate(&self, outputs: &serde_json::Map<String, serde_json::Value>) -> bool {
        let Some(output) = outputs.get(&self.step_id) else {
            return false;
        };
        match &self.check {
            ConditionCheck::Succeeded => !output.is_null(),
            ConditionCheck::Truthy(field) => output.get(field).is_some_and(is_truthy),
        }
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

impl fmt::Display for StepCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.check {
            ConditionCheck::Succeeded => write!(f, "{}.success", self.step_id),
            ConditionCheck::Truthy(field) => write!(f, "{}.{}", self.step_id, field),
        }
    }
}

impl TryFrom<String> for StepCondition {
    type Error = WeaveError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StepCondition> for String {
    fn from(condition: StepCondition) -> Self {
        condition.to_string()
    }
}
