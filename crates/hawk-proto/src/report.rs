use serde::{Deserialize, Serialize};

/// Outcome of a command-surface operation: what was done and what went wrong.
/// Operations never short-circuit on the first error; every attempted step lands here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub steps: Vec<String>,
    pub errors: Vec<String>,
}

impl StepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&mut self, msg: impl Into<String>) {
        self.steps.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: StepReport) {
        self.steps.extend(other.steps);
        self.errors.extend(other.errors);
    }

    pub fn has_step(&self, needle: &str) -> bool {
        self.steps.iter().any(|s| s.contains(needle))
    }
}
