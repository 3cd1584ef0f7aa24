use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ReplayError, Result};

/// One planned step of a recorded script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStep {
    pub step_number: u32,
    /// Free-text description of what to do, e.g. "Click the login button".
    pub action: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub expected_result: String,
}

impl ScriptStep {
    /// The instruction handed to the oracle for this step.
    pub fn instruction(&self) -> String {
        let mut out = self.action.trim().to_string();
        if !self.target.is_empty() {
            out.push_str(&format!(" (target: {})", self.target));
        }
        if let Some(value) = self.value.as_deref().filter(|v| !v.is_empty()) {
            out.push_str(&format!(" with value \"{}\"", value));
        }
        if !self.url.is_empty() {
            out.push_str(&format!(" on {}", self.url));
        }
        out
    }
}

/// A generated automation script. Read-only input to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<ScriptStep>,
}

impl Script {
    pub fn new(title: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            title: title.into(),
            url: steps.first().map(|s| s.url.clone()).unwrap_or_default(),
            total_steps: steps.len() as u32,
            summary: String::new(),
            steps,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let script: Script = serde_json::from_reader(reader)?;
        script.validated()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let script: Script = serde_json::from_str(json)?;
        script.validated()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Check step ordering and fix up `total_steps`.
    pub fn validated(mut self) -> Result<Self> {
        if self.steps.is_empty() {
            return Err(ReplayError::Script("script has no steps".to_string()));
        }
        for pair in self.steps.windows(2) {
            if pair[1].step_number <= pair[0].step_number {
                return Err(ReplayError::Script(format!(
                    "step numbers must increase: {} follows {}",
                    pair[1].step_number, pair[0].step_number
                )));
            }
        }
        let actual = self.steps.len() as u32;
        if self.total_steps != actual {
            warn!(
                declared = self.total_steps,
                actual, "Script totalSteps does not match step list, correcting"
            );
            self.total_steps = actual;
        }
        Ok(self)
    }
}

#[cfg(test)]
#[path = "script_tests.rs"]
mod tests;
