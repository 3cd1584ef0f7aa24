use std::fmt;

use serde::{Deserialize, Serialize};

use crate::script::ScriptStep;

/// A point in some 2D coordinate space (image pixels or CSS pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The live viewport as seen by the page at the moment of execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
}

/// A snapshot of the page taken at the start of one iteration.
///
/// `image_width`/`image_height` are the pixel dimensions of the encoded
/// screenshot, which is the coordinate space the oracle answers in.
/// `viewport_width`/`viewport_height` are captured together with the image.
#[derive(Clone, PartialEq)]
pub struct Observation {
    pub image: Vec<u8>,
    pub image_width: u32,
    pub image_height: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub dom_summary: Option<String>,
}

impl Observation {
    /// Human-readable screen description sent alongside the image.
    pub fn describe_viewport(&self) -> String {
        format!(
            "Screenshot is {}x{} pixels (viewport {}x{} CSS pixels)",
            self.image_width, self.image_height, self.viewport_width, self.viewport_height
        )
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("image_bytes", &self.image.len())
            .field("image_width", &self.image_width)
            .field("image_height", &self.image_height)
            .field("viewport_width", &self.viewport_width)
            .field("viewport_height", &self.viewport_height)
            .field("dom_summary_chars", &self.dom_summary.as_ref().map(|s| s.len()))
            .finish()
    }
}

/// A single action proposed by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Coordinates win over the selector when both are present.
    Click {
        selector: Option<String>,
        coordinates: Option<Point>,
    },
    Navigate {
        url: String,
    },
    TypeText {
        text: String,
        selector: Option<String>,
        submit: bool,
    },
}

impl Action {
    pub fn click_at(x: f64, y: f64) -> Self {
        Action::Click {
            selector: None,
            coordinates: Some(Point::new(x, y)),
        }
    }

    pub fn click_selector(selector: impl Into<String>) -> Self {
        Action::Click {
            selector: Some(selector.into()),
            coordinates: None,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Action::Navigate { url: url.into() }
    }

    pub fn type_text(text: impl Into<String>, submit: bool) -> Self {
        Action::TypeText {
            text: text.into(),
            selector: None,
            submit,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click {
                coordinates: Some(p),
                ..
            } => write!(f, "click at ({:.0}, {:.0})", p.x, p.y),
            Action::Click {
                selector: Some(s), ..
            } => write!(f, "click on '{}'", s),
            Action::Click { .. } => write!(f, "click with no target"),
            Action::Navigate { url } => write!(f, "navigate to {}", url),
            Action::TypeText {
                text,
                selector,
                submit,
            } => {
                write!(f, "type \"{}\"", text)?;
                if let Some(s) = selector {
                    write!(f, " into '{}'", s)?;
                }
                if *submit {
                    write!(f, " and submit")?;
                }
                Ok(())
            }
        }
    }
}

/// Running context for one step, threaded through every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub step_number: u32,
    pub instruction_text: String,
    pub expected_result_text: String,
    pub target_description: String,
    pub prior_action_description: String,
    pub prior_action_succeeded: bool,
    pub consecutive_success_count: u32,
    /// Set once the success streak reaches its threshold.
    pub completion_hinted: bool,
    /// 0-based index of the iteration currently running.
    pub iteration: u32,
}

impl StepContext {
    pub fn for_step(step: &ScriptStep) -> Self {
        Self {
            step_number: step.step_number,
            instruction_text: step.instruction(),
            expected_result_text: step.expected_result.clone(),
            target_description: step.target.clone(),
            prior_action_description: String::new(),
            prior_action_succeeded: false,
            consecutive_success_count: 0,
            completion_hinted: false,
            iteration: 0,
        }
    }

    /// Fold one evaluated iteration into the context.
    pub fn record(&mut self, action: Option<&Action>, succeeded: bool, streak_threshold: u32) {
        self.prior_action_description = match action {
            Some(a) => a.to_string(),
            None => "no action".to_string(),
        };
        self.prior_action_succeeded = succeeded;
        if succeeded {
            self.consecutive_success_count += 1;
            if self.consecutive_success_count >= streak_threshold {
                self.completion_hinted = true;
            }
        } else {
            self.consecutive_success_count = 0;
            self.completion_hinted = false;
        }
    }

    /// Fold an iteration that errored before it could be evaluated.
    pub fn record_error(&mut self, description: impl Into<String>) {
        self.prior_action_description = description.into();
        self.prior_action_succeeded = false;
        self.consecutive_success_count = 0;
        self.completion_hinted = false;
    }

    /// One-line summary of the step handed to the oracle.
    pub fn summary(&self) -> String {
        let mut out = format!("Step {}: {}", self.step_number, self.instruction_text);
        if !self.target_description.is_empty() {
            out.push_str(&format!("\nTarget: {}", self.target_description));
        }
        if !self.expected_result_text.is_empty() {
            out.push_str(&format!("\nExpected result: {}", self.expected_result_text));
        }
        out.push_str(&format!("\nIteration: {}", self.iteration + 1));
        out
    }
}

/// Everything one iteration produced; consumed by the runner then dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationResult {
    pub action: Option<Action>,
    pub completion_message: Option<String>,
    pub execution_succeeded: Option<bool>,
    pub raw_page_content_sample: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_number: u32,
    pub status: StepStatus,
    pub message: String,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub completed_steps: Vec<u32>,
}

impl RunResult {
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}
