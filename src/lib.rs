//! Replays recorded browser scripts by asking a vision oracle what to do
//! next and acting on a live page until each step's goal is met.

pub mod chrome;
pub mod config;
pub mod error;
pub mod executor;
pub mod heuristic;
pub mod oracle;
pub mod page;
pub mod runner;
pub mod script;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use config::{OracleConfig, ReplayConfig};
pub use error::{ReplayError, Result};
pub use executor::{ActionExecutor, ExecutionOutcome, scale_point};
pub use heuristic::{effective_success, might_have_succeeded};
pub use oracle::{HttpOracle, Oracle, OracleReply};
pub use page::{DomEvent, ElementHandle, ElementInfo, PageHandle};
pub use runner::{ReplayEvent, ReplayRunner};
pub use script::{Script, ScriptStep};
pub use types::{
    Action, IterationResult, Observation, Point, RunResult, RunStatus, StepContext, StepResult,
    StepStatus, Viewport,
};
