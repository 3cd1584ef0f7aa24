//! The observe/decide/act/evaluate loop.
//!
//! One step runs as a bounded sequence of iterations:
//!
//!   1. settle, then capture an observation
//!   2. ask the oracle for the next action (or a completion message)
//!   3. execute the action and let the page settle
//!   4. combine the weak success signals and update the step context
//!
//! Iterations never overlap and a failed step halts the script. A step only
//! fails when its budget runs out without a single effective success. Errors
//! in any phase count as a failed iteration; only the last permitted
//! iteration's error becomes the step's failure reason.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReplayConfig;
use crate::error::ReplayError;
use crate::executor::ActionExecutor;
use crate::heuristic::{
    SuccessSignals, effective_success, message_signals_success, might_have_succeeded_with,
};
use crate::oracle::Oracle;
use crate::page::PageHandle;
use crate::script::{Script, ScriptStep};
use crate::types::{
    IterationResult, RunResult, RunStatus, StepContext, StepResult, StepStatus,
};

/// Progress events for whoever hosts the run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    RunStarted {
        title: String,
        total_steps: u32,
    },
    StepStarted {
        step_number: u32,
        instruction: String,
    },
    Iteration {
        step_number: u32,
        iteration: u32,
        action: Option<String>,
        succeeded: bool,
        error: Option<String>,
    },
    StepFinished(StepResult),
    RunFinished(RunResult),
}

impl ReplayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ReplayEvent::RunStarted { .. } => "run_started",
            ReplayEvent::StepStarted { .. } => "step_started",
            ReplayEvent::Iteration { .. } => "iteration",
            ReplayEvent::StepFinished(_) => "step_finished",
            ReplayEvent::RunFinished(_) => "run_finished",
        }
    }
}

/// Where in an iteration something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPhase {
    Observing,
    Deciding,
    Executing,
    Evaluating,
}

impl fmt::Display for IterationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IterationPhase::Observing => "observing",
            IterationPhase::Deciding => "deciding",
            IterationPhase::Executing => "executing",
            IterationPhase::Evaluating => "evaluating",
        };
        f.write_str(name)
    }
}

struct PhaseError {
    phase: IterationPhase,
    error: ReplayError,
}

impl PhaseError {
    fn new(phase: IterationPhase, error: ReplayError) -> Self {
        Self { phase, error }
    }
}

enum Verdict {
    /// The oracle declared the step done.
    Complete(String),
    Evaluated {
        result: IterationResult,
        succeeded: bool,
        reason: Option<String>,
    },
    Cancelled,
}

/// Drives scripts against one page at a time.
pub struct ReplayRunner<O: Oracle> {
    oracle: O,
    config: ReplayConfig,
    cancel: CancellationToken,
    events: Option<broadcast::Sender<ReplayEvent>>,
}

impl<O: Oracle> ReplayRunner<O> {
    pub fn new(oracle: O, config: ReplayConfig) -> Self {
        Self {
            oracle,
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<ReplayEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the run between iterations when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    fn emit(&self, event: ReplayEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Wait, unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run_script<P: PageHandle + ?Sized>(&self, script: &Script, page: &P) -> RunResult {
        info!(title = %script.title, steps = script.steps.len(), "Starting script run");
        self.emit(ReplayEvent::RunStarted {
            title: script.title.clone(),
            total_steps: script.steps.len() as u32,
        });

        let mut steps = Vec::with_capacity(script.steps.len());
        let mut completed_steps = Vec::new();
        let mut status = RunStatus::Completed;

        for step in &script.steps {
            if self.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            let result = self.run_step(step, page).await;
            let step_status = result.status;
            steps.push(result);

            match step_status {
                StepStatus::Success => completed_steps.push(step.step_number),
                StepStatus::Failed => {
                    status = RunStatus::Failed;
                    break;
                }
                StepStatus::Pending | StepStatus::Running => {
                    status = RunStatus::Cancelled;
                    break;
                }
            }
        }

        let result = RunResult {
            status,
            steps,
            completed_steps,
        };
        info!(
            status = ?result.status,
            completed = result.completed_steps.len(),
            "Script run finished"
        );
        self.emit(ReplayEvent::RunFinished(result.clone()));
        result
    }

    /// Run one step until it succeeds, fails, or the run is cancelled.
    pub async fn run_step<P: PageHandle + ?Sized>(&self, step: &ScriptStep, page: &P) -> StepResult {
        let mut ctx = StepContext::for_step(step);
        info!(step = step.step_number, instruction = %ctx.instruction_text, "Step started");
        self.emit(ReplayEvent::StepStarted {
            step_number: step.step_number,
            instruction: ctx.instruction_text.clone(),
        });

        let max = self.config.max_iterations;
        let mut last_failure: Option<String> = None;
        let mut last_errored = false;
        let mut successful_iterations = 0u32;

        for iteration in 0..max {
            ctx.iteration = iteration;
            if !self.pause(self.config.settle_delay).await {
                return self.finish_step(&ctx, StepStatus::Pending, "Cancelled".to_string(), iteration);
            }

            match self.iterate(page, &ctx).await {
                Ok(Verdict::Cancelled) => {
                    return self.finish_step(&ctx, StepStatus::Pending, "Cancelled".to_string(), iteration);
                }
                Ok(Verdict::Complete(message)) => {
                    info!(step = ctx.step_number, iteration, %message, "Oracle reported step complete");
                    return self.finish_step(&ctx, StepStatus::Success, message, iteration + 1);
                }
                Ok(Verdict::Evaluated {
                    result,
                    succeeded,
                    reason,
                }) => {
                    ctx.record(result.action.as_ref(), succeeded, self.config.success_streak);
                    last_errored = false;
                    self.emit(ReplayEvent::Iteration {
                        step_number: ctx.step_number,
                        iteration,
                        action: result.action.as_ref().map(ToString::to_string),
                        succeeded,
                        error: reason.clone(),
                    });
                    debug!(
                        step = ctx.step_number,
                        iteration,
                        succeeded,
                        streak = ctx.consecutive_success_count,
                        "Iteration evaluated"
                    );

                    if succeeded {
                        successful_iterations += 1;
                        if ctx.completion_hinted
                            && iteration >= self.config.early_completion_min_iteration
                        {
                            let message = format!(
                                "Step {} completed after {} iterations with {} consecutive successful actions",
                                ctx.step_number,
                                iteration + 1,
                                ctx.consecutive_success_count
                            );
                            info!(step = ctx.step_number, iteration, "Ending step on success streak");
                            return self.finish_step(&ctx, StepStatus::Success, message, iteration + 1);
                        }
                    } else {
                        last_failure = Some(reason.unwrap_or_else(|| {
                            "action did not produce the expected result".to_string()
                        }));
                    }
                }
                Err(PhaseError { phase, error }) => {
                    warn!(
                        step = ctx.step_number,
                        iteration,
                        %phase,
                        error = %error,
                        retryable = error.is_retryable(),
                        "Iteration failed"
                    );
                    let description = format!("{} failed: {}", phase, error);
                    self.emit(ReplayEvent::Iteration {
                        step_number: ctx.step_number,
                        iteration,
                        action: None,
                        succeeded: false,
                        error: Some(description.clone()),
                    });
                    if !error.is_retryable() {
                        return self.finish_step(&ctx, StepStatus::Failed, error.to_string(), iteration + 1);
                    }
                    ctx.record_error(description);
                    last_failure = Some(error.to_string());
                    last_errored = true;
                }
            }
        }

        if successful_iterations > 0 {
            let message = format!(
                "Step {} completed after {} iterations with {} successful actions",
                ctx.step_number, max, successful_iterations
            );
            info!(step = ctx.step_number, successful_iterations, "Budget spent after effective success");
            return self.finish_step(&ctx, StepStatus::Success, message, max);
        }

        let message = match last_failure {
            Some(reason) if last_errored => reason,
            last => ReplayError::IterationBudgetExceeded {
                iterations: max,
                last_reason: last.unwrap_or_else(|| "no successful iteration".to_string()),
            }
            .to_string(),
        };
        warn!(step = ctx.step_number, %message, "Step failed");
        self.finish_step(&ctx, StepStatus::Failed, message, max)
    }

    fn finish_step(&self, ctx: &StepContext, status: StepStatus, message: String, iterations: u32) -> StepResult {
        let result = StepResult {
            step_number: ctx.step_number,
            status,
            message,
            iterations,
        };
        self.emit(ReplayEvent::StepFinished(result.clone()));
        result
    }

    async fn iterate<P: PageHandle + ?Sized>(
        &self,
        page: &P,
        ctx: &StepContext,
    ) -> Result<Verdict, PhaseError> {
        let observation = page
            .capture(self.config.include_dom_summary)
            .await
            .map_err(|e| PhaseError::new(IterationPhase::Observing, e))?;
        debug!(step = ctx.step_number, iteration = ctx.iteration, ?observation, "Captured");

        if self.cancel.is_cancelled() {
            return Ok(Verdict::Cancelled);
        }

        let reply = self
            .oracle
            .decide(&observation, ctx)
            .await
            .map_err(|e| PhaseError::new(IterationPhase::Deciding, e))?;

        if reply.is_completion() {
            return Ok(Verdict::Complete(reply.message.unwrap_or_default()));
        }
        let Some(action) = reply.action else {
            return Err(PhaseError::new(
                IterationPhase::Deciding,
                ReplayError::OracleProtocol("reply carried no action".to_string()),
            ));
        };

        if self.cancel.is_cancelled() {
            return Ok(Verdict::Cancelled);
        }

        let executor = ActionExecutor::new(page, self.config.click_marker_duration);
        let outcome = executor.execute(&action, &observation).await;
        drop(observation);

        if !self.pause(self.config.post_action_delay).await {
            return Ok(Verdict::Cancelled);
        }

        let mut signals = SuccessSignals {
            executed: outcome.applied,
            oracle_completed: reply.completed,
            message_reports_success: reply
                .message
                .as_deref()
                .is_some_and(|m| message_signals_success(m, &ctx.expected_result_text)),
            page_matches_expected: false,
        };

        let mut sample = None;
        if !effective_success(signals) {
            // Only worth reading the page when nothing else claimed success.
            match page.page_text().await {
                Ok(text) => {
                    let text: String = text.chars().take(self.config.page_sample_chars).collect();
                    signals.page_matches_expected = might_have_succeeded_with(
                        &text,
                        &ctx.expected_result_text,
                        self.config.success_threshold,
                    );
                    sample = Some(text);
                }
                Err(e) => {
                    debug!(phase = %IterationPhase::Evaluating, error = %e, "Page text unavailable");
                }
            }
        }

        Ok(Verdict::Evaluated {
            succeeded: effective_success(signals),
            reason: outcome.reason,
            result: IterationResult {
                action: Some(action),
                completion_message: None,
                execution_succeeded: Some(outcome.applied),
                raw_page_content_sample: sample,
            },
        })
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
