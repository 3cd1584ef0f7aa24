use async_trait::async_trait;

use super::*;
use crate::error::Result;
use crate::oracle::OracleReply;
use crate::testing::{FakeElement, FakePage, ScriptedOracle};
use crate::types::{Action, Observation};

fn step(number: u32, expected: &str) -> ScriptStep {
    ScriptStep {
        step_number: number,
        action: format!("Do step {}", number),
        target: String::new(),
        value: None,
        url: String::new(),
        expected_result: expected.to_string(),
    }
}

fn runner(oracle: ScriptedOracle) -> ReplayRunner<ScriptedOracle> {
    ReplayRunner::new(oracle, ReplayConfig::immediate())
}

#[tokio::test]
async fn test_completion_message_ends_step_on_first_iteration() {
    let page = FakePage::new(1280.0, 800.0);
    let runner = runner(ScriptedOracle::repeating(OracleReply::complete("All done")));

    let result = runner.run_step(&step(1, "Home page"), &page).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.message, "All done");
    assert_eq!(result.iterations, 1);
    assert_eq!(runner.oracle().call_count(), 1);
}

#[tokio::test]
async fn test_budget_exhaustion_fails_without_eleventh_iteration() {
    let page = FakePage::new(1280.0, 800.0);
    let runner = runner(ScriptedOracle::repeating(OracleReply::act(
        Action::click_selector("#missing"),
    )));

    let result = runner.run_step(&step(1, "Dialog opens"), &page).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.iterations, 10);
    assert_eq!(runner.oracle().call_count(), 10);
    assert_eq!(page.capture_count(), 10);
    assert!(result.message.contains("10 iterations"));
    assert!(result.message.contains("#missing"));
}

#[tokio::test]
async fn test_success_streak_ends_step_on_fourth_iteration() {
    let page = FakePage::new(1280.0, 800.0);
    let runner = runner(ScriptedOracle::repeating(OracleReply::act(Action::navigate(
        "https://example.com",
    ))));

    let result = runner.run_step(&step(1, "Example domain"), &page).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.iterations, 4);
    assert_eq!(runner.oracle().call_count(), 4);
    assert!(result.message.contains("consecutive successful actions"));
}

#[tokio::test]
async fn test_failure_resets_streak() {
    let page = FakePage::new(1280.0, 800.0);
    page.add_element(FakeElement::new(1, "button").selector("#ok"));
    let oracle = ScriptedOracle::new(vec![
        Ok(OracleReply::act(Action::click_selector("#ok"))),
        Ok(OracleReply::act(Action::click_selector("#ok"))),
        Ok(OracleReply::act(Action::click_selector("#gone"))),
        Ok(OracleReply::act(Action::click_selector("#ok"))),
    ])
    .then_repeat(OracleReply::complete("Finished"));
    let runner = runner(oracle);

    let result = runner.run_step(&step(1, "Saved"), &page).await;

    // Iterations 0,1 succeed, 2 fails, 3 succeeds (streak 1), 4 completes.
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.message, "Finished");
    assert_eq!(result.iterations, 5);

    let contexts = runner.oracle().contexts();
    assert_eq!(contexts[2].consecutive_success_count, 2);
    assert!(contexts[2].completion_hinted);
    assert_eq!(contexts[3].consecutive_success_count, 0);
    assert!(!contexts[3].prior_action_succeeded);
    assert_eq!(contexts[3].prior_action_description, "click on '#gone'");
    assert_eq!(contexts[4].consecutive_success_count, 1);
}

#[tokio::test]
async fn test_success_on_final_iteration_is_not_a_failure() {
    let page = FakePage::new(1280.0, 800.0);
    page.add_element(FakeElement::new(1, "button").selector("#ok"));
    let mut replies: Vec<Result<OracleReply>> = (0..9)
        .map(|_| Ok(OracleReply::act(Action::click_selector("#gone"))))
        .collect();
    replies.push(Ok(OracleReply::act(Action::click_selector("#ok"))));
    let runner = runner(ScriptedOracle::new(replies));

    let result = runner.run_step(&step(1, "Saved"), &page).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.iterations, 10);
    assert_eq!(runner.oracle().call_count(), 10);
    assert_eq!(
        result.message,
        "Step 1 completed after 10 iterations with 1 successful actions"
    );
}

#[tokio::test]
async fn test_early_success_then_failures_still_succeeds() {
    let page = FakePage::new(1280.0, 800.0);
    page.add_element(FakeElement::new(1, "button").selector("#ok"));
    let oracle = ScriptedOracle::new(vec![Ok(OracleReply::act(Action::click_selector("#ok")))])
        .then_repeat(OracleReply::act(Action::click_selector("#gone")));
    let runner = runner(oracle);

    let result = runner.run_step(&step(1, "Saved"), &page).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.iterations, 10);
    assert!(!result.message.contains("did not succeed"));
}

#[tokio::test]
async fn test_heuristic_rescues_failed_execution() {
    let page = FakePage::new(1280.0, 800.0);
    page.set_page_text("Your order has been confirmed. Thank you!");
    let runner = runner(ScriptedOracle::repeating(OracleReply::act(
        Action::click_selector("#missing"),
    )));

    let result = runner.run_step(&step(1, "Order confirmed"), &page).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.iterations, 4);
}

#[tokio::test]
async fn test_success_message_counts_as_success() {
    let page = FakePage::new(1280.0, 800.0);
    let runner = runner(ScriptedOracle::repeating(
        OracleReply::act(Action::click_selector("#missing")).with_message("Page loaded successfully"),
    ));

    let result = runner.run_step(&step(1, "Anything"), &page).await;
    assert_eq!(result.status, StepStatus::Success);
}

#[tokio::test]
async fn test_capture_errors_are_retried() {
    let page = FakePage::new(1280.0, 800.0);
    page.fail_captures(2);
    let runner = runner(ScriptedOracle::repeating(OracleReply::complete("Done")));

    let result = runner.run_step(&step(1, "Home"), &page).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.iterations, 3);
    assert_eq!(runner.oracle().call_count(), 1);
}

#[tokio::test]
async fn test_error_on_last_iteration_is_failure_reason() {
    let page = FakePage::new(1280.0, 800.0);
    let oracle = ScriptedOracle::new(vec![
        Ok(OracleReply::act(Action::click_selector("#missing"))),
        Err(ReplayError::OracleUnavailable("model overloaded".to_string())),
    ]);
    let config = ReplayConfig {
        max_iterations: 2,
        ..ReplayConfig::immediate()
    };
    let runner = ReplayRunner::new(oracle, config);

    let result = runner.run_step(&step(1, "Anything"), &page).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.message, "Oracle unavailable: model overloaded");

    let contexts = runner.oracle().contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[1].prior_action_description, "click on '#missing'");
}

#[tokio::test]
async fn test_early_error_does_not_mask_later_reason() {
    let page = FakePage::new(1280.0, 800.0);
    let oracle = ScriptedOracle::new(vec![
        Err(ReplayError::OracleProtocol("garbled".to_string())),
        Ok(OracleReply::act(Action::click_selector("#missing"))),
    ]);
    let config = ReplayConfig {
        max_iterations: 2,
        ..ReplayConfig::immediate()
    };
    let runner = ReplayRunner::new(oracle, config);

    let result = runner.run_step(&step(1, "Anything"), &page).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.message.starts_with("Step did not succeed within 2 iterations"));
    assert!(result.message.contains("#missing"));
}

#[tokio::test]
async fn test_terminal_error_ends_step_immediately() {
    let page = FakePage::new(1280.0, 800.0);
    let oracle = ScriptedOracle::new(vec![Err(ReplayError::Script("plan is corrupt".to_string()))])
        .then_repeat(OracleReply::complete("never reached"));
    let runner = runner(oracle);

    let result = runner.run_step(&step(1, "Anything"), &page).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.message, "Script error: plan is corrupt");
    assert_eq!(runner.oracle().call_count(), 1);
}

#[tokio::test]
async fn test_failed_step_halts_script() {
    let page = FakePage::new(1280.0, 800.0);
    let oracle = ScriptedOracle::new(vec![Ok(OracleReply::complete("Step one done"))])
        .then_repeat(OracleReply::act(Action::click_selector("#missing")));
    let runner = runner(oracle);
    let script = Script::new("three steps", vec![step(1, ""), step(2, ""), step(3, "")]);

    let result = runner.run_script(&script, &page).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.completed_steps, vec![1]);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.failed_step().map(|s| s.step_number), Some(2));
}

#[tokio::test]
async fn test_events_are_emitted_in_order() {
    let page = FakePage::new(1280.0, 800.0);
    let (tx, mut rx) = broadcast::channel(64);
    let runner = runner(ScriptedOracle::repeating(OracleReply::complete("ok"))).with_events(tx);
    let script = Script::new("one", vec![step(1, "")]);

    runner.run_script(&script, &page).await;

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names, vec!["run_started", "step_started", "step_finished", "run_finished"]);
}

/// Cancels the run from inside its N-th decision.
struct CancellingOracle {
    inner: ScriptedOracle,
    cancel_on_call: usize,
    token: CancellationToken,
}

#[async_trait]
impl Oracle for CancellingOracle {
    async fn decide(&self, observation: &Observation, context: &StepContext) -> Result<OracleReply> {
        let reply = self.inner.decide(observation, context).await;
        if self.inner.call_count() == self.cancel_on_call {
            self.token.cancel();
        }
        reply
    }
}

#[tokio::test]
async fn test_cancellation_stops_oracle_calls() {
    let page = FakePage::new(1280.0, 800.0);
    let token = CancellationToken::new();
    let oracle = CancellingOracle {
        inner: ScriptedOracle::new(vec![Ok(OracleReply::complete("first"))])
            .then_repeat(OracleReply::act(Action::navigate("https://example.com"))),
        cancel_on_call: 2,
        token: token.clone(),
    };
    let runner = ReplayRunner::new(oracle, ReplayConfig::immediate()).with_cancellation(token);
    let script = Script::new("cancel me", vec![step(1, ""), step(2, ""), step(3, "")]);

    let result = runner.run_script(&script, &page).await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.completed_steps, vec![1]);
    assert_eq!(runner.oracle().inner.call_count(), 2);
    assert!(result.failed_step().is_none());
    // The navigate proposed on the cancelling call is never executed.
    assert_eq!(page.url(), "about:blank");
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let page = FakePage::new(1280.0, 800.0);
    let runner = runner(ScriptedOracle::repeating(OracleReply::complete("ok")));
    runner.cancellation_token().cancel();

    let result = runner.run_script(&Script::new("none", vec![step(1, "")]), &page).await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.steps.is_empty());
    assert_eq!(page.capture_count(), 0);
}
