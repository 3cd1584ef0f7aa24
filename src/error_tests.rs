use super::*;

#[test]
fn test_is_retryable() {
    assert!(ReplayError::Capture("blank frame".to_string()).is_retryable());
    assert!(ReplayError::OracleUnavailable("timeout".to_string()).is_retryable());
    assert!(ReplayError::OracleProtocol("bad json".to_string()).is_retryable());
    assert!(ReplayError::NoInputTarget.is_retryable());

    assert!(!ReplayError::Cancelled.is_retryable());
    assert!(!ReplayError::Script("missing".to_string()).is_retryable());
    assert!(
        !ReplayError::IterationBudgetExceeded {
            iterations: 10,
            last_reason: "nothing".to_string()
        }
        .is_retryable()
    );
}

#[test]
fn test_budget_message_names_iterations_and_reason() {
    let err = ReplayError::IterationBudgetExceeded {
        iterations: 10,
        last_reason: "no element matches '#missing'".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "Step did not succeed within 10 iterations: no element matches '#missing'"
    );
}

#[test]
fn test_json_errors_become_script_errors() {
    let err: ReplayError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(matches!(err, ReplayError::Script(_)));
}
