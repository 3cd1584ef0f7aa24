use std::collections::HashMap;
use std::time::Duration;

use super::*;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_defaults() {
    let config = ReplayConfig::default();
    assert_eq!(config.max_iterations, 10);
    assert_eq!(config.success_streak, 2);
    assert_eq!(config.early_completion_min_iteration, 3);
    assert!((config.success_threshold - 0.7).abs() < f64::EPSILON);
}

#[test]
fn test_empty_lookup_gives_defaults() {
    let config = ReplayConfig::from_lookup(|_| None);
    assert_eq!(config, ReplayConfig::default());
}

#[test]
fn test_overrides() {
    let config = ReplayConfig::from_lookup(lookup_from(&[
        ("REPLAY_MAX_ITERATIONS", "5"),
        ("REPLAY_SETTLE_DELAY_MS", "0"),
        ("REPLAY_SUCCESS_THRESHOLD", "0.5"),
        ("REPLAY_INCLUDE_DOM", "false"),
    ]));
    assert_eq!(config.max_iterations, 5);
    assert_eq!(config.settle_delay, Duration::ZERO);
    assert!((config.success_threshold - 0.5).abs() < f64::EPSILON);
    assert!(!config.include_dom_summary);
}

#[test]
fn test_invalid_values_fall_back() {
    let config = ReplayConfig::from_lookup(lookup_from(&[
        ("REPLAY_MAX_ITERATIONS", "lots"),
        ("REPLAY_SUCCESS_THRESHOLD", "1.5"),
    ]));
    assert_eq!(config.max_iterations, 10);
    assert!((config.success_threshold - 0.7).abs() < f64::EPSILON);
}

#[test]
fn test_zero_iterations_clamped() {
    let config = ReplayConfig::from_lookup(lookup_from(&[("REPLAY_MAX_ITERATIONS", "0")]));
    assert_eq!(config.max_iterations, 1);
}

#[test]
fn test_oversized_values_fall_back_instead_of_wrapping() {
    let config = ReplayConfig::from_lookup(lookup_from(&[
        ("REPLAY_MAX_ITERATIONS", "4294967296"),
        ("REPLAY_SUCCESS_STREAK", "99999999999"),
        ("REPLAY_EARLY_COMPLETION_MIN_ITERATION", "4294967299"),
    ]));
    assert_eq!(config.max_iterations, 10);
    assert_eq!(config.success_streak, 2);
    assert_eq!(config.early_completion_min_iteration, 3);
}

#[test]
fn test_oracle_config_requires_url() {
    assert!(OracleConfig::from_lookup(|_| None).is_err());

    let config = OracleConfig::from_lookup(lookup_from(&[
        ("REPLAY_ORACLE_URL", "http://localhost:8080/decide"),
        ("REPLAY_ORACLE_TIMEOUT_SECS", "5"),
    ]))
    .unwrap();
    assert_eq!(config.endpoint, "http://localhost:8080/decide");
    assert_eq!(config.api_key, None);
    assert_eq!(config.timeout, Duration::from_secs(5));
}
