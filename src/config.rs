//! Loop tuning and oracle endpoint configuration.
//!
//! Values come from `REPLAY_*` environment variables. The binary loads a
//! `.env` file first, so either works.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_SUCCESS_STREAK: u32 = 2;
pub const DEFAULT_EARLY_COMPLETION_MIN_ITERATION: u32 = 3;
pub const DEFAULT_SUCCESS_THRESHOLD: f64 = 0.7;

/// Constants that drive the observe/decide/act loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Iterations allowed per step before it is marked failed.
    pub max_iterations: u32,
    /// Consecutive effective successes that raise the completion hint.
    pub success_streak: u32,
    /// 0-based iteration index from which a hinted step may end early.
    pub early_completion_min_iteration: u32,
    /// Wait before each observation.
    pub settle_delay: Duration,
    /// Wait after executing an action.
    pub post_action_delay: Duration,
    /// Fraction of expected-result words that must appear on the page.
    pub success_threshold: f64,
    /// Maximum characters of page text sampled after an action.
    pub page_sample_chars: usize,
    pub include_dom_summary: bool,
    pub click_marker_duration: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            success_streak: DEFAULT_SUCCESS_STREAK,
            early_completion_min_iteration: DEFAULT_EARLY_COMPLETION_MIN_ITERATION,
            settle_delay: Duration::from_millis(1000),
            post_action_delay: Duration::from_millis(1500),
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            page_sample_chars: 5000,
            include_dom_summary: true,
            click_marker_duration: Duration::from_millis(1500),
        }
    }
}

impl ReplayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparsable or out-of-range
    /// values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let millis = |key: &str| parsed::<u64>(&lookup, key).map(Duration::from_millis);

        Self {
            max_iterations: parsed::<u32>(&lookup, "REPLAY_MAX_ITERATIONS")
                .map(|v| v.max(1))
                .unwrap_or(d.max_iterations),
            success_streak: parsed::<u32>(&lookup, "REPLAY_SUCCESS_STREAK")
                .map(|v| v.max(1))
                .unwrap_or(d.success_streak),
            early_completion_min_iteration: parsed(&lookup, "REPLAY_EARLY_COMPLETION_MIN_ITERATION")
                .unwrap_or(d.early_completion_min_iteration),
            settle_delay: millis("REPLAY_SETTLE_DELAY_MS").unwrap_or(d.settle_delay),
            post_action_delay: millis("REPLAY_POST_ACTION_DELAY_MS").unwrap_or(d.post_action_delay),
            success_threshold: parsed::<f64>(&lookup, "REPLAY_SUCCESS_THRESHOLD")
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(d.success_threshold),
            page_sample_chars: parsed(&lookup, "REPLAY_PAGE_SAMPLE_CHARS")
                .unwrap_or(d.page_sample_chars),
            include_dom_summary: lookup("REPLAY_INCLUDE_DOM")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
                .unwrap_or(d.include_dom_summary),
            click_marker_duration: millis("REPLAY_CLICK_MARKER_MS").unwrap_or(d.click_marker_duration),
        }
    }

    /// Zero delays, for driving fakes.
    pub fn immediate() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            post_action_delay: Duration::ZERO,
            click_marker_duration: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse::<T>().ok())
}

/// Where the decision oracle lives.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl OracleConfig {
    pub fn from_env() -> crate::error::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::error::Result<Self> {
        let endpoint = lookup("REPLAY_ORACLE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                crate::error::ReplayError::OracleUnavailable(
                    "REPLAY_ORACLE_URL not set in environment".to_string(),
                )
            })?;

        Ok(Self {
            endpoint,
            api_key: lookup("REPLAY_ORACLE_API_KEY").filter(|v| !v.is_empty()),
            timeout: Duration::from_secs(
                lookup("REPLAY_ORACLE_TIMEOUT_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(60),
            ),
        })
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
