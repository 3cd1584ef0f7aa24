//! Weak success signals and how they combine.

use crate::config::DEFAULT_SUCCESS_THRESHOLD;

/// Words of this length or shorter carry no signal.
const MIN_WORD_CHARS: usize = 4;

/// Length of the expected-result prefix matched against oracle messages.
const EXPECTED_PREFIX_CHARS: usize = 20;

const SUCCESS_PHRASES: [&str; 2] = ["success", "loaded successfully"];

/// Recall-biased check that the page shows what the step expected.
///
/// Returns true when at least 70% of the expected text's words longer than
/// three characters appear, case-insensitively, somewhere in the page text.
pub fn might_have_succeeded(page_content: &str, expected_result: &str) -> bool {
    might_have_succeeded_with(page_content, expected_result, DEFAULT_SUCCESS_THRESHOLD)
}

pub fn might_have_succeeded_with(page_content: &str, expected_result: &str, threshold: f64) -> bool {
    if page_content.trim().is_empty() || expected_result.trim().is_empty() {
        return false;
    }

    let page = page_content.to_lowercase();
    let words = significant_words(expected_result);
    if words.is_empty() {
        return false;
    }

    let matched = words.iter().filter(|w| page.contains(w.as_str())).count();
    matched as f64 / words.len() as f64 >= threshold
}

fn significant_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_CHARS)
        .map(str::to_lowercase)
        .collect()
}

/// Does the oracle's follow-up message read like a success report?
pub fn message_signals_success(message: &str, expected_result: &str) -> bool {
    let message = message.to_lowercase();
    if SUCCESS_PHRASES.iter().any(|p| message.contains(p)) {
        return true;
    }

    let prefix: String = expected_result
        .trim()
        .chars()
        .take(EXPECTED_PREFIX_CHARS)
        .collect::<String>()
        .to_lowercase();
    !prefix.is_empty() && message.contains(&prefix)
}

/// The individual signals gathered for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuccessSignals {
    pub executed: bool,
    pub oracle_completed: bool,
    pub page_matches_expected: bool,
    pub message_reports_success: bool,
}

/// No single channel is trusted on its own; any of them counts.
pub fn effective_success(signals: SuccessSignals) -> bool {
    signals.executed
        || signals.oracle_completed
        || signals.page_matches_expected
        || signals.message_reports_success
}

#[cfg(test)]
#[path = "heuristic_tests.rs"]
mod tests;
