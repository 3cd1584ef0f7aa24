//! Client for the decision oracle.
//!
//! The oracle is stateless between calls: every request carries the
//! screenshot, the step instruction, the expected result and what happened
//! on the previous iteration.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::{ReplayError, Result};
use crate::types::{Action, Observation, Point, StepContext};

/// What the oracle wants next.
///
/// An action means "do this, not done yet". A message with no action means
/// the step is complete and the message is its summary. A message next to
/// an action is commentary on the previous iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleReply {
    pub action: Option<Action>,
    pub message: Option<String>,
    /// Explicit completion flag, when the oracle sends one.
    pub completed: bool,
}

impl OracleReply {
    pub fn act(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Default::default()
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self {
            action: None,
            message: Some(message.into()),
            completed: true,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_completion(&self) -> bool {
        self.action.is_none() && self.message.is_some()
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(&self, observation: &Observation, context: &StepContext) -> Result<OracleReply>;
}

#[async_trait]
impl<T: Oracle + ?Sized> Oracle for Arc<T> {
    async fn decide(&self, observation: &Observation, context: &StepContext) -> Result<OracleReply> {
        (**self).decide(observation, context).await
    }
}

/// Request body sent to the oracle endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleRequest {
    pub instruction: String,
    pub observation_image: String,
    pub viewport_description: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub prior_action: String,
    pub step_context: String,
    pub expected_result: String,
    pub prior_succeeded: bool,
    pub completion_hinted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_summary: Option<String>,
}

impl OracleRequest {
    pub fn new(observation: &Observation, context: &StepContext) -> Self {
        Self {
            instruction: context.instruction_text.clone(),
            observation_image: STANDARD.encode(&observation.image),
            viewport_description: observation.describe_viewport(),
            screen_width: observation.image_width,
            screen_height: observation.image_height,
            prior_action: if context.prior_action_description.is_empty() {
                "none".to_string()
            } else {
                context.prior_action_description.clone()
            },
            step_context: context.summary(),
            expected_result: context.expected_result_text.clone(),
            prior_succeeded: context.prior_action_succeeded,
            completion_hinted: context.completion_hinted,
            dom_summary: observation.dom_summary.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleResponse {
    #[serde(default)]
    tool_call: Option<ToolCall>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    completed: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClickInput {
    selector: Option<String>,
    coordinate: Option<[f64; 2]>,
    x: Option<f64>,
    y: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct NavigateInput {
    url: String,
}

#[derive(Debug, Deserialize)]
struct TypeInput {
    text: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    submit: bool,
}

fn input_of<T: for<'de> Deserialize<'de>>(tool: &str, input: serde_json::Value) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| ReplayError::OracleProtocol(format!("invalid {} input: {}", tool, e)))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn parse_tool_call(call: ToolCall) -> Result<Action> {
    match call.name.as_str() {
        "click" => {
            let input: ClickInput = input_of("click", call.input)?;
            let coordinates = match (input.coordinate, input.x, input.y) {
                (Some([x, y]), _, _) => Some(Point::new(x, y)),
                (None, Some(x), Some(y)) => Some(Point::new(x, y)),
                _ => None,
            };
            let selector = non_empty(input.selector);
            if coordinates.is_none() && selector.is_none() {
                return Err(ReplayError::OracleProtocol(
                    "click needs coordinates or a selector".to_string(),
                ));
            }
            Ok(Action::Click {
                selector,
                coordinates,
            })
        }
        "navigate" => {
            let input: NavigateInput = input_of("navigate", call.input)?;
            if input.url.trim().is_empty() {
                return Err(ReplayError::OracleProtocol("navigate needs a url".to_string()));
            }
            Ok(Action::Navigate { url: input.url })
        }
        "type" => {
            let input: TypeInput = input_of("type", call.input)?;
            Ok(Action::TypeText {
                text: input.text,
                selector: non_empty(input.selector),
                submit: input.submit,
            })
        }
        other => Err(ReplayError::OracleProtocol(format!(
            "unknown tool '{}'",
            other
        ))),
    }
}

/// Strip markdown fences some backends wrap around JSON.
fn strip_fences(body: &str) -> &str {
    body.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse a raw oracle response body into a reply.
pub fn parse_reply(body: &str) -> Result<OracleReply> {
    let response: OracleResponse = serde_json::from_str(strip_fences(body))
        .map_err(|e| ReplayError::OracleProtocol(format!("unparsable reply: {}", e)))?;

    let message = non_empty(response.message);
    let action = response.tool_call.map(parse_tool_call).transpose()?;

    if action.is_none() && message.is_none() {
        return Err(ReplayError::OracleProtocol(
            "reply has neither a tool call nor a message".to_string(),
        ));
    }

    Ok(OracleReply {
        completed: response.completed.unwrap_or(false),
        action,
        message,
    })
}

/// Oracle reached over HTTP.
pub struct HttpOracle {
    client: Client,
    config: OracleConfig,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ReplayError::OracleUnavailable(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn decide(&self, observation: &Observation, context: &StepContext) -> Result<OracleReply> {
        let request = OracleRequest::new(observation, context);
        debug!(
            step = context.step_number,
            iteration = context.iteration,
            image_bytes = observation.image.len(),
            "Querying oracle"
        );

        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let err_msg = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body);
            warn!(status = %status, error = %err_msg, "Oracle API error");
            return Err(ReplayError::OracleUnavailable(format!(
                "status {}: {}",
                status, err_msg
            )));
        }

        let reply = parse_reply(&body)?;
        debug!(
            action = ?reply.action,
            message = ?reply.message,
            completed = reply.completed,
            "Oracle replied"
        );
        Ok(reply)
    }
}

#[cfg(test)]
#[path = "oracle_tests.rs"]
mod tests;
