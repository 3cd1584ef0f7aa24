use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;

fn observation() -> Observation {
    Observation {
        image: b"png-bytes".to_vec(),
        image_width: 1280,
        image_height: 800,
        viewport_width: 1280,
        viewport_height: 800,
        dom_summary: None,
    }
}

fn context() -> StepContext {
    StepContext {
        step_number: 2,
        instruction_text: "Click the login button".to_string(),
        expected_result_text: "Login form is shown".to_string(),
        target_description: "login button".to_string(),
        prior_action_description: "click at (10, 20)".to_string(),
        prior_action_succeeded: true,
        consecutive_success_count: 1,
        completion_hinted: false,
        iteration: 1,
    }
}

fn oracle_for(server: &MockServer, api_key: Option<&str>) -> HttpOracle {
    HttpOracle::new(OracleConfig {
        endpoint: format!("{}/decide", server.uri()),
        api_key: api_key.map(String::from),
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

#[test]
fn test_parse_click_coordinate_array() {
    let reply =
        parse_reply(r#"{"toolCall": {"name": "click", "input": {"coordinate": [120, 45]}}, "message": null}"#)
            .unwrap();
    assert_eq!(reply.action, Some(Action::click_at(120.0, 45.0)));
    assert!(!reply.is_completion());
}

#[test]
fn test_parse_click_xy_and_selector() {
    let reply = parse_reply(
        r##"{"toolCall": {"name": "click", "input": {"x": 1.5, "y": 2, "selector": "#go"}}}"##,
    )
    .unwrap();
    assert_eq!(
        reply.action,
        Some(Action::Click {
            selector: Some("#go".to_string()),
            coordinates: Some(Point::new(1.5, 2.0)),
        })
    );
}

#[test]
fn test_parse_click_without_target_is_protocol_error() {
    let err = parse_reply(r#"{"toolCall": {"name": "click", "input": {}}}"#).unwrap_err();
    assert!(matches!(err, ReplayError::OracleProtocol(_)));
}

#[test]
fn test_parse_navigate_and_type() {
    let nav = parse_reply(r#"{"toolCall": {"name": "navigate", "input": {"url": "https://example.com"}}}"#)
        .unwrap();
    assert_eq!(nav.action, Some(Action::navigate("https://example.com")));

    let typed = parse_reply(
        r#"{"toolCall": {"name": "type", "input": {"text": "rust", "submit": true}}, "message": "Typing the query"}"#,
    )
    .unwrap();
    assert_eq!(typed.action, Some(Action::type_text("rust", true)));
    assert_eq!(typed.message.as_deref(), Some("Typing the query"));
}

#[test]
fn test_parse_completion_message() {
    let reply = parse_reply(r#"{"toolCall": null, "message": "The dashboard is visible."}"#).unwrap();
    assert!(reply.is_completion());
    assert!(!reply.completed);
}

#[test]
fn test_parse_completed_flag() {
    let reply = parse_reply(
        r#"{"toolCall": {"name": "navigate", "input": {"url": "https://a.b"}}, "completed": true}"#,
    )
    .unwrap();
    assert!(reply.completed);
}

#[test]
fn test_parse_strips_code_fences() {
    let reply = parse_reply("```json\n{\"message\": \"done\"}\n```").unwrap();
    assert_eq!(reply.message.as_deref(), Some("done"));
}

#[test]
fn test_parse_rejects_empty_and_unknown() {
    assert!(matches!(
        parse_reply(r#"{"toolCall": null, "message": null}"#),
        Err(ReplayError::OracleProtocol(_))
    ));
    assert!(matches!(
        parse_reply(r#"{"toolCall": {"name": "scroll", "input": {}}}"#),
        Err(ReplayError::OracleProtocol(_))
    ));
    assert!(matches!(parse_reply("not json"), Err(ReplayError::OracleProtocol(_))));
}

#[test]
fn test_request_declares_scaled_screen_size() {
    let observation = Observation {
        image_width: 640,
        image_height: 400,
        ..observation()
    };
    let json = serde_json::to_value(OracleRequest::new(&observation, &context())).unwrap();
    assert_eq!(json["screenWidth"], 640);
    assert_eq!(json["screenHeight"], 400);
    assert_eq!(
        json["viewportDescription"],
        "Screenshot is 640x400 pixels (viewport 1280x800 CSS pixels)"
    );
}

#[test]
fn test_request_carries_full_context() {
    let request = OracleRequest::new(&observation(), &context());
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["instruction"], "Click the login button");
    assert_eq!(json["observationImage"], STANDARD.encode(b"png-bytes"));
    assert_eq!(json["screenWidth"], 1280);
    assert_eq!(json["priorAction"], "click at (10, 20)");
    assert_eq!(json["priorSucceeded"], true);
    assert_eq!(json["completionHinted"], false);
    assert_eq!(json["expectedResult"], "Login form is shown");
    assert!(json["stepContext"].as_str().unwrap().contains("Step 2"));
    assert!(json.get("domSummary").is_none());
}

#[tokio::test]
async fn test_decide_posts_request_and_parses_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/decide"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(serde_json::json!({
            "instruction": "Click the login button",
            "priorSucceeded": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "toolCall": {"name": "click", "input": {"selector": "#login"}},
            "message": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, Some("secret"));
    let reply = oracle.decide(&observation(), &context()).await.unwrap();
    assert_eq!(reply.action, Some(Action::click_selector("#login")));
}

#[tokio::test]
async fn test_decide_maps_http_error_to_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
            "error": {"message": "model overloaded"}
        })))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None);
    let err = oracle.decide(&observation(), &context()).await.unwrap_err();
    match err {
        ReplayError::OracleUnavailable(msg) => assert!(msg.contains("model overloaded")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_decide_maps_garbage_to_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let oracle = oracle_for(&server, None);
    let err = oracle.decide(&observation(), &context()).await.unwrap_err();
    assert!(matches!(err, ReplayError::OracleProtocol(_)));
}

#[tokio::test]
async fn test_decide_unreachable_is_unavailable() {
    let oracle = HttpOracle::new(OracleConfig {
        endpoint: "http://127.0.0.1:9/decide".to_string(),
        api_key: None,
        timeout: Duration::from_secs(2),
    })
    .unwrap();
    let err = oracle.decide(&observation(), &context()).await.unwrap_err();
    assert!(matches!(err, ReplayError::OracleUnavailable(_)));
}
