use agent_inbox::agent::{AgentRunner, HttpAgentRunner};
use agent_inbox::channels::sms::{SmsTransport, TwilioTransport};
use agent_inbox::config::{AgentConfig, SmsConfig};
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn twilio(base_url: &str) -> TwilioTransport {
    TwilioTransport::new(
        reqwest::Client::new(),
        &SmsConfig {
            account_sid: Some("AC123".to_string()),
            auth_token: Some("tok".to_string()),
            from_number: Some("+15559990000".to_string()),
            api_base: base_url.to_string(),
            ..SmsConfig::default()
        },
    )
}

fn agent(url: &str, token: Option<&str>) -> HttpAgentRunner {
    HttpAgentRunner::new(
        reqwest::Client::new(),
        &AgentConfig {
            url: Some(url.to_string()),
            api_token: token.map(str::to_string),
            ..AgentConfig::default()
        },
    )
}

#[tokio::test]
async fn test_twilio_send_posts_form_with_basic_auth() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
        .and(header("authorization", "Basic QUMxMjM6dG9r"))
        .and(body_string_contains("To=%2B15550001111"))
        .and(body_string_contains("From=%2B15559990000"))
        .and(body_string_contains("Body=hello+there"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": "SM_sent_1", "status": "queued"})))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = twilio(&server.uri()).send("+15550001111", "hello there").await.unwrap();
    assert_eq!(receipt.provider_message_id, "SM_sent_1");
}

#[tokio::test]
async fn test_twilio_error_status_is_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"code": 21211, "message": "Invalid 'To' Phone Number"})))
        .mount(&server)
        .await;

    let err = twilio(&server.uri()).send("not-a-number", "hi").await.unwrap_err();
    assert!(err.to_string().contains("400"));
}

#[tokio::test]
async fn test_twilio_without_credentials_never_calls_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let transport = TwilioTransport::new(
        reqwest::Client::new(),
        &SmsConfig {
            api_base: server.uri(),
            ..SmsConfig::default()
        },
    );
    assert!(transport.send("+15550001111", "hi").await.is_err());
}

#[tokio::test]
async fn test_agent_runner_posts_message_and_user() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/agent/run"))
        .and(header("authorization", "Bearer agent-token"))
        .and(body_json(json!({"message": "Add John Smith as a lead", "user_id": "acct_1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runId": "run_77",
            "message": "Added John Smith.",
            "followUpQuestion": "What's his phone number?",
            "requiresApproval": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let runner = agent(&format!("{}/agent/run", server.uri()), Some("agent-token"));
    let run = runner.run("Add John Smith as a lead", "acct_1").await.unwrap();
    assert_eq!(run.run_id, "run_77");
    assert_eq!(run.message, "Added John Smith.");
    assert_eq!(run.follow_up_question.as_deref(), Some("What's his phone number?"));
    assert_eq!(run.requires_approval, Some(false));
}

#[tokio::test]
async fn test_agent_runner_tolerates_missing_optionals() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"run_id": "run_1", "message": "ok"})))
        .mount(&server)
        .await;

    let run = agent(&server.uri(), None).run("hi", "acct_1").await.unwrap();
    assert_eq!(run.run_id, "run_1");
    assert!(run.follow_up_question.is_none());
    assert!(run.requires_approval.is_none());
}

#[tokio::test]
async fn test_agent_runner_surfaces_http_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = agent(&server.uri(), None).run("hi", "acct_1").await.unwrap_err();
    assert!(err.to_string().contains("503"));
}
