use agent_inbox::agent::AgentRunner;
use agent_inbox::channels::sms::{compute_signature, SmsTransport, EMPTY_TWIML, SIGNATURE_HEADER};
use agent_inbox::config::Config;
use agent_inbox::db::{self, DbKind, PhoneLinkRecord};
use agent_inbox::types::{AgentRun, SendReceipt};
use agent_inbox::{router, AppState, AUTH_HEADER};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::AnyPool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "test_token_123";
const AUTH_TOKEN: &str = "twilio_secret";
const PUBLIC_URL: &str = "https://inbox.test";
const WEBHOOK: &str = "/v1/channels/sms/inbound";
const LINKED: &str = "+15550001111";

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsTransport for RecordingTransport {
    async fn send(&self, to: &str, body: &str) -> Result<SendReceipt> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(SendReceipt {
            provider_message_id: format!("SM_out_{}", sent.len()),
        })
    }
}

struct EchoAgent;

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run(&self, message: &str, _account_id: &str) -> Result<AgentRun> {
        Ok(AgentRun {
            run_id: "run_1".to_string(),
            message: format!("echo: {message}"),
            follow_up_question: None,
            requires_approval: None,
        })
    }
}

fn create_test_config() -> Config {
    let mut config = Config::default();
    config.auth.token = Some(TOKEN.to_string());
    config.sms.auth_token = Some(AUTH_TOKEN.to_string());
    config.sms.public_url = Some(PUBLIC_URL.to_string());
    config.sms.from_number = Some("+15559990000".to_string());
    config
}

async fn create_test_app(config: Config) -> (AppState, Router, Arc<RecordingTransport>, TempDir) {
    sqlx::any::install_default_drivers();
    let temp_dir = TempDir::new().unwrap();
    let db_url = format!("sqlite://{}?mode=rwc", temp_dir.path().join("test.db").to_string_lossy());
    let pool = AnyPool::connect(&db_url).await.unwrap();
    let kind = DbKind::Sqlite;
    db::init_db(&pool, kind).await.unwrap();
    db::upsert_phone_link(
        &pool,
        kind,
        &PhoneLinkRecord {
            phone_number: LINKED.to_string(),
            account_id: "acct_1".to_string(),
            autopilot: false,
            verified_at: Utc::now(),
        },
    )
    .await
    .unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let state = AppState::new(config, pool, kind, transport.clone(), Arc::new(EchoAgent));
    let app = router(state.clone());
    (state, app, transport, temp_dir)
}

fn signed_request(form: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(WEBHOOK)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(form.to_string())).unwrap()
}

fn sign(form: &str) -> String {
    let params: Vec<(String, String)> = serde_urlencoded::from_str(form).unwrap();
    compute_signature(AUTH_TOKEN, &format!("{PUBLIC_URL}{WEBHOOK}"), &params).unwrap()
}

fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(AUTH_HEADER, TOKEN)
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, app, _transport, _dir) = create_test_app(create_test_config()).await;
    let resp = app
        .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_authed_routes_require_token() {
    let (_state, app, _transport, _dir) = create_test_app(create_test_config()).await;

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/accounts/acct_1/threads")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(authed("GET", "/v1/accounts/acct_1/threads", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!([]));
}

#[tokio::test]
async fn test_signed_webhook_replies_with_twiml() {
    let (_state, app, transport, _dir) = create_test_app(create_test_config()).await;
    let form = "MessageSid=SM100&From=%2B15550001111&To=%2B15559990000&Body=Add+John+Smith+as+a+lead";

    let resp = app
        .clone()
        .oneshot(signed_request(form, Some(sign(form))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "text/xml");
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], EMPTY_TWIML.as_bytes());

    assert_eq!(
        transport.sent.lock().unwrap().clone(),
        vec![(LINKED.to_string(), "echo: Add John Smith as a lead".to_string())]
    );

    let resp = app.oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap()).await.unwrap();
    let status = body_json(resp).await;
    assert_eq!(status["conversations"], 1);
    assert_eq!(status["turns"], 2);
    assert_eq!(status["sms_messages"], 2);
    assert_eq!(status["threads"], 1);
}

#[tokio::test]
async fn test_bad_signature_rejected() {
    let (_state, app, transport, _dir) = create_test_app(create_test_config()).await;
    let form = "MessageSid=SM100&From=%2B15550001111&Body=hello";
    let tampered = "MessageSid=SM100&From=%2B15550001111&Body=goodbye";

    let resp = app
        .clone()
        .oneshot(signed_request(tampered, Some(sign(form))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app.oneshot(signed_request(form, None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_fails_closed_without_public_url() {
    let mut config = create_test_config();
    config.sms.public_url = None;
    let (_state, app, transport, _dir) = create_test_app(config).await;
    let form = "MessageSid=SM100&From=%2B15550001111&Body=hello";

    let resp = app.oneshot(signed_request(form, Some(sign(form)))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_incomplete_payload_acknowledged() {
    let (state, app, transport, _dir) = create_test_app(create_test_config()).await;
    let form = "Body=no+sender+here";

    let resp = app.oneshot(signed_request(form, Some(sign(form)))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(transport.sent.lock().unwrap().is_empty());
    assert_eq!(db::count_rows(&state.pool, "sms_messages").await.unwrap(), 0);
}

#[tokio::test]
async fn test_unsigned_webhook_when_validation_disabled() {
    let mut config = create_test_config();
    config.sms.validate_signatures = false;
    let (_state, app, transport, _dir) = create_test_app(config).await;

    let resp = app
        .oneshot(signed_request("MessageSid=SM7&From=%2B15552223333&Body=hi", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let sent = transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+15552223333");
}

#[tokio::test]
async fn test_thread_read_and_patch() {
    let (_state, app, _transport, _dir) = create_test_app(create_test_config()).await;
    let form = "MessageSid=SM200&From=%2B15550001111&Body=hello";
    app.clone()
        .oneshot(signed_request(form, Some(sign(form))))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(authed("GET", "/v1/accounts/acct_1/threads", None))
        .await
        .unwrap();
    let threads = body_json(resp).await;
    assert_eq!(threads.as_array().unwrap().len(), 1);
    let thread_id = threads[0]["id"].as_str().unwrap().to_string();
    assert_eq!(threads[0]["address"], LINKED);

    let resp = app
        .clone()
        .oneshot(authed("GET", &format!("/v1/threads/{thread_id}/messages"), None))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);

    let resp = app
        .clone()
        .oneshot(authed(
            "PATCH",
            &format!("/v1/threads/{thread_id}"),
            Some(json!({"status": "archived", "assigned_to": "agent_7", "is_read": false})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let patched = body_json(resp).await;
    assert_eq!(patched["status"], "archived");
    assert_eq!(patched["assigned_to"], "agent_7");
    assert_eq!(patched["is_read"], false);

    let resp = app
        .clone()
        .oneshot(authed("PATCH", &format!("/v1/threads/{thread_id}"), Some(json!({"status": "deleted"}))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(authed("GET", "/v1/threads/does-not-exist", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_phone_link_then_turns() {
    let (_state, app, transport, _dir) = create_test_app(create_test_config()).await;

    let resp = app
        .clone()
        .oneshot(authed(
            "PUT",
            "/v1/phone-links",
            Some(json!({"phone_number": "+15554443333", "account_id": "acct_9"})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let form = "MessageSid=SM300&From=%2B15554443333&Body=what+is+on+today";
    app.clone()
        .oneshot(signed_request(form, Some(sign(form))))
        .await
        .unwrap();
    assert_eq!(
        transport.sent.lock().unwrap().last().unwrap().1,
        "echo: what is on today"
    );

    let resp = app
        .clone()
        .oneshot(authed("GET", "/v1/accounts/acct_9/turns?limit=10", None))
        .await
        .unwrap();
    let turns = body_json(resp).await;
    let turns = turns.as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert!(turns.iter().any(|t| t["role"] == "assistant"));

    let resp = app
        .oneshot(authed("PUT", "/v1/phone-links", Some(json!({"phone_number": " ", "account_id": "acct_9"}))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_web_turns_feed_sms_context() {
    let (_state, app, transport, _dir) = create_test_app(create_test_config()).await;

    let resp = app
        .clone()
        .oneshot(authed(
            "POST",
            "/v1/accounts/acct_1/turns",
            Some(json!({"channel": "web", "role": "user", "content": "Show my pipeline"})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let recorded = body_json(resp).await;
    assert_eq!(recorded["conversation"]["channel"], "web");
    assert_eq!(recorded["turn"]["role"], "user");
    assert_eq!(recorded["turn"]["run_id"], Value::Null);

    let resp = app
        .clone()
        .oneshot(authed(
            "POST",
            "/v1/accounts/acct_1/turns",
            Some(json!({"channel": "web", "role": "assistant", "content": "Pipeline: 4 deals", "run_id": "run_web"})),
        ))
        .await
        .unwrap();
    let second = body_json(resp).await;
    assert_eq!(second["conversation"]["id"], recorded["conversation"]["id"]);
    assert_eq!(second["turn"]["turn_index"], 2);

    let form = "MessageSid=SM400&From=%2B15550001111&Body=which+closes+first";
    app.clone()
        .oneshot(signed_request(form, Some(sign(form))))
        .await
        .unwrap();
    let reply = transport.sent.lock().unwrap().last().unwrap().1.clone();
    assert!(reply.contains("Recent web conversation (separate channel):"));
    assert!(reply.contains("Assistant: Pipeline: 4 deals"));
    assert!(reply.ends_with("which closes first"));
}

#[tokio::test]
async fn test_turn_write_validates_input() {
    let (_state, app, _transport, _dir) = create_test_app(create_test_config()).await;

    for body in [
        json!({"channel": "fax", "role": "user", "content": "hi"}),
        json!({"channel": "web", "role": "system", "content": "hi"}),
        json!({"channel": "web", "role": "user", "content": "   "}),
    ] {
        let resp = app
            .clone()
            .oneshot(authed("POST", "/v1/accounts/acct_1/turns", Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
    }

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/accounts/acct_1/turns")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"channel": "web", "role": "user", "content": "hi"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_status_surfaces_storage_errors() {
    let (state, app, _transport, _dir) = create_test_app(create_test_config()).await;
    sqlx::query("DROP TABLE inbox_threads").execute(&state.pool).await.unwrap();

    let resp = app
        .oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
