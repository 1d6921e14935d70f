pub mod agent;
pub mod channels;
pub mod commands;
pub mod config;
pub mod context;
pub mod conversation;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod threads;
pub mod types;
pub mod usage;

pub use config::Config;

use self::agent::{AgentRunner, HttpAgentRunner};
use self::channels::sms::{self as sms_channel, SmsTransport, TwilioTransport};
use self::config::{resolve_database_url, SmsConfig};
use self::db::{DbKind, PhoneLinkRecord};
use self::error::InboxError;
use self::pipeline::InboxPipeline;
use self::types::{Channel, Role, ThreadStatus};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const AUTH_HEADER: &str = "X-Inbox-Token";

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub pipeline: Arc<InboxPipeline>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: AnyPool,
        db_kind: DbKind,
        transport: Arc<dyn SmsTransport>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let pipeline = InboxPipeline::new(pool.clone(), db_kind, &config, transport, runner);
        Self {
            config,
            pool,
            db_kind,
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub conversations: i64,
    pub turns: i64,
    pub sms_messages: i64,
    pub threads: i64,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    fn bounds(&self, default_limit: i64) -> (i64, i64) {
        let limit = self.limit.unwrap_or(default_limit).clamp(1, 500);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Deserialize)]
pub struct ThreadPatch {
    pub status: Option<String>,
    pub is_read: Option<bool>,
    pub assigned_to: Option<String>,
}

/// A turn captured by another surface (web chat, email) for cross-channel context.
#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub channel: String,
    pub role: String,
    pub content: String,
    pub run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PhoneLinkRequest {
    pub phone_number: String,
    pub account_id: String,
    #[serde(default)]
    pub autopilot: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Connects storage from config and wires the live provider and agent clients.
pub async fn create_app(config: Config) -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.agent.timeout_seconds.max(1)))
        .build()?;
    let transport: Arc<dyn SmsTransport> = Arc::new(TwilioTransport::new(http.clone(), &config.sms));
    let runner: Arc<dyn AgentRunner> = Arc::new(HttpAgentRunner::new(http, &config.agent));

    if config.sms.validate_signatures && config.sms.signed_webhook_url().is_none() {
        warn!("sms signature validation is on but public_url is unset; inbound sms will be rejected");
    }

    let state = AppState::new(config, pool, db_kind, transport, runner);
    let app = router(state.clone());
    Ok((state, app))
}

pub fn router(state: AppState) -> Router {
    let authed_routes = Router::new()
        .route("/v1/accounts/:account_id/threads", get(list_threads))
        .route("/v1/accounts/:account_id/turns", get(list_turns).post(record_turn))
        .route("/v1/threads/:thread_id", get(get_thread).patch(patch_thread))
        .route("/v1/threads/:thread_id/messages", get(list_thread_messages))
        .route("/v1/phone-links", put(put_phone_link))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route(&state.config.sms.webhook_path, post(sms_inbound));

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> Response {
    match collect_status(&state.pool).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => storage_failure("status error", err),
    }
}

async fn collect_status(pool: &AnyPool) -> anyhow::Result<StatusResponse> {
    Ok(StatusResponse {
        conversations: db::count_rows(pool, "conversations").await?,
        turns: db::count_rows(pool, "conversation_turns").await?,
        sms_messages: db::count_rows(pool, "sms_messages").await?,
        threads: db::count_rows(pool, "inbox_threads").await?,
    })
}

fn twiml_ack() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        sms_channel::EMPTY_TWIML,
    )
        .into_response()
}

/// Rejects unsigned or mis-signed callbacks. Missing credentials fail closed.
fn verify_webhook(sms: &SmsConfig, headers: &HeaderMap, params: &[(String, String)]) -> Result<(), InboxError> {
    if !sms.validate_signatures {
        return Ok(());
    }
    let (Some(auth_token), Some(url)) = (sms.auth_token.as_deref(), sms.signed_webhook_url()) else {
        return Err(InboxError::SigningNotConfigured);
    };
    let signature = headers
        .get(sms_channel::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(InboxError::InvalidSignature)?;
    if sms_channel::verify_signature(auth_token, &url, params, signature) {
        Ok(())
    } else {
        Err(InboxError::InvalidSignature)
    }
}

async fn sms_inbound(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let params: Vec<(String, String)> = match serde_urlencoded::from_bytes(&body) {
        Ok(params) => params,
        Err(err) => {
            warn!(error = %err, "malformed sms webhook body");
            return InboxError::Malformed(err.to_string()).into_response();
        }
    };

    if let Err(err) = verify_webhook(&state.config.sms, &headers, &params) {
        warn!(error = %err, "sms webhook rejected");
        return err.into_response();
    }

    let Some(inbound) = sms_channel::parse_inbound(&params) else {
        info!("sms webhook without sender or message id acknowledged");
        return twiml_ack();
    };

    let outcome = state.pipeline.process(&inbound, Utc::now()).await;
    info!(
        provider_message_id = %inbound.provider_message_id,
        outcome = ?outcome,
        "sms webhook handled"
    );
    twiml_ack()
}

fn storage_failure(context: &str, err: anyhow::Error) -> Response {
    error!("{context}: {err:?}");
    InboxError::Storage(err).into_response()
}

async fn list_threads(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Response {
    let (limit, offset) = page.bounds(50);
    match db::list_threads_for_account(&state.pool, state.db_kind, &account_id, limit, offset).await {
        Ok(threads) => Json(threads).into_response(),
        Err(err) => storage_failure("list_threads error", err),
    }
}

async fn get_thread(State(state): State<AppState>, Path(thread_id): Path<String>) -> Response {
    match db::get_thread(&state.pool, state.db_kind, &thread_id).await {
        Ok(Some(thread)) => Json(thread).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => storage_failure("get_thread error", err),
    }
}

async fn patch_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(patch): Json<ThreadPatch>,
) -> Response {
    let status = match patch.status.as_deref().map(ThreadStatus::from_str).transpose() {
        Ok(status) => status,
        Err(err) => return InboxError::Malformed(err.to_string()).into_response(),
    };

    let mut thread = match db::get_thread(&state.pool, state.db_kind, &thread_id).await {
        Ok(Some(thread)) => thread,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return storage_failure("patch_thread error", err),
    };
    if let Some(status) = status {
        thread.status = status.as_str().to_string();
    }
    if let Some(is_read) = patch.is_read {
        thread.is_read = is_read;
    }
    if let Some(assignee) = patch.assigned_to {
        let assignee = assignee.trim().to_string();
        thread.assigned_to = (!assignee.is_empty()).then_some(assignee);
    }
    thread.updated_at = Utc::now();

    match db::update_thread(&state.pool, state.db_kind, &thread).await {
        Ok(()) => Json(thread).into_response(),
        Err(err) => storage_failure("patch_thread error", err),
    }
}

async fn list_thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Response {
    let (limit, offset) = page.bounds(100);
    match db::list_thread_messages(&state.pool, state.db_kind, &thread_id, limit, offset).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => storage_failure("list_thread_messages error", err),
    }
}

async fn list_turns(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Response {
    let (limit, _) = page.bounds(50);
    match db::list_recent_turns(&state.pool, state.db_kind, &account_id, limit).await {
        Ok(turns) => Json(turns).into_response(),
        Err(err) => storage_failure("list_turns error", err),
    }
}

async fn record_turn(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(req): Json<TurnRequest>,
) -> Response {
    let channel = match Channel::from_str(&req.channel) {
        Ok(channel) => channel,
        Err(err) => return InboxError::Malformed(err.to_string()).into_response(),
    };
    let role = match Role::from_str(&req.role) {
        Ok(role) => role,
        Err(err) => return InboxError::Malformed(err.to_string()).into_response(),
    };
    let content = req.content.trim();
    if content.is_empty() {
        return InboxError::Malformed("content is required".to_string()).into_response();
    }
    let run_id = req.run_id.as_deref().map(str::trim).filter(|id| !id.is_empty());

    let window = state.pipeline.window();
    match window
        .record_turn(&state.pool, state.db_kind, &account_id, channel, role, content, run_id, Utc::now())
        .await
    {
        Ok((conversation, turn)) => {
            info!(
                account_id = %account_id,
                channel = channel.as_str(),
                conversation_id = %conversation.id,
                "turn recorded"
            );
            Json(json!({"conversation": conversation, "turn": turn})).into_response()
        }
        Err(err) => storage_failure("record_turn error", err),
    }
}

async fn put_phone_link(State(state): State<AppState>, Json(req): Json<PhoneLinkRequest>) -> Response {
    let phone_number = req.phone_number.trim().to_string();
    let account_id = req.account_id.trim().to_string();
    if phone_number.is_empty() || account_id.is_empty() {
        return InboxError::Malformed("phone_number and account_id are required".to_string()).into_response();
    }

    let record = PhoneLinkRecord {
        phone_number,
        account_id,
        autopilot: req.autopilot,
        verified_at: req.verified_at.unwrap_or_else(Utc::now),
    };
    match db::upsert_phone_link(&state.pool, state.db_kind, &record).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "linked", "link": record}))).into_response(),
        Err(err) => storage_failure("put_phone_link error", err),
    }
}
