//! Inbound SMS orchestration: identity, quota, windowed capture, inbox
//! indexing, command or agent reply, dispatch. Everything past signature
//! validation ends in an acknowledgment; failures become a channel reply.

use crate::agent::{AgentGateway, AgentReply, AgentRunner};
use crate::channels::sms::SmsTransport;
use crate::commands;
use crate::config::Config;
use crate::context::{self, ContextLimits, ContextRequest};
use crate::conversation::ConversationWindow;
use crate::db::{self, ConversationRecord, DbKind, SmsMessageRecord, TurnRecord};
use crate::dispatch::{OutboundDispatcher, OutboundReply};
use crate::error::InboxError;
use crate::identity::{self, Identity};
use crate::threads::{ThreadMessage, ThreadStore};
use crate::types::{Channel, Direction, InboundSms, Role};
use crate::usage::UsageGovernor;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const ONBOARDING_REPLY: &str = "Hi! This number isn't linked to an account yet. \
Sign in to the app and verify your phone number in Settings to start texting your assistant.";

pub const RATE_LIMIT_REPLY: &str =
    "You've reached your assistant usage limit for now. Please try again later.";

pub const APOLOGY_REPLY: &str =
    "Sorry, something went wrong on our end. Please try again shortly.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Provider redelivered a message that was already captured.
    Duplicate,
    UnknownSender,
    RateLimited,
    Replied {
        conversation_id: String,
        run_id: Option<String>,
        command: bool,
    },
    /// Unexpected failure; an apology send was attempted.
    Failed,
}

enum Capture {
    Fresh(ConversationRecord, TurnRecord),
    Duplicate,
}

#[derive(Clone)]
pub struct InboxPipeline {
    pool: AnyPool,
    kind: DbKind,
    window: ConversationWindow,
    limits: ContextLimits,
    governor: UsageGovernor,
    agent: AgentGateway,
    dispatcher: OutboundDispatcher,
    threads: ThreadStore,
    from_number: Option<String>,
}

impl InboxPipeline {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        config: &Config,
        transport: Arc<dyn SmsTransport>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let window = ConversationWindow::from_minutes(config.conversation.window_minutes);
        Self {
            governor: UsageGovernor::new(pool.clone(), kind, config.usage.clone()),
            agent: AgentGateway::new(runner),
            dispatcher: OutboundDispatcher::new(
                pool.clone(),
                kind,
                transport,
                window,
                config.sms.from_number.clone(),
            ),
            threads: ThreadStore::new(pool.clone(), kind),
            limits: ContextLimits {
                history_turns: config.conversation.history_limit.max(0),
                cross_channel_turns: config.conversation.cross_channel_limit.max(0),
            },
            from_number: config.sms.from_number.clone(),
            window,
            pool,
            kind,
        }
    }

    pub fn window(&self) -> ConversationWindow {
        self.window
    }

    /// Never fails; unexpected errors trigger one best-effort apology.
    pub async fn process(&self, inbound: &InboundSms, now: DateTime<Utc>) -> InboundOutcome {
        match self.try_process(inbound, now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    provider_message_id = %inbound.provider_message_id,
                    error = %err,
                    "inbound sms handling failed"
                );
                if let Err(send_err) = self.dispatcher.send_plain(&inbound.from, APOLOGY_REPLY).await {
                    debug!(error = %send_err, "apology send failed");
                }
                InboundOutcome::Failed
            }
        }
    }

    async fn try_process(&self, inbound: &InboundSms, now: DateTime<Utc>) -> Result<InboundOutcome, InboxError> {
        if db::sms_message_exists(&self.pool, self.kind, &inbound.provider_message_id)
            .await
            .map_err(InboxError::Storage)?
        {
            info!(provider_message_id = %inbound.provider_message_id, "duplicate inbound sms ignored");
            return Ok(InboundOutcome::Duplicate);
        }

        let link = match identity::resolve(&self.pool, self.kind, Channel::Sms, &inbound.from)
            .await
            .map_err(InboxError::Storage)?
        {
            Identity::Account(link) => link,
            Identity::Unknown => {
                info!(provider_message_id = %inbound.provider_message_id, "sms from unknown sender");
                if !self
                    .log_uncaptured(None, inbound, now)
                    .await
                    .map_err(InboxError::Storage)?
                {
                    return Ok(InboundOutcome::Duplicate);
                }
                self.dispatcher
                    .send_plain(&inbound.from, ONBOARDING_REPLY)
                    .await
                    .map_err(InboxError::Send)?;
                return Ok(InboundOutcome::UnknownSender);
            }
        };
        let account_id = link.account_id.as_str();

        let command_reply = commands::intercept(&inbound.body);
        if command_reply.is_none() {
            let decision = self
                .governor
                .check_rate_limit(account_id, now)
                .await
                .map_err(InboxError::Storage)?;
            if !decision.allowed {
                info!(account_id, used = decision.used, limit = decision.limit, "agent quota exhausted");
                if !self
                    .log_uncaptured(Some(account_id), inbound, now)
                    .await
                    .map_err(InboxError::Storage)?
                {
                    return Ok(InboundOutcome::Duplicate);
                }
                self.dispatcher
                    .send_plain(&inbound.from, RATE_LIMIT_REPLY)
                    .await
                    .map_err(InboxError::Send)?;
                return Ok(InboundOutcome::RateLimited);
            }
        }

        let (conversation, user_turn) = match self
            .capture_inbound(account_id, inbound, now)
            .await
            .map_err(InboxError::Storage)?
        {
            Capture::Fresh(conversation, turn) => (conversation, turn),
            Capture::Duplicate => {
                info!(provider_message_id = %inbound.provider_message_id, "inbound sms captured concurrently");
                return Ok(InboundOutcome::Duplicate);
            }
        };

        self.index_inbound(account_id, inbound, now).await;

        let (reply, command) = match command_reply {
            Some(text) => (
                AgentReply {
                    text: text.to_string(),
                    run_id: None,
                },
                true,
            ),
            None => (self.ask_agent(account_id, &conversation, &user_turn, inbound, now).await?, false),
        };

        self.dispatcher
            .deliver_reply(OutboundReply {
                conversation: &conversation,
                to: &inbound.from,
                body: &reply.text,
                run_id: reply.run_id.as_deref(),
                now,
            })
            .await
            .map_err(InboxError::Send)?;

        Ok(InboundOutcome::Replied {
            conversation_id: conversation.id,
            run_id: reply.run_id,
            command,
        })
    }

    fn raw_inbound(
        &self,
        account_id: Option<&str>,
        conversation_id: Option<&str>,
        inbound: &InboundSms,
        now: DateTime<Utc>,
    ) -> SmsMessageRecord {
        SmsMessageRecord {
            id: Uuid::new_v4().to_string(),
            provider_message_id: inbound.provider_message_id.clone(),
            direction: Direction::Inbound.as_str().to_string(),
            account_id: account_id.map(str::to_string),
            conversation_id: conversation_id.map(str::to_string),
            from_number: inbound.from.clone(),
            to_number: inbound.to.clone().or_else(|| self.from_number.clone()),
            body: inbound.body.clone(),
            run_id: None,
            created_at: now,
        }
    }

    /// Logs a message that gets a canned reply without entering a conversation,
    /// so a redelivery is caught by the dedupe check. False if already logged.
    async fn log_uncaptured(
        &self,
        account_id: Option<&str>,
        inbound: &InboundSms,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let raw = self.raw_inbound(account_id, None, inbound, now);
        let mut conn = self.pool.acquire().await?;
        db::insert_sms_message(&mut conn, self.kind, &raw).await
    }

    /// Raw message, window lookup/creation, user turn and activity bump, all or nothing.
    async fn capture_inbound(&self, account_id: &str, inbound: &InboundSms, now: DateTime<Utc>) -> anyhow::Result<Capture> {
        let mut tx = self.pool.begin().await?;
        let conversation = self
            .window
            .open_or_extend(&mut tx, self.kind, account_id, Channel::Sms, now)
            .await?;

        let raw = self.raw_inbound(Some(account_id), Some(&conversation.id), inbound, now);
        if !db::insert_sms_message(&mut tx, self.kind, &raw).await? {
            tx.rollback().await?;
            return Ok(Capture::Duplicate);
        }

        let turn = self
            .window
            .append_turn(&mut tx, self.kind, &conversation, Role::User, &inbound.body, None, now)
            .await?;
        tx.commit().await?;

        debug!(
            account_id,
            conversation_id = %conversation.id,
            provider_message_id = %inbound.provider_message_id,
            "inbound sms captured"
        );
        Ok(Capture::Fresh(conversation, turn))
    }

    /// Secondary index; failures are logged and never abort the pipeline.
    async fn index_inbound(&self, account_id: &str, inbound: &InboundSms, now: DateTime<Utc>) {
        let to = inbound.to.as_deref().or(self.from_number.as_deref());
        let message = ThreadMessage {
            channel: Channel::Sms,
            direction: Direction::Inbound,
            counterparty: &inbound.from,
            from_address: &inbound.from,
            to_address: to,
            body: &inbound.body,
            provider_message_id: &inbound.provider_message_id,
            run_id: None,
            account_id: Some(account_id),
        };
        if let Err(err) = self.threads.record(&message, now).await {
            warn!(
                account_id,
                provider_message_id = %inbound.provider_message_id,
                error = %err,
                "inbox thread update failed for inbound sms"
            );
        }
    }

    async fn ask_agent(
        &self,
        account_id: &str,
        conversation: &ConversationRecord,
        user_turn: &TurnRecord,
        inbound: &InboundSms,
        now: DateTime<Utc>,
    ) -> Result<AgentReply, InboxError> {
        let prompt = context::assemble(
            &self.pool,
            self.kind,
            &self.window,
            self.limits,
            ContextRequest {
                account_id,
                channel: Channel::Sms,
                conversation_id: &conversation.id,
                current_turn_id: &user_turn.id,
                message: &inbound.body,
                now,
            },
        )
        .await
        .map_err(InboxError::Storage)?;

        let reply = self.agent.run_agent(&prompt, account_id).await;
        if let Some(run_id) = reply.run_id.as_deref() {
            if let Err(err) = self
                .governor
                .record_usage(account_id, self.governor.cost_per_run(), Some(run_id), now)
                .await
            {
                warn!(account_id, run_id, error = %err, "usage record failed; delivering reply anyway");
            }
        }
        Ok(reply)
    }
}
