use crate::channels::sms::SmsTransport;
use crate::conversation::ConversationWindow;
use crate::db::{self, ConversationRecord, DbKind, SmsMessageRecord, TurnRecord};
use crate::threads::{ThreadMessage, ThreadStore};
use crate::types::{Channel, Direction, Role, SendReceipt};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const ELLIPSIS: &str = "...";

/// Cuts `body` to at most `max_chars` characters, ending in the ellipsis when anything was dropped.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.chars().count());
    let mut out: String = body.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

pub fn truncate_for_channel(body: &str, channel: Channel) -> String {
    match channel.max_body_chars() {
        Some(max) => truncate_body(body, max),
        None => body.to_string(),
    }
}

/// A reply that belongs to an active conversation and must be recorded after sending.
#[derive(Debug, Clone)]
pub struct OutboundReply<'a> {
    pub conversation: &'a ConversationRecord,
    pub to: &'a str,
    pub body: &'a str,
    pub run_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeliveredReply {
    pub receipt: SendReceipt,
    pub turn: TurnRecord,
    pub body: String,
}

#[derive(Clone)]
pub struct OutboundDispatcher {
    pool: AnyPool,
    kind: DbKind,
    transport: Arc<dyn SmsTransport>,
    window: ConversationWindow,
    threads: ThreadStore,
    from_number: Option<String>,
}

impl OutboundDispatcher {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        transport: Arc<dyn SmsTransport>,
        window: ConversationWindow,
        from_number: Option<String>,
    ) -> Self {
        let threads = ThreadStore::new(pool.clone(), kind);
        Self {
            pool,
            kind,
            transport,
            window,
            threads,
            from_number,
        }
    }

    /// Truncates and sends without touching any conversation.
    pub async fn send_plain(&self, to: &str, body: &str) -> Result<SendReceipt> {
        let body = truncate_for_channel(body, Channel::Sms);
        self.transport.send(to, &body).await
    }

    /// Sends, then records the assistant turn and raw outbound message in one transaction.
    pub async fn deliver_reply(&self, reply: OutboundReply<'_>) -> Result<DeliveredReply> {
        let body = truncate_for_channel(reply.body, Channel::Sms);
        let receipt = self.transport.send(reply.to, &body).await?;
        let conversation = reply.conversation;

        let mut tx = self.pool.begin().await?;
        db::lock_conversation_slot(&mut tx, self.kind, &conversation.account_id, &conversation.channel, reply.now)
            .await?;
        let turn = self
            .window
            .append_turn(&mut tx, self.kind, conversation, Role::Assistant, &body, reply.run_id, reply.now)
            .await?;
        let raw = SmsMessageRecord {
            id: Uuid::new_v4().to_string(),
            provider_message_id: receipt.provider_message_id.clone(),
            direction: Direction::Outbound.as_str().to_string(),
            account_id: Some(conversation.account_id.clone()),
            conversation_id: Some(conversation.id.clone()),
            from_number: self.from_number.clone().unwrap_or_default(),
            to_number: Some(reply.to.to_string()),
            body: body.clone(),
            run_id: reply.run_id.map(str::to_string),
            created_at: reply.now,
        };
        if !db::insert_sms_message(&mut tx, self.kind, &raw).await? {
            warn!(provider_message_id = %raw.provider_message_id, "outbound sms already recorded");
        }
        tx.commit().await?;

        info!(
            account_id = %conversation.account_id,
            conversation_id = %conversation.id,
            provider_message_id = %receipt.provider_message_id,
            run_id = reply.run_id.unwrap_or("-"),
            "reply delivered"
        );

        let from = self.from_number.as_deref().unwrap_or_default();
        let indexed = ThreadMessage {
            channel: Channel::Sms,
            direction: Direction::Outbound,
            counterparty: reply.to,
            from_address: from,
            to_address: Some(reply.to),
            body: &body,
            provider_message_id: &receipt.provider_message_id,
            run_id: reply.run_id,
            account_id: Some(&conversation.account_id),
        };
        if let Err(err) = self.threads.record(&indexed, reply.now).await {
            warn!(error = %err, "inbox thread update failed for outbound sms");
        }

        Ok(DeliveredReply { receipt, turn, body })
    }
}
