use crate::db::{self, DbKind, InboxMessageRecord, ThreadRecord};
use crate::types::{Channel, Direction, ThreadStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 160;

/// One message headed for the channel-agnostic inbox.
#[derive(Debug, Clone)]
pub struct ThreadMessage<'a> {
    pub channel: Channel,
    pub direction: Direction,
    /// The counterparty address the thread is keyed on.
    pub counterparty: &'a str,
    pub from_address: &'a str,
    pub to_address: Option<&'a str>,
    pub body: &'a str,
    pub provider_message_id: &'a str,
    pub run_id: Option<&'a str>,
    pub account_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct ThreadStore {
    pool: AnyPool,
    kind: DbKind,
}

impl ThreadStore {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    /// Reuses the (channel, address) thread, refreshing its metadata, or opens a new one.
    pub async fn find_or_create_thread(
        &self,
        channel: Channel,
        address: &str,
        direction: Direction,
        account_id: Option<&str>,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let fresh = ThreadRecord {
            id: Uuid::new_v4().to_string(),
            channel: channel.as_str().to_string(),
            address: address.to_string(),
            account_id: account_id.map(str::to_string),
            contact_id: None,
            status: ThreadStatus::Open.as_str().to_string(),
            is_read: direction == Direction::Outbound,
            assigned_to: None,
            last_message_at: now,
            last_message_preview: Some(preview(body)),
            created_at: now,
            updated_at: now,
        };
        db::insert_thread_if_absent(&self.pool, self.kind, &fresh).await?;

        let mut thread = db::find_thread(&self.pool, self.kind, channel.as_str(), address)
            .await?
            .ok_or_else(|| anyhow!("inbox thread vanished for {channel}:{address}"))?;
        if thread.id != fresh.id {
            refresh(&mut thread, direction, account_id, body, now);
            db::update_thread(&self.pool, self.kind, &thread).await?;
        }
        Ok(thread.id)
    }

    /// Idempotent on (channel, provider message id); a repeat returns the original id.
    pub async fn record_message(&self, thread_id: &str, message: &ThreadMessage<'_>, now: DateTime<Utc>) -> Result<String> {
        let record = InboxMessageRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            direction: message.direction.as_str().to_string(),
            channel: message.channel.as_str().to_string(),
            from_address: message.from_address.to_string(),
            to_address: message.to_address.map(str::to_string),
            body: message.body.to_string(),
            provider_message_id: message.provider_message_id.to_string(),
            run_id: message.run_id.map(str::to_string),
            created_at: now,
        };
        if db::insert_inbox_message_if_absent(&self.pool, self.kind, &record).await? {
            return Ok(record.id);
        }
        db::find_inbox_message_id(
            &self.pool,
            self.kind,
            message.channel.as_str(),
            message.provider_message_id,
        )
        .await?
        .ok_or_else(|| anyhow!("inbox message {} conflicted but was not found", message.provider_message_id))
    }

    /// Thread upsert followed by the idempotent message insert.
    pub async fn record(&self, message: &ThreadMessage<'_>, now: DateTime<Utc>) -> Result<(String, String)> {
        let thread_id = self
            .find_or_create_thread(
                message.channel,
                message.counterparty,
                message.direction,
                message.account_id,
                message.body,
                now,
            )
            .await?;
        let message_id = self.record_message(&thread_id, message, now).await?;
        Ok((thread_id, message_id))
    }
}

fn refresh(thread: &mut ThreadRecord, direction: Direction, account_id: Option<&str>, body: &str, now: DateTime<Utc>) {
    if thread.account_id.is_none() {
        thread.account_id = account_id.map(str::to_string);
    }
    match direction {
        Direction::Inbound => {
            thread.is_read = false;
            if thread.status == ThreadStatus::Archived.as_str() {
                thread.status = ThreadStatus::Open.as_str().to_string();
            }
        }
        Direction::Outbound => thread.is_read = true,
    }
    if now >= thread.last_message_at {
        thread.last_message_at = now;
        thread.last_message_preview = Some(preview(body));
    }
    thread.updated_at = now;
}

pub fn preview(body: &str) -> String {
    body.trim().chars().take(PREVIEW_CHARS).collect()
}
