//! Conversation windowing.
//!
//! A conversation for one (account, channel) pair stays active while its
//! last activity is within the inactivity window. Expiry is never written
//! down; the next lookup simply finds no active row and opens a new one.

use crate::db::{self, ConversationRecord, DbKind, TurnRecord};
use crate::types::{Channel, Role};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::AnyConnection;
use sqlx::AnyPool;
use uuid::Uuid;

pub const DEFAULT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct ConversationWindow {
    pub inactivity: Duration,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::from_minutes(DEFAULT_WINDOW_MINUTES)
    }
}

impl ConversationWindow {
    pub fn from_minutes(minutes: i64) -> Self {
        Self {
            inactivity: Duration::minutes(minutes.max(1)),
        }
    }

    pub fn active_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.inactivity
    }

    /// Must run inside the caller's transaction; takes the (account, channel) lock first.
    pub async fn open_or_extend(
        &self,
        conn: &mut AnyConnection,
        kind: DbKind,
        account_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<ConversationRecord> {
        db::lock_conversation_slot(&mut *conn, kind, account_id, channel.as_str(), now).await?;

        if let Some(active) =
            db::find_active_conversation(&mut *conn, kind, account_id, channel.as_str(), self.active_since(now)).await?
        {
            return Ok(active);
        }

        let record = ConversationRecord {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            channel: channel.as_str().to_string(),
            created_at: now,
            last_activity_at: now,
        };
        db::insert_conversation(&mut *conn, kind, &record).await?;
        tracing::debug!(
            account_id,
            channel = channel.as_str(),
            conversation_id = %record.id,
            "opened conversation"
        );
        Ok(record)
    }

    /// Appends a turn and bumps the conversation's last activity.
    pub async fn append_turn(
        &self,
        conn: &mut AnyConnection,
        kind: DbKind,
        conversation: &ConversationRecord,
        role: Role,
        content: &str,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TurnRecord> {
        let turn_index = db::next_turn_index(&mut *conn, kind, &conversation.id).await?;
        let turn = TurnRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            account_id: conversation.account_id.clone(),
            channel: conversation.channel.clone(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            run_id: run_id.map(str::to_string),
            turn_index,
            created_at: now,
        };
        db::insert_turn(&mut *conn, kind, &turn).await?;
        db::touch_conversation(&mut *conn, kind, &conversation.id, now).await?;
        Ok(turn)
    }

    /// Standalone entry point for channels without a raw message log of their own (e.g. web chat).
    pub async fn record_turn(
        &self,
        pool: &AnyPool,
        kind: DbKind,
        account_id: &str,
        channel: Channel,
        role: Role,
        content: &str,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(ConversationRecord, TurnRecord)> {
        let mut tx = pool.begin().await?;
        let conversation = self.open_or_extend(&mut tx, kind, account_id, channel, now).await?;
        let turn = self
            .append_turn(&mut tx, kind, &conversation, role, content, run_id, now)
            .await?;
        tx.commit().await?;
        Ok((conversation, turn))
    }
}
