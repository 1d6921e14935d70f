use crate::conversation::ConversationWindow;
use crate::db::{self, DbKind, TurnRecord};
use crate::types::{Channel, Role};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;

#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub history_turns: i64,
    pub cross_channel_turns: i64,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            history_turns: 20,
            cross_channel_turns: 10,
        }
    }
}

/// Where the new message sits: the active conversation and the turn just written for it.
#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    pub account_id: &'a str,
    pub channel: Channel,
    pub conversation_id: &'a str,
    pub current_turn_id: &'a str,
    pub message: &'a str,
    pub now: DateTime<Utc>,
}

pub async fn assemble(
    pool: &AnyPool,
    kind: DbKind,
    window: &ConversationWindow,
    limits: ContextLimits,
    req: ContextRequest<'_>,
) -> Result<String> {
    // One extra row so the limit still holds after the current turn is dropped.
    let history: Vec<TurnRecord> =
        db::list_conversation_turns(pool, kind, req.conversation_id, limits.history_turns + 1)
            .await?
            .into_iter()
            .filter(|turn| turn.id != req.current_turn_id)
            .collect();
    let other = db::list_other_channel_turns(
        pool,
        kind,
        req.account_id,
        req.channel.as_str(),
        window.active_since(req.now),
        limits.cross_channel_turns,
    )
    .await?;

    Ok(render(req.channel, &history, &other, req.message))
}

/// Prefix of labeled history blocks followed by the literal message; the bare message when there is no history.
pub fn render(channel: Channel, history: &[TurnRecord], other_channels: &[TurnRecord], message: &str) -> String {
    if history.is_empty() && other_channels.is_empty() {
        return message.to_string();
    }

    let mut out = String::new();
    if !history.is_empty() {
        out.push_str(&format!("Conversation so far ({channel}):\n"));
        push_turns(&mut out, history.iter());
        out.push('\n');
    }

    let mut seen: Vec<&str> = Vec::new();
    for turn in other_channels {
        if !seen.contains(&turn.channel.as_str()) {
            seen.push(turn.channel.as_str());
        }
    }
    for other in seen {
        out.push_str(&format!("Recent {other} conversation (separate channel):\n"));
        push_turns(&mut out, other_channels.iter().filter(|t| t.channel == other));
        out.push('\n');
    }

    out.push_str(&format!("New {channel} message:\n"));
    out.push_str(message);
    out
}

fn push_turns<'a>(out: &mut String, turns: impl Iterator<Item = &'a TurnRecord>) {
    for turn in turns {
        let label = turn.role.parse::<Role>().map(|r| r.label()).unwrap_or("User");
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&turn.content);
        out.push('\n');
    }
}
