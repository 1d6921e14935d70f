use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Usable SMS body length once room for the truncation marker is reserved.
pub const SMS_MAX_BODY_CHARS: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
    Voice,
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Voice => "voice",
            Channel::Web => "web",
        }
    }

    /// Hard ceiling on an outbound body for this channel, in characters.
    pub fn max_body_chars(&self) -> Option<usize> {
        match self {
            Channel::Sms => Some(SMS_MAX_BODY_CHARS),
            Channel::Email | Channel::Voice | Channel::Web => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            "voice" => Ok(Channel::Voice),
            "web" => Ok(Channel::Web),
            other => Err(anyhow::anyhow!("unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow::anyhow!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Open,
    Archived,
    Snoozed,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Open => "open",
            ThreadStatus::Archived => "archived",
            ThreadStatus::Snoozed => "snoozed",
        }
    }
}

impl FromStr for ThreadStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "open" => Ok(ThreadStatus::Open),
            "archived" => Ok(ThreadStatus::Archived),
            "snoozed" => Ok(ThreadStatus::Snoozed),
            other => Err(anyhow::anyhow!("unknown thread status: {other}")),
        }
    }
}

/// An inbound SMS as delivered by the provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSms {
    pub provider_message_id: String,
    pub from: String,
    pub to: Option<String>,
    pub body: String,
}

/// What the transport hands back after accepting a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

/// Structured result of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    #[serde(alias = "runId")]
    pub run_id: String,
    pub message: String,
    #[serde(default, alias = "followUpQuestion")]
    pub follow_up_question: Option<String>,
    #[serde(default, alias = "requiresApproval")]
    pub requires_approval: Option<bool>,
}
