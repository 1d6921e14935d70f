use crate::db::{self, DbKind, PhoneLinkRecord};
use crate::types::Channel;
use anyhow::Result;
use sqlx::AnyPool;

/// Outcome of mapping a raw channel address to an account.
#[derive(Debug, Clone)]
pub enum Identity {
    Account(PhoneLinkRecord),
    Unknown,
}

impl Identity {
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Identity::Account(link) => Some(link.account_id.as_str()),
            Identity::Unknown => None,
        }
    }
}

pub fn normalize_address(channel: Channel, address: &str) -> String {
    match channel {
        Channel::Email => address.trim().to_lowercase(),
        Channel::Sms | Channel::Voice | Channel::Web => address.trim().to_string(),
    }
}

pub async fn resolve(pool: &AnyPool, kind: DbKind, channel: Channel, address: &str) -> Result<Identity> {
    let address = normalize_address(channel, address);
    if address.is_empty() {
        return Ok(Identity::Unknown);
    }
    match channel {
        Channel::Sms | Channel::Voice => Ok(db::get_phone_link(pool, kind, &address)
            .await?
            .map(Identity::Account)
            .unwrap_or(Identity::Unknown)),
        // Only phone numbers carry a verified link today.
        Channel::Email | Channel::Web => Ok(Identity::Unknown),
    }
}
