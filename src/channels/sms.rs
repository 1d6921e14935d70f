use crate::config::SmsConfig;
use crate::types::{InboundSms, SendReceipt};
use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha1::Sha1;
use tracing::warn;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

/// Empty TwiML document; replies go out through the REST API instead.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

/// Outbound SMS capability.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<SendReceipt>;
}

/// Base64 HMAC-SHA1 over the webhook URL followed by every `key + value` pair sorted by key.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> Option<String> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut data = String::from(url);
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(data.as_bytes());
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(auth_token: &str, url: &str, params: &[(String, String)], signature: &str) -> bool {
    match compute_signature(auth_token, url, params) {
        Some(expected) => constant_time_eq(expected.as_bytes(), signature.trim().as_bytes()),
        None => {
            warn!("failed to create HMAC for sms signature");
            false
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// None when the sender or the provider message id is missing.
pub fn parse_inbound(params: &[(String, String)]) -> Option<InboundSms> {
    let from = param(params, "From")?;
    let provider_message_id = param(params, "MessageSid")
        .or_else(|| param(params, "SmsMessageSid"))
        .or_else(|| param(params, "SmsSid"))?;

    Some(InboundSms {
        provider_message_id: provider_message_id.to_string(),
        from: from.to_string(),
        to: param(params, "To").map(str::to_string),
        body: params
            .iter()
            .find(|(key, _)| key == "Body")
            .map(|(_, value)| value.clone())
            .unwrap_or_default(),
    })
}

pub struct TwilioTransport {
    client: Client,
    api_base: String,
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
}

impl TwilioTransport {
    pub fn new(client: Client, config: &SmsConfig) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        }
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    async fn send(&self, to: &str, body: &str) -> Result<SendReceipt> {
        let sid = self
            .account_sid
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("twilio account sid missing"))?;
        let token = self
            .auth_token
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("twilio auth token missing"))?;
        let from = self
            .from_number
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("twilio from number missing"))?;

        let url = format!("{}/2010-04-01/Accounts/{}/Messages.json", self.api_base, sid);
        let resp = self
            .client
            .post(&url)
            .basic_auth(sid, Some(token))
            .form(&[("To", to), ("From", from.as_str()), ("Body", body)])
            .send()
            .await?;

        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow::anyhow!("twilio send failed: {} {}", status, value));
        }
        let provider_message_id = value
            .get("sid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("twilio response missing sid: {}", value))?;
        Ok(SendReceipt {
            provider_message_id: provider_message_id.to_string(),
        })
    }
}
