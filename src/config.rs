use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub sms: SmsConfig,
    pub agent: AgentConfig,
    pub conversation: ConversationConfig,
    pub usage: UsageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.agent-inbox/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub api_base: String,
    pub webhook_path: String,
    /// Externally visible base URL the provider signs requests against.
    pub public_url: Option<String>,
    pub validate_signatures: bool,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            from_number: None,
            api_base: "https://api.twilio.com".to_string(),
            webhook_path: "/v1/channels/sms/inbound".to_string(),
            public_url: None,
            validate_signatures: true,
        }
    }
}

impl SmsConfig {
    /// Full URL of the inbound webhook as the provider sees it.
    pub fn signed_webhook_url(&self) -> Option<String> {
        self.public_url
            .as_ref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), self.webhook_path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: Option<String>,
    pub api_token: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_token: None,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub window_minutes: i64,
    pub history_limit: i64,
    pub cross_channel_limit: i64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            history_limit: 20,
            cross_channel_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub period_hours: i64,
    pub max_cost_per_period: i64,
    pub cost_per_run: i64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            period_hours: 24,
            max_cost_per_period: 100,
            cost_per_run: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("INBOX_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.agent-inbox/agent-inbox.json"))
}

fn env_override(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();
    let mut cfg = Config::default();

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => warn!(path = %config_path.display(), error = %err, "ignoring unparsable config file"),
            },
            Err(err) => warn!(path = %config_path.display(), error = %err, "failed to read config file"),
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(token) = env_override("INBOX_TOKEN") {
        cfg.auth.token = Some(token);
    }
    if let Some(url) = env_override("INBOX_DATABASE_URL") {
        cfg.database.url = Some(url);
    }
    if let Some(path) = env_override("INBOX_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }
    if let Some(sid) = env_override("INBOX_TWILIO_ACCOUNT_SID") {
        cfg.sms.account_sid = Some(sid);
    }
    if let Some(token) = env_override("INBOX_TWILIO_AUTH_TOKEN") {
        cfg.sms.auth_token = Some(token);
    }
    if let Some(number) = env_override("INBOX_TWILIO_FROM_NUMBER") {
        cfg.sms.from_number = Some(number);
    }
    if let Some(url) = env_override("INBOX_PUBLIC_URL") {
        cfg.sms.public_url = Some(url);
    }
    if let Some(url) = env_override("INBOX_AGENT_URL") {
        cfg.agent.url = Some(url);
    }
    if let Some(token) = env_override("INBOX_AGENT_TOKEN") {
        cfg.agent.api_token = Some(token);
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
