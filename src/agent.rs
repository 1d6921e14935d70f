use crate::config::AgentConfig;
use crate::types::AgentRun;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::warn;

pub const AGENT_FAILURE_REPLY: &str =
    "Sorry, I couldn't process that right now. Please try again in a few minutes.";

pub const APPROVAL_NOTICE: &str =
    "This action needs your approval. Open the app to review and approve it.";

/// The external natural-language agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, message: &str, account_id: &str) -> Result<AgentRun>;
}

/// Posts `{message, user_id}` to the configured agent endpoint.
pub struct HttpAgentRunner {
    client: Client,
    url: Option<String>,
    api_token: Option<String>,
}

impl HttpAgentRunner {
    pub fn new(client: Client, config: &AgentConfig) -> Self {
        Self {
            client,
            url: config.url.clone(),
            api_token: config.api_token.clone(),
        }
    }
}

#[async_trait]
impl AgentRunner for HttpAgentRunner {
    async fn run(&self, message: &str, account_id: &str) -> Result<AgentRun> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("agent url not configured"))?;
        let payload = serde_json::json!({
            "message": message,
            "user_id": account_id,
        });
        let mut req = self.client.post(url).json(&payload);
        if let Some(token) = self.api_token.as_ref() {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("agent request failed: {} {}", status, body));
        }
        Ok(resp.json::<AgentRun>().await?)
    }
}

/// User-facing reply plus the run it came from, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub text: String,
    pub run_id: Option<String>,
}

#[derive(Clone)]
pub struct AgentGateway {
    runner: Arc<dyn AgentRunner>,
}

impl AgentGateway {
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self { runner }
    }

    /// Never fails: agent errors collapse into the fixed apology with no run id.
    pub async fn run_agent(&self, message: &str, account_id: &str) -> AgentReply {
        match self.runner.run(message, account_id).await {
            Ok(run) => AgentReply {
                text: compose_reply(&run),
                run_id: Some(run.run_id),
            },
            Err(err) => {
                warn!(account_id, error = %err, "agent run failed");
                AgentReply {
                    text: AGENT_FAILURE_REPLY.to_string(),
                    run_id: None,
                }
            }
        }
    }
}

pub fn compose_reply(run: &AgentRun) -> String {
    let mut reply = run.message.trim().to_string();
    if let Some(question) = run
        .follow_up_question
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
    {
        reply.push_str("\n\n");
        reply.push_str(question);
    }
    if run.requires_approval == Some(true) {
        reply.push_str("\n\n");
        reply.push_str(APPROVAL_NOTICE);
    }
    reply
}
