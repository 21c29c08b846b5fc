use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Draft reply produced by the generation service, including the knowledge
/// rules consulted and whether they disagreed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    pub text: String,
    pub confidence: i32,
    #[serde(default)]
    pub kb_rule_ids: Vec<i64>,
    #[serde(default)]
    pub conflict: bool,
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<LlmReply>;
}

/// JSON-over-HTTP adapter for the reply-generation service.
pub struct HttpLlmAdapter {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLlmAdapter {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(http, crate::config::LLM_ENDPOINT.clone())
    }
}

#[async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn generate(&self, prompt: &str) -> anyhow::Result<LlmReply> {
        let mut reply: LlmReply = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        reply.confidence = reply.confidence.clamp(0, 100);
        Ok(reply)
    }
}
