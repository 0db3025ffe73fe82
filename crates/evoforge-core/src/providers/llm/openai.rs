use super::{ChatProvider, ChatReply, ChatSession};
use crate::model::UsageStats;
use async_trait::async_trait;
use serde_json::json;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAIProvider {
    pub model: String,
    pub api_key: String,
    pub client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

impl ChatProvider for OpenAIProvider {
    fn start_session(&self) -> Box<dyn ChatSession> {
        Box::new(OpenAISession {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
            messages: Vec::new(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct OpenAISession {
    model: String,
    api_key: String,
    client: reqwest::Client,
    messages: Vec<serde_json::Value>,
}

#[async_trait]
impl ChatSession for OpenAISession {
    async fn send(&mut self, message: &str) -> anyhow::Result<ChatReply> {
        let mut messages = self.messages.clone();
        messages.push(json!({ "role": "user", "content": message }));

        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        let resp = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI chat API error ({}): {}", status, error_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let reply = parse_reply(&json)?;

        // history only grows once the turn round-tripped
        messages.push(json!({ "role": "assistant", "content": reply.text }));
        self.messages = messages;
        Ok(reply)
    }
}

fn parse_reply(json: &serde_json::Value) -> anyhow::Result<ChatReply> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("OpenAI API response missing content"))?
        .to_string();

    let usage = UsageStats {
        model: json
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        prompt_tokens: json
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        gen_tokens: json
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };

    Ok(ChatReply { text, usage })
}
