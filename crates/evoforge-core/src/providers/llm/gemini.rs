use super::{ChatProvider, ChatReply, ChatSession};
use crate::model::UsageStats;
use async_trait::async_trait;
use serde_json::json;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiProvider {
    pub model: String,
    pub api_key: String,
    pub client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

impl ChatProvider for GeminiProvider {
    fn start_session(&self) -> Box<dyn ChatSession> {
        Box::new(GeminiSession {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
            contents: Vec::new(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct GeminiSession {
    model: String,
    api_key: String,
    client: reqwest::Client,
    contents: Vec<serde_json::Value>,
}

#[async_trait]
impl ChatSession for GeminiSession {
    async fn send(&mut self, message: &str) -> anyhow::Result<ChatReply> {
        let mut contents = self.contents.clone();
        contents.push(json!({ "role": "user", "parts": [{ "text": message }] }));

        let url = format!("{}/{}:generateContent", API_BASE, self.model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({ "contents": contents }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error ({}): {}", status, error_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let mut reply = parse_reply(&json)?;
        if reply.usage.model.is_none() {
            reply.usage.model = Some(self.model.clone());
        }

        contents.push(json!({ "role": "model", "parts": [{ "text": reply.text }] }));
        self.contents = contents;
        Ok(reply)
    }
}

fn parse_reply(json: &serde_json::Value) -> anyhow::Result<ChatReply> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("Gemini API response missing candidate parts"))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    let usage = UsageStats {
        model: json
            .get("modelVersion")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        prompt_tokens: json
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        gen_tokens: json
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };

    Ok(ChatReply { text, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_text_parts() {
        let body = json!({
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": "a" }, { "text": "b" }] } }],
            "usageMetadata": { "promptTokenCount": 40, "candidatesTokenCount": 7 }
        });
        let reply = parse_reply(&body).unwrap();
        assert_eq!(reply.text, "ab");
        assert_eq!(reply.usage.prompt_tokens, 40);
        assert_eq!(reply.usage.gen_tokens, 7);
    }

    #[test]
    fn blocked_prompt_has_no_candidates() {
        let body = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert!(parse_reply(&body).is_err());
    }
}
