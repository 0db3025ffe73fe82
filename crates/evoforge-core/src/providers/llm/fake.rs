use super::{ChatProvider, ChatReply, ChatSession};
use crate::model::UsageStats;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    TransportError(String),
}

#[derive(Default)]
struct Script {
    replies: VecDeque<ScriptedReply>,
    prompts: Vec<String>,
    sessions: usize,
}

/// Replays canned replies in order across every session it opens.
///
/// Running out of replies is reported as a transport error.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(ScriptedReply::Text(text.into()))
    }

    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        self.push(ScriptedReply::TransportError(message.into()))
    }

    pub fn push(&self, reply: ScriptedReply) -> &Self {
        self.script.lock().unwrap().replies.push_back(reply);
        self
    }

    /// Every prompt sent so far, across sessions.
    pub fn prompts(&self) -> Vec<String> {
        self.script.lock().unwrap().prompts.clone()
    }

    pub fn calls(&self) -> usize {
        self.script.lock().unwrap().prompts.len()
    }

    pub fn sessions(&self) -> usize {
        self.script.lock().unwrap().sessions
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().replies.len()
    }
}

impl ChatProvider for ScriptedProvider {
    fn start_session(&self) -> Box<dyn ChatSession> {
        self.script.lock().unwrap().sessions += 1;
        Box::new(ScriptedSession {
            script: self.script.clone(),
            turns: 0,
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    turns: u64,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    async fn send(&mut self, message: &str) -> anyhow::Result<ChatReply> {
        let mut script = self.script.lock().unwrap();
        script.prompts.push(message.to_string());
        match script.replies.pop_front() {
            Some(ScriptedReply::Text(text)) => {
                self.turns += 1;
                Ok(ChatReply {
                    usage: UsageStats {
                        model: Some("scripted".into()),
                        prompt_tokens: message.len() as u64 * self.turns,
                        gen_tokens: text.len() as u64,
                    },
                    text,
                })
            }
            Some(ScriptedReply::TransportError(e)) => anyhow::bail!("scripted transport error: {}", e),
            None => anyhow::bail!("scripted provider has no replies left"),
        }
    }
}
