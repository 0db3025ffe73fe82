//! Candidate generator: one model conversation per (iter, sample) slot.

use crate::errors::EvolveError;
use crate::model::GeneratedResponse;
use crate::providers::llm::{ChatProvider, ChatSession};
use std::time::Duration;
use tokio::time::timeout;

pub mod segments;

pub use segments::split_explanation_and_code;

/// Transport policy for a conversation. `retries == 0` aborts on the first failure.
#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    pub retries: u32,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            request_timeout: Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

pub struct CandidateGenerator {
    session: Box<dyn ChatSession>,
    policy: GenerationPolicy,
    turns: u32,
}

impl CandidateGenerator {
    /// Opens a fresh conversation. Sessions are never shared between candidates.
    pub fn start(provider: &dyn ChatProvider, policy: GenerationPolicy) -> Self {
        Self {
            session: provider.start_session(),
            policy,
            turns: 0,
        }
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    /// Sends `prompt` and splits the reply. Transport failures surface as
    /// [`EvolveError::Generation`] once the retry budget is spent.
    pub async fn send(&mut self, prompt: &str) -> anyhow::Result<GeneratedResponse> {
        let mut attempt = 0;
        let reply = loop {
            let err = match timeout(self.policy.request_timeout, self.session.send(prompt)).await {
                Ok(Ok(reply)) => break reply,
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!(
                    "no reply within {}s",
                    self.policy.request_timeout.as_secs()
                ),
            };
            if attempt >= self.policy.retries {
                return Err(EvolveError::Generation(format!("{:#}", err)).into());
            }
            attempt += 1;
            tracing::warn!(
                event = "generation.retry",
                attempt,
                max = self.policy.retries,
                error = %err,
                "chat transport failed; retrying"
            );
            tokio::time::sleep(self.policy.retry_backoff * attempt).await;
        };

        self.turns += 1;
        let seg = split_explanation_and_code(&reply.text);
        Ok(GeneratedResponse {
            full_response: reply.text,
            text_segments: seg.text,
            code_segments: seg.code,
            code_languages: seg.languages,
            usage_stats: reply.usage,
        })
    }
}
