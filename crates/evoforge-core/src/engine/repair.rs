//! Build-repair cycle: bounded build attempts, each failure fed back to the model.

use crate::backends::prompts::{NO_CODE_DIAGNOSTIC, NO_CODE_REPROMPT};
use crate::backends::Backend;
use crate::generator::CandidateGenerator;
use crate::model::{GeneratedResponse, Revision};

#[derive(Debug, Clone, PartialEq)]
pub struct RepairResult {
    pub build_status: bool,
    /// Code of the last build call, successful or not.
    pub final_code: Option<String>,
    pub revisions: Vec<Revision>,
}

/// Drives up to `max_attempts` attempts starting from an already generated reply.
///
/// A reply without code costs an attempt but no build call. The model is only
/// re-prompted while attempts remain.
pub async fn run_build_repair(
    generator: &mut CandidateGenerator,
    backend: &dyn Backend,
    prompt: String,
    response: GeneratedResponse,
    max_attempts: u32,
) -> anyhow::Result<RepairResult> {
    let mut prompt = prompt;
    let mut response = response;
    let mut result = RepairResult {
        build_status: false,
        final_code: None,
        revisions: Vec::new(),
    };

    for attempt in 0..max_attempts {
        let next_prompt = match response.primary_code() {
            Some(code) => {
                let code = code.to_string();
                let outcome = backend.build(&code).await?;
                tracing::info!(event = "candidate.build", attempt, success = outcome.success);
                let next = (!outcome.success)
                    .then(|| backend.debug_prompt(&outcome.stdout, &outcome.stderr));
                result.revisions.push(Revision {
                    attempt,
                    build_status: outcome.success,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    prompt,
                    response,
                });
                result.final_code = Some(code);
                result.build_status = outcome.success;
                match next {
                    Some(p) => p,
                    None => return Ok(result),
                }
            }
            None => {
                tracing::warn!(event = "candidate.no_code", attempt, "reply had no code block");
                result.revisions.push(Revision {
                    attempt,
                    build_status: false,
                    stdout: NO_CODE_DIAGNOSTIC.to_string(),
                    stderr: String::new(),
                    prompt,
                    response,
                });
                result.build_status = false;
                NO_CODE_REPROMPT.to_string()
            }
        };

        if attempt + 1 == max_attempts {
            break;
        }
        response = generator.send(&next_prompt).await?;
        prompt = next_prompt;
    }

    Ok(result)
}
