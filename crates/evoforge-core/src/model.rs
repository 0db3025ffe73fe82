use serde::{Deserialize, Serialize};

/// Token accounting reported by a chat transport for one exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt_tokens: u64,
    pub gen_tokens: u64,
}

/// A model reply split into prose and fenced code.
///
/// `text_segments[i]` is the prose preceding `code_segments[i]`; a trailing
/// prose segment (if any) follows the last block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedResponse {
    pub full_response: String,
    pub text_segments: Vec<String>,
    pub code_segments: Vec<String>,
    pub code_languages: Vec<String>,
    pub usage_stats: UsageStats,
}

impl GeneratedResponse {
    /// The code the build-repair cycle acts on: the first block, if it has content.
    pub fn primary_code(&self) -> Option<&str> {
        self.code_segments
            .first()
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// One build attempt and the model exchange that produced its code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub attempt: u32,
    pub build_status: bool,
    pub stdout: String,
    pub stderr: String,
    pub prompt: String,
    pub response: GeneratedResponse,
}

/// Result of a single backend build call.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl BuildOutcome {
    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Result of a backend experiment. `eval_results["score"]` is numeric on success.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub exec_status: bool,
    pub eval_results: serde_json::Value,
    pub eval_logs: serde_json::Value,
}

impl EvalOutcome {
    pub fn score(&self) -> Option<f64> {
        score_of(&self.eval_results)
    }
}

pub fn score_of(eval_results: &serde_json::Value) -> Option<f64> {
    eval_results.get("score").and_then(|v| v.as_f64())
}

/// Parents chosen by the selector for one generation, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentSet {
    pub source_iter: u32,
    pub ids: Vec<i64>,
    pub codes: Vec<String>,
    pub scores: Vec<f64>,
}

impl ParentSet {
    pub fn best_score(&self) -> Option<f64> {
        self.scores.first().copied()
    }
}

/// The durable outcome of one (iter, sample) slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub iter: u32,
    pub sample: u32,
    pub final_code: Option<String>,
    pub build_status: Option<bool>,
    pub exec_status: Option<bool>,
    pub eval_results: Option<serde_json::Value>,
    pub eval_logs: Option<serde_json::Value>,
    pub revisions: Vec<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_codes: Option<Vec<String>>,
}

impl CandidateRecord {
    pub fn new(iter: u32, sample: u32) -> Self {
        Self {
            iter,
            sample,
            final_code: None,
            build_status: None,
            exec_status: None,
            eval_results: None,
            eval_logs: None,
            revisions: Vec::new(),
            parent_ids: None,
            parent_codes: None,
        }
    }

    pub fn with_parents(mut self, parents: &ParentSet) -> Self {
        self.parent_ids = Some(parents.ids.clone());
        self.parent_codes = Some(parents.codes.clone());
        self
    }

    pub fn score(&self) -> Option<f64> {
        self.eval_results.as_ref().and_then(score_of)
    }

    pub fn is_eligible_parent(&self) -> bool {
        self.build_status == Some(true) && self.exec_status == Some(true)
    }

    /// Checks the record invariants that must hold before it is persisted.
    pub fn check_consistency(&self, retry_bound: u32) -> Result<(), String> {
        let Some(last) = self.revisions.last() else {
            return Err(format!(
                "iter={} sample={}: record has no revisions",
                self.iter, self.sample
            ));
        };
        if self.revisions.len() > retry_bound as usize {
            return Err(format!(
                "iter={} sample={}: {} revisions exceed retry bound {}",
                self.iter,
                self.sample,
                self.revisions.len(),
                retry_bound
            ));
        }
        if self.build_status != Some(last.build_status) {
            return Err(format!(
                "iter={} sample={}: build_status {:?} does not match last revision ({})",
                self.iter, self.sample, self.build_status, last.build_status
            ));
        }
        let built = last.build_status;
        if built != self.eval_results.is_some() || built != self.exec_status.is_some() {
            return Err(format!(
                "iter={} sample={}: evaluation fields present={} but build_status={}",
                self.iter,
                self.sample,
                self.eval_results.is_some(),
                built
            ));
        }
        if built && self.final_code.is_none() {
            return Err(format!(
                "iter={} sample={}: built candidate has no final_code",
                self.iter, self.sample
            ));
        }
        Ok(())
    }
}

/// Immutable metadata written once when a run is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub task: String,
    pub model: String,
    pub created_at: String,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// One stored candidate with its ledger identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCandidate {
    pub id: i64,
    pub recorded_at: String,
    #[serde(flatten)]
    pub record: CandidateRecord,
}
