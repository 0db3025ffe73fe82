use super::Backend;
use crate::model::{BuildOutcome, EvalOutcome};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    builds: VecDeque<BuildOutcome>,
    evals: VecDeque<EvalOutcome>,
    built_code: Vec<String>,
    mutate_calls: Vec<Vec<String>>,
    experiments: usize,
}

/// Backend replaying queued build and evaluation outcomes.
///
/// With an empty queue, builds succeed and evaluations score 0.5.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<State>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_build(&self, success: bool) -> &Self {
        let outcome = if success {
            BuildOutcome {
                success: true,
                stdout: "ok".into(),
                stderr: String::new(),
            }
        } else {
            BuildOutcome::failed("", "error: expected ';'")
        };
        self.state.lock().unwrap().builds.push_back(outcome);
        self
    }

    pub fn push_score(&self, score: f64) -> &Self {
        self.push_eval(EvalOutcome {
            exec_status: true,
            eval_results: json!({ "score": score }),
            eval_logs: json!({ "stdout": "" }),
        })
    }

    pub fn push_exec_failure(&self) -> &Self {
        self.push_eval(EvalOutcome {
            exec_status: false,
            eval_results: json!({}),
            eval_logs: json!({ "stderr": "segfault" }),
        })
    }

    pub fn push_eval(&self, outcome: EvalOutcome) -> &Self {
        self.state.lock().unwrap().evals.push_back(outcome);
        self
    }

    /// Code passed to every build call, in order.
    pub fn built_code(&self) -> Vec<String> {
        self.state.lock().unwrap().built_code.clone()
    }

    pub fn build_calls(&self) -> usize {
        self.state.lock().unwrap().built_code.len()
    }

    pub fn experiment_calls(&self) -> usize {
        self.state.lock().unwrap().experiments
    }

    /// Parent lists handed to `mutate_prompt`, in order.
    pub fn mutate_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().mutate_calls.clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn initial_prompt(&self) -> String {
        "write a heuristic".into()
    }

    fn mutate_prompt(&self, parent_codes: &[String]) -> String {
        self.state
            .lock()
            .unwrap()
            .mutate_calls
            .push(parent_codes.to_vec());
        format!("improve on:\n{}", parent_codes.join("\n---\n"))
    }

    fn debug_prompt(&self, stdout: &str, stderr: &str) -> String {
        format!("fix it\nstdout: {}\nstderr: {}", stdout, stderr)
    }

    async fn build(&self, code: &str) -> anyhow::Result<BuildOutcome> {
        let mut s = self.state.lock().unwrap();
        s.built_code.push(code.to_string());
        Ok(s.builds.pop_front().unwrap_or(BuildOutcome {
            success: true,
            stdout: "ok".into(),
            stderr: String::new(),
        }))
    }

    async fn run_experiment(&self) -> anyhow::Result<EvalOutcome> {
        let mut s = self.state.lock().unwrap();
        s.experiments += 1;
        Ok(s.evals.pop_front().unwrap_or(EvalOutcome {
            exec_status: true,
            eval_results: json!({ "score": 0.5 }),
            eval_logs: json!({}),
        }))
    }

    fn run_info(&self) -> serde_json::Value {
        json!({ "task_args": { "scripted": true } })
    }
}
