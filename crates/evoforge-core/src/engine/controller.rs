use crate::backends::Backend;
use crate::config::RunSettings;
use crate::engine::repair::run_build_repair;
use crate::engine::selector::select_parents;
use crate::errors::EvolveError;
use crate::fingerprint::{capture_git_info, code_digest, GitInfo};
use crate::generator::{CandidateGenerator, GenerationPolicy};
use crate::model::{CandidateRecord, ParentSet, RunInfo};
use crate::providers::llm::ChatProvider;
use crate::storage::{InvocationRecord, Store};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub n_samples: u32,
    pub build_retries: u32,
    pub num_snippets: usize,
    pub generation: GenerationPolicy,
}

impl ControllerSettings {
    pub fn from_run(s: &RunSettings) -> Self {
        Self {
            n_samples: s.n_samples,
            build_retries: s.build_retries,
            num_snippets: s.num_snippets,
            generation: GenerationPolicy {
                retries: s.generation_retries,
                request_timeout: s.request_timeout,
                ..GenerationPolicy::default()
            },
        }
    }
}

/// Counters for one `evolve` call. Skipped slots were recorded by an earlier call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvolveSummary {
    pub run_id: String,
    pub recorded: u32,
    pub skipped: u32,
    pub built: u32,
    pub evaluated: u32,
    pub best_score: Option<f64>,
}

/// Everything one (iter, sample) slot needs; parents are shared by the generation.
struct SampleTask<'a> {
    iter: u32,
    sample: u32,
    parents: Option<&'a ParentSet>,
}

/// Resolves the run to write into: continues `requested`, or creates a fresh one.
///
/// Fresh runs get `<task>_<n>` and a metadata document holding the backend's
/// run info, the run id and the source revision of `source_dir`.
pub fn open_run(
    store: &Store,
    task: &str,
    model: &str,
    requested: Option<&str>,
    backend: &dyn Backend,
    source_dir: &Path,
) -> anyhow::Result<String> {
    if let Some(run_id) = requested {
        let info = store
            .run_info(run_id)?
            .ok_or_else(|| EvolveError::UnknownRun(run_id.to_string()))?;
        if info.task != task {
            return Err(EvolveError::TaskMismatch {
                run_id: run_id.to_string(),
                stored: info.task,
                requested: task.to_string(),
            }
            .into());
        }
        tracing::info!(event = "run.continue", run_id, created_at = %info.created_at);
        return Ok(run_id.to_string());
    }

    let run_id = store.allocate_run_id(task)?;
    let mut info = backend.run_info();
    if !info.is_object() {
        info = serde_json::json!({ "backend": info });
    }
    info["run_id"] = serde_json::json!(run_id);
    info["git"] = serde_json::json!(capture_git_info(source_dir));
    store.create_run(&RunInfo {
        run_id: run_id.clone(),
        task: task.to_string(),
        model: model.to_string(),
        created_at: crate::storage::store::now_rfc3339(),
        info,
    })?;
    tracing::info!(event = "run.create", run_id = %run_id, task, model);
    Ok(run_id)
}

pub struct EvolutionController {
    store: Store,
    provider: Arc<dyn ChatProvider>,
    backend: Arc<dyn Backend>,
    settings: ControllerSettings,
    run_id: String,
}

impl EvolutionController {
    pub fn new(
        store: Store,
        provider: Arc<dyn ChatProvider>,
        backend: Arc<dyn Backend>,
        settings: ControllerSettings,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            backend,
            settings,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs iterations `start..end`, samples in order, one candidate at a time.
    /// Slots already in the ledger are skipped without any model or backend call.
    pub async fn evolve(
        &self,
        start: u32,
        end: u32,
        git: Option<GitInfo>,
    ) -> anyhow::Result<EvolveSummary> {
        self.store.record_invocation(&InvocationRecord {
            run_id: self.run_id.clone(),
            start_iter: start,
            end_iter: end,
            n_samples: self.settings.n_samples,
            model: self.provider.model().to_string(),
            git_commit: git.as_ref().map(|g| g.commit.clone()),
            git_dirty: git.as_ref().map(|g| g.dirty),
        })?;
        tracing::info!(
            event = "run.start",
            run_id = %self.run_id,
            start,
            end,
            n_samples = self.settings.n_samples,
            backend = self.backend.name(),
            model = self.provider.model()
        );

        let mut summary = EvolveSummary {
            run_id: self.run_id.clone(),
            ..Default::default()
        };

        for iter in start..end {
            let mut parents: Option<ParentSet> = None;
            for sample in 0..self.settings.n_samples {
                if self.store.has_candidate(&self.run_id, iter, sample)? {
                    tracing::info!(event = "candidate.skip", iter, sample, "already recorded");
                    summary.skipped += 1;
                    continue;
                }
                if iter > 0 && parents.is_none() {
                    parents = Some(select_parents(
                        &self.store,
                        &self.run_id,
                        iter,
                        self.settings.num_snippets,
                    )?);
                }

                let task = SampleTask {
                    iter,
                    sample,
                    parents: parents.as_ref(),
                };
                let span = tracing::info_span!("candidate", iter, sample);
                let record = self.run_sample(&task).instrument(span).await?;
                self.persist(&record)?;

                summary.recorded += 1;
                if record.build_status == Some(true) {
                    summary.built += 1;
                }
                if record.exec_status == Some(true) {
                    summary.evaluated += 1;
                }
                if record.is_eligible_parent() {
                    if let Some(score) = record.score() {
                        summary.best_score = Some(summary.best_score.map_or(score, |b| b.max(score)));
                    }
                }
            }
        }

        tracing::info!(
            event = "run.finish",
            run_id = %self.run_id,
            recorded = summary.recorded,
            skipped = summary.skipped,
            best_score = ?summary.best_score
        );
        Ok(summary)
    }

    async fn run_sample(&self, task: &SampleTask<'_>) -> anyhow::Result<CandidateRecord> {
        let prompt = match task.parents {
            None => self.backend.initial_prompt(),
            Some(p) => self.backend.mutate_prompt(&p.codes),
        };

        let mut generator =
            CandidateGenerator::start(self.provider.as_ref(), self.settings.generation.clone());
        tracing::info!(event = "candidate.generate", mutation = task.parents.is_some());
        let response = generator.send(&prompt).await?;

        let repair = run_build_repair(
            &mut generator,
            self.backend.as_ref(),
            prompt,
            response,
            self.settings.build_retries,
        )
        .await?;

        let mut record = CandidateRecord::new(task.iter, task.sample);
        if let Some(p) = task.parents {
            record = record.with_parents(p);
        }
        record.build_status = Some(repair.build_status);
        record.final_code = repair.final_code;
        record.revisions = repair.revisions;

        if !repair.build_status {
            tracing::warn!(
                event = "candidate.build_exhausted",
                attempts = record.revisions.len(),
                "no successful build"
            );
            return Ok(record);
        }

        let eval = self.backend.run_experiment().await?;
        let score = eval.score();
        tracing::info!(
            event = "candidate.eval",
            exec_status = eval.exec_status,
            score = ?score,
            code = %record.final_code.as_deref().map(code_digest).unwrap_or_default()
        );
        if !eval.exec_status {
            tracing::warn!(event = "candidate.eval_failed", "experiment failed; excluded from selection");
        } else if score.is_none() {
            tracing::warn!(event = "candidate.eval_unscored", "experiment reported no numeric score");
        }
        record.exec_status = Some(eval.exec_status);
        record.eval_results = Some(eval.eval_results);
        record.eval_logs = Some(eval.eval_logs);
        Ok(record)
    }

    fn persist(&self, record: &CandidateRecord) -> anyhow::Result<()> {
        record
            .check_consistency(self.settings.build_retries)
            .map_err(EvolveError::Consistency)?;
        self.store.insert_candidate(&self.run_id, record)?;
        Ok(())
    }
}
