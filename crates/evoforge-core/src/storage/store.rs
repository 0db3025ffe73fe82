use crate::errors::EvolveError;
use crate::model::{CandidateRecord, RunInfo, StoredCandidate};
use anyhow::Context;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

const CANDIDATE_COLS: &str = "id, iter, sample, final_code, build_status, exec_status,
     eval_results_json, eval_logs_json, revisions_json, parent_ids_json, parent_codes_json,
     recorded_at";

/// The Run Ledger. Single writer: one controller per run at a time.
#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

/// One controller invocation against a run.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub run_id: String,
    pub start_iter: u32,
    pub end_iter: u32,
    pub n_samples: u32,
    pub model: String,
    pub git_commit: Option<String>,
    pub git_dirty: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunListing {
    pub run_id: String,
    pub task: String,
    pub model: String,
    pub created_at: String,
    pub candidates: u64,
    pub best_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationCounts {
    pub iter: u32,
    pub recorded: u64,
    pub built: u64,
    pub evaluated: u64,
    pub best_score: Option<f64>,
}

/// A candidate eligible as a parent, in selection order.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleRow {
    pub id: i64,
    pub iter: u32,
    pub sample: u32,
    pub score: f64,
    pub final_code: String,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger directory {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(crate::storage::schema::DDL)?;
        Ok(())
    }

    // runs

    /// First unused `<task>_<n>`, probing upward from 0.
    pub fn allocate_run_id(&self, task: &str) -> anyhow::Result<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM runs WHERE run_id = ?1")?;
        let mut n = 0u32;
        loop {
            let candidate = format!("{}_{}", task, n);
            if !stmt.exists(params![candidate])? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    pub fn create_run(&self, info: &RunInfo) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs(run_id, task, model, created_at, info_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                info.run_id,
                info.task,
                info.model,
                info.created_at,
                serde_json::to_string(&info.info)?
            ],
        )
        .with_context(|| format!("failed to create run {}", info.run_id))?;
        Ok(())
    }

    pub fn run_info(&self, run_id: &str) -> anyhow::Result<Option<RunInfo>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT run_id, task, model, created_at, info_json FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunInfo {
                        run_id: row.get(0)?,
                        task: row.get(1)?,
                        model: row.get(2)?,
                        created_at: row.get(3)?,
                        info: json_col(row, 4)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn record_invocation(&self, inv: &InvocationRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO invocations(run_id, start_iter, end_iter, n_samples, model, git_commit, git_dirty, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                inv.run_id,
                inv.start_iter,
                inv.end_iter,
                inv.n_samples,
                inv.model,
                inv.git_commit,
                inv.git_dirty,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn invocation_count(&self, run_id: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM invocations WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn list_runs(&self) -> anyhow::Result<Vec<RunListing>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.run_id, r.task, r.model, r.created_at,
                    COUNT(c.id), MAX(CASE WHEN c.build_status = 1 AND c.exec_status = 1 THEN c.score END)
             FROM runs r
             LEFT JOIN candidates c ON c.run_id = r.run_id
             GROUP BY r.run_id
             ORDER BY r.created_at, r.run_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RunListing {
                run_id: row.get(0)?,
                task: row.get(1)?,
                model: row.get(2)?,
                created_at: row.get(3)?,
                candidates: row.get::<_, i64>(4)? as u64,
                best_score: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // candidates

    pub fn has_candidate(&self, run_id: &str, iter: u32, sample: u32) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT 1 FROM candidates WHERE run_id = ?1 AND iter = ?2 AND sample = ?3")?;
        Ok(stmt.exists(params![run_id, iter, sample])?)
    }

    /// Persists a finished record. A second record for the same slot is refused.
    pub fn insert_candidate(&self, run_id: &str, rec: &CandidateRecord) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let res = conn.execute(
            "INSERT INTO candidates(run_id, iter, sample, final_code, build_status, exec_status, score,
                eval_results_json, eval_logs_json, revisions_json, parent_ids_json, parent_codes_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run_id,
                rec.iter,
                rec.sample,
                rec.final_code,
                rec.build_status,
                rec.exec_status,
                rec.score(),
                to_json_opt(&rec.eval_results)?,
                to_json_opt(&rec.eval_logs)?,
                serde_json::to_string(&rec.revisions)?,
                to_json_opt(&rec.parent_ids)?,
                to_json_opt(&rec.parent_codes)?,
                now_rfc3339(),
            ],
        );
        match res {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(EvolveError::DuplicateRecord {
                    run_id: run_id.to_string(),
                    iter: rec.iter,
                    sample: rec.sample,
                }
                .into())
            }
            Err(e) => Err(e).context("failed to insert candidate"),
        }
    }

    pub fn get_candidate(
        &self,
        run_id: &str,
        iter: u32,
        sample: u32,
    ) -> anyhow::Result<Option<StoredCandidate>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM candidates WHERE run_id = ?1 AND iter = ?2 AND sample = ?3",
            CANDIDATE_COLS
        );
        let row = conn
            .query_row(&sql, params![run_id, iter, sample], row_to_candidate)
            .optional()?;
        Ok(row)
    }

    /// All records of a run in (iter, sample) order.
    pub fn candidates_for_run(&self, run_id: &str) -> anyhow::Result<Vec<StoredCandidate>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM candidates WHERE run_id = ?1 ORDER BY iter, sample",
            CANDIDATE_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id], row_to_candidate)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Built, executed and scored records with `iter <= max_iter`, best first.
    /// Equal scores keep ledger insertion order.
    pub fn eligible_parents(&self, run_id: &str, max_iter: u32) -> anyhow::Result<Vec<EligibleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, iter, sample, score, final_code
             FROM candidates
             WHERE run_id = ?1 AND iter <= ?2
               AND build_status = 1 AND exec_status = 1
               AND score IS NOT NULL AND final_code IS NOT NULL
             ORDER BY score DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id, max_iter], |row| {
            Ok(EligibleRow {
                id: row.get(0)?,
                iter: row.get(1)?,
                sample: row.get(2)?,
                score: row.get(3)?,
                final_code: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn top_candidates(&self, run_id: &str, limit: u32) -> anyhow::Result<Vec<StoredCandidate>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM candidates
             WHERE run_id = ?1 AND build_status = 1 AND exec_status = 1 AND score IS NOT NULL
             ORDER BY score DESC, id ASC
             LIMIT ?2",
            CANDIDATE_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, limit], row_to_candidate)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn iteration_counts(&self, run_id: &str) -> anyhow::Result<Vec<IterationCounts>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT iter, COUNT(*),
                    SUM(CASE WHEN build_status = 1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN exec_status = 1 THEN 1 ELSE 0 END),
                    MAX(CASE WHEN build_status = 1 AND exec_status = 1 THEN score END)
             FROM candidates
             WHERE run_id = ?1
             GROUP BY iter
             ORDER BY iter",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(IterationCounts {
                iter: row.get(0)?,
                recorded: row.get::<_, i64>(1)? as u64,
                built: row.get::<_, i64>(2)? as u64,
                evaluated: row.get::<_, i64>(3)? as u64,
                best_score: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn row_to_candidate(row: &Row<'_>) -> rusqlite::Result<StoredCandidate> {
    Ok(StoredCandidate {
        id: row.get(0)?,
        recorded_at: row.get(11)?,
        record: CandidateRecord {
            iter: row.get(1)?,
            sample: row.get(2)?,
            final_code: row.get(3)?,
            build_status: row.get(4)?,
            exec_status: row.get(5)?,
            eval_results: json_col(row, 6)?,
            eval_logs: json_col(row, 7)?,
            revisions: json_col(row, 8)?.unwrap_or_default(),
            parent_ids: json_col(row, 9)?,
            parent_codes: json_col(row, 10)?,
        },
    })
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        _ => Ok(None),
    }
}

fn to_json_opt<T: Serialize>(v: &Option<T>) -> anyhow::Result<Option<String>> {
    v.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Revision;
    use serde_json::json;

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s.create_run(&RunInfo {
            run_id: "webcache_0".into(),
            task: "webcache".into(),
            model: "gemini-2.0".into(),
            created_at: now_rfc3339(),
            info: json!({}),
        })
        .unwrap();
        s
    }

    fn built(iter: u32, sample: u32, score: Option<f64>) -> CandidateRecord {
        let mut r = CandidateRecord::new(iter, sample);
        r.final_code = Some(format!("code-{iter}-{sample}"));
        r.build_status = Some(true);
        r.exec_status = Some(true);
        r.eval_results = Some(match score {
            Some(s) => json!({ "score": s }),
            None => json!({}),
        });
        r.eval_logs = Some(json!({}));
        r.revisions = vec![Revision {
            attempt: 0,
            build_status: true,
            stdout: String::new(),
            stderr: String::new(),
            prompt: "p".into(),
            response: Default::default(),
        }];
        r
    }

    #[test]
    fn allocates_first_free_id() {
        let s = store();
        assert_eq!(s.allocate_run_id("webcache").unwrap(), "webcache_1");
        assert_eq!(s.allocate_run_id("tcp").unwrap(), "tcp_0");
    }

    #[test]
    fn duplicate_slot_is_refused() {
        let s = store();
        s.insert_candidate("webcache_0", &built(0, 0, Some(0.1))).unwrap();
        let err = s
            .insert_candidate("webcache_0", &built(0, 0, Some(0.2)))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvolveError>(),
            Some(EvolveError::DuplicateRecord { iter: 0, sample: 0, .. })
        ));
        assert_eq!(s.candidates_for_run("webcache_0").unwrap().len(), 1);
    }

    #[test]
    fn record_survives_storage() {
        let s = store();
        let mut rec = built(1, 3, Some(0.42));
        rec.parent_ids = Some(vec![4, 7]);
        rec.parent_codes = Some(vec!["a".into(), "b".into()]);
        s.insert_candidate("webcache_0", &rec).unwrap();

        let got = s.get_candidate("webcache_0", 1, 3).unwrap().unwrap();
        assert_eq!(got.record, rec);
        assert!(s.get_candidate("webcache_0", 1, 4).unwrap().is_none());
    }

    #[test]
    fn eligible_excludes_unscored_and_later_iters() {
        let s = store();
        s.insert_candidate("webcache_0", &built(0, 0, Some(0.3))).unwrap();
        s.insert_candidate("webcache_0", &built(0, 1, None)).unwrap();
        s.insert_candidate("webcache_0", &built(1, 0, Some(0.9))).unwrap();

        let rows = s.eligible_parents("webcache_0", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].final_code, "code-0-0");

        let counts = s.iteration_counts("webcache_0").unwrap();
        assert_eq!(counts[0].recorded, 2);
        assert_eq!(counts[1].best_score, Some(0.9));
    }

    #[test]
    fn unknown_run_has_no_info() {
        let s = store();
        assert!(s.run_info("tcp_9").unwrap().is_none());
        assert_eq!(s.run_info("webcache_0").unwrap().unwrap().task, "webcache");
    }
}
