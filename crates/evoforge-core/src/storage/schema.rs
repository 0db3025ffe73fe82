pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  task TEXT NOT NULL,
  model TEXT NOT NULL,
  created_at TEXT NOT NULL,
  info_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS invocations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES runs(run_id),
  start_iter INTEGER NOT NULL,
  end_iter INTEGER NOT NULL,
  n_samples INTEGER NOT NULL,
  model TEXT NOT NULL,
  git_commit TEXT,
  git_dirty INTEGER,
  started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS candidates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES runs(run_id),
  iter INTEGER NOT NULL,
  sample INTEGER NOT NULL,
  final_code TEXT,
  build_status INTEGER,
  exec_status INTEGER,
  score REAL,
  eval_results_json TEXT,
  eval_logs_json TEXT,
  revisions_json TEXT NOT NULL,
  parent_ids_json TEXT,
  parent_codes_json TEXT,
  recorded_at TEXT NOT NULL,
  UNIQUE (run_id, iter, sample)
);

CREATE INDEX IF NOT EXISTS idx_candidates_eligible
  ON candidates (run_id, build_status, exec_status, iter);
"#;
