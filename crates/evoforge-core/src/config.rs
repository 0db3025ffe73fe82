use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod path_resolver;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;
pub const DEFAULT_DB_PATH: &str = ".evoforge/ledger.db";
pub const DEFAULT_N_SAMPLES: u32 = 25;
pub const DEFAULT_BUILD_RETRIES: u32 = 3;
pub const DEFAULT_NUM_SNIPPETS: usize = 2;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvolveConfig {
    #[serde(default, rename = "configVersion", alias = "version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub task_args: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_samples: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_snippets: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<u64>,
}

impl EvolveConfig {
    /// Applies `EVOFORGE_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("EVOFORGE_DB") {
            self.db = Some(v);
        }
        if let Some(v) = lookup("EVOFORGE_MODEL") {
            self.model = Some(v);
        }
        if let Some(v) = lookup("EVOFORGE_GENERATION_RETRIES") {
            let n = v.trim().parse().map_err(|_| {
                ConfigError(format!(
                    "EVOFORGE_GENERATION_RETRIES must be a non-negative integer, got '{}'",
                    v
                ))
            })?;
            self.settings.generation_retries = Some(n);
        }
        Ok(())
    }
}

pub fn load_config(path: &Path, strict: bool) -> Result<EvolveConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let mut cfg: EvolveConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    let meaningful: Vec<_> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    if !meaningful.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "unknown fields in {}: {:?}",
                path.display(),
                meaningful
            )));
        }
        tracing::warn!(
            event = "config.unknown_fields",
            fields = ?meaningful,
            "ignoring unknown config fields"
        );
    }

    if cfg.version != 0 && cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }

    let r = path_resolver::PathResolver::new(path);
    r.resolve_opt_str(&mut cfg.workdir);
    r.resolve_opt_str(&mut cfg.db);

    Ok(cfg)
}

/// Values given on the command line; each one wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub task: Option<String>,
    pub model: Option<String>,
    pub workdir: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub n_samples: Option<u32>,
    pub build_retries: Option<u32>,
    pub num_snippets: Option<usize>,
    pub generation_retries: Option<u32>,
    pub request_timeout_seconds: Option<u64>,
    pub task_args: Vec<(String, serde_json::Value)>,
}

/// Fully resolved settings for one controller invocation.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub task: String,
    pub model: String,
    pub workdir: PathBuf,
    pub db: PathBuf,
    pub run_id: Option<String>,
    pub start_iter: u32,
    pub end_iter: u32,
    pub n_samples: u32,
    pub build_retries: u32,
    pub num_snippets: usize,
    pub generation_retries: u32,
    pub request_timeout: Duration,
    pub task_args: serde_json::Value,
}

impl RunSettings {
    pub fn resolve(
        cfg: &EvolveConfig,
        overrides: RunOverrides,
        start_iter: u32,
        end_iter: u32,
        run_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let task = overrides
            .task
            .or_else(|| cfg.task.clone())
            .ok_or_else(|| ConfigError("no task selected (--task or `task:`)".into()))?;
        let model = overrides
            .model
            .or_else(|| cfg.model.clone())
            .ok_or_else(|| ConfigError("no model selected (--model or `model:`)".into()))?;

        let mut task_args = cfg.task_args.clone();
        for (k, v) in overrides.task_args {
            task_args.insert(k, v);
        }

        let s = &cfg.settings;
        let settings = Self {
            task,
            model,
            workdir: overrides
                .workdir
                .or_else(|| cfg.workdir.as_ref().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".")),
            db: overrides
                .db
                .or_else(|| cfg.db.as_ref().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            run_id,
            start_iter,
            end_iter,
            n_samples: overrides
                .n_samples
                .or(s.n_samples)
                .unwrap_or(DEFAULT_N_SAMPLES),
            build_retries: overrides
                .build_retries
                .or(s.build_retries)
                .unwrap_or(DEFAULT_BUILD_RETRIES),
            num_snippets: overrides
                .num_snippets
                .or(s.num_snippets)
                .unwrap_or(DEFAULT_NUM_SNIPPETS),
            generation_retries: overrides
                .generation_retries
                .or(s.generation_retries)
                .unwrap_or(0),
            request_timeout: Duration::from_secs(
                overrides
                    .request_timeout_seconds
                    .or(s.request_timeout_seconds)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            task_args: serde_json::Value::Object(task_args),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_iter <= self.start_iter {
            return Err(ConfigError(format!(
                "end_iter ({}) must be greater than start_iter ({})",
                self.end_iter, self.start_iter
            )));
        }
        if self.run_id.is_none() && self.start_iter != 0 {
            return Err(ConfigError(
                "a fresh run must start at iteration 0; pass --run-id to continue a run".into(),
            ));
        }
        if self.n_samples == 0 {
            return Err(ConfigError("n_samples must be at least 1".into()));
        }
        if self.build_retries == 0 {
            return Err(ConfigError("build_retries must be at least 1".into()));
        }
        if self.num_snippets == 0 {
            return Err(ConfigError("num_snippets must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError("request_timeout_seconds must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parses a `key=value` task argument. Values are read as YAML scalars or lists,
/// so `cache_sizes=[64, 128]` and `percent=true` keep their types.
pub fn parse_task_arg(raw: &str) -> Result<(String, serde_json::Value), ConfigError> {
    let (k, v) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError(format!("task arg '{}' is not key=value", raw)))?;
    let key = k.trim().trim_start_matches("--").replace('-', "_");
    if key.is_empty() {
        return Err(ConfigError(format!("task arg '{}' has an empty key", raw)));
    }
    let value: serde_json::Value = serde_yaml::from_str(v)
        .unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
    Ok((key, value))
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"configVersion: 1
task: webcache
model: gemini-2.0
workdir: .
db: .evoforge/ledger.db
settings:
  n_samples: 25
  build_retries: 3
  num_snippets: 2
  generation_retries: 0
  request_timeout_seconds: 600
task_args:
  trace: CloudPhysics/w106.oracleGeneral.bin.zst
  cache_sizes: [128]
  eval_cache_size: 128
  byte: true
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_beat_config_values() {
        let cfg = EvolveConfig {
            task: Some("webcache".into()),
            model: Some("gemini-2.0".into()),
            settings: Settings {
                n_samples: Some(10),
                build_retries: Some(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = RunOverrides {
            n_samples: Some(4),
            task_args: vec![("trace".into(), serde_json::json!("a.bin"))],
            ..Default::default()
        };
        let s = RunSettings::resolve(&cfg, overrides, 0, 2, None).unwrap();
        assert_eq!(s.n_samples, 4);
        assert_eq!(s.build_retries, 5);
        assert_eq!(s.num_snippets, DEFAULT_NUM_SNIPPETS);
        assert_eq!(s.generation_retries, 0);
        assert_eq!(s.task_args["trace"], "a.bin");
        assert_eq!(s.db, PathBuf::from(DEFAULT_DB_PATH));
    }

    #[test]
    fn fresh_run_must_start_at_zero() {
        let cfg = EvolveConfig {
            task: Some("tcpbpf".into()),
            model: Some("gpt-4o-mini".into()),
            ..Default::default()
        };
        let err = RunSettings::resolve(&cfg, RunOverrides::default(), 1, 3, None).unwrap_err();
        assert!(err.0.contains("iteration 0"));

        assert!(
            RunSettings::resolve(&cfg, RunOverrides::default(), 1, 3, Some("tcpbpf_0".into()))
                .is_ok()
        );
    }

    #[test]
    fn empty_range_is_rejected() {
        let cfg = EvolveConfig {
            task: Some("tcp".into()),
            model: Some("gpt-4o-mini".into()),
            ..Default::default()
        };
        assert!(RunSettings::resolve(&cfg, RunOverrides::default(), 0, 0, None).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = EvolveConfig::default();
        cfg.apply_env_from(|k| match k {
            "EVOFORGE_DB" => Some("/tmp/x.db".into()),
            "EVOFORGE_GENERATION_RETRIES" => Some("2".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.db.as_deref(), Some("/tmp/x.db"));
        assert_eq!(cfg.settings.generation_retries, Some(2));
        assert_eq!(cfg.model, None);
    }

    #[test]
    fn malformed_retry_env_is_rejected() {
        let mut cfg = EvolveConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "EVOFORGE_GENERATION_RETRIES").then(|| "three".into()))
            .unwrap_err();
        assert!(err.0.contains("three"));
        assert_eq!(cfg.settings.generation_retries, None);
    }

    #[test]
    fn zero_request_timeout_is_rejected() {
        let cfg = EvolveConfig {
            task: Some("webcache".into()),
            model: Some("gemini-2.0".into()),
            ..Default::default()
        };
        let overrides = RunOverrides {
            request_timeout_seconds: Some(0),
            ..Default::default()
        };
        let err = RunSettings::resolve(&cfg, overrides, 0, 1, None).unwrap_err();
        assert!(err.0.contains("request_timeout_seconds"));
    }

    #[test]
    fn task_args_keep_yaml_types() {
        let (k, v) = parse_task_arg("--cache-sizes=[64, 128]").unwrap();
        assert_eq!(k, "cache_sizes");
        assert_eq!(v, serde_json::json!([64, 128]));

        let (_, v) = parse_task_arg("percent=true").unwrap();
        assert_eq!(v, serde_json::json!(true));

        assert!(parse_task_arg("nothing").is_err());
    }

    #[test]
    fn sample_config_loads_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evoforge.yaml");
        write_sample_config(&path).unwrap();

        let cfg = load_config(&path, true).unwrap();
        assert_eq!(cfg.task.as_deref(), Some("webcache"));
        assert_eq!(cfg.settings.build_retries, Some(3));
        let db = cfg.db.unwrap();
        assert!(Path::new(&db).starts_with(dir.path()));
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evoforge.yaml");
        std::fs::write(&path, "configVersion: 1\ntask: tcp\nsamples: 3\n").unwrap();

        assert!(load_config(&path, true).is_err());
        let cfg = load_config(&path, false).unwrap();
        assert_eq!(cfg.task.as_deref(), Some("tcp"));
    }
}
