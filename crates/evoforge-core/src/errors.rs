use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Conditions that stop a run. Per-candidate failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    #[error("expected at least 2 successful candidates up to iter={iter}, found {found}")]
    InsufficientParents { iter: u32, found: usize },

    #[error("internal consistency violation: {0}")]
    Consistency(String),

    #[error("ledger already holds a record for run={run_id} iter={iter} sample={sample}")]
    DuplicateRecord {
        run_id: String,
        iter: u32,
        sample: u32,
    },

    #[error("generation transport failed: {0}")]
    Generation(String),

    #[error("run '{0}' does not exist in the ledger")]
    UnknownRun(String),

    #[error("run '{run_id}' was created for task '{stored}', not '{requested}'")]
    TaskMismatch {
        run_id: String,
        stored: String,
        requested: String,
    },
}

/// Maps an error chain to the CLI exit class: `true` when it is a configuration problem.
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<EvolveError>(),
                Some(EvolveError::TaskMismatch { .. }) | Some(EvolveError::UnknownRun(_))
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_classified_through_context() {
        let err = anyhow::Error::new(ConfigError("bad".into())).context("loading");
        assert!(is_config_error(&err));

        let err = anyhow::Error::new(EvolveError::InsufficientParents { iter: 0, found: 1 });
        assert!(!is_config_error(&err));
    }

    #[test]
    fn insufficient_parents_message_names_counts() {
        let e = EvolveError::InsufficientParents { iter: 3, found: 1 };
        assert_eq!(
            e.to_string(),
            "expected at least 2 successful candidates up to iter=3, found 1"
        );
    }
}
