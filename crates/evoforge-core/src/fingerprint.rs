use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Command;

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Short digest of a code fragment, used to correlate log lines with ledger records.
pub fn code_digest(code: &str) -> String {
    sha256_hex(code)[..12].to_string()
}

/// Source revision of the tree driving a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: String,
    pub dirty: bool,
    /// `git status --porcelain` output, empty when clean.
    pub status: String,
}

/// Captures the git revision of `dir`. Returns `None` outside a git checkout.
pub fn capture_git_info(dir: &Path) -> Option<GitInfo> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();

    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir)
        .output()
        .ok()?;
    let status = if output.status.success() {
        String::from_utf8_lossy(&output.stdout).to_string()
    } else {
        String::new()
    };

    Some(GitInfo {
        commit,
        dirty: !status.trim().is_empty(),
        status,
    })
}
