use std::path::{Path, PathBuf};

/// Resolves relative paths in a config file against the file's own directory.
#[derive(Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
}

impl PathResolver {
    pub fn new(config_path: &Path) -> Self {
        let base_dir = config_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self { base_dir }
    }

    pub fn resolve_opt_str(&self, p: &mut Option<String>) {
        let Some(s) = p.as_mut() else { return };
        if s.trim().is_empty() {
            return;
        }

        let pb = PathBuf::from(&*s);
        if pb.is_absolute() {
            return;
        }

        let joined = self.join_clean(&pb);
        *s = joined.to_string_lossy().to_string();
    }

    fn join_clean(&self, rel: &Path) -> PathBuf {
        let joined = self.base_dir.join(rel);

        let mut out = PathBuf::new();
        for c in joined.components() {
            use std::path::Component::*;
            match c {
                CurDir => {}
                ParentDir => {
                    out.pop();
                }
                RootDir | Prefix(_) | Normal(_) => out.push(c.as_os_str()),
            }
        }
        if out.as_os_str().is_empty() {
            out.push(".");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_config_dir() {
        let r = PathResolver::new(Path::new("/srv/exp/evoforge.yaml"));
        let mut p = Some("../traces/./w106.bin".to_string());
        r.resolve_opt_str(&mut p);
        assert_eq!(p.as_deref(), Some("/srv/traces/w106.bin"));

        let mut abs = Some("/data/ledger.db".to_string());
        r.resolve_opt_str(&mut abs);
        assert_eq!(abs.as_deref(), Some("/data/ledger.db"));
    }

    #[test]
    fn bare_config_name_resolves_to_cwd() {
        let r = PathResolver::new(Path::new("evoforge.yaml"));
        let mut p = Some(".".to_string());
        r.resolve_opt_str(&mut p);
        assert_eq!(p.as_deref(), Some("."));
    }
}
