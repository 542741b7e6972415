//! Protected-path policy collaborator.

use serde::{Deserialize, Serialize};

/// Decides which repository paths no patch may touch. Supplied by external
/// configuration at run start.
pub trait ProtectedPathPolicy: Send + Sync {
    fn is_protected(&self, path: &str) -> bool;

    /// Subset of `paths` that are protected, in input order.
    fn violations(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .filter(|p| self.is_protected(p))
            .cloned()
            .collect()
    }
}

/// Prefix-based protected set. An entry protects the path itself and
/// everything beneath it when it names a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedPaths {
    entries: Vec<String>,
}

impl ProtectedPaths {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|s| s.into().trim_start_matches("./").to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl ProtectedPathPolicy for ProtectedPaths {
    fn is_protected(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.entries.iter().any(|entry| {
            let dir = entry.trim_end_matches('/');
            path == dir || path.starts_with(&format!("{}/", dir))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching() {
        let policy = ProtectedPaths::new([".github/", "Cargo.lock", "./infra"]);
        assert!(policy.is_protected(".github/workflows/ci.yml"));
        assert!(policy.is_protected("Cargo.lock"));
        assert!(policy.is_protected("infra/main.tf"));
        assert!(!policy.is_protected("infrastructure.md"));
        assert!(!policy.is_protected("src/lib.rs"));
    }

    #[test]
    fn test_violations_preserve_order() {
        let policy = ProtectedPaths::new(["secrets"]);
        let paths = vec![
            "src/a.rs".to_string(),
            "secrets/key.pem".to_string(),
            "secrets/b".to_string(),
        ];
        assert_eq!(policy.violations(&paths), vec!["secrets/key.pem", "secrets/b"]);
    }
}
