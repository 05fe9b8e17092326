//! The scheduler's view of an element.
//!
//! An [`Element`] is the runtime state of one node of the loaded graph:
//! its cache keys, whether the pipeline still requires it, and the results
//! observed so far. The element/plugin surface above this (configuration
//! composition, sandboxed assembly) lives outside the core.

use buildstream_artifact::Keyed;
use buildstream_core::KeyStrength;
use buildstream_loader::MetaElement;
use sha2::{Digest as Sha2Digest, Sha256};
use std::path::PathBuf;

/// The recorded result of a failed build, kept so re-runs can report the
/// failure without scheduling a new job.
#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub description: String,
    pub logfile: Option<PathBuf>,
}

/// Runtime state of one element in the pipeline.
#[derive(Debug, Clone)]
pub struct Element {
    /// Stable id within the owning pipeline's element table
    pub id: usize,
    pub name: String,
    pub project: String,
    pub kind: String,

    /// Direct dependency ids within the owning pipeline
    pub dependencies: Vec<usize>,

    pub strong_key: Option<String>,
    pub weak_key: Option<String>,

    /// Whether this element's artifact may still be needed this session
    pub required: bool,

    /// Set once the element's artifact is known cached and good
    pub cached_success: bool,

    /// Set when a cached failure artifact is known for this element
    pub cached_failure: Option<BuildFailure>,

    /// Whether the element's sources are locally available
    pub sources_cached: bool,
}

impl Element {
    /// Create an element from its loaded description.
    #[must_use]
    pub fn from_meta(id: usize, project: &str, meta: &MetaElement, dependencies: Vec<usize>) -> Self {
        Self {
            id,
            name: meta.name.clone(),
            project: project.to_string(),
            kind: meta.kind.clone(),
            dependencies,
            strong_key: None,
            weak_key: None,
            required: false,
            cached_success: false,
            cached_failure: None,
            sources_cached: false,
        }
    }

    /// Both cache keys, once resolved.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.strong_key
            .iter()
            .chain(self.weak_key.iter())
            .cloned()
            .collect()
    }

    /// Whether all dependencies have produced good artifacts.
    #[must_use]
    pub fn buildable(&self, elements: &[Element]) -> bool {
        self.dependencies
            .iter()
            .all(|&dep| elements[dep].cached_success)
    }
}

impl Keyed for Element {
    fn project_name(&self) -> &str {
        &self.project
    }

    fn element_name(&self) -> &str {
        &self.name
    }

    fn cache_key(&self, strength: KeyStrength) -> Option<String> {
        match strength {
            KeyStrength::Strong => self.strong_key.clone(),
            KeyStrength::Weak => self.weak_key.clone(),
        }
    }
}

/// Derive the strong and weak cache keys for an element.
///
/// The weak key covers the element's own description plus dependency
/// *names*; the strong key additionally covers the dependencies' strong
/// keys, so any change in transitive content invalidates it.
#[must_use]
pub fn calculate_keys(
    kind: &str,
    config_digest: &str,
    dep_names: &[&str],
    dep_strong_keys: &[&str],
) -> (String, String) {
    let mut weak = Sha256::new();
    weak.update(kind.as_bytes());
    weak.update([0u8]);
    weak.update(config_digest.as_bytes());
    for name in dep_names {
        weak.update([0u8]);
        weak.update(name.as_bytes());
    }
    let weak_key = hex::encode(weak.finalize());

    let mut strong = Sha256::new();
    strong.update(weak_key.as_bytes());
    for key in dep_strong_keys {
        strong.update([0u8]);
        strong.update(key.as_bytes());
    }
    (hex::encode(strong.finalize()), weak_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_include_both_strengths() {
        let mut element = Element {
            id: 0,
            name: "app.bst".into(),
            project: "test".into(),
            kind: "autotools".into(),
            dependencies: vec![],
            strong_key: Some("s".into()),
            weak_key: Some("w".into()),
            required: false,
            cached_success: false,
            cached_failure: None,
            sources_cached: false,
        };
        assert_eq!(element.keys(), vec!["s", "w"]);

        element.strong_key = None;
        assert_eq!(element.keys(), vec!["w"]);
    }

    #[test]
    fn test_weak_key_ignores_dependency_content() {
        let (strong_a, weak_a) = calculate_keys("import", "cfg", &["dep.bst"], &["aaa"]);
        let (strong_b, weak_b) = calculate_keys("import", "cfg", &["dep.bst"], &["bbb"]);
        assert_eq!(weak_a, weak_b);
        assert_ne!(strong_a, strong_b);
    }

    #[test]
    fn test_strong_key_changes_with_dep_names() {
        let (strong_a, _) = calculate_keys("import", "cfg", &["one.bst"], &["k"]);
        let (strong_b, _) = calculate_keys("import", "cfg", &["two.bst"], &["k"]);
        assert_ne!(strong_a, strong_b);
    }
}
