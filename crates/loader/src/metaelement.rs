//! The loader's output: a flat table of resolved elements.

use crate::types::SourceNode;
use std::collections::BTreeMap;

/// A resolved source within an element. The index is the source's stable
/// position in the descriptor, used to seed source-specific caching.
#[derive(Debug, Clone)]
pub struct MetaSource {
    pub element_name: String,
    pub index: usize,
    pub kind: String,
    pub directory: Option<String>,
    pub config: BTreeMap<String, serde_yaml::Value>,
}

/// A fully resolved element, ready for instantiation by the core.
///
/// Dependencies are stable integer indices into the owning
/// [`LoadResult::elements`] table, already in dependency order: any
/// dependency which transitively depends on another dependency of the same
/// element appears later in the list.
///
/// [`LoadResult::elements`]: crate::LoadResult::elements
#[derive(Debug, Clone)]
pub struct MetaElement {
    /// Full element name, junction-prefixed for sub-project elements
    pub name: String,
    pub kind: String,
    pub sources: Vec<MetaSource>,
    pub config: serde_yaml::Value,
    pub variables: serde_yaml::Value,
    pub environment: BTreeMap<String, String>,
    /// Dependencies needed to build this element
    pub build_dependencies: Vec<usize>,
    /// Dependencies needed at runtime
    pub runtime_dependencies: Vec<usize>,
    pub is_junction: bool,
}

impl MetaElement {
    /// Build and runtime dependency indices, deduplicated, preserving
    /// dependency order.
    #[must_use]
    pub fn all_dependencies(&self) -> Vec<usize> {
        let mut seen = std::collections::HashSet::new();
        self.build_dependencies
            .iter()
            .chain(self.runtime_dependencies.iter())
            .copied()
            .filter(|idx| seen.insert(*idx))
            .collect()
    }
}

/// Everything one `load()` call produced.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// All loaded elements; dependency indices point into this table
    pub elements: Vec<MetaElement>,
    /// Indices of the requested targets, in request order
    pub targets: Vec<usize>,
}

impl LoadResult {
    #[must_use]
    pub fn element(&self, index: usize) -> &MetaElement {
        &self.elements[index]
    }

    /// Look up an element index by its full name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }
}
