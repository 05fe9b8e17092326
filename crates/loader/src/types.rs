//! Element descriptor nodes, as parsed from `.bst` files.

use serde::Deserialize;
use std::collections::BTreeMap;

/// The scope a dependency applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Needed to build the depending element
    Build,
    /// Needed at runtime by the depending element
    Runtime,
    /// Both build and runtime
    #[default]
    All,
}

/// A dependency reference in a descriptor: either a bare filename or a
/// mapping with junction and type.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencyNode {
    Simple(String),
    Full {
        filename: String,
        #[serde(default)]
        junction: Option<String>,
        #[serde(rename = "type", default)]
        dep_type: DependencyType,
    },
}

impl DependencyNode {
    /// The element filename, possibly still carrying a `junction:` prefix.
    #[must_use]
    pub fn filename(&self) -> &str {
        match self {
            Self::Simple(name) => name,
            Self::Full { filename, .. } => filename,
        }
    }

    #[must_use]
    pub fn dep_type(&self) -> DependencyType {
        match self {
            Self::Simple(_) => DependencyType::All,
            Self::Full { dep_type, .. } => *dep_type,
        }
    }

    /// Explicit junction field, if the mapping form named one.
    #[must_use]
    pub fn junction(&self) -> Option<&str> {
        match self {
            Self::Simple(_) => None,
            Self::Full { junction, .. } => junction.as_deref(),
        }
    }
}

/// One source declaration within an element.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceNode {
    pub kind: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(flatten)]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

/// A parsed element descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementNode {
    pub kind: String,
    #[serde(default)]
    pub depends: Vec<DependencyNode>,
    #[serde(default)]
    pub sources: Vec<SourceNode>,
    #[serde(default)]
    pub config: serde_yaml::Value,
    #[serde(default)]
    pub variables: serde_yaml::Value,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Per-project configuration, from `project.conf`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(rename = "element-path", default = "default_element_path")]
    pub element_path: String,
}

fn default_element_path() -> String {
    ".".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_dependency() {
        let node: DependencyNode = serde_yaml::from_str("base.bst").unwrap();
        assert_eq!(node.filename(), "base.bst");
        assert_eq!(node.dep_type(), DependencyType::All);
    }

    #[test]
    fn test_parse_full_dependency() {
        let yaml = "filename: compiler.bst\ntype: build\n";
        let node: DependencyNode = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.filename(), "compiler.bst");
        assert_eq!(node.dep_type(), DependencyType::Build);
    }

    #[test]
    fn test_parse_element_descriptor() {
        let yaml = "\
kind: autotools
depends:
- base.bst
- filename: libfoo.bst
  type: runtime
sources:
- kind: tar
  url: https://example.com/app.tar.gz
environment:
  CFLAGS: -O2
";
        let element: ElementNode = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(element.kind, "autotools");
        assert_eq!(element.depends.len(), 2);
        assert_eq!(element.sources.len(), 1);
        assert_eq!(element.sources[0].kind, "tar");
        assert_eq!(element.environment["CFLAGS"], "-O2");
    }

    #[test]
    fn test_project_config_defaults() {
        let config: ProjectConfig = serde_yaml::from_str("name: test\n").unwrap();
        assert_eq!(config.element_path, ".");
    }
}
