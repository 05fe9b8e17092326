//! Recursive element loading.
//!
//! The loader parses target `.bst` files into an in-memory DAG, resolving
//! dependency references across junctions, then validates the graph for
//! cycles and sorts each element's dependencies into a stable build order.
//! Elements are identified by stable node indices; each descriptor file is
//! loaded at most once per project, which breaks diamond dependencies.

use crate::metaelement::{LoadResult, MetaElement, MetaSource};
use crate::types::{DependencyType, ElementNode, ProjectConfig};
use buildstream_core::LoadError;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A loaded element descriptor plus its resolved dependency list.
struct LoadedElement {
    /// Element-path-relative filename within its project
    filename: String,
    /// Junction-prefixed display name
    full_name: String,
    /// Junction this element was reached through, if any
    junction: Option<String>,
    node: ElementNode,
    /// Ordered dependencies; re-ordered in place by the dependency sort
    dependencies: Vec<(NodeIndex, DependencyType)>,
}

/// Loader state for one project (the toplevel project or a junctioned
/// sub-project).
struct SubLoader {
    project_name: String,
    project_dir: PathBuf,
    /// Absolute element search path
    basedir: PathBuf,
    parent: Option<usize>,
    /// Junction element name this loader was instantiated through
    junction_prefix: String,
    /// Per-file cache; ensures each descriptor is loaded once
    elements: HashMap<String, NodeIndex>,
    /// Junction name to sub-loader. `None` marks a junction known to be
    /// missing here, which makes later conflicting definitions in sibling
    /// sub-projects a hard error.
    junctions: HashMap<String, Option<usize>>,
}

/// Loads the element DAG of a project and its junctioned sub-projects.
pub struct Loader {
    graph: DiGraph<LoadedElement, DependencyType>,
    loaders: Vec<SubLoader>,
}

impl Loader {
    /// Create a loader for the project at `project_dir`.
    pub fn new(project_dir: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let mut loader = Self {
            graph: DiGraph::new(),
            loaders: Vec::new(),
        };
        loader.add_subloader(&project_dir.into(), None, String::new())?;
        Ok(loader)
    }

    /// Load the given target elements and everything they depend on.
    pub fn load(&mut self, targets: &[&str]) -> Result<LoadResult, LoadError> {
        let mut target_nodes = Vec::new();
        for target in targets {
            if Path::new(target).is_absolute() {
                return Err(LoadError::invalid_data(format!(
                    "Target '{target}' was not specified as a relative path to the base project directory"
                )));
            }
            let (loader_idx, name) = self.parse_name(0, target)?;
            let node = self.load_file(loader_idx, &name)?;
            target_nodes.push(node);
        }

        // Now that dependencies are resolved, scan for circular dependencies
        let mut validated = HashSet::new();
        for &node in &target_nodes {
            self.check_circular_deps(node, &mut HashSet::new(), &mut validated, &mut Vec::new())?;
        }

        // Sort each element's direct dependencies into build order
        let mut visited = HashSet::new();
        for &node in &target_nodes {
            self.sort_dependencies(node, &mut visited);
        }

        let mut elements = Vec::new();
        let mut built = HashMap::new();
        let targets = target_nodes
            .iter()
            .map(|&node| self.collect_element(node, &mut elements, &mut built))
            .collect();

        Ok(LoadResult { elements, targets })
    }

    fn add_subloader(
        &mut self,
        project_dir: &Path,
        parent: Option<usize>,
        junction_prefix: String,
    ) -> Result<usize, LoadError> {
        let conf_path = project_dir.join("project.conf");
        let text = fs::read_to_string(&conf_path).map_err(|_| LoadError::MissingFile {
            message: format!(
                "Could not find the project.conf file in {}",
                project_dir.display()
            ),
            detail: None,
        })?;
        let config: ProjectConfig = serde_yaml::from_str(&text).map_err(|e| {
            LoadError::InvalidYaml {
                message: format!("{}: {e}", conf_path.display()),
            }
        })?;

        let basedir = project_dir.join(&config.element_path);
        debug!(project = %config.name, basedir = %basedir.display(), "Initialized project loader");

        self.loaders.push(SubLoader {
            project_name: config.name,
            project_dir: project_dir.to_path_buf(),
            basedir,
            parent,
            junction_prefix,
            elements: HashMap::new(),
            junctions: HashMap::new(),
        });
        Ok(self.loaders.len() - 1)
    }

    /// Split a possibly junction-prefixed name and resolve its loader.
    /// Deep junction names (`a:b:c`) are forbidden; elements in
    /// sub-sub-projects require a junction in the toplevel project.
    fn parse_name(&mut self, loader_idx: usize, name: &str) -> Result<(usize, String), LoadError> {
        if name.matches(':').count() > 1 {
            return Err(LoadError::invalid_data(format!(
                "Deep junction names are not allowed: '{name}'"
            )));
        }
        match name.split_once(':') {
            None => Ok((loader_idx, name.to_string())),
            Some((junction, element)) => {
                self.load_file(loader_idx, junction)?;
                let sub_loader = self.get_loader_required(loader_idx, junction)?;
                Ok((sub_loader, element.to_string()))
            }
        }
    }

    /// Recursively load one descriptor file in the given project.
    fn load_file(&mut self, loader_idx: usize, filename: &str) -> Result<NodeIndex, LoadError> {
        // Silently reuse already loaded files
        if let Some(&node) = self.loaders[loader_idx].elements.get(filename) {
            return Ok(node);
        }

        let fullpath = self.loaders[loader_idx].basedir.join(filename);
        let text = match fs::read_to_string(&fullpath) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.missing_file_error(loader_idx, filename));
            }
            Err(e) => {
                return Err(LoadError::invalid_data(format!(
                    "Failed to read '{}': {e}",
                    fullpath.display()
                )));
            }
        };
        let element: ElementNode =
            serde_yaml::from_str(&text).map_err(|e| LoadError::InvalidYaml {
                message: format!("{filename}: {e}"),
            })?;

        let prefix = self.loaders[loader_idx].junction_prefix.clone();
        let (full_name, junction) = if prefix.is_empty() {
            (filename.to_string(), None)
        } else {
            (format!("{prefix}:{filename}"), Some(prefix))
        };

        // Register the element before descending into its dependencies so
        // diamond references resolve to this node and cyclic descriptors
        // terminate (the cycle itself is reported by the later check)
        let depends = element.depends.clone();
        let node = self.graph.add_node(LoadedElement {
            filename: filename.to_string(),
            full_name,
            junction,
            node: element,
            dependencies: Vec::new(),
        });
        self.loaders[loader_idx]
            .elements
            .insert(filename.to_string(), node);

        for dep in &depends {
            let (dep_loader, dep_name) = match dep.junction() {
                Some(junction) => {
                    self.load_file(loader_idx, junction)?;
                    (
                        self.get_loader_required(loader_idx, junction)?,
                        dep.filename().to_string(),
                    )
                }
                None => self.parse_name(loader_idx, dep.filename())?,
            };

            let dep_node = self.load_file(dep_loader, &dep_name)?;
            if self.graph[dep_node].node.kind == "junction" {
                return Err(LoadError::invalid_data(format!(
                    "{filename}: Cannot depend on junction '{dep_name}'"
                )));
            }

            self.graph[node].dependencies.push((dep_node, dep.dep_type()));
            self.graph.add_edge(node, dep_node, dep.dep_type());
        }

        Ok(node)
    }

    fn missing_file_error(&self, loader_idx: usize, filename: &str) -> LoadError {
        let loader = &self.loaders[loader_idx];
        let message = if loader.parent.is_some() {
            format!(
                "Could not find element '{}' in project referred to by junction element '{}'",
                filename, loader.junction_prefix
            )
        } else {
            format!(
                "Could not find element '{}' in elements directory '{}'",
                filename,
                loader.basedir.display()
            )
        };

        // Suggest a plausible alternative where one exists
        let mut detail = None;
        if !filename.ends_with(".bst") {
            let suggestion = format!("{filename}.bst");
            if loader.basedir.join(&suggestion).exists() {
                detail = Some(format!("Did you mean '{suggestion}'?"));
            }
        }

        LoadError::MissingFile { message, detail }
    }

    /// Resolve the loader for a junction, erroring when it cannot be found.
    fn get_loader_required(
        &mut self,
        loader_idx: usize,
        junction: &str,
    ) -> Result<usize, LoadError> {
        match self.get_loader(loader_idx, junction, 0)? {
            Some(idx) => Ok(idx),
            None => Err(self.missing_file_error(loader_idx, junction)),
        }
    }

    /// Return the loader for the named junction, instantiating it on first
    /// use. Junctions in the parent project take precedence over junctions
    /// defined in sub-projects; a junction resolved through two different
    /// sibling sub-projects is a hard error.
    fn get_loader(
        &mut self,
        loader_idx: usize,
        junction: &str,
        level: usize,
    ) -> Result<Option<usize>, LoadError> {
        if let Some(cached) = self.loaders[loader_idx].junctions.get(junction) {
            return match cached {
                Some(idx) => Ok(Some(*idx)),
                None => Err(LoadError::ConflictingJunction {
                    junction: junction.to_string(),
                    project: self.loaders[loader_idx].project_name.clone(),
                }),
            };
        }

        if let Some(parent) = self.loaders[loader_idx].parent {
            if let Some(idx) = self.get_loader(parent, junction, level + 1)? {
                self.loaders[loader_idx]
                    .junctions
                    .insert(junction.to_string(), Some(idx));
                return Ok(Some(idx));
            }
        }

        let node = match self.load_file(loader_idx, junction) {
            Ok(node) => node,
            Err(LoadError::MissingFile { .. }) if level > 0 => {
                // Mark the junction as unavailable here so conflicting
                // definitions in sibling sub-projects can be detected
                self.loaders[loader_idx]
                    .junctions
                    .insert(junction.to_string(), None);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let element = &self.graph[node].node;
        if element.kind != "junction" {
            return Err(LoadError::invalid_data(format!(
                "{junction}: Expected junction but element kind is '{}'",
                element.kind
            )));
        }

        // A junction embeds its sub-project below the configured path. A
        // junction with sources but no staged checkout still needs a fetch;
        // one with no path at all has no ref to begin with.
        let subproject = match element.config.get("path").and_then(|v| v.as_str()) {
            Some(path) => self.loaders[loader_idx].project_dir.join(path),
            None => {
                return Err(LoadError::SubprojectInconsistent {
                    junction: junction.to_string(),
                })
            }
        };
        if !subproject.join("project.conf").exists() {
            return Err(LoadError::SubprojectFetchNeeded {
                junction: junction.to_string(),
            });
        }

        let sub_loader = self.add_subloader(&subproject, Some(loader_idx), junction.to_string())?;
        self.loaders[loader_idx]
            .junctions
            .insert(junction.to_string(), Some(sub_loader));
        Ok(Some(sub_loader))
    }

    /// Detect circular dependencies with a gray/black DFS colouring. The
    /// reported chain is the DFS path sliced from the first occurrence of
    /// the revisited element back to itself.
    fn check_circular_deps(
        &self,
        node: NodeIndex,
        check_elements: &mut HashSet<NodeIndex>,
        validated: &mut HashSet<NodeIndex>,
        sequence: &mut Vec<String>,
    ) -> Result<(), LoadError> {
        if validated.contains(&node) {
            return Ok(());
        }

        let full_name = &self.graph[node].full_name;
        if check_elements.contains(&node) {
            let position = sequence
                .iter()
                .position(|name| name == full_name)
                .unwrap_or(0);
            let mut chain: Vec<String> = sequence[position..].to_vec();
            chain.push(full_name.clone());
            return Err(LoadError::CircularDependency {
                element: full_name.clone(),
                chain: chain.join(" -> "),
            });
        }

        check_elements.insert(node);
        sequence.push(full_name.clone());
        for (dep, _) in self.graph[node].dependencies.clone() {
            self.check_circular_deps(dep, check_elements, validated, sequence)?;
        }
        check_elements.remove(&node);
        sequence.pop();

        validated.insert(node);
        Ok(())
    }

    /// Sort each element's direct dependencies so that any dependency which
    /// directly or indirectly depends on another dependency of the same
    /// element appears later in the list. This avoids repeated topological
    /// sorts during the build.
    fn sort_dependencies(&mut self, node: NodeIndex, visited: &mut HashSet<NodeIndex>) {
        if !visited.insert(node) {
            return;
        }

        for (dep, _) in self.graph[node].dependencies.clone() {
            self.sort_dependencies(dep, visited);
        }

        let mut dependencies = std::mem::take(&mut self.graph[node].dependencies);
        let graph = &self.graph;
        dependencies.sort_by(|(a, type_a), (b, type_b)| {
            if a == b {
                return Ordering::Equal;
            }

            // Inter-dependency ordering first
            if has_path_connecting(graph, *a, *b, None) {
                return Ordering::Greater;
            }
            if has_path_connecting(graph, *b, *a, None) {
                return Ordering::Less;
            }

            // Runtime-only dependencies after everything else
            if type_a != type_b {
                if *type_a == DependencyType::Runtime {
                    return Ordering::Greater;
                }
                if *type_b == DependencyType::Runtime {
                    return Ordering::Less;
                }
            }

            let element_a = &graph[*a];
            let element_b = &graph[*b];
            match element_a.filename.cmp(&element_b.filename) {
                Ordering::Equal => {}
                other => return other,
            }

            // Local elements before junction elements, then junction names
            match (&element_a.junction, &element_b.junction) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(junction_a), Some(junction_b)) => junction_a.cmp(junction_b),
            }
        });
        self.graph[node].dependencies = dependencies;
    }

    /// Flatten the loaded graph below `node` into the output table,
    /// returning the element's stable index.
    fn collect_element(
        &self,
        node: NodeIndex,
        elements: &mut Vec<MetaElement>,
        built: &mut HashMap<NodeIndex, usize>,
    ) -> usize {
        if let Some(&index) = built.get(&node) {
            return index;
        }

        let loaded = &self.graph[node];
        let sources = loaded
            .node
            .sources
            .iter()
            .enumerate()
            .map(|(index, source)| MetaSource {
                element_name: loaded.full_name.clone(),
                index,
                kind: source.kind.clone(),
                directory: source.directory.clone(),
                config: source.config.clone(),
            })
            .collect();

        let meta = MetaElement {
            name: loaded.full_name.clone(),
            kind: loaded.node.kind.clone(),
            sources,
            config: loaded.node.config.clone(),
            variables: loaded.node.variables.clone(),
            environment: loaded.node.environment.clone(),
            build_dependencies: Vec::new(),
            runtime_dependencies: Vec::new(),
            is_junction: loaded.node.kind == "junction",
        };
        elements.push(meta);
        let index = elements.len() - 1;
        built.insert(node, index);

        for (dep_node, dep_type) in self.graph[node].dependencies.clone() {
            let dep_index = self.collect_element(dep_node, elements, built);
            if dep_type != DependencyType::Runtime {
                elements[index].build_dependencies.push(dep_index);
            }
            if dep_type != DependencyType::Build {
                elements[index].runtime_dependencies.push(dep_index);
            }
        }

        index
    }
}
