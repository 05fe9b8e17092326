//! Loader behaviour: dependency ordering, cycles, junctions.

use buildstream_core::LoadError;
use buildstream_loader::{DependencyType, Loader};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Stage a project from (relative path, content) pairs.
fn project(files: &[(&str, &str)]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    write_files(tmp.path(), files);
    tmp
}

fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
}

const PROJECT_CONF: &str = "name: test\n";

#[test]
fn test_load_simple_chain() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("base.bst", "kind: import\n"),
        ("lib.bst", "kind: autotools\ndepends:\n- base.bst\n"),
        ("app.bst", "kind: autotools\ndepends:\n- lib.bst\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    assert_eq!(result.targets.len(), 1);
    let app = result.element(result.targets[0]);
    assert_eq!(app.name, "app.bst");
    assert_eq!(app.kind, "autotools");
    assert_eq!(app.build_dependencies.len(), 1);
    assert_eq!(result.element(app.build_dependencies[0]).name, "lib.bst");
}

#[test]
fn test_dependency_sort_is_topological() {
    // app depends on both lib and base; lib itself depends on base, so
    // base must appear before lib in app's dependency list
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("base.bst", "kind: import\n"),
        ("lib.bst", "kind: autotools\ndepends:\n- base.bst\n"),
        (
            "app.bst",
            "kind: autotools\ndepends:\n- lib.bst\n- base.bst\n",
        ),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    let app = result.element(result.targets[0]);
    let dep_names: Vec<&str> = app
        .build_dependencies
        .iter()
        .map(|&idx| result.element(idx).name.as_str())
        .collect();
    assert_eq!(dep_names, vec!["base.bst", "lib.bst"]);

    // The full table order is a valid topological order for every element
    for element in &result.elements {
        for &dep in element
            .build_dependencies
            .iter()
            .chain(&element.runtime_dependencies)
        {
            assert!(!result.elements[dep]
                .all_dependencies()
                .contains(&result.index_of(&element.name).unwrap()));
        }
    }
}

#[test]
fn test_runtime_dependencies_sort_last() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("aa.bst", "kind: import\n"),
        ("cc.bst", "kind: import\n"),
        ("rr.bst", "kind: import\n"),
        (
            "app.bst",
            "kind: autotools\n\
             depends:\n\
             - filename: rr.bst\n\
             \x20 type: runtime\n\
             - filename: cc.bst\n\
             \x20 type: build\n\
             - aa.bst\n",
        ),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    let app = result.element(result.targets[0]);
    // Non-runtime deps first in name order, runtime-only last
    let build_names: Vec<&str> = app
        .build_dependencies
        .iter()
        .map(|&idx| result.element(idx).name.as_str())
        .collect();
    assert_eq!(build_names, vec!["aa.bst", "cc.bst"]);
    assert_eq!(
        result.element(*app.runtime_dependencies.last().unwrap()).name,
        "rr.bst"
    );
}

#[test]
fn test_diamond_loads_once() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("base.bst", "kind: import\n"),
        ("left.bst", "kind: autotools\ndepends:\n- base.bst\n"),
        ("right.bst", "kind: autotools\ndepends:\n- base.bst\n"),
        (
            "app.bst",
            "kind: autotools\ndepends:\n- left.bst\n- right.bst\n",
        ),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    // base is shared, not duplicated
    assert_eq!(result.elements.len(), 4);
    let left = result.element(result.index_of("left.bst").unwrap());
    let right = result.element(result.index_of("right.bst").unwrap());
    assert_eq!(left.build_dependencies, right.build_dependencies);
}

#[test]
fn test_circular_dependency_chain() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("x.bst", "kind: import\ndepends:\n- y.bst\n"),
        ("y.bst", "kind: import\ndepends:\n- z.bst\n"),
        ("z.bst", "kind: import\ndepends:\n- x.bst\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["x.bst"]).unwrap_err();

    assert_eq!(err.reason(), "circular-dependency");
    match err {
        LoadError::CircularDependency { chain, .. } => {
            assert_eq!(chain, "x.bst -> y.bst -> z.bst -> x.bst");
        }
        other => panic!("expected circular dependency, got {other:?}"),
    }
}

#[test]
fn test_missing_element_with_suggestion() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("app.bst", "kind: import\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["app"]).unwrap_err();

    assert_eq!(err.reason(), "missing-file");
    match err {
        LoadError::MissingFile { detail, .. } => {
            assert_eq!(detail.as_deref(), Some("Did you mean 'app.bst'?"));
        }
        other => panic!("expected missing file, got {other:?}"),
    }
}

#[test]
fn test_invalid_yaml() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("bad.bst", "kind: [unclosed\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["bad.bst"]).unwrap_err();
    assert_eq!(err.reason(), "invalid-yaml");
}

#[test]
fn test_junction_loads_subproject_elements() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        (
            "sub.bst",
            "kind: junction\nconfig:\n  path: subproject\n",
        ),
        (
            "app.bst",
            "kind: autotools\ndepends:\n- sub.bst:lib.bst\n",
        ),
        ("subproject/project.conf", "name: subtest\n"),
        ("subproject/lib.bst", "kind: autotools\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    let app = result.element(result.targets[0]);
    let lib = result.element(app.build_dependencies[0]);
    assert_eq!(lib.name, "sub.bst:lib.bst");
}

#[test]
fn test_junction_with_explicit_field() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("sub.bst", "kind: junction\nconfig:\n  path: subproject\n"),
        (
            "app.bst",
            "kind: autotools\n\
             depends:\n\
             - filename: lib.bst\n\
             \x20 junction: sub.bst\n",
        ),
        ("subproject/project.conf", "name: subtest\n"),
        ("subproject/lib.bst", "kind: autotools\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();
    let app = result.element(result.targets[0]);
    assert_eq!(result.element(app.build_dependencies[0]).name, "sub.bst:lib.bst");
}

#[test]
fn test_deep_junction_names_forbidden() {
    let dir = project(&[("project.conf", PROJECT_CONF)]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["a.bst:b.bst:c.bst"]).unwrap_err();
    assert_eq!(err.reason(), "invalid-data");
}

#[test]
fn test_cannot_depend_on_junction() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("sub.bst", "kind: junction\nconfig:\n  path: subproject\n"),
        ("app.bst", "kind: autotools\ndepends:\n- sub.bst\n"),
        ("subproject/project.conf", "name: subtest\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["app.bst"]).unwrap_err();
    assert_eq!(err.reason(), "invalid-data");
}

#[test]
fn test_junction_subproject_not_fetched() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("sub.bst", "kind: junction\nconfig:\n  path: not-there\n"),
        ("app.bst", "kind: autotools\ndepends:\n- sub.bst:lib.bst\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["app.bst"]).unwrap_err();
    assert_eq!(err.reason(), "subproject-fetch-needed");
}

#[test]
fn test_junction_without_path_is_inconsistent() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("sub.bst", "kind: junction\n"),
        ("app.bst", "kind: autotools\ndepends:\n- sub.bst:lib.bst\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["app.bst"]).unwrap_err();
    assert_eq!(err.reason(), "subproject-inconsistent");
}

#[test]
fn test_conflicting_junctions_in_siblings() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("sub1.bst", "kind: junction\nconfig:\n  path: sub1\n"),
        ("sub2.bst", "kind: junction\nconfig:\n  path: sub2\n"),
        (
            "app.bst",
            "kind: autotools\ndepends:\n- sub1.bst:x.bst\n- sub2.bst:y.bst\n",
        ),
        // Both sub-projects define the junction 'common.bst' themselves
        ("sub1/project.conf", "name: sub1\n"),
        ("sub1/common.bst", "kind: junction\nconfig:\n  path: common\n"),
        ("sub1/x.bst", "kind: autotools\ndepends:\n- common.bst:e.bst\n"),
        ("sub1/common/project.conf", "name: common1\n"),
        ("sub1/common/e.bst", "kind: import\n"),
        ("sub2/project.conf", "name: sub2\n"),
        ("sub2/common.bst", "kind: junction\nconfig:\n  path: common\n"),
        ("sub2/y.bst", "kind: autotools\ndepends:\n- common.bst:f.bst\n"),
        ("sub2/common/project.conf", "name: common2\n"),
        ("sub2/common/f.bst", "kind: import\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["app.bst"]).unwrap_err();
    assert_eq!(err.reason(), "conflicting-junction");
}

#[test]
fn test_parent_junction_takes_precedence() {
    // The toplevel project defines 'common.bst'; the sub-project's own
    // definition of the same junction is shadowed by the parent's
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("common.bst", "kind: junction\nconfig:\n  path: common\n"),
        ("sub.bst", "kind: junction\nconfig:\n  path: sub\n"),
        ("app.bst", "kind: autotools\ndepends:\n- sub.bst:x.bst\n"),
        ("common/project.conf", "name: parent-common\n"),
        ("common/e.bst", "kind: import\n"),
        ("sub/project.conf", "name: sub\n"),
        ("sub/common.bst", "kind: junction\nconfig:\n  path: other\n"),
        ("sub/x.bst", "kind: autotools\ndepends:\n- common.bst:e.bst\n"),
        // The sub-project's own 'common' would not even resolve
        ("sub/other/project.conf", "name: sub-common\n"),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    // e.bst came from the parent's junction
    assert!(result.index_of("common.bst:e.bst").is_some());
}

#[test]
fn test_sources_get_stable_indices() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        (
            "app.bst",
            "kind: autotools\n\
             sources:\n\
             - kind: tar\n\
             \x20 url: https://example.com/a.tar.gz\n\
             - kind: patch\n\
             \x20 path: fix.diff\n",
        ),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();

    let app = result.element(result.targets[0]);
    assert_eq!(app.sources.len(), 2);
    assert_eq!(app.sources[0].index, 0);
    assert_eq!(app.sources[0].kind, "tar");
    assert_eq!(app.sources[1].index, 1);
    assert_eq!(app.sources[1].kind, "patch");
}

#[test]
fn test_dependency_types_split() {
    let dir = project(&[
        ("project.conf", PROJECT_CONF),
        ("buildtool.bst", "kind: import\n"),
        ("runtimelib.bst", "kind: import\n"),
        ("shared.bst", "kind: import\n"),
        (
            "app.bst",
            "kind: autotools\n\
             depends:\n\
             - filename: buildtool.bst\n\
             \x20 type: build\n\
             - filename: runtimelib.bst\n\
             \x20 type: runtime\n\
             - shared.bst\n",
        ),
    ]);

    let mut loader = Loader::new(dir.path()).unwrap();
    let result = loader.load(&["app.bst"]).unwrap();
    let app = result.element(result.targets[0]);

    let names = |indices: &[usize]| -> Vec<&str> {
        indices
            .iter()
            .map(|&idx| result.element(idx).name.as_str())
            .collect()
    };

    let build = names(&app.build_dependencies);
    let runtime = names(&app.runtime_dependencies);
    assert!(build.contains(&"buildtool.bst"));
    assert!(build.contains(&"shared.bst"));
    assert!(!build.contains(&"runtimelib.bst"));
    assert!(runtime.contains(&"runtimelib.bst"));
    assert!(runtime.contains(&"shared.bst"));
    assert!(!runtime.contains(&"buildtool.bst"));
}

#[test]
fn test_absolute_target_rejected() {
    let dir = project(&[("project.conf", PROJECT_CONF)]);
    let mut loader = Loader::new(dir.path()).unwrap();
    let err = loader.load(&["/abs/app.bst"]).unwrap_err();
    assert_eq!(err.reason(), "invalid-data");
}

// DependencyType is re-exported for consumers computing cache keys
#[test]
fn test_dependency_type_default_is_all() {
    assert_eq!(DependencyType::default(), DependencyType::All);
}
