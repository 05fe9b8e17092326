//! A mutable directory tree view backed by the CAS.
//!
//! `CasBasedDirectory` keeps an in-memory index of its children which is
//! authoritative for the duration of a session; the wire-format Directory
//! message is rebuilt from the index at serialization time. Instead of
//! re-hashing the chain to the root on every change, mutations (and `&mut`
//! descents) mark the affected nodes dirty, and [`CasBasedDirectory::digest`]
//! re-encodes exactly the dirty subtrees, writing every regenerated Directory
//! object back to the store. After `digest()` returns, the root digest
//! reflects the tree and all intermediate objects are stored.

use crate::cascache::CasCache;
use crate::digest::Digest;
use buildstream_core::CasError;
use buildstream_protos::reapi;
use prost::Message;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Cap on symlink indirections during resolution.
const MAX_SYMLINK_HOPS: usize = 64;

/// Outcome of an `import_files` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileListResult {
    /// Files written that did not exist before, by relative path.
    pub files_written: Vec<String>,
    /// Files overwritten in the import.
    pub overwritten: Vec<String>,
    /// Files that could not be written because a non-empty directory was in
    /// the way.
    pub ignored: Vec<String>,
}

impl FileListResult {
    fn combine(&mut self, other: FileListResult) {
        self.files_written.extend(other.files_written);
        self.overwritten.extend(other.overwritten);
        self.ignored.extend(other.ignored);
    }
}

/// Result of resolving a name through symlinks.
#[derive(Debug)]
pub enum Resolved<'a> {
    Directory(&'a CasBasedDirectory),
    File { digest: &'a Digest, executable: bool },
    /// An absolute symlink that policy left unresolved.
    Unresolved,
    /// A broken symlink, treated like a file for listing purposes.
    Broken,
}

#[derive(Debug, Clone)]
enum Entry {
    Directory(CasBasedDirectory),
    File { digest: Digest, executable: bool },
    Symlink { target: String },
}

/// A mutable, hierarchical view onto CAS-stored content.
#[derive(Debug, Clone)]
pub struct CasBasedDirectory {
    cas: CasCache,
    entries: BTreeMap<String, Entry>,
    /// Cached digest of this node; `None` while the subtree is dirty.
    cached_digest: Option<Digest>,
}

impl CasBasedDirectory {
    /// Create an empty root directory.
    #[must_use]
    pub fn new(cas: CasCache) -> Self {
        Self {
            cas,
            entries: BTreeMap::new(),
            cached_digest: None,
        }
    }

    /// Open an existing Directory from the store, loading the full tree.
    pub fn open(cas: CasCache, digest: &Digest) -> Result<Self, CasError> {
        let pb = cas.load_directory(digest)?;
        let mut entries = BTreeMap::new();

        for node in &pb.directories {
            let node_digest = node
                .digest
                .as_ref()
                .ok_or_else(|| CasError::corrupt(digest.to_string(), "DirectoryNode without digest"))?;
            let node_digest = Digest::from_proto(node_digest)?;
            let child = Self::open(cas.clone(), &node_digest)?;
            entries.insert(node.name.clone(), Entry::Directory(child));
        }
        for file in &pb.files {
            let file_digest = file
                .digest
                .as_ref()
                .ok_or_else(|| CasError::corrupt(digest.to_string(), "FileNode without digest"))?;
            entries.insert(
                file.name.clone(),
                Entry::File {
                    digest: Digest::from_proto(file_digest)?,
                    executable: file.is_executable,
                },
            );
        }
        for symlink in &pb.symlinks {
            entries.insert(
                symlink.name.clone(),
                Entry::Symlink {
                    target: symlink.target.clone(),
                },
            );
        }

        Ok(Self {
            cas,
            entries,
            cached_digest: Some(digest.clone()),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the tree, re-encoding dirty subtrees and writing every
    /// regenerated Directory object to the store. Returns the root digest.
    pub fn digest(&mut self) -> Result<Digest, CasError> {
        if let Some(digest) = &self.cached_digest {
            return Ok(digest.clone());
        }

        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut symlinks = Vec::new();

        // BTreeMap iteration is name-sorted within each kind, which makes
        // the serialization canonical across hosts.
        for (name, entry) in self.entries.iter_mut() {
            match entry {
                Entry::File { digest, executable } => files.push(reapi::FileNode {
                    name: name.clone(),
                    digest: Some(digest.to_proto()),
                    is_executable: *executable,
                }),
                Entry::Directory(child) => {
                    let child_digest = child.digest()?;
                    directories.push(reapi::DirectoryNode {
                        name: name.clone(),
                        digest: Some(child_digest.to_proto()),
                    });
                }
                Entry::Symlink { target } => symlinks.push(reapi::SymlinkNode {
                    name: name.clone(),
                    target: target.clone(),
                }),
            }
        }

        let pb = reapi::Directory {
            files,
            directories,
            symlinks,
        };
        let digest = self.cas.add_object(&pb.encode_to_vec())?;
        self.cached_digest = Some(digest.clone());
        Ok(digest)
    }

    /// Add a file with the given content to this directory, replacing any
    /// existing entry of the same name.
    pub fn add_file(
        &mut self,
        name: &str,
        content: &[u8],
        executable: bool,
    ) -> Result<(), CasError> {
        let digest = self.cas.add_object(content)?;
        self.entries.insert(
            name.to_string(),
            Entry::File { digest, executable },
        );
        self.cached_digest = None;
        self.digest()?;
        Ok(())
    }

    /// Add a symlink. The target is stored literally and never resolved at
    /// write time.
    pub fn add_symlink(&mut self, name: &str, target: &str) -> Result<(), CasError> {
        self.entries.insert(
            name.to_string(),
            Entry::Symlink {
                target: target.to_string(),
            },
        );
        self.cached_digest = None;
        self.digest()?;
        Ok(())
    }

    /// Remove an entry if present.
    pub fn delete_entry(&mut self, name: &str) -> Result<(), CasError> {
        if self.entries.remove(name).is_some() {
            self.cached_digest = None;
            self.digest()?;
        }
        Ok(())
    }

    /// Create a subdirectory if it does not already exist. Files and
    /// symlinks-to-files of the same name are replaced; a symlink pointing
    /// at a directory within the tree is followed instead.
    pub fn create_directory(&mut self, name: &str) -> Result<&mut CasBasedDirectory, CasError> {
        let path = self.ensure_dir_path(&[name])?;
        let dir = self.dir_at_mut(&path)?;
        dir.cached_digest = None;
        Ok(dir)
    }

    /// Descend to a subdirectory by `/`-separated path, optionally creating
    /// missing components. Marks the walked chain dirty, since the caller
    /// receives mutable access.
    pub fn descend(&mut self, path: &str, create: bool) -> Result<&mut CasBasedDirectory, CasError> {
        let mut current = self;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            current.cached_digest = None;
            if !matches!(current.entries.get(component), Some(Entry::Directory(_))) {
                if !create || current.entries.contains_key(component) {
                    return Err(CasError::not_found(path));
                }
                let cas = current.cas.clone();
                current
                    .entries
                    .insert(component.to_string(), Entry::Directory(Self::new(cas)));
            }
            current = match current.entries.get_mut(component) {
                Some(Entry::Directory(child)) => child,
                _ => return Err(CasError::not_found(path)),
            };
        }
        current.cached_digest = None;
        Ok(current)
    }

    /// Resolve a `/`-separated name through symlinks, component by
    /// component. `..` above the root stays at the root; with
    /// `absolute_symlinks_resolve` disabled, `/`-prefixed targets are
    /// reported as [`Resolved::Unresolved`].
    pub fn resolve(
        &self,
        name: &str,
        absolute_symlinks_resolve: bool,
    ) -> Result<Resolved<'_>, CasError> {
        let mut stack: Vec<String> = Vec::new();
        let mut pending: VecDeque<String> =
            name.split('/').map(str::to_string).collect();
        let mut hops = 0usize;

        loop {
            let component = match pending.pop_front() {
                None => return Ok(Resolved::Directory(self.dir_at(&stack)?)),
                Some(c) => c,
            };
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                // '..' from the root is valid under POSIX; it stays at the root
                stack.pop();
                continue;
            }

            let dir = self.dir_at(&stack)?;
            match dir.entries.get(&component) {
                None => return Ok(Resolved::Broken),
                Some(Entry::Directory(_)) => stack.push(component),
                Some(Entry::File { digest, executable }) => {
                    if pending.is_empty() {
                        return Ok(Resolved::File {
                            digest,
                            executable: *executable,
                        });
                    }
                    // A file in the middle of the path behaves like a
                    // broken link
                    return Ok(Resolved::Broken);
                }
                Some(Entry::Symlink { target }) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Ok(Resolved::Broken);
                    }
                    if let Some(stripped) = target.strip_prefix('/') {
                        if !absolute_symlinks_resolve {
                            return Ok(Resolved::Unresolved);
                        }
                        stack.clear();
                        splice_front(&mut pending, stripped);
                    } else {
                        splice_front(&mut pending, target);
                    }
                }
            }
        }
    }

    /// Import files from the host filesystem.
    ///
    /// With `files` given, only those relative paths are imported; otherwise
    /// the whole tree below `source_directory` is. Existing files and
    /// symlinks are overwritten, empty directories give way to files, and
    /// files refusing to replace a non-empty directory are recorded in
    /// [`FileListResult::ignored`].
    pub fn import_files(
        &mut self,
        source_directory: &Path,
        files: Option<&[String]>,
    ) -> Result<FileListResult, CasError> {
        let mut paths: Vec<String> = match files {
            Some(list) => list.to_vec(),
            None => enumerate_host_paths(source_directory)?,
        };
        paths.sort();

        let mut result = FileListResult::default();
        for relpath in &paths {
            self.import_one_host_path(source_directory, relpath, &mut result)?;
        }

        // Stamp every regenerated directory down from the root
        self.digest()?;
        debug!(
            source = %source_directory.display(),
            written = result.files_written.len(),
            "Imported files from host filesystem"
        );
        Ok(result)
    }

    fn import_one_host_path(
        &mut self,
        source_directory: &Path,
        relpath: &str,
        result: &mut FileListResult,
    ) -> Result<(), CasError> {
        let import_path = source_directory.join(relpath);
        let metadata = fs::symlink_metadata(&import_path)
            .map_err(|e| CasError::io(format!("stat {}", import_path.display()), e))?;

        let components: Vec<&str> = relpath.split('/').filter(|c| !c.is_empty()).collect();
        let (basename, parents) = match components.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };

        let dir_path = self.ensure_dir_path(parents)?;
        let dir = self.dir_at_mut(&dir_path)?;

        if metadata.file_type().is_symlink() {
            if dir.check_replacement(basename, relpath, result) {
                let target = fs::read_link(&import_path)
                    .map_err(|e| CasError::io(format!("readlink {}", import_path.display()), e))?;
                dir.entries.insert(
                    (*basename).to_string(),
                    Entry::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    },
                );
                dir.cached_digest = None;
                result.files_written.push(relpath.to_string());
            }
        } else if metadata.is_dir() {
            // A plain directory which already exists is not a problem
            if !matches!(dir.entries.get(*basename), Some(Entry::Directory(_))) {
                let cas = dir.cas.clone();
                dir.entries
                    .insert((*basename).to_string(), Entry::Directory(Self::new(cas)));
                dir.cached_digest = None;
            }
        } else if dir.check_replacement(basename, relpath, result) {
            let digest = self.cas.add_object_from_path(&import_path)?;
            let executable = is_executable(&metadata);
            let dir = self.dir_at_mut(&dir_path)?;
            dir.entries.insert(
                (*basename).to_string(),
                Entry::File { digest, executable },
            );
            dir.cached_digest = None;
            result.files_written.push(relpath.to_string());
        }
        Ok(())
    }

    /// Import the contents of another CAS-backed directory into this one,
    /// with the same overwrite semantics as the host filesystem import. The
    /// two paths produce identical digests for identical inputs. Both
    /// directories must be views over the same store.
    pub fn import_cas(&mut self, source: &CasBasedDirectory) -> Result<FileListResult, CasError> {
        let mut result = FileListResult::default();
        self.import_cas_into(source, "", &mut result)?;
        self.digest()?;
        Ok(result)
    }

    fn import_cas_into(
        &mut self,
        source: &CasBasedDirectory,
        prefix: &str,
        result: &mut FileListResult,
    ) -> Result<(), CasError> {
        for (name, entry) in &source.entries {
            let relpath = join_rel(prefix, name);
            match entry {
                Entry::File { digest, executable } => {
                    if self.check_replacement(name, &relpath, result) {
                        self.entries.insert(
                            name.clone(),
                            Entry::File {
                                digest: digest.clone(),
                                executable: *executable,
                            },
                        );
                        self.cached_digest = None;
                        result.files_written.push(relpath);
                    }
                }
                Entry::Symlink { target } => {
                    if self.check_replacement(name, &relpath, result) {
                        self.entries.insert(
                            name.clone(),
                            Entry::Symlink {
                                target: target.clone(),
                            },
                        );
                        self.cached_digest = None;
                        result.files_written.push(relpath);
                    }
                }
                Entry::Directory(subdir) => {
                    match self.entries.get_mut(name) {
                        Some(Entry::Directory(existing)) => {
                            existing.import_cas_into(subdir, &relpath, result)?;
                            self.cached_digest = None;
                        }
                        Some(_) => {
                            // File or symlink in the way of a directory
                            self.entries.remove(name);
                            result.overwritten.push(relpath.clone());
                            let mut fresh = Self::new(self.cas.clone());
                            fresh.import_cas_into(subdir, &relpath, result)?;
                            self.entries.insert(name.clone(), Entry::Directory(fresh));
                            self.cached_digest = None;
                        }
                        None => {
                            // Whole-subtree import: a structural copy is valid
                            let copy = subdir.clone();
                            record_subtree(&copy, &relpath, &mut result.files_written);
                            self.entries.insert(name.clone(), Entry::Directory(copy));
                            self.cached_digest = None;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Export this tree to the host filesystem.
    pub fn export_files(&self, to_directory: &Path) -> Result<(), CasError> {
        fs::create_dir_all(to_directory)
            .map_err(|e| CasError::io(format!("mkdir {}", to_directory.display()), e))?;

        for (name, entry) in &self.entries {
            let dest = to_directory.join(name);
            match entry {
                Entry::Directory(child) => {
                    child.export_files(&dest)?;
                }
                Entry::File { digest, executable } => {
                    let objpath = self.cas.objpath(digest);
                    fs::copy(&objpath, &dest)
                        .map_err(|e| CasError::io(format!("copy to {}", dest.display()), e))?;
                    set_executable(&dest, *executable)?;
                }
                Entry::Symlink { target } => {
                    make_symlink(target, &dest)?;
                }
            }
        }
        Ok(())
    }

    /// Relative paths of all files, symlinks and empty directories in the
    /// tree, in sorted order.
    #[must_use]
    pub fn list_relative_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_relative_paths("", &mut paths);
        paths
    }

    fn collect_relative_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            let relpath = join_rel(prefix, name);
            match entry {
                Entry::Directory(child) => {
                    if child.is_empty() {
                        paths.push(relpath);
                    } else {
                        child.collect_relative_paths(&relpath, paths);
                    }
                }
                _ => paths.push(relpath),
            }
        }
    }

    /// Whether `name` exists, and if so whether the import may overwrite it.
    fn check_replacement(
        &mut self,
        name: &str,
        relpath: &str,
        result: &mut FileListResult,
    ) -> bool {
        enum Verdict {
            Vacant,
            Overwrite,
            Ignore,
        }
        let verdict = match self.entries.get(name) {
            None => Verdict::Vacant,
            Some(Entry::Directory(dir)) if !dir.is_empty() => Verdict::Ignore,
            Some(_) => Verdict::Overwrite,
        };
        match verdict {
            Verdict::Vacant => true,
            Verdict::Overwrite => {
                self.entries.remove(name);
                self.cached_digest = None;
                result.overwritten.push(relpath.to_string());
                true
            }
            Verdict::Ignore => {
                result.ignored.push(relpath.to_string());
                false
            }
        }
    }

    /// Walk (and create) the directory chain for `components`, following
    /// symlinks. Returns the canonical path of directory names from this
    /// node. Files in the way are replaced by directories.
    fn ensure_dir_path(&mut self, components: &[&str]) -> Result<Vec<String>, CasError> {
        enum Probe {
            Descend,
            Symlink(String),
            Create,
        }

        let mut stack: Vec<String> = Vec::new();
        let mut pending: VecDeque<String> =
            components.iter().map(|c| (*c).to_string()).collect();
        let mut hops = 0usize;

        while let Some(component) = pending.pop_front() {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                stack.pop();
                continue;
            }

            let dir = self.dir_at_mut(&stack)?;
            let probe = match dir.entries.get(&component) {
                Some(Entry::Directory(_)) => Probe::Descend,
                Some(Entry::Symlink { target }) => Probe::Symlink(target.clone()),
                _ => Probe::Create,
            };

            match probe {
                Probe::Descend => stack.push(component),
                Probe::Create => {
                    let cas = dir.cas.clone();
                    dir.entries
                        .insert(component.clone(), Entry::Directory(Self::new(cas)));
                    dir.cached_digest = None;
                    stack.push(component);
                }
                Probe::Symlink(target) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(CasError::corrupt(
                            component,
                            "too many levels of symbolic links",
                        ));
                    }
                    if let Some(stripped) = target.strip_prefix('/') {
                        stack.clear();
                        splice_front(&mut pending, stripped);
                    } else {
                        splice_front(&mut pending, &target);
                    }
                }
            }
        }
        Ok(stack)
    }

    fn dir_at(&self, path: &[String]) -> Result<&CasBasedDirectory, CasError> {
        let mut current = self;
        for component in path {
            current = match current.entries.get(component) {
                Some(Entry::Directory(child)) => child,
                _ => return Err(CasError::not_found(component.clone())),
            };
        }
        Ok(current)
    }

    fn dir_at_mut(&mut self, path: &[String]) -> Result<&mut CasBasedDirectory, CasError> {
        let mut current = self;
        for component in path {
            current.cached_digest = None;
            current = match current.entries.get_mut(component) {
                Some(Entry::Directory(child)) => child,
                _ => return Err(CasError::not_found(component.clone())),
            };
        }
        Ok(current)
    }
}

fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn splice_front(pending: &mut VecDeque<String>, path: &str) {
    for component in path.split('/').rev() {
        if !component.is_empty() {
            pending.push_front(component.to_string());
        }
    }
}

fn record_subtree(dir: &CasBasedDirectory, prefix: &str, written: &mut Vec<String>) {
    for (name, entry) in &dir.entries {
        let relpath = join_rel(prefix, name);
        match entry {
            Entry::Directory(child) => record_subtree(child, &relpath, written),
            _ => written.push(relpath),
        }
    }
}

/// Enumerate every file, directory and symlink below `root`, as relative
/// paths.
fn enumerate_host_paths(root: &Path) -> Result<Vec<String>, CasError> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| {
            CasError::io(
                "walk import source",
                e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                }),
            )
        })?;
        let relpath = entry
            .path()
            .strip_prefix(root)
            .expect("walked entries live below the root")
            .to_string_lossy()
            .replace('\\', "/");
        paths.push(relpath);
    }
    Ok(paths)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), CasError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CasError::io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), CasError> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, dest: &Path) -> Result<(), CasError> {
    std::os::unix::fs::symlink(target, dest)
        .map_err(|e| CasError::io(format!("symlink {}", dest.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, dest: &Path) -> Result<(), CasError> {
    Err(CasError::io(
        format!("symlink {}", dest.display()),
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks unsupported"),
    ))
}
