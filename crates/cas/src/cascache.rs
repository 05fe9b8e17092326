//! Content-addressed object store with a symbolic ref namespace.
//!
//! Objects live under `cas/objects/<hh>/<rest-of-hash>` and are immutable;
//! writes go through a temp file in `cas/tmp/` and are committed with an
//! atomic rename, which makes concurrent writers safe without locking. Refs
//! live under `cas/refs/heads/<name>` and are the only mutable state; the
//! mtime of a ref file is the LRU clock used by eviction and by concurrent
//! instances defending their live set.

use crate::digest::Digest;
use buildstream_core::CasError;
use buildstream_protos::reapi;
use filetime::FileTime;
use globset::Glob;
use prost::Message;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A content-addressed object store rooted at `<cachedir>/cas`.
#[derive(Debug, Clone)]
pub struct CasCache {
    casdir: PathBuf,
}

impl CasCache {
    /// Open (and create if necessary) the store below `cachedir`.
    pub fn new(cachedir: impl Into<PathBuf>) -> Result<Self, CasError> {
        let casdir = cachedir.into().join("cas");
        for subdir in ["objects", "refs/heads", "tmp"] {
            let path = casdir.join(subdir);
            fs::create_dir_all(&path).map_err(|e| map_io("create_dir_all", &path, e))?;
        }
        Ok(Self { casdir })
    }

    /// Root of the store, `<cachedir>/cas`.
    #[must_use]
    pub fn casdir(&self) -> &Path {
        &self.casdir
    }

    /// Check that the store is usable before starting a pipeline.
    pub fn preflight(&self) -> Result<(), CasError> {
        let probe = tempfile::NamedTempFile::new_in(self.tmpdir())
            .map_err(|e| map_io("preflight", &self.tmpdir(), e))?;
        drop(probe);
        Ok(())
    }

    fn tmpdir(&self) -> PathBuf {
        self.casdir.join("tmp")
    }

    /// The object path for a digest. A pure function of the hash.
    #[must_use]
    pub fn objpath(&self, digest: &Digest) -> PathBuf {
        self.casdir
            .join("objects")
            .join(&digest.hash[0..2])
            .join(&digest.hash[2..])
    }

    #[must_use]
    pub fn has_object(&self, digest: &Digest) -> bool {
        self.objpath(digest).exists()
    }

    /// Store a blob under its hash. Idempotent.
    pub fn add_object(&self, data: &[u8]) -> Result<Digest, CasError> {
        let digest = Digest::from_bytes(data);
        if self.has_object(&digest) {
            return Ok(digest);
        }

        let mut tmp = tempfile::NamedTempFile::new_in(self.tmpdir())
            .map_err(|e| map_io("create temp object", &self.tmpdir(), e))?;
        tmp.write_all(data)
            .map_err(|e| CasError::io("write object", e))?;
        self.commit_object(tmp, &digest)?;

        Ok(digest)
    }

    /// Store the content of a file under its hash. Idempotent.
    pub fn add_object_from_path(&self, path: &Path) -> Result<Digest, CasError> {
        let digest = Digest::from_file(path)?;
        if self.has_object(&digest) {
            return Ok(digest);
        }

        let mut tmp = tempfile::NamedTempFile::new_in(self.tmpdir())
            .map_err(|e| map_io("create temp object", &self.tmpdir(), e))?;
        let mut src = fs::File::open(path).map_err(|e| map_io("open", path, e))?;
        std::io::copy(&mut src, &mut tmp).map_err(|e| CasError::io("copy object", e))?;
        self.commit_object(tmp, &digest)?;

        Ok(digest)
    }

    /// fsync-before-rename commit of a fully written temp file.
    fn commit_object(
        &self,
        tmp: tempfile::NamedTempFile,
        digest: &Digest,
    ) -> Result<(), CasError> {
        tmp.as_file()
            .sync_all()
            .map_err(|e| CasError::io("sync object", e))?;

        let objpath = self.objpath(digest);
        if let Some(parent) = objpath.parent() {
            fs::create_dir_all(parent).map_err(|e| map_io("create_dir_all", parent, e))?;
        }
        tmp.persist(&objpath)
            .map_err(|e| map_io("persist object", &objpath, e.error))?;

        debug!(digest = %digest, "Stored object");
        Ok(())
    }

    /// Load a blob, verifying it against its digest.
    pub fn load_object(&self, digest: &Digest) -> Result<Vec<u8>, CasError> {
        let path = self.objpath(digest);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::not_found(digest.to_string())
            } else {
                map_io("read object", &path, e)
            }
        })?;

        let computed = Digest::from_bytes(&data);
        if computed != *digest {
            return Err(CasError::corrupt(
                digest.to_string(),
                format!("content hashes to {computed}"),
            ));
        }

        Ok(data)
    }

    /// Load and decode a serialized Directory message.
    pub fn load_directory(&self, digest: &Digest) -> Result<reapi::Directory, CasError> {
        let data = self.load_object(digest)?;
        reapi::Directory::decode(data.as_slice())
            .map_err(|e| CasError::corrupt(digest.to_string(), e.to_string()))
    }

    fn refpath(&self, name: &str) -> PathBuf {
        self.casdir.join("refs/heads").join(name)
    }

    /// Bind a ref to a Directory digest. Last writer wins.
    pub fn set_ref(&self, name: &str, digest: &Digest) -> Result<(), CasError> {
        let refpath = self.refpath(name);
        if let Some(parent) = refpath.parent() {
            fs::create_dir_all(parent).map_err(|e| map_io("create_dir_all", parent, e))?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(self.tmpdir())
            .map_err(|e| map_io("create temp ref", &self.tmpdir(), e))?;
        tmp.write_all(&digest.to_proto().encode_to_vec())
            .map_err(|e| CasError::io("write ref", e))?;
        tmp.persist(&refpath)
            .map_err(|e| map_io("persist ref", &refpath, e.error))?;

        debug!(r#ref = name, digest = %digest, "Updated ref");
        Ok(())
    }

    /// Resolve a ref to its digest, optionally touching its mtime so it
    /// counts as recently used.
    pub fn resolve_ref(&self, name: &str, update_mtime: bool) -> Result<Digest, CasError> {
        let refpath = self.refpath(name);
        let data = fs::read(&refpath).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::not_found(name)
            } else {
                map_io("read ref", &refpath, e)
            }
        })?;

        if update_mtime {
            filetime::set_file_mtime(&refpath, FileTime::now())
                .map_err(|e| map_io("touch ref", &refpath, e))?;
        }

        let proto = reapi::Digest::decode(data.as_slice())
            .map_err(|e| CasError::corrupt(name, e.to_string()))?;
        Digest::from_proto(&proto)
    }

    /// Whether a ref exists and its root object is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        match self.resolve_ref(name, false) {
            Ok(digest) => self.has_object(&digest),
            Err(_) => false,
        }
    }

    /// Whether the artifact for `name` has a populated (non-dangling)
    /// subdirectory called `subdir`.
    pub fn contains_subdir_artifact(&self, name: &str, subdir: &str) -> Result<bool, CasError> {
        let digest = self.resolve_ref(name, false)?;
        let directory = self.load_directory(&digest)?;

        for node in &directory.directories {
            if node.name == subdir {
                if let Some(node_digest) = &node.digest {
                    let node_digest = Digest::from_proto(node_digest)?;
                    return Ok(self.has_object(&node_digest));
                }
            }
        }
        Ok(false)
    }

    /// Alias an existing ref under a new name.
    pub fn link_ref(&self, oldname: &str, newname: &str) -> Result<(), CasError> {
        let digest = self.resolve_ref(oldname, false)?;
        self.set_ref(newname, &digest)
    }

    /// Touch a ref's mtime so concurrent instances do not evict it.
    pub fn update_mtime(&self, name: &str) -> Result<(), CasError> {
        let refpath = self.refpath(name);
        filetime::set_file_mtime(&refpath, FileTime::now()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::not_found(name)
            } else {
                map_io("touch ref", &refpath, e)
            }
        })
    }

    /// List refs in LRU order (least recently used first), derived from ref
    /// file mtimes. Equal timestamps are broken by name for stability.
    pub fn list_refs(&self, glob: Option<&str>) -> Result<Vec<String>, CasError> {
        let heads = self.casdir.join("refs/heads");
        let matcher = match glob {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| CasError::corrupt(pattern, e.to_string()))?
                    .compile_matcher(),
            ),
            None => None,
        };

        let mut refs: Vec<(FileTime, String)> = Vec::new();
        for entry in walkdir::WalkDir::new(&heads) {
            let entry = entry.map_err(|e| {
                CasError::io("walk refs", e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(&heads)
                .expect("walked entries live below refs/heads")
                .to_string_lossy()
                .replace('\\', "/");
            if let Some(matcher) = &matcher {
                if !matcher.is_match(&name) {
                    continue;
                }
            }
            let metadata = entry
                .metadata()
                .map_err(|e| CasError::io("stat ref", e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir metadata")
                })))?;
            refs.push((FileTime::from_last_modification_time(&metadata), name));
        }

        refs.sort();
        Ok(refs.into_iter().map(|(_, name)| name).collect())
    }

    /// Remove a ref. Returns the bytes this removal can free: with
    /// `defer_prune` the size reachable from the ref (a safe overestimate
    /// when blobs are shared), otherwise the bytes actually pruned.
    pub fn remove(&self, name: &str, defer_prune: bool) -> Result<u64, CasError> {
        let digest = self.resolve_ref(name, false)?;

        let refpath = self.refpath(name);
        fs::remove_file(&refpath).map_err(|e| map_io("remove ref", &refpath, e))?;
        debug!(r#ref = name, "Removed ref");

        if defer_prune {
            let mut seen = HashSet::new();
            return self.reachable_size(&digest, &mut seen);
        }

        self.prune()
    }

    /// Delete every object not reachable from any ref. Returns bytes freed.
    pub fn prune(&self) -> Result<u64, CasError> {
        let mut reachable: HashSet<String> = HashSet::new();
        for name in self.list_refs(None)? {
            let digest = self.resolve_ref(&name, false)?;
            self.mark_reachable(&digest, &mut reachable)?;
        }

        let mut pruned = 0u64;
        let objects = self.casdir.join("objects");
        for entry in walkdir::WalkDir::new(&objects) {
            let entry = entry.map_err(|e| {
                CasError::io("walk objects", e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relpath = entry
                .path()
                .strip_prefix(&objects)
                .expect("walked entries live below objects");
            let mut components = relpath.iter();
            let hash = match (components.next(), components.next()) {
                (Some(prefix), Some(rest)) => {
                    format!("{}{}", prefix.to_string_lossy(), rest.to_string_lossy())
                }
                _ => continue,
            };

            if !reachable.contains(&hash) {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(object = %hash, error = %e, "Failed to prune object");
                } else {
                    pruned += size;
                }
            }
        }

        debug!(bytes = pruned, "Pruned unreachable objects");
        Ok(pruned)
    }

    /// Sum the sizes of all stored objects.
    pub fn calculate_cache_size(&self) -> Result<u64, CasError> {
        let mut total = 0u64;
        let objects = self.casdir.join("objects");
        for entry in walkdir::WalkDir::new(&objects) {
            let entry = entry.map_err(|e| {
                CasError::io("walk objects", e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
                }))
            })?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// Collect the hashes reachable from a Directory digest, the digest
    /// itself included. Objects missing on disk are skipped; a partial pull
    /// leaves only the gap for the next attempt.
    fn mark_reachable(
        &self,
        digest: &Digest,
        reachable: &mut HashSet<String>,
    ) -> Result<(), CasError> {
        if !reachable.insert(digest.hash.clone()) {
            return Ok(());
        }
        if !self.has_object(digest) {
            return Ok(());
        }

        let directory = self.load_directory(digest)?;
        for file in &directory.files {
            if let Some(file_digest) = &file.digest {
                reachable.insert(file_digest.hash.clone());
            }
        }
        for node in &directory.directories {
            if let Some(node_digest) = &node.digest {
                let node_digest = Digest::from_proto(node_digest)?;
                self.mark_reachable(&node_digest, reachable)?;
            }
        }
        Ok(())
    }

    /// Upper-bound size of the tree below a Directory digest, counting each
    /// object once.
    fn reachable_size(
        &self,
        digest: &Digest,
        seen: &mut HashSet<String>,
    ) -> Result<u64, CasError> {
        if !seen.insert(digest.hash.clone()) {
            return Ok(0);
        }
        if !self.has_object(digest) {
            return Ok(0);
        }

        let mut total = digest.size_bytes.max(0) as u64;
        let directory = self.load_directory(digest)?;
        for file in &directory.files {
            if let Some(file_digest) = &file.digest {
                if seen.insert(file_digest.hash.clone()) {
                    total += file_digest.size_bytes.max(0) as u64;
                }
            }
        }
        for node in &directory.directories {
            if let Some(node_digest) = &node.digest {
                let node_digest = Digest::from_proto(node_digest)?;
                total += self.reachable_size(&node_digest, seen)?;
            }
        }
        Ok(total)
    }
}

fn map_io(operation: &str, path: &Path, source: std::io::Error) -> CasError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        CasError::PermDenied {
            path: path.to_path_buf(),
        }
    } else {
        CasError::io(format!("{operation} {}", path.display()), source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> (TempDir, CasCache) {
        let tmp = TempDir::new().unwrap();
        let cas = CasCache::new(tmp.path()).unwrap();
        (tmp, cas)
    }

    #[test]
    fn test_add_and_load_object() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"some content").unwrap();
        assert!(cas.has_object(&digest));
        assert_eq!(cas.load_object(&digest).unwrap(), b"some content");
    }

    #[test]
    fn test_add_object_idempotent() {
        let (_tmp, cas) = cache();
        let a = cas.add_object(b"twice").unwrap();
        let b = cas.add_object(b"twice").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_objpath_layout() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"layout").unwrap();
        let path = cas.objpath(&digest);
        let parent = path.parent().unwrap().file_name().unwrap();
        assert_eq!(parent.to_str().unwrap(), &digest.hash[0..2]);
        assert!(path.ends_with(
            Path::new(&digest.hash[0..2]).join(&digest.hash[2..])
        ));
    }

    #[test]
    fn test_load_detects_corruption() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"pristine").unwrap();
        fs::write(cas.objpath(&digest), b"tampered").unwrap();
        let err = cas.load_object(&digest).unwrap_err();
        assert_eq!(err.reason(), "corrupt");
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let (_tmp, cas) = cache();
        let digest = Digest::from_bytes(b"never stored");
        let err = cas.load_object(&digest).unwrap_err();
        assert_eq!(err.reason(), "not-found");
    }

    #[test]
    fn test_set_and_resolve_ref() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"tree").unwrap();
        cas.set_ref("test/element/abc123", &digest).unwrap();
        let resolved = cas.resolve_ref("test/element/abc123", false).unwrap();
        assert_eq!(resolved, digest);
    }

    #[test]
    fn test_resolve_missing_ref() {
        let (_tmp, cas) = cache();
        let err = cas.resolve_ref("no/such/ref", false).unwrap_err();
        assert_eq!(err.reason(), "not-found");
    }

    #[test]
    fn test_link_ref_aliases_digest() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"shared").unwrap();
        cas.set_ref("p/e/strong", &digest).unwrap();
        cas.link_ref("p/e/strong", "p/e/weak").unwrap();
        assert_eq!(cas.resolve_ref("p/e/weak", false).unwrap(), digest);
    }

    #[test]
    fn test_list_refs_lru_order() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"x").unwrap();
        for (name, secs) in [("p/a/1", 100), ("p/b/2", 300), ("p/c/3", 200)] {
            cas.set_ref(name, &digest).unwrap();
            filetime::set_file_mtime(
                cas.casdir().join("refs/heads").join(name),
                FileTime::from_unix_time(1_500_000_000 + secs, 0),
            )
            .unwrap();
        }

        let refs = cas.list_refs(None).unwrap();
        assert_eq!(refs, vec!["p/a/1", "p/c/3", "p/b/2"]);
    }

    #[test]
    fn test_list_refs_glob() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"x").unwrap();
        cas.set_ref("proj/app/1", &digest).unwrap();
        cas.set_ref("proj/lib/2", &digest).unwrap();
        cas.set_ref("other/app/3", &digest).unwrap();

        let refs = cas.list_refs(Some("proj/**")).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.starts_with("proj/")));
    }

    #[test]
    fn test_update_mtime_defends_ref() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"x").unwrap();
        cas.set_ref("p/old/1", &digest).unwrap();
        cas.set_ref("p/new/2", &digest).unwrap();

        let heads = cas.casdir().join("refs/heads");
        filetime::set_file_mtime(heads.join("p/old/1"), FileTime::from_unix_time(1_000, 0))
            .unwrap();
        filetime::set_file_mtime(heads.join("p/new/2"), FileTime::from_unix_time(2_000, 0))
            .unwrap();

        // Touching the older ref moves it to the back of the LRU list
        cas.update_mtime("p/old/1").unwrap();
        let refs = cas.list_refs(None).unwrap();
        assert_eq!(refs, vec!["p/new/2", "p/old/1"]);
    }

    #[test]
    fn test_prune_keeps_reachable() {
        let (_tmp, cas) = cache();

        let kept = cas.add_object(b"kept blob").unwrap();
        let directory = reapi::Directory {
            files: vec![reapi::FileNode {
                name: "kept".into(),
                digest: Some(kept.to_proto()),
                is_executable: false,
            }],
            directories: vec![],
            symlinks: vec![],
        };
        let root = cas.add_object(&directory.encode_to_vec()).unwrap();
        cas.set_ref("p/e/key", &root).unwrap();

        let orphan = cas.add_object(b"orphan blob").unwrap();

        let freed = cas.prune().unwrap();
        assert_eq!(freed, b"orphan blob".len() as u64);
        assert!(cas.has_object(&kept));
        assert!(cas.has_object(&root));
        assert!(!cas.has_object(&orphan));
    }

    #[test]
    fn test_remove_then_prune_frees_objects() {
        let (_tmp, cas) = cache();
        let blob = cas.add_object(b"artifact data").unwrap();
        let directory = reapi::Directory {
            files: vec![reapi::FileNode {
                name: "data".into(),
                digest: Some(blob.to_proto()),
                is_executable: false,
            }],
            directories: vec![],
            symlinks: vec![],
        };
        let root = cas.add_object(&directory.encode_to_vec()).unwrap();
        cas.set_ref("p/e/key", &root).unwrap();

        let estimated = cas.remove("p/e/key", true).unwrap();
        assert!(estimated >= b"artifact data".len() as u64);
        assert!(cas.list_refs(None).unwrap().is_empty());

        // Objects linger until the deferred prune
        assert!(cas.has_object(&blob));
        let freed = cas.prune().unwrap();
        assert!(freed > 0);
        assert!(!cas.has_object(&blob));
    }

    #[test]
    fn test_calculate_cache_size() {
        let (_tmp, cas) = cache();
        cas.add_object(b"12345").unwrap();
        cas.add_object(b"123").unwrap();
        assert_eq!(cas.calculate_cache_size().unwrap(), 8);
    }

    #[test]
    fn test_contains_requires_object() {
        let (_tmp, cas) = cache();
        let digest = cas.add_object(b"present").unwrap();
        cas.set_ref("p/e/1", &digest).unwrap();
        assert!(cas.contains("p/e/1"));

        // A dangling ref does not count as cached
        fs::remove_file(cas.objpath(&digest)).unwrap();
        assert!(!cas.contains("p/e/1"));
    }
}
