//! The artifact cache: element-to-ref binding over the CAS, required-set
//! pinning, LRU eviction driven by the quota, and replication against
//! remote caches.
//!
//! Artifacts are named `<project>/<sanitized-element>/<cachekey>`. Each
//! element owns a strong and a weak cache key; both are pinned together for
//! the duration of a pipeline and both are evicted together, since dropping
//! only one of the pair saves no space.

use buildstream_cas::{CasBasedDirectory, CasCache, CasQuota, Digest};
use buildstream_core::utils::{pretty_size, sanitize_element_name};
use buildstream_core::{ArtifactError, CasError, KeyStrength};
use buildstream_remote::{CasRemote, RemoteSpec};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Anything owning artifacts in the cache: a project-scoped element name
/// plus its cache keys.
pub trait Keyed {
    fn project_name(&self) -> &str;
    fn element_name(&self) -> &str;
    fn cache_key(&self, strength: KeyStrength) -> Option<String>;
}

/// The ref name for one element at one cache key.
#[must_use]
pub fn get_artifact_name(project: &str, element: &str, key: &str) -> String {
    format!("{}/{}/{}", project, sanitize_element_name(element), key)
}

/// An artifact cache over a local store, with optional remotes.
pub struct ArtifactCache {
    cas: CasCache,
    quota: CasQuota,
    remote_specs: Vec<RemoteSpec>,
    remotes: Vec<CasRemote>,
    has_push_remotes: bool,

    /// Cache keys required by the current pipeline; refs carrying these
    /// keys are never evicted.
    required_artifacts: HashSet<String>,
}

impl ArtifactCache {
    /// Compose an artifact cache from an opened store and configured quota.
    #[must_use]
    pub fn with_quota(cas: CasCache, quota: CasQuota) -> Self {
        Self {
            cas,
            quota,
            remote_specs: Vec::new(),
            remotes: Vec::new(),
            has_push_remotes: false,
            required_artifacts: HashSet::new(),
        }
    }

    /// Open the cache below `cachedir` with the production quota headroom.
    pub fn open(
        cachedir: impl Into<std::path::PathBuf>,
        quota_config: Option<&str>,
    ) -> Result<Self, ArtifactError> {
        let cachedir = cachedir.into();
        let cas = CasCache::new(&cachedir)?;
        let quota = CasQuota::new(&cachedir, &cas, quota_config)?;
        Ok(Self::with_quota(cas, quota))
    }

    #[must_use]
    pub fn cas(&self) -> &CasCache {
        &self.cas
    }

    /// Preflight the local store before scheduling work.
    pub fn preflight(&self) -> Result<(), CasError> {
        self.cas.preflight()
    }

    /// Set the list of remote caches, in priority order.
    pub fn set_remotes(&mut self, specs: Vec<RemoteSpec>) {
        self.remote_specs = specs;
    }

    /// Contact every configured remote. Unreachable remotes are reported
    /// through `on_failure` and skipped; a push remote that turns out to
    /// be read-only is an error.
    pub async fn initialize_remotes(
        &mut self,
        mut on_failure: Option<&mut dyn FnMut(&str, &str)>,
    ) -> Result<(), ArtifactError> {
        for spec in self.remote_specs.clone() {
            match CasRemote::check(&spec).await {
                Ok(allow_updates) => {
                    if spec.push && !allow_updates {
                        return Err(ArtifactError::PushForbidden {
                            url: spec.url.clone(),
                        });
                    }
                    let remote = CasRemote::init(&spec).await.map_err(ArtifactError::from)?;
                    self.has_push_remotes |= spec.push;
                    self.remotes.push(remote);
                }
                Err(err) => match on_failure.as_mut() {
                    Some(on_failure) => on_failure(&spec.url, &err.to_string()),
                    None => return Err(err.into()),
                },
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn has_fetch_remotes(&self) -> bool {
        !self.remotes.is_empty()
    }

    #[must_use]
    pub fn has_push_remotes(&self) -> bool {
        self.has_push_remotes
    }

    /// Whether the artifact for `element` at `key` is in the local cache.
    #[must_use]
    pub fn contains(&self, element: &dyn Keyed, key: &str) -> bool {
        let name = get_artifact_name(element.project_name(), element.element_name(), key);
        self.cas.contains(&name)
    }

    /// Commit a built directory under every given key.
    pub fn commit(
        &self,
        element: &dyn Keyed,
        content: &mut CasBasedDirectory,
        keys: &[String],
    ) -> Result<(), ArtifactError> {
        let tree = content.digest()?;
        for key in keys {
            let name = get_artifact_name(element.project_name(), element.element_name(), key);
            self.cas.set_ref(&name, &tree)?;
        }
        Ok(())
    }

    /// Open the cached directory of an element, touching its LRU clock.
    pub fn get_artifact_directory(
        &self,
        element: &dyn Keyed,
        key: &str,
    ) -> Result<CasBasedDirectory, ArtifactError> {
        let name = get_artifact_name(element.project_name(), element.element_name(), key);
        let digest = self.cas.resolve_ref(&name, true)?;
        Ok(CasBasedDirectory::open(self.cas.clone(), &digest)?)
    }

    /// Alias the artifact under an additional key.
    pub fn link_key(
        &self,
        element: &dyn Keyed,
        oldkey: &str,
        newkey: &str,
    ) -> Result<(), ArtifactError> {
        let oldref = get_artifact_name(element.project_name(), element.element_name(), oldkey);
        let newref = get_artifact_name(element.project_name(), element.element_name(), newkey);
        Ok(self.cas.link_ref(&oldref, &newref)?)
    }

    /// Remove one artifact ref. Blobs are freed by a later [`prune`] when
    /// `defer_prune` is set.
    ///
    /// [`prune`]: ArtifactCache::prune
    pub fn remove(&self, ref_name: &str, defer_prune: bool) -> Result<u64, ArtifactError> {
        Ok(self.cas.remove(ref_name, defer_prune)?)
    }

    /// Remove every key of an element's artifact, then prune.
    pub fn remove_element(&self, element: &dyn Keyed) -> Result<u64, ArtifactError> {
        for strength in KeyStrength::ALL {
            if let Some(key) = element.cache_key(strength) {
                let name =
                    get_artifact_name(element.project_name(), element.element_name(), &key);
                match self.cas.remove(&name, true) {
                    Ok(_) | Err(CasError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(self.cas.prune()?)
    }

    /// Prune unreachable objects.
    pub fn prune(&self) -> Result<u64, ArtifactError> {
        Ok(self.cas.prune()?)
    }

    /// List artifacts in LRU order.
    pub fn list_artifacts(&self, glob: Option<&str>) -> Result<Vec<String>, ArtifactError> {
        Ok(self.cas.list_refs(glob)?)
    }

    /// Mark elements whose artifacts the current pipeline may still need.
    ///
    /// Their resolved keys are pinned against eviction, and the mtimes of
    /// already-known refs are bumped so concurrent instances sharing the
    /// store do not evict them either.
    pub fn mark_required_elements<'a, I>(&mut self, elements: I)
    where
        I: IntoIterator<Item = &'a dyn Keyed>,
    {
        for element in elements {
            for strength in KeyStrength::ALL {
                if let Some(key) = element.cache_key(strength) {
                    let name =
                        get_artifact_name(element.project_name(), element.element_name(), &key);
                    if let Err(e) = self.cas.update_mtime(&name) {
                        debug!(r#ref = %name, error = %e, "No cached artifact to defend yet");
                    }
                    self.required_artifacts.insert(key);
                }
            }
        }
    }

    /// Pin raw cache keys directly, without touching mtimes. Used to hand a
    /// worker job the same required set as the owning cache.
    pub fn mark_required_keys<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.required_artifacts.extend(keys);
    }

    /// Snapshot of the currently pinned cache keys.
    #[must_use]
    pub fn required_keys(&self) -> HashSet<String> {
        self.required_artifacts.clone()
    }

    /// Snapshot of the quota accounting, for worker jobs.
    #[must_use]
    pub fn quota_snapshot(&self) -> CasQuota {
        self.quota.clone()
    }

    /// Number of required cache keys currently pinned.
    #[must_use]
    pub fn required_count(&self) -> usize {
        self.required_artifacts.len()
    }

    /// Add the reported size of a newly cached artifact to the estimate.
    pub fn add_artifact_size(&mut self, artifact_size: u64) -> Result<(), ArtifactError> {
        let cache_size = self.quota.get_cache_size(&self.cas)? + artifact_size;
        self.quota.set_cache_size(cache_size, true)?;
        Ok(())
    }

    /// Whether the cache estimate exceeds the quota.
    pub fn full(&mut self) -> Result<bool, ArtifactError> {
        Ok(self.quota.full(&self.cas)?)
    }

    /// Current estimated cache size.
    pub fn get_cache_size(&mut self) -> Result<u64, ArtifactError> {
        Ok(self.quota.get_cache_size(&self.cas)?)
    }

    /// Replace the cache size estimate (deltas computed by worker jobs are
    /// applied through here by the owning loop).
    pub fn set_cache_size(&mut self, size: u64, write_to_disk: bool) -> Result<(), ArtifactError> {
        Ok(self.quota.set_cache_size(size, write_to_disk)?)
    }

    /// Clean the artifact cache as much as possible.
    ///
    /// Walks refs in LRU order, removing unpinned artifacts until the cache
    /// drops below the lower threshold. Both keys of an element go together:
    /// when a ref is removed, sibling refs of the same element resolving to
    /// the same digest are removed in the same step. Pruning of unreachable
    /// blobs is amortised into a single pass at the end.
    pub fn clean(
        &mut self,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64, ArtifactError> {
        // Start from the real size, not the running estimate
        self.quota.compute_cache_size(&self.cas)?;

        info!(
            required = self.required_artifacts.len(),
            quota = %pretty_size(self.quota.cache_quota()),
            usage = %pretty_size(self.quota.get_cache_size(&self.cas)?),
            "Starting cache cleanup"
        );

        let mut artifacts: std::collections::VecDeque<String> =
            self.cas.list_refs(None)?.into();

        let mut removed_ref_count = 0usize;
        let mut space_saved = 0u64;

        while self.quota.get_cache_size(&self.cas)? >= self.quota.lower_threshold() {
            let to_remove = match artifacts.pop_front() {
                Some(ref_name) => ref_name,
                None => {
                    // Everything left is required; if we are still over
                    // quota the build cannot proceed.
                    if self.quota.full(&self.cas)? {
                        let detail = format!(
                            "Aborted after removing {} refs and saving {} disk space.\n\
                             The remaining {} in the cache is required by the {} elements in your build plan\n\n\
                             There is not enough space to complete the build.\n\
                             Please increase the cache quota and/or make more disk space.",
                            removed_ref_count,
                            pretty_size(space_saved),
                            pretty_size(self.quota.get_cache_size(&self.cas)?),
                            self.required_artifacts.len(),
                        );
                        return Err(ArtifactError::CacheTooFull { detail });
                    }
                    break;
                }
            };

            let key = to_remove.rsplit('/').next().unwrap_or(&to_remove).to_string();
            if self.required_artifacts.contains(&key) {
                continue;
            }

            let freed = self.remove_with_siblings(&to_remove, &mut artifacts)?;
            removed_ref_count += 1;
            space_saved += freed;

            let cache_size = self.quota.get_cache_size(&self.cas)?.saturating_sub(freed);
            self.quota.set_cache_size(cache_size, true)?;

            debug!(r#ref = %to_remove, freed = %pretty_size(freed), "Evicted artifact");

            if let Some(progress) = progress.as_mut() {
                progress(cache_size);
            }
        }

        // Reclaim the blobs of everything removed above in one pass
        self.cas.prune()?;

        let final_size = self.quota.get_cache_size(&self.cas)?;
        info!(
            removed = removed_ref_count,
            saved = %pretty_size(space_saved),
            usage = %pretty_size(final_size),
            "Cleanup completed"
        );
        Ok(final_size)
    }

    /// Remove a ref together with any sibling refs of the same element that
    /// point at the same digest (its partner cache key).
    fn remove_with_siblings(
        &self,
        ref_name: &str,
        pending: &mut std::collections::VecDeque<String>,
    ) -> Result<u64, ArtifactError> {
        let digest = self.cas.resolve_ref(ref_name, false)?;
        let mut freed = self.cas.remove(ref_name, true)?;

        if let Some(element_prefix) = ref_name.rsplit_once('/').map(|(prefix, _)| prefix) {
            let glob = format!("{element_prefix}/*");
            for sibling in self.cas.list_refs(Some(&glob))? {
                let sibling_key = sibling.rsplit('/').next().unwrap_or(&sibling);
                if self.required_artifacts.contains(sibling_key) {
                    continue;
                }
                if self.cas.resolve_ref(&sibling, false)? == digest {
                    freed += self.cas.remove(&sibling, true)?;
                    pending.retain(|r| r != &sibling);
                }
            }
        }
        Ok(freed)
    }

    /// Pull an element's artifact from the configured remotes, in priority
    /// order; the first remote holding it wins. Unreachable remotes are
    /// skipped.
    pub async fn pull(
        &mut self,
        element: &dyn Keyed,
        key: &str,
        excluded_subdirs: &[String],
    ) -> Result<bool, ArtifactError> {
        let name = get_artifact_name(element.project_name(), element.element_name(), key);

        for remote in &mut self.remotes {
            let url = remote.spec().url.clone();
            debug!(r#ref = %name, url = %url, "Pulling artifact");

            match remote.pull(&self.cas, &name, excluded_subdirs).await {
                Ok(true) => {
                    info!(r#ref = %name, url = %url, "Pulled artifact");
                    return Ok(true);
                }
                Ok(false) => {
                    debug!(r#ref = %name, url = %url, "Remote does not have artifact");
                }
                Err(e) if e.is_retryable() => {
                    warn!(url = %url, error = %e, "Remote unavailable during pull, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Push an element's artifact to every push-enabled remote. Returns
    /// whether any remote was updated.
    pub async fn push(
        &mut self,
        element: &dyn Keyed,
        keys: &[String],
    ) -> Result<bool, ArtifactError> {
        let refs: Vec<String> = keys
            .iter()
            .map(|key| get_artifact_name(element.project_name(), element.element_name(), key))
            .collect();

        let mut pushed = false;
        for remote in &mut self.remotes {
            if !remote.spec().push {
                continue;
            }
            let url = remote.spec().url.clone();
            if remote.push(&self.cas, &refs).await.map_err(ArtifactError::from)? {
                info!(refs = ?refs, url = %url, "Pushed artifact");
                pushed = true;
            } else {
                debug!(refs = ?refs, url = %url, "Remote already has artifact");
            }
        }
        Ok(pushed)
    }

    /// Push a directory tree to every push-enabled remote.
    pub async fn push_directory(
        &mut self,
        directory: &mut CasBasedDirectory,
    ) -> Result<(), ArtifactError> {
        if !self.has_push_remotes {
            return Err(ArtifactError::remote_unavailable(
                "none",
                "push_directory was called, but no remote artifact servers are configured as push remotes",
            ));
        }
        let digest = directory.digest()?;
        for remote in &mut self.remotes {
            if remote.spec().push {
                remote
                    .push_directory(&self.cas, &digest)
                    .await
                    .map_err(ArtifactError::from)?;
            }
        }
        Ok(())
    }

    /// Push a serialized message to every push-enabled remote. Broadcast
    /// with last-digest-wins; all remotes return the same digest for the
    /// same bytes.
    pub async fn push_message(&mut self, data: &[u8]) -> Result<Digest, ArtifactError> {
        if !self.has_push_remotes {
            return Err(ArtifactError::remote_unavailable(
                "none",
                "push_message was called, but no remote artifact servers are configured as push remotes",
            ));
        }

        let mut message_digest = Digest::from_bytes(data);
        for remote in &mut self.remotes {
            if remote.spec().push {
                message_digest = remote.push_message(data).await.map_err(ArtifactError::from)?;
            }
        }
        Ok(message_digest)
    }

    /// Pull a Tree blob from the first remote that has it.
    pub async fn pull_tree(&mut self, tree_digest: &Digest) -> Result<Option<Digest>, ArtifactError> {
        for remote in &mut self.remotes {
            match remote.pull_tree(&self.cas, tree_digest).await {
                Ok(digest) => return Ok(Some(digest)),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Remote unavailable during tree pull, trying next");
                }
                Err(_) => continue,
            }
        }
        Ok(None)
    }
}
