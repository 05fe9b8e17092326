//! Cache usage accounting and quota configuration.
//!
//! The current cache size is tracked as an in-memory estimate persisted to a
//! `cache_size` file next to the store. The estimate is an upper bound; a
//! periodic full recomputation reconciles it against the sum of stored object
//! sizes. The configured quota is validated against the cache volume at
//! startup, keeping a headroom margin below it so builds in flight have room
//! to land.

use crate::cascache::CasCache;
use buildstream_core::utils::{parse_size, pretty_size};
use buildstream_core::{ArtifactError, CasError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the persisted cache size file, below the cache directory.
pub const CACHE_SIZE_FILE: &str = "cache_size";

/// Headroom kept free below the configured quota in production.
const QUOTA_HEADROOM: u64 = 2 * 1024 * 1024 * 1024;

/// Quota and usage accounting for a [`CasCache`].
///
/// Cloning yields an independent accountant over the same persisted state,
/// which is how worker jobs (e.g. cleanup) get their own view; the owning
/// loop stays authoritative by applying their reported sizes.
#[derive(Debug, Clone)]
pub struct CasQuota {
    cachedir: PathBuf,

    /// Estimated cache size; `None` until first read or computation.
    cache_size: Option<u64>,

    /// Effective quota: the configured value minus the headroom.
    cache_quota: u64,

    /// Eviction target; cleaning runs until the size drops below this.
    cache_lower_threshold: u64,

    /// Volume (total, available) override for tests and callers that
    /// already know the target volume.
    volume_override: Option<(u64, u64)>,
}

impl CasQuota {
    /// Create quota accounting with the production headroom.
    pub fn new(
        cachedir: impl Into<PathBuf>,
        cas: &CasCache,
        quota_config: Option<&str>,
    ) -> Result<Self, ArtifactError> {
        Self::with_options(cachedir, cas, quota_config, QUOTA_HEADROOM, None)
    }

    /// Create quota accounting with explicit headroom and optionally a fixed
    /// volume size, bypassing volume detection.
    pub fn with_options(
        cachedir: impl Into<PathBuf>,
        cas: &CasCache,
        quota_config: Option<&str>,
        headroom: u64,
        volume_override: Option<(u64, u64)>,
    ) -> Result<Self, ArtifactError> {
        let mut quota = Self {
            cachedir: cachedir.into(),
            cache_size: None,
            cache_quota: 0,
            cache_lower_threshold: 0,
            volume_override,
        };
        quota.calculate_cache_quota(cas, quota_config, headroom)?;
        Ok(quota)
    }

    fn size_file(&self) -> PathBuf {
        self.cachedir.join(CACHE_SIZE_FILE)
    }

    /// The effective cache quota in bytes.
    #[must_use]
    pub fn cache_quota(&self) -> u64 {
        self.cache_quota
    }

    /// The size below which eviction stops.
    #[must_use]
    pub fn lower_threshold(&self) -> u64 {
        self.cache_lower_threshold
    }

    /// Current estimated cache size. Reads the persisted value on first call,
    /// falling back to a full computation when no record exists.
    pub fn get_cache_size(&mut self, cas: &CasCache) -> Result<u64, CasError> {
        if let Some(size) = self.cache_size {
            return Ok(size);
        }

        if let Some(size) = self.read_cache_size()? {
            self.cache_size = Some(size);
            return Ok(size);
        }

        self.compute_cache_size(cas)
    }

    /// Replace the estimate, optionally persisting it.
    pub fn set_cache_size(&mut self, size: u64, write_to_disk: bool) -> Result<(), CasError> {
        self.cache_size = Some(size);
        if write_to_disk {
            self.write_cache_size(size)?;
        }
        Ok(())
    }

    /// Recompute the true cache size from the store and persist it.
    pub fn compute_cache_size(&mut self, cas: &CasCache) -> Result<u64, CasError> {
        let size = cas.calculate_cache_size()?;
        self.set_cache_size(size, true)?;
        debug!(bytes = size, "Recomputed cache size");
        Ok(size)
    }

    /// Whether the estimated size exceeds the quota.
    pub fn full(&mut self, cas: &CasCache) -> Result<bool, CasError> {
        Ok(self.get_cache_size(cas)? > self.cache_quota)
    }

    fn read_cache_size(&self) -> Result<Option<u64>, CasError> {
        let path = self.size_file();
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CasError::io(format!("read {}", path.display()), e)),
        }
    }

    fn write_cache_size(&self, size: u64) -> Result<(), CasError> {
        let path = self.size_file();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cachedir)
            .map_err(|e| CasError::io("create cache_size temp", e))?;
        write!(tmp, "{size}").map_err(|e| CasError::io("write cache_size", e))?;
        tmp.persist(&path)
            .map_err(|e| CasError::io("persist cache_size", e.error))?;
        Ok(())
    }

    /// Total and available bytes of the volume holding the cache.
    pub fn get_cache_volume_size(&self) -> Result<(u64, u64), CasError> {
        if let Some(volume) = self.volume_override {
            return Ok(volume);
        }
        volume_size(&self.cachedir)
    }

    /// Parse and validate the configured quota against the cache volume.
    ///
    /// `None` means no limit; it resolves to the current usage plus whatever
    /// the volume has available.
    fn calculate_cache_quota(
        &mut self,
        cas: &CasCache,
        quota_config: Option<&str>,
        headroom: u64,
    ) -> Result<(), ArtifactError> {
        let cache_size = self.get_cache_size(cas)?;
        let (volume_size, volume_avail) = self.get_cache_volume_size()?;

        let configured = match quota_config {
            Some(expr) if expr != "infinity" => {
                let parsed = parse_size(expr).map_err(|e| {
                    ArtifactError::InsufficientStorageForQuota {
                        message: format!("Invalid cache quota '{expr}': {e}"),
                    }
                })?;
                parsed.resolve(volume_size)
            }
            _ => cache_size + volume_avail,
        };

        if configured < headroom {
            return Err(ArtifactError::InsufficientStorageForQuota {
                message: format!(
                    "Invalid cache quota ({}): BuildStream requires a minimum cache quota of {}.",
                    pretty_size(configured),
                    pretty_size(headroom)
                ),
            });
        }

        let available = cache_size + volume_avail;
        if configured > available {
            return Err(ArtifactError::InsufficientStorageForQuota {
                message: format!(
                    "Your system does not have enough available space to support the cache quota specified.\n\
                     The filesystem containing {} only has {} available, but the quota is set to {}.",
                    self.cachedir.display(),
                    pretty_size(available),
                    pretty_size(configured)
                ),
            });
        }

        self.cache_quota = configured - headroom;
        self.cache_lower_threshold = self.cache_quota / 2;

        info!(
            quota = %pretty_size(self.cache_quota),
            usage = %pretty_size(cache_size),
            "Configured cache quota"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn volume_size(path: &Path) -> Result<(u64, u64), CasError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CasError::not_found(path.display().to_string()))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(CasError::io(
            format!("statvfs {}", path.display()),
            std::io::Error::last_os_error(),
        ));
    }

    let frsize = stat.f_frsize as u64;
    Ok((stat.f_blocks as u64 * frsize, stat.f_bavail as u64 * frsize))
}

#[cfg(not(unix))]
fn volume_size(_path: &Path) -> Result<(u64, u64), CasError> {
    // Without statvfs, report an effectively unlimited volume; absolute
    // quotas still apply.
    Ok((u64::MAX / 2, u64::MAX / 2))
}
