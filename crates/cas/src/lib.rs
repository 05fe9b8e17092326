//! Content-addressed storage for BuildStream artifacts.
//!
//! Three layers live in this crate: the object/ref store ([`CasCache`]), the
//! mutable directory view over it ([`CasBasedDirectory`]), and the cache
//! usage and quota accounting ([`CasQuota`]).

pub mod cascache;
pub mod casdir;
pub mod digest;
pub mod quota;

pub use cascache::CasCache;
pub use casdir::{CasBasedDirectory, FileListResult, Resolved};
pub use digest::{Digest, EMPTY_DIGEST};
pub use quota::{CasQuota, CACHE_SIZE_FILE};
