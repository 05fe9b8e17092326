//! Element graph loading for BuildStream.
//!
//! The [`Loader`] turns declarative element descriptors into a flat table
//! of [`MetaElement`]s with dependency-ordered integer references, ready
//! for cache key computation and scheduling.

pub mod loader;
pub mod metaelement;
pub mod types;

pub use loader::Loader;
pub use metaelement::{LoadResult, MetaElement, MetaSource};
pub use types::{DependencyNode, DependencyType, ElementNode, ProjectConfig, SourceNode};
