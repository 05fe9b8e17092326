//! Core types and error handling for the BuildStream build orchestrator.
//!
//! Every other crate in the workspace builds on the error taxonomy and the
//! small shared vocabulary defined here. Nothing in this crate touches the
//! filesystem or the network.

pub mod error;
pub mod types;
pub mod utils;

pub use error::{ArtifactError, CasError, LoadError, PluginError, SandboxError};
pub use types::KeyStrength;
