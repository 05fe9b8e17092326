//! Remote artifact replication for BuildStream.
//!
//! The client side ([`CasRemote`]) pulls and pushes Merkle-tree artifacts
//! against remote CAS servers; the server side ([`server::create_router`])
//! exposes a local store under the same wire contract, and backs the
//! `bst-artifact-server` binary.

pub mod client;
pub mod error;
pub mod retry;
pub mod server;
pub mod spec;

pub use client::CasRemote;
pub use error::{RemoteError, Result};
pub use retry::RetryConfig;
pub use spec::RemoteSpec;
