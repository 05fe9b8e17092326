//! Configuration of remote artifact caches

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User configuration for a single remote artifact cache.
///
/// Remotes are consulted in configuration order: the first remote holding an
/// artifact wins on pull, and pushes go to every push-enabled remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSpec {
    /// Server URL, e.g. `grpc://cache.example.com:11001` or
    /// `grpcs://cache.example.com:11002`
    pub url: String,

    /// Whether to attempt to push artifacts to this cache, in addition to
    /// pulling from it
    #[serde(default)]
    pub push: bool,

    /// Public server certificate for TLS (PEM-encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<PathBuf>,

    /// Private client key for mutual TLS (PEM-encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,

    /// Public client certificate for mutual TLS (PEM-encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,

    /// Instance name for multi-tenant servers
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
}

impl RemoteSpec {
    /// A plain spec with no TLS material.
    pub fn new(url: impl Into<String>, push: bool) -> Self {
        Self {
            url: url.into(),
            push,
            server_cert: None,
            client_key: None,
            client_cert: None,
            instance_name: default_instance_name(),
        }
    }
}

fn default_instance_name() -> String {
    String::new()
}
