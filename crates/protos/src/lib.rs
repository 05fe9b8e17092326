//! Generated wire-protocol types for the BuildStream CAS.
//!
//! The protos are vendored under `proto/` and compiled by `tonic-build`:
//! the Remote Execution API content-addressing subset, the ByteStream API,
//! and the BuildStream artifact service.

/// Bazel Remote Execution API v2 content-addressing types
pub mod build {
    pub mod bazel {
        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    tonic::include_proto!("build.bazel.remote.execution.v2");
                }
            }
        }
    }
}

/// Google ByteStream API types
pub mod google {
    pub mod bytestream {
        tonic::include_proto!("google.bytestream");
    }
}

/// BuildStream artifact service types
pub mod buildstream {
    pub mod v2 {
        tonic::include_proto!("buildstream.v2");
    }
}

// Type aliases for convenience
pub use build::bazel::remote::execution::v2 as reapi;

/// REAPI Digest message (SHA-256 hash + size)
pub type ReapiDigest = reapi::Digest;
/// REAPI Directory message
pub type ReapiDirectory = reapi::Directory;
/// REAPI Tree message
pub type ReapiTree = reapi::Tree;
