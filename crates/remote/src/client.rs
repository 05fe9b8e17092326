//! Client for remote CAS artifact servers.
//!
//! A [`CasRemote`] wraps the three services a remote exposes: ByteStream for
//! blob transfer, ContentAddressableStorage for missing-blob queries and the
//! BuildStream artifact service for ref resolution. All transfers are
//! idempotent on content, so transient failures are retried and an upload
//! aborted mid-stream is restarted from offset zero.
//!
//! gRPC channels must not be created before a process fork; construct
//! remotes either in the main process before any worker spawns or entirely
//! inside a worker.

use crate::error::{RemoteError, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::spec::RemoteSpec;
use buildstream_cas::{CasCache, Digest};
use buildstream_protos::buildstream::v2::artifact_cache_client::ArtifactCacheClient;
use buildstream_protos::buildstream::v2::{
    GetArtifactRequest, StatusRequest, UpdateArtifactRequest,
};
use buildstream_protos::google::bytestream::byte_stream_client::ByteStreamClient;
use buildstream_protos::google::bytestream::{ReadRequest, WriteRequest};
use buildstream_protos::reapi;
use buildstream_protos::reapi::content_addressable_storage_client::ContentAddressableStorageClient;
use buildstream_protos::reapi::FindMissingBlobsRequest;
use prost::Message;
use std::collections::{HashSet, VecDeque};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, instrument};

/// Maximum chunk carried by one ByteStream message.
const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum number of digests per FindMissingBlobs request.
const MAX_FIND_MISSING_BATCH: usize = 500;

/// A connected remote artifact cache.
pub struct CasRemote {
    spec: RemoteSpec,
    bytestream: ByteStreamClient<Channel>,
    cas_client: ContentAddressableStorageClient<Channel>,
    artifact: ArtifactCacheClient<Channel>,
    retry: RetryConfig,
}

impl CasRemote {
    /// Connect to a remote described by `spec`.
    pub async fn init(spec: &RemoteSpec) -> Result<Self> {
        let endpoint = create_endpoint(spec)?;

        info!(url = %spec.url, "Connecting to remote artifact cache");
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RemoteError::connection_failed(&spec.url, e.to_string()))?;

        Ok(Self {
            spec: spec.clone(),
            bytestream: ByteStreamClient::new(channel.clone()),
            cas_client: ContentAddressableStorageClient::new(channel.clone()),
            artifact: ArtifactCacheClient::new(channel),
            retry: RetryConfig::default(),
        })
    }

    /// Preflight a remote before the scheduler spawns workers: connect and
    /// report whether the server accepts updates.
    pub async fn check(spec: &RemoteSpec) -> Result<bool> {
        let mut remote = Self::init(spec).await?;
        remote.status().await
    }

    #[must_use]
    pub fn spec(&self) -> &RemoteSpec {
        &self.spec
    }

    /// Whether the server allows blob uploads and artifact updates.
    pub async fn status(&mut self) -> Result<bool> {
        let response = self
            .artifact
            .status(StatusRequest {})
            .await
            .map_err(|e| RemoteError::grpc_error("ArtifactCache.Status", e))?;
        Ok(response.into_inner().allow_updates)
    }

    /// Resolve an artifact ref on the remote. `None` when not cached there.
    pub async fn get_artifact(&mut self, key: &str) -> Result<Option<Digest>> {
        let response = self
            .artifact
            .get_artifact(GetArtifactRequest {
                key: key.to_string(),
            })
            .await;

        match response {
            Ok(response) => {
                let artifact = response.into_inner().artifact.ok_or_else(|| {
                    RemoteError::InvalidBlob {
                        digest: key.to_string(),
                    }
                })?;
                Ok(Some(Digest::from_proto(&artifact)?))
            }
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(RemoteError::grpc_error("ArtifactCache.GetArtifact", status)),
        }
    }

    /// Bind refs to an already uploaded artifact digest.
    pub async fn update_artifact(&mut self, keys: &[String], digest: &Digest) -> Result<()> {
        let response = self
            .artifact
            .update_artifact(UpdateArtifactRequest {
                keys: keys.to_vec(),
                artifact: Some(digest.to_proto()),
            })
            .await;

        match response {
            Ok(_) => Ok(()),
            Err(status) if status.code() == tonic::Code::PermissionDenied => {
                Err(RemoteError::PushForbidden {
                    url: self.spec.url.clone(),
                })
            }
            Err(status) => Err(RemoteError::grpc_error(
                "ArtifactCache.UpdateArtifact",
                status,
            )),
        }
    }

    /// Ask the server which of `digests` it does not have.
    pub async fn find_missing(&mut self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for chunk in digests.chunks(MAX_FIND_MISSING_BATCH) {
            let request = FindMissingBlobsRequest {
                instance_name: self.spec.instance_name.clone(),
                blob_digests: chunk.iter().map(Digest::to_proto).collect(),
            };
            let response = self
                .cas_client
                .find_missing_blobs(request)
                .await
                .map_err(|e| RemoteError::grpc_error("FindMissingBlobs", e))?;

            for proto in response.into_inner().missing_blob_digests {
                missing.push(Digest::from_proto(&proto)?);
            }
        }
        debug!(missing = missing.len(), "Queried missing blobs");
        Ok(missing)
    }

    /// Download one blob over ByteStream.Read, in chunks of at most 64 KiB.
    pub async fn fetch_blob(&mut self, digest: &Digest) -> Result<Vec<u8>> {
        let request = ReadRequest {
            resource_name: digest.to_string(),
            read_offset: 0,
            read_limit: 0,
        };

        let response = self
            .bytestream
            .read(request)
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Read", e))?;

        let mut stream = response.into_inner();
        let mut data = Vec::with_capacity(digest.size_bytes.max(0) as usize);
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Read chunk", e))?
        {
            data.extend(chunk.data);
        }

        if data.len() as i64 != digest.size_bytes {
            return Err(RemoteError::InvalidBlob {
                digest: digest.to_string(),
            });
        }
        Ok(data)
    }

    /// Upload one blob over ByteStream.Write. The first chunk carries the
    /// resource name, the final chunk sets `finish_write`.
    pub async fn push_blob(&mut self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let mut pusher = BlobPusher {
            bytestream: self.bytestream.clone(),
        };
        pusher.push_blob(digest, data).await
    }

    /// Pull an artifact ref from this remote into the local store.
    ///
    /// Returns `false` when the remote does not have the artifact. Top-level
    /// subdirectories named in `excluded_subdirs` (e.g. build trees) are not
    /// fetched.
    #[instrument(skip(self, cas), fields(url = %self.spec.url))]
    pub async fn pull(
        &mut self,
        cas: &CasCache,
        ref_name: &str,
        excluded_subdirs: &[String],
    ) -> Result<bool> {
        let root = match self.get_artifact(ref_name).await? {
            Some(digest) => digest,
            None => return Ok(false),
        };

        self.fetch_tree(cas, &root, excluded_subdirs).await?;
        cas.set_ref(ref_name, &root)?;

        info!(r#ref = ref_name, digest = %root, "Pulled artifact");
        Ok(true)
    }

    /// Walk a remote Directory tree breadth-first, fetching every blob the
    /// local store is missing.
    async fn fetch_tree(
        &mut self,
        cas: &CasCache,
        root: &Digest,
        excluded_subdirs: &[String],
    ) -> Result<()> {
        let mut queue: VecDeque<(Digest, bool)> = VecDeque::new();
        queue.push_back((root.clone(), true));

        while let Some((digest, at_root)) = queue.pop_front() {
            self.ensure_blob(cas, &digest).await?;
            let directory = cas.load_directory(&digest)?;
            self.fetch_files(cas, &directory).await?;

            for node in &directory.directories {
                if at_root && excluded_subdirs.iter().any(|s| s == &node.name) {
                    continue;
                }
                let node_digest = node.digest.as_ref().ok_or_else(|| {
                    RemoteError::InvalidBlob {
                        digest: digest.to_string(),
                    }
                })?;
                queue.push_back((Digest::from_proto(node_digest)?, false));
            }
        }
        Ok(())
    }

    /// Fetch the file blobs of one Directory that are missing locally.
    ///
    /// The locally missing digests are first checked against the server so a
    /// partial pull only ever walks the remaining gap; blobs the server has
    /// lost surface as a not-found error rather than a dangling ref.
    async fn fetch_files(&mut self, cas: &CasCache, directory: &reapi::Directory) -> Result<()> {
        let mut wanted = Vec::new();
        for file in &directory.files {
            let file_digest = match &file.digest {
                Some(proto) => Digest::from_proto(proto)?,
                None => continue,
            };
            if !cas.has_object(&file_digest) {
                wanted.push(file_digest);
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let unavailable: HashSet<String> = self
            .find_missing(&wanted)
            .await?
            .into_iter()
            .map(|d| d.hash)
            .collect();

        for digest in &wanted {
            if unavailable.contains(&digest.hash) {
                return Err(RemoteError::Cas(buildstream_core::CasError::not_found(
                    digest.to_string(),
                )));
            }
            self.ensure_blob(cas, digest).await?;
        }
        Ok(())
    }

    /// Fetch a blob into the local store unless already present, verifying
    /// its content against the digest.
    async fn ensure_blob(&mut self, cas: &CasCache, digest: &Digest) -> Result<()> {
        if cas.has_object(digest) {
            return Ok(());
        }

        let retry = self.retry.clone();
        let data = retry_with_backoff(&retry, "ByteStream.Read", || {
            let mut client = self.bytestream.clone();
            let resource_name = digest.to_string();
            let expected = digest.size_bytes;
            async move {
                let response = client
                    .read(ReadRequest {
                        resource_name: resource_name.clone(),
                        read_offset: 0,
                        read_limit: 0,
                    })
                    .await
                    .map_err(|e| RemoteError::grpc_error("ByteStream.Read", e))?;
                let mut stream = response.into_inner();
                let mut data = Vec::with_capacity(expected.max(0) as usize);
                while let Some(chunk) = stream
                    .message()
                    .await
                    .map_err(|e| RemoteError::grpc_error("ByteStream.Read chunk", e))?
                {
                    data.extend(chunk.data);
                }
                Ok(data)
            }
        })
        .await?;

        let stored = cas.add_object(&data)?;
        if stored != *digest {
            return Err(RemoteError::InvalidBlob {
                digest: digest.to_string(),
            });
        }
        Ok(())
    }

    /// Push artifact refs to this remote.
    ///
    /// Returns `true` if the remote was updated, `false` when it already had
    /// every ref bound to the same digest.
    #[instrument(skip(self, cas), fields(url = %self.spec.url))]
    pub async fn push(&mut self, cas: &CasCache, refs: &[String]) -> Result<bool> {
        let mut pushed = false;

        for ref_name in refs {
            let digest = cas.resolve_ref(ref_name, false)?;

            if let Some(remote_digest) = self.get_artifact(ref_name).await? {
                if remote_digest == digest {
                    debug!(r#ref = ref_name, "Remote already has artifact");
                    continue;
                }
            }

            self.send_tree(cas, &digest).await?;
            self.update_artifact(std::slice::from_ref(ref_name), &digest)
                .await?;
            info!(r#ref = ref_name, digest = %digest, "Pushed artifact");
            pushed = true;
        }

        Ok(pushed)
    }

    /// Push a directory tree (without touching any refs).
    pub async fn push_directory(&mut self, cas: &CasCache, root: &Digest) -> Result<()> {
        self.send_tree(cas, root).await
    }

    /// Push one serialized message as a blob, returning its digest.
    pub async fn push_message(&mut self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::from_bytes(data);
        let missing = self.find_missing(std::slice::from_ref(&digest)).await?;
        if !missing.is_empty() {
            let retry = self.retry.clone();
            let bytestream = self.bytestream.clone();
            let payload = data.to_vec();
            retry_with_backoff(&retry, "ByteStream.Write", || {
                let mut pusher = BlobPusher {
                    bytestream: bytestream.clone(),
                };
                let digest = digest.clone();
                let payload = payload.clone();
                async move { pusher.push_blob(&digest, payload).await }
            })
            .await?;
        }
        Ok(digest)
    }

    /// Pull a Tree blob (a root Directory bundled with all its descendants)
    /// and unpack it into the local store. Returns the root Directory digest.
    pub async fn pull_tree(&mut self, cas: &CasCache, tree_digest: &Digest) -> Result<Digest> {
        let data = self.fetch_blob(tree_digest).await?;
        let tree = reapi::Tree::decode(data.as_slice()).map_err(|_| RemoteError::InvalidBlob {
            digest: tree_digest.to_string(),
        })?;

        let root = tree.root.ok_or_else(|| RemoteError::InvalidBlob {
            digest: tree_digest.to_string(),
        })?;

        let mut root_digest = None;
        for directory in std::iter::once(&root).chain(tree.children.iter()) {
            self.fetch_files(cas, directory).await?;
            let stored = cas.add_object(&directory.encode_to_vec())?;
            if root_digest.is_none() {
                root_digest = Some(stored);
            }
        }

        Ok(root_digest.unwrap_or_default())
    }

    /// Upload every blob reachable from a Directory digest that the server
    /// is missing.
    async fn send_tree(&mut self, cas: &CasCache, root: &Digest) -> Result<()> {
        let blobs = collect_tree_digests(cas, root)?;
        let missing = self.find_missing(&blobs).await?;

        debug!(
            total = blobs.len(),
            missing = missing.len(),
            "Uploading artifact blobs"
        );

        for digest in missing {
            let data = cas.load_object(&digest)?;
            let retry = self.retry.clone();
            let bytestream = self.bytestream.clone();
            retry_with_backoff(&retry, "ByteStream.Write", || {
                let mut pusher = BlobPusher {
                    bytestream: bytestream.clone(),
                };
                let digest = digest.clone();
                let data = data.clone();
                async move { pusher.push_blob(&digest, data).await }
            })
            .await?;
        }
        Ok(())
    }
}

/// Minimal handle used to restart blob uploads from scratch inside the
/// retry loop.
struct BlobPusher {
    bytestream: ByteStreamClient<Channel>,
}

impl BlobPusher {
    async fn push_blob(&mut self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let resource_name = digest.to_string();
        let total = data.len();

        let (tx, rx) = tokio::sync::mpsc::channel::<WriteRequest>(16);
        let sender = tokio::spawn(async move {
            let mut offset = 0usize;
            loop {
                let end = (offset + MAX_CHUNK_SIZE).min(total);
                let request = WriteRequest {
                    resource_name: if offset == 0 {
                        resource_name.clone()
                    } else {
                        String::new()
                    },
                    write_offset: offset as i64,
                    finish_write: end == total,
                    data: data[offset..end].to_vec(),
                };
                if tx.send(request).await.is_err() {
                    break;
                }
                if end == total {
                    break;
                }
                offset = end;
            }
        });

        let response = self
            .bytestream
            .write(ReceiverStream::new(rx))
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Write", e));
        let _ = sender.await;

        let committed = response?.into_inner().committed_size;
        if committed != digest.size_bytes {
            return Err(RemoteError::IncompleteWrite {
                digest: digest.to_string(),
                expected: digest.size_bytes,
                committed,
            });
        }
        Ok(())
    }
}

/// Collect every blob digest reachable from a Directory: the directory
/// objects themselves plus all file contents, each counted once.
fn collect_tree_digests(cas: &CasCache, root: &Digest) -> Result<Vec<Digest>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::new();
    let mut queue: VecDeque<Digest> = VecDeque::new();
    queue.push_back(root.clone());

    while let Some(digest) = queue.pop_front() {
        if !seen.insert(digest.hash.clone()) {
            continue;
        }
        let directory = cas.load_directory(&digest)?;
        for file in &directory.files {
            if let Some(proto) = &file.digest {
                let file_digest = Digest::from_proto(proto)?;
                if seen.insert(file_digest.hash.clone()) {
                    result.push(file_digest);
                }
            }
        }
        for node in &directory.directories {
            if let Some(proto) = &node.digest {
                queue.push_back(Digest::from_proto(proto)?);
            }
        }
        result.push(digest);
    }

    Ok(result)
}

/// Build a tonic endpoint from a remote spec, configuring TLS when the spec
/// carries certificates or uses a `grpcs://` URL.
fn create_endpoint(spec: &RemoteSpec) -> Result<Endpoint> {
    let url = &spec.url;
    let uri = if let Some(rest) = url.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else if url.starts_with("http://") || url.starts_with("https://") {
        url.clone()
    } else {
        return Err(RemoteError::ConfigError(format!(
            "Unsupported remote URL scheme: '{url}'"
        )));
    };

    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| RemoteError::ConfigError(format!("Invalid remote URL '{url}': {e}")))?;

    if uri.starts_with("https://") {
        let mut tls = ClientTlsConfig::new().with_native_roots();

        if let Some(server_cert) = &spec.server_cert {
            let pem = std::fs::read(server_cert)
                .map_err(|e| RemoteError::io_error("read server certificate", e))?;
            tls = tls.ca_certificate(Certificate::from_pem(pem));
        }
        match (&spec.client_cert, &spec.client_key) {
            (Some(cert), Some(key)) => {
                let cert_pem = std::fs::read(cert)
                    .map_err(|e| RemoteError::io_error("read client certificate", e))?;
                let key_pem = std::fs::read(key)
                    .map_err(|e| RemoteError::io_error("read client key", e))?;
                tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
            }
            (None, None) => {}
            _ => {
                return Err(RemoteError::ConfigError(
                    "client-cert and client-key must be specified together".into(),
                ))
            }
        }

        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| RemoteError::ConfigError(format!("TLS configuration error: {e}")))?;
    }

    Ok(endpoint.connect_timeout(std::time::Duration::from_secs(30)))
}
