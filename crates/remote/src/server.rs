//! gRPC services exposing a local [`CasCache`] to peers.
//!
//! Three services make up the server: ByteStream for blob transfer, the CAS
//! missing-blob query, and the artifact ref service. Uploads are spooled to
//! the store's `tmp/` directory and committed through the same atomic
//! `add_object` path as local writes, after validating the declared size and
//! hash. When push is disabled, every mutating RPC answers
//! `PERMISSION_DENIED`.

use buildstream_cas::{CasCache, Digest};
use buildstream_core::CasError;
use buildstream_protos::buildstream::v2::artifact_cache_server::{
    ArtifactCache, ArtifactCacheServer,
};
use buildstream_protos::buildstream::v2::{
    GetArtifactRequest, GetArtifactResponse, StatusRequest, StatusResponse,
    UpdateArtifactRequest, UpdateArtifactResponse,
};
use buildstream_protos::google::bytestream::byte_stream_server::{ByteStream, ByteStreamServer};
use buildstream_protos::google::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use buildstream_protos::reapi::content_addressable_storage_server::{
    ContentAddressableStorage, ContentAddressableStorageServer,
};
use buildstream_protos::reapi::{FindMissingBlobsRequest, FindMissingBlobsResponse};
use std::io::Write;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Router;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

/// Maximum chunk carried by one ByteStream.Read response.
const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Assemble a tonic router serving the CAS below `cas`.
pub fn create_router(
    cas: CasCache,
    enable_push: bool,
    tls: Option<ServerTlsConfig>,
) -> Result<Router, tonic::transport::Error> {
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }

    Ok(builder
        .add_service(ByteStreamServer::new(ByteStreamService {
            cas: cas.clone(),
            enable_push,
        }))
        .add_service(ContentAddressableStorageServer::new(CasService {
            cas: cas.clone(),
        }))
        .add_service(ArtifactCacheServer::new(ArtifactCacheService {
            cas,
            enable_push,
        })))
}

struct ByteStreamService {
    cas: CasCache,
    enable_push: bool,
}

#[tonic::async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = ReceiverStream<Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let req = request.into_inner();
        let digest = digest_from_resource_name(&req.resource_name)?;

        if req.read_offset > digest.size_bytes {
            return Err(Status::out_of_range("read_offset beyond blob size"));
        }

        let path = self.cas.objpath(&digest);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Status::not_found(req.resource_name.clone()))?;
        if metadata.len() != digest.size_bytes as u64 {
            return Err(Status::internal("stored object size mismatch"));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let read_offset = req.read_offset;
        let read_limit = req.read_limit;
        tokio::spawn(async move {
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                    return;
                }
            };
            if read_offset > 0 {
                if let Err(e) = file
                    .seek(std::io::SeekFrom::Start(read_offset as u64))
                    .await
                {
                    let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                    return;
                }
            }

            let mut remaining = digest.size_bytes - read_offset;
            if read_limit > 0 {
                remaining = remaining.min(read_limit);
            }
            let mut buffer = vec![0u8; MAX_CHUNK_SIZE];
            while remaining > 0 {
                let want = (remaining as usize).min(MAX_CHUNK_SIZE);
                match file.read(&mut buffer[..want]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        remaining -= n as i64;
                        if tx
                            .send(Ok(ReadResponse {
                                data: buffer[..n].to_vec(),
                            }))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        if !self.enable_push {
            return Err(Status::permission_denied("push is not enabled"));
        }

        let mut stream = request.into_inner();
        let mut tmp = tempfile::NamedTempFile::new_in(self.cas.casdir().join("tmp"))
            .map_err(|e| Status::internal(e.to_string()))?;

        let mut offset: i64 = 0;
        let mut finished = false;
        let mut resource_name: Option<String> = None;
        let mut declared: Option<Digest> = None;

        while let Some(req) = stream.message().await? {
            if finished {
                return Err(Status::failed_precondition("write after finish_write"));
            }
            if req.write_offset != offset {
                return Err(Status::invalid_argument("non-contiguous write offset"));
            }

            match &resource_name {
                None => {
                    if req.resource_name.is_empty() {
                        return Err(Status::invalid_argument(
                            "resource_name required on first request",
                        ));
                    }
                    declared = Some(digest_from_resource_name(&req.resource_name)?);
                    resource_name = Some(req.resource_name.clone());
                }
                Some(first) => {
                    // If set on subsequent requests it must match the first
                    if !req.resource_name.is_empty() && req.resource_name != *first {
                        return Err(Status::invalid_argument("resource_name changed mid-stream"));
                    }
                }
            }

            tmp.write_all(&req.data)
                .map_err(|e| Status::internal(e.to_string()))?;
            offset += req.data.len() as i64;

            if req.finish_write {
                let declared = declared
                    .as_ref()
                    .ok_or_else(|| Status::invalid_argument("missing resource_name"))?;
                if offset != declared.size_bytes {
                    return Err(Status::invalid_argument(
                        "committed size does not match declared size",
                    ));
                }
                tmp.flush().map_err(|e| Status::internal(e.to_string()))?;

                let stored = self
                    .cas
                    .add_object_from_path(tmp.path())
                    .map_err(|e| Status::internal(e.to_string()))?;
                if stored.hash != declared.hash {
                    warn!(declared = %declared, stored = %stored, "Rejected upload with hash mismatch");
                    return Err(Status::invalid_argument(
                        "uploaded content does not match declared hash",
                    ));
                }

                debug!(digest = %stored, "Stored uploaded blob");
                finished = true;
            }
        }

        if !finished {
            return Err(Status::invalid_argument("stream ended without finish_write"));
        }

        Ok(Response::new(WriteResponse {
            committed_size: offset,
        }))
    }

    async fn query_write_status(
        &self,
        _request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        // Uploads are committed atomically on finish_write, so there is no
        // partial state to report
        Err(Status::unimplemented("QueryWriteStatus is not supported"))
    }
}

struct CasService {
    cas: CasCache,
}

#[tonic::async_trait]
impl ContentAddressableStorage for CasService {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let req = request.into_inner();
        let mut missing_blob_digests = Vec::new();

        for proto in req.blob_digests {
            let present = match Digest::from_proto(&proto) {
                Ok(digest) => self.cas.has_object(&digest),
                Err(_) => false,
            };
            if !present {
                missing_blob_digests.push(proto);
            }
        }

        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests,
        }))
    }
}

struct ArtifactCacheService {
    cas: CasCache,
    enable_push: bool,
}

#[tonic::async_trait]
impl ArtifactCache for ArtifactCacheService {
    async fn get_artifact(
        &self,
        request: Request<GetArtifactRequest>,
    ) -> Result<Response<GetArtifactResponse>, Status> {
        let req = request.into_inner();
        match self.cas.resolve_ref(&req.key, false) {
            Ok(digest) => Ok(Response::new(GetArtifactResponse {
                artifact: Some(digest.to_proto()),
            })),
            Err(CasError::NotFound { .. }) => Err(Status::not_found(req.key)),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }

    async fn update_artifact(
        &self,
        request: Request<UpdateArtifactRequest>,
    ) -> Result<Response<UpdateArtifactResponse>, Status> {
        if !self.enable_push {
            return Err(Status::permission_denied("push is not enabled"));
        }

        let req = request.into_inner();
        let artifact = req
            .artifact
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing artifact digest"))?;
        let digest =
            Digest::from_proto(artifact).map_err(|e| Status::invalid_argument(e.to_string()))?;

        for key in &req.keys {
            self.cas
                .set_ref(key, &digest)
                .map_err(|e| Status::internal(e.to_string()))?;
            debug!(key, digest = %digest, "Updated artifact ref");
        }

        Ok(Response::new(UpdateArtifactResponse {}))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        Ok(Response::new(StatusResponse {
            allow_updates: self.enable_push,
        }))
    }
}

fn digest_from_resource_name(resource_name: &str) -> Result<Digest, Status> {
    Digest::parse(resource_name)
        .map_err(|_| Status::invalid_argument(format!("invalid resource name '{resource_name}'")))
}
