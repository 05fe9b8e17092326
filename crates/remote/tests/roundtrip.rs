//! Wire round-trip tests against an in-process artifact server.

use buildstream_cas::{CasBasedDirectory, CasCache};
use buildstream_remote::server::create_router;
use buildstream_remote::{CasRemote, RemoteError, RemoteSpec};
use tempfile::TempDir;
use tokio_stream::wrappers::TcpListenerStream;

/// Spawn a server over a fresh store, returning the store and a client spec.
async fn spawn_server(enable_push: bool) -> (TempDir, CasCache, RemoteSpec) {
    let tmp = TempDir::new().unwrap();
    let cas = CasCache::new(tmp.path()).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(cas.clone(), enable_push, None).unwrap();
    tokio::spawn(async move {
        router
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .ok();
    });

    let spec = RemoteSpec::new(format!("grpc://{addr}"), enable_push);
    (tmp, cas, spec)
}

fn local_store() -> (TempDir, CasCache) {
    let tmp = TempDir::new().unwrap();
    let cas = CasCache::new(tmp.path()).unwrap();
    (tmp, cas)
}

#[tokio::test]
async fn test_push_then_pull_roundtrip() {
    let (_server_tmp, _server_cas, spec) = spawn_server(true).await;

    // Commit an artifact locally
    let (_tmp_a, cas_a) = local_store();
    let mut content = CasBasedDirectory::new(cas_a.clone());
    content.add_file("hello.txt", b"hello world", false).unwrap();
    content
        .descend("usr/bin", true)
        .unwrap()
        .add_file("tool", b"#!/bin/sh\n", true)
        .unwrap();
    let digest = content.digest().unwrap();
    cas_a.set_ref("test/element/key1", &digest).unwrap();

    // Push it
    let mut remote = CasRemote::init(&spec).await.unwrap();
    let pushed = remote
        .push(&cas_a, &["test/element/key1".to_string()])
        .await
        .unwrap();
    assert!(pushed);

    // Pull it into a fresh store; the resolved digest must match
    let (_tmp_b, cas_b) = local_store();
    let pulled = remote
        .pull(&cas_b, "test/element/key1", &[])
        .await
        .unwrap();
    assert!(pulled);

    let resolved = cas_b.resolve_ref("test/element/key1", false).unwrap();
    assert_eq!(resolved, digest);

    // Content is byte-identical
    let reopened = CasBasedDirectory::open(cas_b.clone(), &resolved).unwrap();
    assert_eq!(
        reopened.list_relative_paths(),
        vec!["hello.txt", "usr/bin/tool"]
    );
}

#[tokio::test]
async fn test_pull_unknown_artifact_returns_false() {
    let (_server_tmp, _server_cas, spec) = spawn_server(true).await;
    let (_tmp, cas) = local_store();

    let mut remote = CasRemote::init(&spec).await.unwrap();
    let pulled = remote.pull(&cas, "test/element/missing", &[]).await.unwrap();
    assert!(!pulled);
}

#[tokio::test]
async fn test_push_is_noop_when_remote_current() {
    let (_server_tmp, _server_cas, spec) = spawn_server(true).await;
    let (_tmp, cas) = local_store();

    let mut content = CasBasedDirectory::new(cas.clone());
    content.add_file("f", b"data", false).unwrap();
    let digest = content.digest().unwrap();
    cas.set_ref("test/element/key1", &digest).unwrap();

    let mut remote = CasRemote::init(&spec).await.unwrap();
    let refs = vec!["test/element/key1".to_string()];
    assert!(remote.push(&cas, &refs).await.unwrap());
    // Second push finds the remote current and does nothing
    assert!(!remote.push(&cas, &refs).await.unwrap());
}

#[tokio::test]
async fn test_push_forbidden_without_enable_push() {
    let (_server_tmp, _server_cas, spec) = spawn_server(false).await;
    let (_tmp, cas) = local_store();

    let mut content = CasBasedDirectory::new(cas.clone());
    content.add_file("f", b"data", false).unwrap();
    let digest = content.digest().unwrap();
    cas.set_ref("test/element/key1", &digest).unwrap();

    let mut remote = CasRemote::init(&spec).await.unwrap();
    let err = remote
        .push(&cas, &["test/element/key1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::PushForbidden { .. }));
}

#[tokio::test]
async fn test_status_reflects_push_configuration() {
    let (_t1, _c1, push_spec) = spawn_server(true).await;
    let (_t2, _c2, pull_spec) = spawn_server(false).await;

    assert!(CasRemote::check(&push_spec).await.unwrap());
    assert!(!CasRemote::check(&pull_spec).await.unwrap());
}

#[tokio::test]
async fn test_large_blob_chunked_transfer() {
    let (_server_tmp, _server_cas, spec) = spawn_server(true).await;
    let (_tmp, cas) = local_store();

    // Spans several 64 KiB chunks in both directions
    let big: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let mut content = CasBasedDirectory::new(cas.clone());
    content.add_file("big.bin", &big, false).unwrap();
    let digest = content.digest().unwrap();
    cas.set_ref("test/big/key1", &digest).unwrap();

    let mut remote = CasRemote::init(&spec).await.unwrap();
    assert!(remote
        .push(&cas, &["test/big/key1".to_string()])
        .await
        .unwrap());

    let (_tmp_b, cas_b) = local_store();
    assert!(remote.pull(&cas_b, "test/big/key1", &[]).await.unwrap());

    let root = cas_b.resolve_ref("test/big/key1", false).unwrap();
    let reopened = CasBasedDirectory::open(cas_b.clone(), &root).unwrap();
    match reopened.resolve("big.bin", true).unwrap() {
        buildstream_cas::Resolved::File { digest, .. } => {
            assert_eq!(cas_b.load_object(digest).unwrap(), big);
        }
        other => panic!("expected file, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pull_skips_excluded_subdirs() {
    let (_server_tmp, _server_cas, spec) = spawn_server(true).await;
    let (_tmp, cas) = local_store();

    let mut content = CasBasedDirectory::new(cas.clone());
    content.add_file("output.txt", b"result", false).unwrap();
    content
        .descend("buildtree", true)
        .unwrap()
        .add_file("scratch.o", b"intermediate", false)
        .unwrap();
    let digest = content.digest().unwrap();
    cas.set_ref("test/element/key1", &digest).unwrap();

    let mut remote = CasRemote::init(&spec).await.unwrap();
    assert!(remote
        .push(&cas, &["test/element/key1".to_string()])
        .await
        .unwrap());

    let (_tmp_b, cas_b) = local_store();
    assert!(remote
        .pull(&cas_b, "test/element/key1", &["buildtree".to_string()])
        .await
        .unwrap());

    // The artifact resolves, but the excluded subdirectory is dangling
    assert!(cas_b.contains("test/element/key1"));
    assert!(!cas_b
        .contains_subdir_artifact("test/element/key1", "buildtree")
        .unwrap());
}

#[tokio::test]
async fn test_push_message_returns_digest() {
    let (_server_tmp, server_cas, spec) = spawn_server(true).await;

    let mut remote = CasRemote::init(&spec).await.unwrap();
    let payload = b"a one-off serialized message";
    let digest = remote.push_message(payload).await.unwrap();

    assert_eq!(server_cas.load_object(&digest).unwrap(), payload);
}
