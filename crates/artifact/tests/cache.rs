//! Eviction and replication scenarios for the artifact cache.

use buildstream_artifact::{get_artifact_name, ArtifactCache, Keyed};
use buildstream_cas::{CasBasedDirectory, CasCache, CasQuota};
use buildstream_core::KeyStrength;
use buildstream_remote::server::create_router;
use buildstream_remote::RemoteSpec;
use tempfile::TempDir;
use tokio_stream::wrappers::TcpListenerStream;

const MIB: u64 = 1024 * 1024;

/// A test element with fixed keys.
struct TestElement {
    name: String,
    strong_key: String,
    weak_key: String,
}

impl TestElement {
    fn new(name: &str) -> Self {
        // Derive stable fake keys from the element name
        let hexed: String = name.bytes().map(|b| format!("{b:02x}")).collect();
        Self {
            name: name.to_string(),
            strong_key: format!("{hexed:0>64}"),
            weak_key: format!("{hexed:0>62}-w"),
        }
    }

    fn keys(&self) -> Vec<String> {
        vec![self.strong_key.clone(), self.weak_key.clone()]
    }
}

impl Keyed for TestElement {
    fn project_name(&self) -> &str {
        "test"
    }

    fn element_name(&self) -> &str {
        &self.name
    }

    fn cache_key(&self, strength: KeyStrength) -> Option<String> {
        match strength {
            KeyStrength::Strong => Some(self.strong_key.clone()),
            KeyStrength::Weak => Some(self.weak_key.clone()),
        }
    }
}

/// An artifact cache with a fixed quota, zero headroom and a mocked volume.
fn test_cache(root: &TempDir, quota: &str) -> ArtifactCache {
    let cas = CasCache::new(root.path()).unwrap();
    let quota = CasQuota::with_options(
        root.path(),
        &cas,
        Some(quota),
        0,
        Some((100 << 30, 100 << 30)),
    )
    .unwrap();
    ArtifactCache::with_quota(cas, quota)
}

/// Commit an artifact of roughly `size` bytes for `element`.
fn build_element(cache: &mut ArtifactCache, element: &TestElement, size: u64) {
    let mut content = CasBasedDirectory::new(cache.cas().clone());
    // Incompressible-ish unique payload per element
    let payload: Vec<u8> = (0..size)
        .map(|i| (i as u8) ^ element.name.as_bytes()[i as usize % element.name.len()])
        .collect();
    content.add_file("payload.bin", &payload, false).unwrap();
    cache.commit(element, &mut content, &element.keys()).unwrap();
    cache.add_artifact_size(size).unwrap();
}

async fn spawn_remote(enable_push: bool) -> (TempDir, CasCache, RemoteSpec) {
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
    (tmp, cas, RemoteSpec::new(format!("grpc://{addr}"), enable_push))
}

#[test]
fn test_commit_then_contains_both_keys() {
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "100M");
    let element = TestElement::new("app");

    build_element(&mut cache, &element, 1024);
    assert!(cache.contains(&element, &element.strong_key));
    assert!(cache.contains(&element, &element.weak_key));

    // Strong and weak keys come and go together
    cache.remove_element(&element).unwrap();
    assert!(!cache.contains(&element, &element.strong_key));
    assert!(!cache.contains(&element, &element.weak_key));
}

#[test]
fn test_clean_respects_required_set() {
    let root = TempDir::new().unwrap();
    // quota 12M, lower threshold 6M
    let mut cache = test_cache(&root, "12M");

    let a = TestElement::new("element-a");
    let b = TestElement::new("element-b");
    let c = TestElement::new("element-c");
    for element in [&a, &b, &c] {
        build_element(&mut cache, element, 5 * MIB);
    }

    // Pin B and C; only A may be evicted
    cache.mark_required_elements([&b as &dyn Keyed, &c as &dyn Keyed]);

    let mut progress_calls = 0usize;
    let mut progress = |_size: u64| progress_calls += 1;
    cache.clean(Some(&mut progress)).unwrap();

    assert!(!cache.contains(&a, &a.strong_key));
    assert!(cache.contains(&b, &b.strong_key));
    assert!(cache.contains(&c, &c.strong_key));
    assert!(progress_calls > 0);
}

#[test]
fn test_clean_evicts_lru_first() {
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "12M");

    let a = TestElement::new("element-a");
    let b = TestElement::new("element-b");
    let c = TestElement::new("element-c");

    // Build in order A, B, C with distinct mtimes
    for element in [&a, &b, &c] {
        build_element(&mut cache, element, 5 * MIB);
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let refs = cache.list_artifacts(None).unwrap();
    let first_key = refs[0].rsplit('/').next().unwrap();
    assert!(a.keys().iter().any(|k| k == first_key));

    cache.clean(None).unwrap();

    // 15M cached, threshold 6M: the two oldest artifacts go, C survives
    assert!(!cache.contains(&a, &a.strong_key));
    assert!(!cache.contains(&b, &b.strong_key));
    assert!(cache.contains(&c, &c.strong_key));
}

#[test]
fn test_clean_removes_key_pairs_together() {
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "12M");

    let a = TestElement::new("element-a");
    let b = TestElement::new("element-b");
    build_element(&mut cache, &a, 5 * MIB);
    build_element(&mut cache, &b, 5 * MIB);
    build_element(&mut cache, &TestElement::new("element-c"), 5 * MIB);

    cache.clean(None).unwrap();

    // However much was evicted, no element is left with only one key
    for element in [&a, &b] {
        assert_eq!(
            cache.contains(element, &element.strong_key),
            cache.contains(element, &element.weak_key),
            "strong and weak keys of {} must go together",
            element.name
        );
    }
}

#[test]
fn test_clean_aborts_when_everything_required() {
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "12M");

    let elements: Vec<TestElement> = (0..4)
        .map(|i| TestElement::new(&format!("element-{i}")))
        .collect();
    for element in &elements {
        build_element(&mut cache, element, 5 * MIB);
    }
    cache.mark_required_elements(elements.iter().map(|e| e as &dyn Keyed));

    let err = cache.clean(None).unwrap_err();
    assert_eq!(err.reason(), "cache-too-full");
    assert!(err.detail().unwrap().contains("required by the"));

    // Nothing required was sacrificed
    for element in &elements {
        assert!(cache.contains(element, &element.strong_key));
    }
}

#[test]
fn test_mark_required_touches_mtime() {
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "100M");

    let a = TestElement::new("element-a");
    let b = TestElement::new("element-b");
    build_element(&mut cache, &a, 1024);
    std::thread::sleep(std::time::Duration::from_millis(20));
    build_element(&mut cache, &b, 1024);

    // A is older than B until it is marked required
    let refs = cache.list_artifacts(None).unwrap();
    let oldest_key = refs[0].rsplit('/').next().unwrap().to_string();
    assert!(a.keys().iter().any(|k| *k == oldest_key));

    std::thread::sleep(std::time::Duration::from_millis(20));
    cache.mark_required_elements([&a as &dyn Keyed]);

    let refs = cache.list_artifacts(None).unwrap();
    let oldest_key = refs[0].rsplit('/').next().unwrap().to_string();
    assert!(b.keys().iter().any(|k| *k == oldest_key));
}

#[tokio::test]
async fn test_evict_then_repull_from_remote() {
    let (_remote_tmp, _remote_cas, spec) = spawn_remote(true).await;

    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "12M");
    cache.set_remotes(vec![spec]);
    cache.initialize_remotes(None).await.unwrap();

    let a = TestElement::new("element-a");
    build_element(&mut cache, &a, 5 * MIB);
    assert!(cache.push(&a, &a.keys()).await.unwrap());

    // Evict A by building past the quota without pinning it
    std::thread::sleep(std::time::Duration::from_millis(20));
    build_element(&mut cache, &TestElement::new("element-b"), 5 * MIB);
    build_element(&mut cache, &TestElement::new("element-c"), 5 * MIB);
    cache.clean(None).unwrap();
    assert!(!cache.contains(&a, &a.strong_key));

    // A subsequent pull restores it
    assert!(cache.pull(&a, &a.strong_key, &[]).await.unwrap());
    assert!(cache.contains(&a, &a.strong_key));
}

#[tokio::test]
async fn test_push_after_pull_is_noop() {
    let (_r1_tmp, _r1_cas, r1_spec) = spawn_remote(true).await;
    let (_r2_tmp, _r2_cas, r2_spec) = spawn_remote(true).await;

    let a = TestElement::new("element-a");

    // Seed R1 with A
    {
        let seed_root = TempDir::new().unwrap();
        let mut seed = test_cache(&seed_root, "100M");
        seed.set_remotes(vec![r1_spec.clone()]);
        seed.initialize_remotes(None).await.unwrap();
        build_element(&mut seed, &a, 1024);
        assert!(seed.push(&a, &a.keys()).await.unwrap());
    }

    // A fresh cache with only R1: the "build" pulls A and has nothing to push
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "100M");
    cache.set_remotes(vec![r1_spec.clone()]);
    cache.initialize_remotes(None).await.unwrap();

    assert!(cache.pull(&a, &a.strong_key, &[]).await.unwrap());
    assert!(!cache.push(&a, &[a.strong_key.clone()]).await.unwrap());

    // Adding empty R2 makes the next push reach exactly the new remote
    let root2 = TempDir::new().unwrap();
    let mut cache2 = test_cache(&root2, "100M");
    cache2.set_remotes(vec![r1_spec, r2_spec]);
    cache2.initialize_remotes(None).await.unwrap();

    assert!(cache2.pull(&a, &a.strong_key, &[]).await.unwrap());
    assert!(cache2.push(&a, &[a.strong_key.clone()]).await.unwrap());
}

#[tokio::test]
async fn test_pull_first_hit_wins() {
    let (_r1_tmp, _r1_cas, r1_spec) = spawn_remote(true).await;
    let (_r2_tmp, r2_cas, r2_spec) = spawn_remote(true).await;

    let a = TestElement::new("element-a");

    // Seed only R2
    {
        let seed_root = TempDir::new().unwrap();
        let mut seed = test_cache(&seed_root, "100M");
        seed.set_remotes(vec![r2_spec.clone()]);
        seed.initialize_remotes(None).await.unwrap();
        build_element(&mut seed, &a, 1024);
        seed.push(&a, &a.keys()).await.unwrap();
    }
    assert!(r2_cas.contains(&get_artifact_name("test", "element-a", &a.strong_key)));

    // R1 misses, R2 provides
    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "100M");
    cache.set_remotes(vec![r1_spec, r2_spec]);
    cache.initialize_remotes(None).await.unwrap();
    assert!(cache.pull(&a, &a.strong_key, &[]).await.unwrap());
}

#[tokio::test]
async fn test_push_message_broadcast() {
    let (_r1_tmp, r1_cas, r1_spec) = spawn_remote(true).await;
    let (_r2_tmp, r2_cas, r2_spec) = spawn_remote(true).await;

    let root = TempDir::new().unwrap();
    let mut cache = test_cache(&root, "100M");
    cache.set_remotes(vec![r1_spec, r2_spec]);
    cache.initialize_remotes(None).await.unwrap();

    let digest = cache.push_message(b"tree snapshot").await.unwrap();
    assert_eq!(r1_cas.load_object(&digest).unwrap(), b"tree snapshot");
    assert_eq!(r2_cas.load_object(&digest).unwrap(), b"tree snapshot");
}
