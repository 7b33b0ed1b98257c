use modelx::client::Client;
use modelxd::endpoints::router;
use modelxd::registry_store::RegistryStore;
use modelxd::storage::LocalStorageDriver;
use modelxd::storage_driver::Backend;
use std::path::Path;
use std::sync::Arc;

async fn start_registry() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let driver = LocalStorageDriver::new(dir.path()).await.unwrap();
    let store = RegistryStore::new(Backend::Local(driver), false)
        .await
        .unwrap();
    let app = router(Arc::new(store));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (dir, format!("http://{addr}"))
}

fn sample_model(dir: &Path) {
    std::fs::write(
        dir.join("modelx.yaml"),
        "description: integration test model\nframework: torch\ntask: nlp\ntags: [test]\n",
    )
    .unwrap();
    let weights: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.join("weights.bin"), &weights).unwrap();
    std::fs::write(dir.join("EMPTY"), b"").unwrap();
    std::fs::create_dir(dir.join("tokenizer")).unwrap();
    std::fs::write(dir.join("tokenizer/vocab.txt"), b"hello\nworld\n").unwrap();
    std::fs::write(dir.join("tokenizer/merges.txt"), b"h e\nl l\n").unwrap();
    std::fs::write(dir.join("tokenizer/special.json"), b"{}").unwrap();
}

fn assert_tree_matches(original: &Path, pulled: &Path) {
    for name in ["modelx.yaml", "weights.bin", "EMPTY"] {
        assert_eq!(
            std::fs::read(original.join(name)).unwrap(),
            std::fs::read(pulled.join(name)).unwrap(),
            "{name} differs"
        );
    }
    for name in ["vocab.txt", "merges.txt", "special.json"] {
        assert_eq!(
            std::fs::read(original.join("tokenizer").join(name)).unwrap(),
            std::fs::read(pulled.join("tokenizer").join(name)).unwrap(),
            "tokenizer/{name} differs"
        );
    }
}

#[tokio::test]
async fn test_push_pull_roundtrip() {
    let (_store_dir, registry) = start_registry().await;
    let model_dir = tempfile::tempdir().unwrap();
    sample_model(model_dir.path());

    let client = Client::new(&registry, None).unwrap();
    client
        .push("lib/m1", "v1", "modelx.yaml", model_dir.path())
        .await
        .unwrap();

    // manifest shape: config plus one file blob, one empty file, one tar-gz
    let manifest = client.get_manifest("lib/m1", "v1").await.unwrap();
    assert_eq!(manifest.config.name, "modelx.yaml");
    assert!(!manifest.config.digest.is_empty());
    let names: Vec<_> = manifest.blobs.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["EMPTY", "tokenizer", "weights.bin"]);
    assert_eq!(
        manifest.blobs[1].media_type,
        shared::MEDIA_TYPE_MODEL_DIRECTORY
    );
    assert!(manifest.blobs[0].digest.is_empty_file());
    let annotations = manifest.annotations.as_ref().unwrap();
    assert_eq!(
        annotations[shared::ANNOTATION_DESCRIPTION],
        "integration test model"
    );

    // the index reflects the write before push returns
    let index = client.get_index("lib/m1", "").await.unwrap();
    assert_eq!(index.manifests.len(), 1);
    assert_eq!(index.manifests[0].name, "v1");
    let global = client.get_global_index("").await.unwrap();
    assert_eq!(global.manifests[0].name, "lib/m1");

    // pull into a fresh directory and compare trees
    let out_dir = tempfile::tempdir().unwrap();
    let target = out_dir.path().join("out");
    client.pull("lib/m1", "v1", &target).await.unwrap();
    assert_tree_matches(model_dir.path(), &target);
    assert_eq!(std::fs::metadata(target.join("EMPTY")).unwrap().len(), 0);

    // pulling again over matching content is a no-op that still succeeds
    client.pull("lib/m1", "v1", &target).await.unwrap();
    assert_tree_matches(model_dir.path(), &target);
}

#[tokio::test]
async fn test_push_is_idempotent() {
    let (_store_dir, registry) = start_registry().await;
    let model_dir = tempfile::tempdir().unwrap();
    sample_model(model_dir.path());

    let client = Client::new(&registry, None).unwrap();
    client
        .push("lib/m1", "v1", "modelx.yaml", model_dir.path())
        .await
        .unwrap();
    let first = client.get_manifest("lib/m1", "v1").await.unwrap();

    client
        .push("lib/m1", "v1", "modelx.yaml", model_dir.path())
        .await
        .unwrap();
    let second = client.get_manifest("lib/m1", "v1").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_dedup_across_versions() {
    let (_store_dir, registry) = start_registry().await;
    let model_dir = tempfile::tempdir().unwrap();
    sample_model(model_dir.path());

    let client = Client::new(&registry, None).unwrap();
    client
        .push("lib/m1", "v1", "modelx.yaml", model_dir.path())
        .await
        .unwrap();
    let v1 = client.get_manifest("lib/m1", "v1").await.unwrap();

    // only the config changes; every other blob digest stays identical
    std::fs::write(
        model_dir.path().join("modelx.yaml"),
        "description: updated model\nframework: torch\ntask: nlp\n",
    )
    .unwrap();
    client
        .push("lib/m1", "v2", "modelx.yaml", model_dir.path())
        .await
        .unwrap();
    let v2 = client.get_manifest("lib/m1", "v2").await.unwrap();

    assert_ne!(v1.config.digest, v2.config.digest);
    for (a, b) in v1.blobs.iter().zip(v2.blobs.iter()) {
        assert_eq!(a.digest, b.digest);
    }

    let index = client.get_index("lib/m1", "").await.unwrap();
    let versions: Vec<_> = index.manifests.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(versions, vec!["v1", "v2"]);
}

#[tokio::test]
async fn test_pull_default_version_and_missing_manifest() {
    let (_store_dir, registry) = start_registry().await;
    let model_dir = tempfile::tempdir().unwrap();
    sample_model(model_dir.path());

    let client = Client::new(&registry, None).unwrap();
    // empty version goes to the wire as "latest"
    client
        .push("lib/m1", "", "modelx.yaml", model_dir.path())
        .await
        .unwrap();
    let manifest = client.get_manifest("lib/m1", "latest").await.unwrap();
    assert_eq!(manifest.config.name, "modelx.yaml");

    let err = client.get_manifest("lib/m1", "nope").await.unwrap_err();
    match err {
        modelx::errors::ClientError::Remote(info) => {
            assert_eq!(info.code, shared::ErrCode::ManifestUnknown);
            assert_eq!(info.http_status, 404);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_concurrent_version_pushes() {
    let (_store_dir, registry) = start_registry().await;
    let mut model_dirs = Vec::new();
    let mut handles = Vec::new();
    for i in 0..4 {
        let model_dir = tempfile::tempdir().unwrap();
        sample_model(model_dir.path());
        let registry = registry.clone();
        let path = model_dir.path().to_path_buf();
        model_dirs.push(model_dir);
        handles.push(tokio::spawn(async move {
            let client = Client::new(&registry, None).unwrap();
            client
                .push("lib/m1", &format!("v{i}"), "modelx.yaml", &path)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let client = Client::new(&registry, None).unwrap();
    let index = client.get_index("lib/m1", "").await.unwrap();
    let versions: Vec<_> = index.manifests.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(versions, vec!["v0", "v1", "v2", "v3"]);
}
