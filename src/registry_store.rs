use shared::{
    BlobLocation, Digest, Digester, ErrorInfo, Index, LocationPurpose, Manifest, PresignedPart,
    S3LocationProperties, CONTENT_TYPE_JSON, MEDIA_TYPE_MODEL_INDEX, REGISTRY_INDEX_FILENAME,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, info};

use crate::storage_driver::{Backend, BlobContent, StorageError};

/// Uploads above this size are split into presigned parts.
const MULTIPART_THRESHOLD: i64 = 5 * 1024 * 1024 * 1024;
/// Parts handed out when the client asks for multipart without a size.
const DEFAULT_PART_COUNT: i64 = 3;

type Result<T> = std::result::Result<T, ErrorInfo>;

pub fn manifest_path(repository: &str, reference: &str) -> String {
    if reference.is_empty() {
        format!("{repository}/manifests")
    } else {
        format!("{repository}/manifests/{reference}")
    }
}

pub fn index_path(repository: &str) -> String {
    if repository.is_empty() {
        REGISTRY_INDEX_FILENAME.to_string()
    } else {
        format!("{repository}/{REGISTRY_INDEX_FILENAME}")
    }
}

pub fn blob_digest_path(repository: &str, digest: &Digest) -> String {
    format!("{repository}/blobs/{}/{}", digest.algorithm(), digest.hex())
}

/// Either the bytes themselves or a side-channel location for them.
pub struct BlobResponse {
    pub redirect_location: Option<String>,
    pub content: Option<BlobContent>,
}

impl std::fmt::Debug for BlobResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobResponse")
            .field("redirect_location", &self.redirect_location)
            .field("content", &self.content.is_some())
            .finish()
    }
}

impl BlobResponse {
    fn stored() -> Self {
        Self { redirect_location: None, content: None }
    }

    fn redirect(location: String) -> Self {
        Self { redirect_location: Some(location), content: None }
    }
}

/// Registry logic over a storage backend: manifest files are authoritative,
/// per-repository and root indices are derived from them on every write.
/// Index rebuilds are serialized so overlapping manifest writes cannot
/// publish a stale catalog after a fresher one.
pub struct RegistryStore {
    backend: Backend,
    enable_redirect: bool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl RegistryStore {
    pub async fn new(backend: Backend, enable_redirect: bool) -> Result<Self> {
        if enable_redirect && backend.as_s3().is_none() {
            return Err(ErrorInfo::config_invalid(
                "local storage does not support redirect",
            ));
        }
        let store = Self {
            backend,
            enable_redirect,
            refresh_lock: tokio::sync::Mutex::new(()),
        };
        store.refresh_global_index().await?;
        Ok(store)
    }

    fn internal(err: StorageError) -> ErrorInfo {
        ErrorInfo::internal(err)
    }

    pub async fn exists_manifest(&self, repository: &str, reference: &str) -> Result<bool> {
        self.backend
            .exists(&manifest_path(repository, reference))
            .await
            .map_err(Self::internal)
    }

    pub async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let mut content = match self.backend.get(&manifest_path(repository, reference)).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return Err(ErrorInfo::manifest_unknown(reference)),
            Err(e) => return Err(Self::internal(e)),
        };
        let mut raw = Vec::new();
        content
            .reader
            .read_to_end(&mut raw)
            .await
            .map_err(ErrorInfo::internal)?;
        serde_json::from_slice(&raw).map_err(ErrorInfo::manifest_invalid)
    }

    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        content_type: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let raw = serde_json::to_vec(manifest).map_err(ErrorInfo::manifest_invalid)?;
        // a manifest write seals any pending multipart uploads it references
        if let Some(s3) = self.backend.as_s3() {
            for blob in &manifest.blobs {
                s3.complete_multipart(&blob_digest_path(repository, &blob.digest))
                    .await
                    .map_err(Self::internal)?;
            }
        }
        let content_type = if content_type.is_empty() {
            CONTENT_TYPE_JSON
        } else {
            content_type
        };
        self.backend
            .put(
                &manifest_path(repository, reference),
                BlobContent::from_bytes(content_type, raw),
            )
            .await
            .map_err(Self::internal)?;
        info!("manifest written: {}@{}", repository, reference);
        self.refresh_index(repository).await
    }

    pub async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        if !self.exists_manifest(repository, reference).await? {
            return Err(ErrorInfo::manifest_unknown(reference));
        }
        self.backend
            .remove(&manifest_path(repository, reference), false)
            .await
            .map_err(Self::internal)?;
        self.refresh_index(repository).await
    }

    pub async fn get_index(&self, repository: &str, search: &str) -> Result<Index> {
        let mut content = match self.backend.get(&index_path(repository)).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return Err(ErrorInfo::index_unknown(repository)),
            Err(e) => return Err(Self::internal(e)),
        };
        let mut raw = Vec::new();
        content
            .reader
            .read_to_end(&mut raw)
            .await
            .map_err(ErrorInfo::internal)?;
        let index: Index = serde_json::from_slice(&raw).map_err(ErrorInfo::internal)?;
        filter_index(index, search)
    }

    async fn put_index(&self, repository: &str, mut index: Index) -> Result<()> {
        shared::sort_descriptors(&mut index.manifests);
        // index annotations follow the first manifest carrying any
        index.annotations = index
            .manifests
            .iter()
            .find_map(|m| m.annotations.clone());
        index.media_type = MEDIA_TYPE_MODEL_INDEX.to_string();
        index.schema_version = 1;
        let raw = serde_json::to_vec(&index).map_err(ErrorInfo::internal)?;
        self.backend
            .put(
                &index_path(repository),
                BlobContent::from_bytes(MEDIA_TYPE_MODEL_INDEX, raw),
            )
            .await
            .map_err(Self::internal)
    }

    /// Deletes the whole repository and refreshes both catalogs.
    pub async fn remove_index(&self, repository: &str) -> Result<()> {
        self.backend
            .remove(repository, true)
            .await
            .map_err(Self::internal)?;
        self.refresh_index(repository).await
    }

    /// Rebuild `<repo>/index.json` from the manifest files, then the root.
    pub async fn refresh_index(&self, repository: &str) -> Result<()> {
        let _serialized = self.refresh_lock.lock().await;
        self.refresh_index_locked(repository).await?;
        self.refresh_global_index_locked().await
    }

    async fn refresh_index_locked(&self, repository: &str) -> Result<()> {
        let metas = self
            .backend
            .list(&manifest_path(repository, ""), false)
            .await
            .map_err(Self::internal)?;

        let descriptors = futures::future::try_join_all(metas.iter().map(|meta| async {
            let manifest = self.get_manifest(repository, &meta.name).await?;
            Ok::<_, ErrorInfo>(shared::Descriptor {
                name: meta.name.clone(),
                modified: Some(meta.last_modified),
                annotations: manifest.annotations.clone(),
                size: manifest.total_size(),
                ..Default::default()
            })
        }))
        .await?;

        if descriptors.is_empty() {
            // last manifest gone: drop the stale catalog as well
            self.backend
                .remove(&index_path(repository), false)
                .await
                .map_err(Self::internal)?;
        } else {
            let index = Index {
                manifests: descriptors,
                ..Index::new()
            };
            self.put_index(repository, index).await?;
        }
        debug!("refreshed index for {}", repository);
        Ok(())
    }

    pub async fn get_global_index(&self, search: &str) -> Result<Index> {
        let mut content = match self.backend.get(&index_path("")).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return filter_index(Index::new(), search),
            Err(e) => return Err(Self::internal(e)),
        };
        let mut raw = Vec::new();
        content
            .reader
            .read_to_end(&mut raw)
            .await
            .map_err(ErrorInfo::internal)?;
        let index: Index = serde_json::from_slice(&raw).map_err(ErrorInfo::internal)?;
        filter_index(index, search)
    }

    async fn put_global_index(&self, mut index: Index) -> Result<()> {
        shared::sort_descriptors(&mut index.manifests);
        index.media_type = MEDIA_TYPE_MODEL_INDEX.to_string();
        index.schema_version = 1;
        let raw = serde_json::to_vec(&index).map_err(ErrorInfo::internal)?;
        self.backend
            .put(
                &index_path(""),
                BlobContent::from_bytes(MEDIA_TYPE_MODEL_INDEX, raw),
            )
            .await
            .map_err(Self::internal)
    }

    /// Rebuild the root catalog from every `<repo>/index.json` in the store.
    pub async fn refresh_global_index(&self) -> Result<()> {
        let _serialized = self.refresh_lock.lock().await;
        self.refresh_global_index_locked().await
    }

    async fn refresh_global_index_locked(&self) -> Result<()> {
        let metas = self
            .backend
            .list("", true)
            .await
            .map_err(Self::internal)?;

        let repositories: Vec<String> = metas
            .iter()
            .filter_map(|meta| {
                let (dir, base) = meta.name.rsplit_once('/')?;
                (base == REGISTRY_INDEX_FILENAME && !dir.is_empty()).then(|| dir.to_string())
            })
            .collect();

        let descriptors = futures::future::try_join_all(repositories.iter().map(|repo| async {
            let index = self.get_index(repo, "").await?;
            Ok::<_, ErrorInfo>(shared::Descriptor {
                name: repo.clone(),
                media_type: MEDIA_TYPE_MODEL_INDEX.to_string(),
                annotations: index.annotations.clone(),
                ..Default::default()
            })
        }))
        .await?;

        self.put_global_index(Index {
            manifests: descriptors,
            ..Index::new()
        })
        .await
    }

    pub async fn exists_blob(&self, repository: &str, digest: &Digest) -> Result<bool> {
        self.backend
            .exists(&blob_digest_path(repository, digest))
            .await
            .map_err(Self::internal)
    }

    pub async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobResponse> {
        let path = blob_digest_path(repository, digest);
        if self.enable_redirect {
            let location = self
                .backend
                .get_location(&path)
                .await
                .map_err(Self::internal)?;
            return Ok(BlobResponse::redirect(location.url));
        }
        match self.backend.get(&path).await {
            Ok(content) => Ok(BlobResponse {
                redirect_location: None,
                content: Some(content),
            }),
            Err(e) if e.is_not_found() => Err(ErrorInfo::blob_unknown(digest)),
            Err(e) => Err(Self::internal(e)),
        }
    }

    /// Store blob bytes, hashing them on the way through. A mismatch with
    /// the declared digest removes the object again.
    pub async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        content: BlobContent,
    ) -> Result<BlobResponse> {
        let path = blob_digest_path(repository, digest);
        if self.enable_redirect {
            let location = self
                .backend
                .put_location(&path)
                .await
                .map_err(Self::internal)?;
            return Ok(BlobResponse::redirect(location.url));
        }

        let digester = Arc::new(Mutex::new(Some(Digester::new())));
        let hashed = BlobContent {
            content_type: content.content_type,
            content_length: content.content_length,
            reader: Box::new(HashingReader {
                inner: content.reader,
                digester: digester.clone(),
            }),
        };
        self.backend.put(&path, hashed).await.map_err(|e| match e {
            StorageError::SizeMismatch { expected, actual } => {
                ErrorInfo::size_invalid(&format!("expected {expected}, got {actual}"))
            }
            other => Self::internal(other),
        })?;

        let actual = digester
            .lock()
            .expect("digester lock")
            .take()
            .expect("digester consumed once")
            .finalize();
        if &actual != digest {
            let _ = self.backend.remove(&path, false).await;
            return Err(ErrorInfo::digest_invalid(&format!(
                "declared {digest}, content hashed to {actual}"
            )));
        }
        Ok(BlobResponse::stored())
    }

    pub async fn delete_blob(&self, repository: &str, digest: &Digest) -> Result<()> {
        self.backend
            .remove(&blob_digest_path(repository, digest), false)
            .await
            .map_err(Self::internal)
    }

    pub async fn list_blobs(&self, repository: &str) -> Result<Vec<Digest>> {
        let prefix = format!("{repository}/blobs");
        let metas = self
            .backend
            .list(&prefix, true)
            .await
            .map_err(Self::internal)?;
        Ok(metas
            .iter()
            .filter_map(|meta| {
                let (algorithm, hex) = meta.name.rsplit_once('/')?;
                Digest::parse(&format!("{algorithm}:{hex}")).ok()
            })
            .collect())
    }

    /// Shape a side-channel transfer location for the blob, or fail with
    /// `UNSUPPORTED` on backends that cannot issue one.
    pub async fn get_blob_location(
        &self,
        repository: &str,
        digest: &Digest,
        purpose: LocationPurpose,
        properties: &HashMap<String, String>,
    ) -> Result<BlobLocation> {
        let Some(s3) = self.backend.as_s3() else {
            return Err(ErrorInfo::unsupported("backend has no location support"));
        };
        let path = blob_digest_path(repository, digest);
        match purpose {
            LocationPurpose::Download => {
                let part = s3.get_location(&path).await.map_err(Self::internal)?;
                Ok(location("s3", purpose, false, "", vec![part]))
            }
            LocationPurpose::Upload => {
                let size: i64 = properties
                    .get("size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let multipart = properties
                    .get("multipart")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(false);
                if !multipart && size <= MULTIPART_THRESHOLD {
                    let part = s3.put_location(&path).await.map_err(Self::internal)?;
                    return Ok(location("s3", purpose, false, "", vec![part]));
                }
                let upload_id = s3
                    .find_upload_id(&path, true)
                    .await
                    .map_err(Self::internal)?
                    .ok_or_else(|| ErrorInfo::internal("no multipart upload id"))?;
                let part_count = if size > MULTIPART_THRESHOLD {
                    (size + MULTIPART_THRESHOLD - 1) / MULTIPART_THRESHOLD
                } else {
                    DEFAULT_PART_COUNT
                };
                let mut parts = Vec::with_capacity(part_count as usize);
                for number in 1..=part_count {
                    parts.push(
                        s3.presign_upload_part(&path, &upload_id, number as i32)
                            .await
                            .map_err(Self::internal)?,
                    );
                }
                Ok(location("s3", purpose, true, &upload_id, parts))
            }
        }
    }
}

fn location(
    provider: &str,
    purpose: LocationPurpose,
    multipart: bool,
    upload_id: &str,
    parts: Vec<PresignedPart>,
) -> BlobLocation {
    let properties = S3LocationProperties {
        multipart,
        upload_id: upload_id.to_string(),
        parts,
    };
    BlobLocation {
        provider: provider.to_string(),
        purpose,
        properties: serde_json::to_value(properties).unwrap_or_default(),
    }
}

fn filter_index(mut index: Index, search: &str) -> Result<Index> {
    if search.is_empty() {
        return Ok(index);
    }
    let pattern = regex::Regex::new(search)
        .map_err(|e| ErrorInfo::parameter_invalid(&format!("search {search}: {e}")))?;
    index.manifests.retain(|m| pattern.is_match(&m.name));
    Ok(index)
}

struct HashingReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    digester: Arc<Mutex<Option<Digester>>>,
}

impl AsyncRead for HashingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let filled = buf.filled();
            if filled.len() > before {
                if let Some(digester) = this.digester.lock().expect("digester lock").as_mut() {
                    digester.update(&filled[before..]);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorageDriver;
    use shared::{Descriptor, MEDIA_TYPE_MODEL_CONFIG, MEDIA_TYPE_MODEL_FILE};

    async fn store() -> (tempfile::TempDir, RegistryStore) {
        let dir = tempfile::tempdir().unwrap();
        let driver = LocalStorageDriver::new(dir.path()).await.unwrap();
        let store = RegistryStore::new(Backend::Local(driver), false)
            .await
            .unwrap();
        (dir, store)
    }

    fn manifest_with(description: &str) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.config = Descriptor {
            name: "modelx.yaml".to_string(),
            media_type: MEDIA_TYPE_MODEL_CONFIG.to_string(),
            digest: Digest::from_bytes(b"config"),
            size: 6,
            ..Default::default()
        };
        manifest.blobs = vec![Descriptor {
            name: "weights.bin".to_string(),
            media_type: MEDIA_TYPE_MODEL_FILE.to_string(),
            digest: Digest::from_bytes(b"weights"),
            size: 7,
            ..Default::default()
        }];
        manifest.annotations = Some(
            [(shared::ANNOTATION_DESCRIPTION.to_string(), description.to_string())]
                .into_iter()
                .collect(),
        );
        manifest
    }

    #[tokio::test]
    async fn test_put_manifest_refreshes_indices() {
        let (_dir, store) = store().await;
        store
            .put_manifest("lib/m1", "v1", CONTENT_TYPE_JSON, &manifest_with("first"))
            .await
            .unwrap();

        let index = store.get_index("lib/m1", "").await.unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].name, "v1");
        assert_eq!(index.manifests[0].size, 13);

        let global = store.get_global_index("").await.unwrap();
        assert_eq!(global.manifests.len(), 1);
        assert_eq!(global.manifests[0].name, "lib/m1");
        let annotations = global.manifests[0].annotations.as_ref().unwrap();
        assert_eq!(annotations[shared::ANNOTATION_DESCRIPTION], "first");
    }

    #[tokio::test]
    async fn test_index_sorted_by_version_name() {
        let (_dir, store) = store().await;
        for version in ["v2", "v10", "v1"] {
            store
                .put_manifest("lib/m1", version, CONTENT_TYPE_JSON, &manifest_with(version))
                .await
                .unwrap();
        }
        let index = store.get_index("lib/m1", "").await.unwrap();
        let names: Vec<_> = index.manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["v1", "v10", "v2"]);
    }

    #[tokio::test]
    async fn test_delete_manifest_updates_index() {
        let (_dir, store) = store().await;
        store
            .put_manifest("lib/m1", "v1", CONTENT_TYPE_JSON, &manifest_with("m"))
            .await
            .unwrap();
        store
            .put_manifest("lib/m1", "v2", CONTENT_TYPE_JSON, &manifest_with("m"))
            .await
            .unwrap();

        store.delete_manifest("lib/m1", "v1").await.unwrap();
        let index = store.get_index("lib/m1", "").await.unwrap();
        let names: Vec<_> = index.manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["v2"]);

        // deleting the unknown version again reports manifest-unknown
        let err = store.delete_manifest("lib/m1", "v1").await.unwrap_err();
        assert_eq!(err.code, shared::ErrCode::ManifestUnknown);
    }

    #[tokio::test]
    async fn test_search_filters_index() {
        let (_dir, store) = store().await;
        for repo in ["lib/gpt-small", "lib/gpt-large", "lib/bert"] {
            store
                .put_manifest(repo, "v1", CONTENT_TYPE_JSON, &manifest_with(repo))
                .await
                .unwrap();
        }
        let global = store.get_global_index("^lib/gpt").await.unwrap();
        let names: Vec<_> = global.manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["lib/gpt-large", "lib/gpt-small"]);

        let err = store.get_global_index("[invalid").await.unwrap_err();
        assert_eq!(err.code, shared::ErrCode::InvalidParameter);
    }

    #[tokio::test]
    async fn test_put_blob_verifies_digest() {
        let (_dir, store) = store().await;
        let digest = Digest::from_bytes(b"payload");
        store
            .put_blob(
                "lib/m1",
                &digest,
                BlobContent::from_bytes("application/octet-stream", b"payload".to_vec()),
            )
            .await
            .unwrap();
        assert!(store.exists_blob("lib/m1", &digest).await.unwrap());

        let wrong = Digest::from_bytes(b"other");
        let err = store
            .put_blob(
                "lib/m1",
                &wrong,
                BlobContent::from_bytes("application/octet-stream", b"payload".to_vec()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, shared::ErrCode::DigestInvalid);
        assert!(!store.exists_blob("lib/m1", &wrong).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_blob_roundtrip() {
        let (_dir, store) = store().await;
        let digest = Digest::from_bytes(b"bytes");
        store
            .put_blob(
                "lib/m1",
                &digest,
                BlobContent::from_bytes("application/octet-stream", b"bytes".to_vec()),
            )
            .await
            .unwrap();

        let response = store.get_blob("lib/m1", &digest).await.unwrap();
        let mut content = response.content.unwrap();
        let mut raw = Vec::new();
        content.reader.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"bytes");

        let missing = Digest::from_bytes(b"missing");
        let err = store.get_blob("lib/m1", &missing).await.unwrap_err();
        assert_eq!(err.code, shared::ErrCode::BlobUnknown);
    }

    #[tokio::test]
    async fn test_remove_index_deletes_repository() {
        let (_dir, store) = store().await;
        store
            .put_manifest("lib/m1", "v1", CONTENT_TYPE_JSON, &manifest_with("m"))
            .await
            .unwrap();
        store.remove_index("lib/m1").await.unwrap();

        let err = store.get_index("lib/m1", "").await.unwrap_err();
        assert_eq!(err.code, shared::ErrCode::IndexUnknown);
        let global = store.get_global_index("").await.unwrap();
        assert!(global.manifests.is_empty());
    }

    #[tokio::test]
    async fn test_location_unsupported_on_local() {
        let (_dir, store) = store().await;
        let err = store
            .get_blob_location(
                "lib/m1",
                &Digest::from_bytes(b"x"),
                LocationPurpose::Upload,
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, shared::ErrCode::Unsupported);
    }

    #[tokio::test]
    async fn test_list_blobs() {
        let (_dir, store) = store().await;
        let a = Digest::from_bytes(b"a");
        let b = Digest::from_bytes(b"b");
        for (digest, data) in [(&a, b"a".to_vec()), (&b, b"b".to_vec())] {
            store
                .put_blob(
                    "lib/m1",
                    digest,
                    BlobContent::from_bytes("application/octet-stream", data),
                )
                .await
                .unwrap();
        }
        let mut listed = store.list_blobs("lib/m1").await.unwrap();
        listed.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        let mut expected = vec![a, b];
        expected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(listed, expected);
    }
}
