use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::PresignedPart;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::storage_driver::{BlobContent, BlobMeta, StorageError};

static META_SUFFIX: &str = ".meta";
static TMP_SUFFIX: &str = ".tmp";

/// Key→blob store on a local directory. Object bytes live at the key path,
/// the content type in a sidecar `<key>.meta` JSON. Writes go through a
/// temp file and a rename so readers see either the old or the new object.
#[derive(Clone, Debug)]
pub struct LocalStorageDriver {
    base_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileMeta {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content_length: i64,
}

impl LocalStorageDriver {
    pub async fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path).await?;
        Ok(Self {
            base_path: PathBuf::from(base_path),
        })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn data_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn meta_path(&self, path: &str) -> PathBuf {
        self.base_path.join(format!("{path}{META_SUFFIX}"))
    }

    pub async fn put(&self, path: &str, mut content: BlobContent) -> Result<(), StorageError> {
        let data_path = self.data_path(path);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let meta = FileMeta {
            content_type: content.content_type.clone(),
            content_length: content.content_length,
        };
        let encoded = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::IoError(std::io::Error::other(e)))?;
        fs::write(self.meta_path(path), encoded).await?;

        let tmp_path = self
            .base_path
            .join(format!("{path}.{}{TMP_SUFFIX}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path).await?;
        let written = match tokio::io::copy(&mut content.reader, &mut file).await {
            Ok(n) => n as i64,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        };
        file.flush().await?;
        drop(file);

        if content.content_length >= 0 && written != content.content_length {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::SizeMismatch {
                expected: content.content_length,
                actual: written,
            });
        }
        fs::rename(&tmp_path, &data_path).await?;
        debug!("stored {} ({} bytes)", path, written);
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<BlobContent, StorageError> {
        let data_path = self.data_path(path);
        let metadata = fs::metadata(&data_path).await?;
        if metadata.is_dir() {
            return Err(StorageError::NotFound);
        }
        let content_type = match fs::read(self.meta_path(path)).await {
            Ok(raw) => serde_json::from_slice::<FileMeta>(&raw)
                .map(|m| m.content_type)
                .unwrap_or_default(),
            Err(_) => String::new(),
        };
        let file = fs::File::open(&data_path).await?;
        Ok(BlobContent {
            content_type,
            content_length: metadata.len() as i64,
            reader: Box::new(file),
        })
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match fs::metadata(self.data_path(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(&self, path: &str, recursive: bool) -> Result<(), StorageError> {
        let data_path = self.data_path(path);
        let result = if recursive {
            fs::remove_dir_all(&data_path).await
        } else {
            let _ = fs::remove_file(self.meta_path(path)).await;
            fs::remove_file(&data_path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<BlobMeta>, StorageError> {
        let root = self.data_path(prefix);
        let mut out = Vec::new();
        let mut to_visit = vec![root.clone()];
        while let Some(dir) = to_visit.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    if recursive {
                        to_visit.push(entry_path);
                    }
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(META_SUFFIX) || name.ends_with(TMP_SUFFIX) {
                    continue;
                }
                let relative = entry_path
                    .strip_prefix(&root)
                    .unwrap_or(&entry_path)
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                out.push(BlobMeta {
                    name: relative,
                    size: metadata.len() as i64,
                    last_modified: metadata
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
        }
        Ok(out)
    }

    pub async fn put_location(&self, _path: &str) -> Result<PresignedPart, StorageError> {
        Err(StorageError::Unsupported)
    }

    pub async fn get_location(&self, _path: &str) -> Result<PresignedPart, StorageError> {
        Err(StorageError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn driver() -> (tempfile::TempDir, LocalStorageDriver) {
        let dir = tempfile::tempdir().unwrap();
        let driver = LocalStorageDriver::new(dir.path()).await.unwrap();
        (dir, driver)
    }

    fn content(data: &[u8]) -> BlobContent {
        BlobContent::from_bytes("application/octet-stream", data.to_vec())
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, driver) = driver().await;
        driver.put("lib/m1/blobs/sha256/ab", content(b"hello")).await.unwrap();

        let mut got = driver.get("lib/m1/blobs/sha256/ab").await.unwrap();
        assert_eq!(got.content_type, "application/octet-stream");
        assert_eq!(got.content_length, 5);
        let mut data = Vec::new();
        got.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_put_rejects_short_body() {
        let (_dir, driver) = driver().await;
        let short = BlobContent {
            content_type: "application/octet-stream".to_string(),
            content_length: 10,
            reader: Box::new(std::io::Cursor::new(b"abc".to_vec())),
        };
        let err = driver.put("lib/m1/blobs/sha256/cd", short).await.unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { .. }));
        assert!(!driver.exists("lib/m1/blobs/sha256/cd").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_and_idempotent_remove() {
        let (_dir, driver) = driver().await;
        assert!(!driver.exists("lib/m1/index.json").await.unwrap());
        driver.put("lib/m1/index.json", content(b"{}")).await.unwrap();
        assert!(driver.exists("lib/m1/index.json").await.unwrap());

        driver.remove("lib/m1/index.json", false).await.unwrap();
        assert!(!driver.exists("lib/m1/index.json").await.unwrap());
        // removing a missing object is not an error
        driver.remove("lib/m1/index.json", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_shallow_and_recursive() {
        let (_dir, driver) = driver().await;
        driver.put("lib/m1/manifests/v1", content(b"{}")).await.unwrap();
        driver.put("lib/m1/manifests/v2", content(b"{}")).await.unwrap();
        driver.put("lib/m1/blobs/sha256/ab", content(b"x")).await.unwrap();

        let mut shallow = driver.list("lib/m1/manifests", false).await.unwrap();
        shallow.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = shallow.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["v1", "v2"]);

        let deep = driver.list("", true).await.unwrap();
        assert!(deep.iter().any(|m| m.name == "lib/m1/blobs/sha256/ab"));
        assert!(deep.iter().any(|m| m.name == "lib/m1/manifests/v1"));
        // sidecars never show up in listings
        assert!(deep.iter().all(|m| !m.name.ends_with(".meta")));
    }

    #[tokio::test]
    async fn test_recursive_remove() {
        let (_dir, driver) = driver().await;
        driver.put("lib/m1/manifests/v1", content(b"{}")).await.unwrap();
        driver.put("lib/m1/blobs/sha256/ab", content(b"x")).await.unwrap();
        driver.remove("lib/m1", true).await.unwrap();
        assert!(driver.list("lib/m1", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locations_unsupported() {
        let (_dir, driver) = driver().await;
        assert!(driver.put_location("x").await.unwrap_err().is_unsupported());
        assert!(driver.get_location("x").await.unwrap_err().is_unsupported());
    }
}
