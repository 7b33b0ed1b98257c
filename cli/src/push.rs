use shared::{Descriptor, LocationPurpose, Manifest, CONTENT_TYPE_OCTET_STREAM};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::client::{Client, PROGRESS_NAME_WIDTH, PROGRESS_WIDTH, PUSH_PULL_CONCURRENCY};
use crate::errors::{ClientError, Result};
use crate::extension::{location_from_url, BlobSource};
use crate::model::scan_directory;
use crate::pack::{self, MODELX_CACHE_DIR};
use crate::progress::{Bar, MultiBar};

impl Client {
    /// Push a local directory as `repository@version`. Top-level files and
    /// packed directories are digested, deduplicated against the server
    /// via HEAD, and uploaded concurrently; the manifest goes last.
    pub async fn push(
        &self,
        repository: &str,
        version: &str,
        config_file: &str,
        dir: &Path,
    ) -> Result<()> {
        let model = scan_directory(dir, config_file)?;
        let annotations = model.annotations.clone();
        let mut multibar =
            MultiBar::new(PROGRESS_WIDTH, PROGRESS_NAME_WIDTH, PUSH_PULL_CONCURRENCY);
        let finished: Arc<Mutex<HashMap<String, Descriptor>>> = Arc::default();

        for descriptor in model.blobs.iter().chain(std::iter::once(&model.config)) {
            let client = self.clone();
            let repository = repository.to_string();
            let basedir = dir.to_path_buf();
            let descriptor = descriptor.clone();
            let display_name = descriptor.name.clone();
            let finished = finished.clone();
            multibar.go(&display_name, "pending", move |bar| async move {
                let sealed = client
                    .push_blob(&repository, &basedir, descriptor, &bar)
                    .await?;
                finished
                    .lock()
                    .expect("results lock")
                    .insert(sealed.name.clone(), sealed);
                Ok(())
            });
        }
        multibar.wait().await?;

        let manifest = {
            let mut finished = finished.lock().expect("results lock");
            let mut manifest = Manifest::new();
            manifest.annotations = annotations;
            manifest.config = finished
                .remove(&model.config.name)
                .ok_or_else(|| ClientError::Other("config blob was not pushed".to_string()))?;
            manifest.blobs = model
                .blobs
                .iter()
                .map(|d| {
                    finished.remove(&d.name).ok_or_else(|| {
                        ClientError::Other(format!("blob {} was not pushed", d.name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            shared::sort_descriptors(&mut manifest.blobs);
            manifest
        };

        self.remote.put_manifest(repository, version, &manifest).await
    }

    /// Digest one entry, then move its bytes unless the server already has
    /// them. Returns the descriptor with digest/size/mode/mtime filled.
    async fn push_blob(
        &self,
        repository: &str,
        basedir: &Path,
        mut descriptor: Descriptor,
        bar: &Bar,
    ) -> Result<Descriptor> {
        let source_path = basedir.join(&descriptor.name);
        let content_path: PathBuf;

        if descriptor.media_type == shared::MEDIA_TYPE_MODEL_DIRECTORY {
            bar.set_name_status(&descriptor.name, "packing", false);
            let cache = basedir
                .join(MODELX_CACHE_DIR)
                .join(format!("{}.tar.gz", descriptor.name));
            let (digest, size) = pack::tgz(&source_path, Some(&cache)).await?;
            descriptor.digest = digest;
            descriptor.size = size;
            content_path = cache;
        } else {
            bar.set_name_status(&descriptor.name, "hashing", false);
            let (digest, size) = pack::digest_file(&source_path).await?;
            descriptor.digest = digest;
            descriptor.size = size;
            content_path = source_path.clone();
        }
        let metadata = std::fs::metadata(&source_path)?;
        descriptor.mode = pack::permissions_mode(&metadata);
        descriptor.modified = metadata.modified().ok().map(Into::into);

        if descriptor.digest.is_empty_file() {
            bar.set_name_status(descriptor.digest.short(), "done", true);
            return Ok(descriptor);
        }
        if self.remote.head_blob(repository, &descriptor.digest).await? {
            bar.set_name_status(descriptor.digest.short(), "skipped", true);
            return Ok(descriptor);
        }

        bar.set_name_status(descriptor.digest.short(), "pushing", false);
        bar.set_total(descriptor.size);
        let source = BlobSource::new(
            &content_path,
            descriptor.clone(),
            descriptor.size,
            Some(bar.clone()),
        );

        match self
            .remote
            .get_blob_location(repository, &descriptor, LocationPurpose::Upload)
            .await
        {
            Ok(location) => self.extension.upload(&source, &location).await?,
            Err(e) if e.is_location_fallback() => {
                debug!("no upload location for {}: direct put", descriptor.digest);
                self.put_blob_direct(repository, &source).await?;
            }
            Err(e) => return Err(e),
        }
        bar.set_status("done", true);
        Ok(descriptor)
    }

    async fn put_blob_direct(&self, repository: &str, source: &BlobSource) -> Result<()> {
        let content = source.open("pushing").await?;
        let fragment = content.fragment;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(content.reader));
        let result = self
            .remote
            .put_blob(
                repository,
                &source.descriptor.digest,
                CONTENT_TYPE_OCTET_STREAM,
                source.size,
                body,
            )
            .await;
        match result {
            Ok(None) => Ok(()),
            Ok(Some(redirect)) => {
                // the registry defers even direct puts to its side channel
                source.discard_fragment(fragment);
                let location = location_from_url(&redirect, LocationPurpose::Upload);
                self.extension.upload(source, &location).await
            }
            Err(e) => {
                source.discard_fragment(fragment);
                Err(e)
            }
        }
    }
}
