use futures::StreamExt;
use shared::Descriptor;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::client::{Client, PROGRESS_NAME_WIDTH, PROGRESS_WIDTH, PUSH_PULL_CONCURRENCY};
use crate::errors::{ClientError, Result};
use crate::pack::{self, MODELX_CACHE_DIR};
use crate::progress::{Bar, MultiBar};
use crate::registry::BlobDownload;

/// Directory blobs download to the cache and extract from there, which
/// keeps the download and extract phases visible separately. The pipe
/// mode extracts while downloading instead.
const USE_CACHE: bool = true;

impl Client {
    /// Reconstruct `repository@version` under `into`. Entries whose local
    /// digest already matches are never transferred again.
    pub async fn pull(&self, repository: &str, version: &str, into: &Path) -> Result<()> {
        match std::fs::metadata(into) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(ClientError::Other(format!(
                    "{} is not a directory",
                    into.display()
                )))
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(into)?;
            }
            Err(e) => return Err(e.into()),
        }

        let manifest = self.remote.get_manifest(repository, version).await?;
        let mut multibar =
            MultiBar::new(PROGRESS_WIDTH, PROGRESS_NAME_WIDTH, PUSH_PULL_CONCURRENCY);
        for descriptor in manifest
            .blobs
            .iter()
            .chain(std::iter::once(&manifest.config))
        {
            let client = self.clone();
            let repository = repository.to_string();
            let basedir = into.to_path_buf();
            let descriptor = descriptor.clone();
            let display_name = descriptor.name.clone();
            multibar.go(&display_name, "pending", move |bar| async move {
                client
                    .pull_blob(&repository, &basedir, &descriptor, &bar)
                    .await
            });
        }
        multibar.wait().await
    }

    async fn pull_blob(
        &self,
        repository: &str,
        basedir: &Path,
        descriptor: &Descriptor,
        bar: &Bar,
    ) -> Result<()> {
        match descriptor.media_type.as_str() {
            media if media == shared::MEDIA_TYPE_MODEL_DIRECTORY => {
                self.pull_directory(repository, basedir, descriptor, bar, USE_CACHE)
                    .await
            }
            media if media == shared::MEDIA_TYPE_MODEL_FILE
                || media == shared::MEDIA_TYPE_MODEL_CONFIG =>
            {
                self.pull_file(repository, basedir, descriptor, bar).await
            }
            other => Err(ClientError::Other(format!(
                "unsupported media type {other}"
            ))),
        }
    }

    async fn pull_file(
        &self,
        repository: &str,
        basedir: &Path,
        descriptor: &Descriptor,
        bar: &Bar,
    ) -> Result<()> {
        bar.set_name_status(&descriptor.name, "checking", false);
        let filename = basedir.join(&descriptor.name);
        if tokio::fs::try_exists(&filename).await? {
            let (digest, _) = pack::digest_file(&filename).await?;
            if digest == descriptor.digest {
                bar.set_name_status(descriptor.digest.short(), "already exists", true);
                return Ok(());
            }
        }
        if let Some(parent) = filename.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if descriptor.digest.is_empty_file() {
            tokio::fs::File::create(&filename).await?;
            set_file_mode(&filename, descriptor.mode, 0o644)?;
            bar.set_name_status(descriptor.digest.short(), "done", true);
            return Ok(());
        }

        let file = tokio::fs::File::create(&filename).await?;
        let mut writer = bar.wrap_writer(
            file,
            descriptor.digest.short(),
            descriptor.size,
            "downloading",
        );
        self.download_blob(repository, descriptor, &mut writer)
            .await?;
        writer.shutdown().await?;
        set_file_mode(&filename, descriptor.mode, 0o644)?;
        bar.set_status("done", true);
        Ok(())
    }

    async fn pull_directory(
        &self,
        repository: &str,
        basedir: &Path,
        descriptor: &Descriptor,
        bar: &Bar,
        use_cache: bool,
    ) -> Result<()> {
        bar.set_name_status(&descriptor.name, "checking", false);
        let target = basedir.join(&descriptor.name);
        if tokio::fs::try_exists(&target).await? {
            let (digest, _) = pack::tgz(&target, None).await?;
            if digest == descriptor.digest {
                bar.set_name_status(descriptor.digest.short(), "already exists", true);
                return Ok(());
            }
        }

        if use_cache {
            let cache = basedir
                .join(MODELX_CACHE_DIR)
                .join(format!("{}.tar.gz", descriptor.name));
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = tokio::fs::File::create(&cache).await?;
            let mut writer = bar.wrap_writer(
                file,
                descriptor.digest.short(),
                descriptor.size,
                "downloading",
            );
            self.download_blob(repository, descriptor, &mut writer)
                .await?;
            writer.shutdown().await?;

            let archive = std::fs::File::open(&cache)?;
            let reader = bar.wrap_sync_reader(
                archive,
                descriptor.digest.short(),
                descriptor.size,
                "extracting",
            );
            let extract_into = target.clone();
            tokio::task::spawn_blocking(move || pack::untgz_sync(reader, &extract_into))
                .await??;
        } else {
            // pipe: extract while the download streams in
            debug!("streaming extract of {}", descriptor.name);
            let (writer_half, reader_half) = tokio::io::duplex(64 * 1024);
            let mut writer = bar.wrap_writer(
                writer_half,
                descriptor.digest.short(),
                descriptor.size,
                "downloading",
            );
            let extract_into = target.clone();
            let extract = tokio::task::spawn_blocking(move || {
                pack::untgz_sync(SyncIoBridge::new(reader_half), &extract_into)
            });
            let download = async {
                self.download_blob(repository, descriptor, &mut writer)
                    .await?;
                writer.shutdown().await?;
                Ok::<_, ClientError>(())
            };
            let (download_result, extract_result) = tokio::join!(download, extract);
            download_result?;
            extract_result??;
        }

        set_file_mode(&target, descriptor.mode, 0o755)?;
        bar.set_status("done", true);
        Ok(())
    }

    /// Fetch blob bytes into the writer, preferring a server-issued
    /// location and falling back to the registry itself.
    async fn download_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        into: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        match self
            .remote
            .get_blob_location(repository, descriptor, shared::LocationPurpose::Download)
            .await
        {
            Ok(location) => self.extension.download(descriptor, &location, into).await,
            Err(e) if e.is_location_fallback() => {
                match self.remote.get_blob(repository, &descriptor.digest).await? {
                    BlobDownload::Content(response) => {
                        let mut stream = response.bytes_stream();
                        while let Some(chunk) = stream.next().await {
                            into.write_all(&chunk?).await?;
                        }
                        into.flush().await?;
                        Ok(())
                    }
                    BlobDownload::Redirect(url) => {
                        let location = crate::extension::location_from_url(
                            &url,
                            shared::LocationPurpose::Download,
                        );
                        self.extension.download(descriptor, &location, into).await
                    }
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn set_file_mode(path: &Path, mode: u32, fallback: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if mode != 0 { mode } else { fallback };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode, fallback);
    }
    Ok(())
}
