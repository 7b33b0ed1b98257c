use async_trait::async_trait;
use shared::{BlobLocation, Descriptor};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::errors::{ClientError, Result};
use crate::extension::{
    download_part, parse_properties, upload_part, BlobSink, BlobSource, Extension,
};
use crate::registry::USER_AGENT;

/// At most this many parts in flight per blob.
const PART_CONCURRENCY: usize = 3;
/// Attempts per part; no backoff between them.
const PART_ATTEMPTS: usize = 3;

/// Handles `s3` locations: presigned single-object transfers and
/// multipart uploads fanned out over presigned part URLs.
pub struct S3Extension {
    client: reqwest::Client,
}

impl S3Extension {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for S3Extension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for S3Extension {
    async fn download(
        &self,
        _blob: &Descriptor,
        location: &BlobLocation,
        into: BlobSink<'_>,
    ) -> Result<()> {
        let properties = parse_properties(location)?;
        let part = properties
            .parts
            .first()
            .ok_or_else(|| ClientError::Other("s3 location without parts".to_string()))?;
        download_part(&self.client, part, into).await
    }

    async fn upload(&self, blob: &BlobSource, location: &BlobLocation) -> Result<()> {
        let properties = parse_properties(location)?;
        if properties.parts.is_empty() {
            return Err(ClientError::Other("s3 location without parts".to_string()));
        }
        if !properties.multipart || properties.parts.len() == 1 {
            return upload_part(
                &self.client,
                blob,
                &properties.parts[0],
                0,
                blob.size.max(0) as u64,
            )
            .await;
        }

        // split into count equal ranges, the last part absorbing the
        // remainder, and upload with bounded fan-out and per-part retry
        let count = properties.parts.len() as i64;
        let part_size = blob.size / count;
        debug!(
            "multipart upload: {} parts of ~{} bytes (upload id {})",
            count, part_size, properties.upload_id
        );

        let blob = Arc::new(blob.clone());
        let limit = Arc::new(Semaphore::new(PART_CONCURRENCY));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for (index, part) in properties.parts.iter().enumerate() {
            let offset = index as i64 * part_size;
            let length = if index as i64 == count - 1 {
                blob.size - offset
            } else {
                part_size
            };
            let part = part.clone();
            let client = self.client.clone();
            let limit = limit.clone();
            let blob = blob.clone();
            tasks.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|e| ClientError::Task(e.to_string()))?;
                let mut last_error = None;
                for _attempt in 0..PART_ATTEMPTS {
                    match upload_part(&client, &blob, &part, offset as u64, length as u64).await {
                        Ok(()) => return Ok(()),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(last_error
                    .unwrap_or_else(|| ClientError::Other("part upload failed".to_string())))
            });
        }

        let mut result: Result<()> = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                    tasks.abort_all();
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                    tasks.abort_all();
                }
            }
        }
        result
    }
}
