use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectIdentifier};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shared::PresignedPart;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::storage_driver::{BlobContent, BlobMeta, StorageError};

/// Direct server-side writes stream in chunks of this size; anything that
/// does not fit in one chunk goes through a native multipart upload.
const PUT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub url: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    pub presign_expire_secs: u64,
}

/// Key→blob store on an S3-compatible bucket. Content type rides in the
/// object's native metadata; presigned URLs back the redirect surface.
pub struct S3StorageDriver {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    expire: Duration,
}

fn s3_err(e: impl std::fmt::Debug) -> StorageError {
    StorageError::S3Error(format!("{e:?}"))
}

fn to_chrono(t: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    t.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn presigned_to_part(req: aws_sdk_s3::presigning::PresignedRequest) -> PresignedPart {
    let mut signed_header: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in req.headers() {
        signed_header
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }
    PresignedPart {
        url: req.uri().to_string(),
        method: req.method().to_string(),
        signed_header: if signed_header.is_empty() {
            None
        } else {
            Some(signed_header)
        },
        part_number: 0,
    }
}

impl S3StorageDriver {
    pub async fn new(options: &S3Options) -> Result<Self, StorageError> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            options.access_key.clone(),
            options.secret_key.clone(),
            None,
            None,
            "modelxd",
        );
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&options.url)
            .region(aws_config::Region::new(options.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(options.path_style)
            .build();
        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: options.bucket.clone(),
            prefix: "registry".to_string(),
            expire: Duration::from_secs(options.presign_expire_secs.max(1)),
        })
    }

    fn prefixed_key(&self, path: &str) -> String {
        if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn presign_config(&self) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(self.expire).map_err(s3_err)
    }

    pub async fn put(&self, path: &str, mut content: BlobContent) -> Result<(), StorageError> {
        let key = self.prefixed_key(path);
        let first = read_chunk(&mut content.reader, PUT_CHUNK_SIZE).await?;

        let total = if first.len() < PUT_CHUNK_SIZE {
            let len = first.len() as i64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_type(&content.content_type)
                .content_length(len)
                .body(Bytes::from(first).into())
                .send()
                .await
                .map_err(s3_err)?;
            len
        } else {
            self.put_multipart(&key, &content.content_type, first, &mut content.reader)
                .await?
        };

        if content.content_length >= 0 && total != content.content_length {
            self.remove(path, false).await?;
            return Err(StorageError::SizeMismatch {
                expected: content.content_length,
                actual: total,
            });
        }
        debug!("stored s3://{}/{} ({} bytes)", self.bucket, key, total);
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        content_type: &str,
        first: Vec<u8>,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<i64, StorageError> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(s3_err)?;
        let upload_id = upload.upload_id().unwrap_or_default().to_string();

        let result = async {
            let mut total = 0i64;
            let mut completed = Vec::new();
            let mut chunk = first;
            let mut part_number = 1i32;
            loop {
                if chunk.is_empty() {
                    break;
                }
                total += chunk.len() as i64;
                let part = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(Bytes::from(chunk).into())
                    .send()
                    .await
                    .map_err(s3_err)?;
                completed.push(
                    CompletedPart::builder()
                        .set_e_tag(part.e_tag().map(String::from))
                        .part_number(part_number)
                        .build(),
                );
                part_number += 1;
                chunk = read_chunk(reader, PUT_CHUNK_SIZE).await?;
            }
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(s3_err)?;
            Ok(total)
        }
        .await;

        if result.is_err() {
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
        }
        result
    }

    pub async fn get(&self, path: &str) -> Result<BlobContent, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.prefixed_key(path))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound
                } else {
                    s3_err(e)
                }
            })?;
        Ok(BlobContent {
            content_type: output.content_type().unwrap_or_default().to_string(),
            content_length: output.content_length().unwrap_or(-1),
            reader: Box::new(output.body.into_async_read()),
        })
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.prefixed_key(path))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(s3_err(e)),
        }
    }

    pub async fn remove(&self, path: &str, recursive: bool) -> Result<(), StorageError> {
        if !recursive {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(self.prefixed_key(path))
                .send()
                .await
                .map_err(s3_err)?;
            return Ok(());
        }
        let prefix = format!("{}/", self.prefixed_key(path));
        let mut token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(t) = &token {
                request = request.continuation_token(t);
            }
            let output = request.send().await.map_err(s3_err)?;
            let ids: Vec<ObjectIdentifier> = output
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .filter_map(|k| ObjectIdentifier::builder().key(k).build().ok())
                .collect();
            if !ids.is_empty() {
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(
                        aws_sdk_s3::types::Delete::builder()
                            .set_objects(Some(ids))
                            .build()
                            .map_err(s3_err)?,
                    )
                    .send()
                    .await
                    .map_err(s3_err)?;
            }
            if output.is_truncated() == Some(true) {
                token = output.next_continuation_token().map(String::from);
            } else {
                return Ok(());
            }
        }
    }

    pub async fn list(&self, path: &str, recursive: bool) -> Result<Vec<BlobMeta>, StorageError> {
        let mut prefix = self.prefixed_key(path);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let mut out = Vec::new();
        let mut token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if !recursive {
                request = request.delimiter("/");
            }
            if let Some(t) = &token {
                request = request.continuation_token(t);
            }
            let output = request.send().await.map_err(s3_err)?;
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                out.push(BlobMeta {
                    name: key.trim_start_matches(prefix.as_str()).to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: to_chrono(object.last_modified()),
                });
            }
            if output.is_truncated() == Some(true) {
                token = output.next_continuation_token().map(String::from);
            } else {
                return Ok(out);
            }
        }
    }

    pub async fn put_location(&self, path: &str) -> Result<PresignedPart, StorageError> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.prefixed_key(path))
            .presigned(self.presign_config()?)
            .await
            .map_err(s3_err)?;
        Ok(presigned_to_part(request))
    }

    pub async fn get_location(&self, path: &str) -> Result<PresignedPart, StorageError> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.prefixed_key(path))
            .presigned(self.presign_config()?)
            .await
            .map_err(s3_err)?;
        Ok(presigned_to_part(request))
    }

    /// Look up an in-flight multipart upload for the key, creating one when
    /// `create` is set.
    pub async fn find_upload_id(
        &self,
        path: &str,
        create: bool,
    ) -> Result<Option<String>, StorageError> {
        let key = self.prefixed_key(path);
        let existing = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .delimiter("/")
            .prefix(&key)
            .send()
            .await
            .map_err(s3_err)?;
        if let Some(upload) = existing.uploads().first() {
            return Ok(upload.upload_id().map(String::from));
        }
        if !create {
            return Ok(None);
        }
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(s3_err)?;
        Ok(created.upload_id().map(String::from))
    }

    pub async fn presign_upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<PresignedPart, StorageError> {
        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.prefixed_key(path))
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(self.presign_config()?)
            .await
            .map_err(s3_err)?;
        let mut part = presigned_to_part(request);
        part.part_number = part_number;
        Ok(part)
    }

    /// Complete the pending multipart upload for the key, if any. Called
    /// when a manifest referencing the blob is written.
    pub async fn complete_multipart(&self, path: &str) -> Result<(), StorageError> {
        let Some(upload_id) = self.find_upload_id(path, false).await? else {
            return Ok(());
        };
        let key = self.prefixed_key(path);
        let listed = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .send()
            .await
            .map_err(s3_err)?;
        let parts: Vec<CompletedPart> = listed
            .parts()
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .set_e_tag(p.e_tag().map(String::from))
                    .set_part_number(p.part_number())
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(s3_err)?;
        Ok(())
    }
}

/// Read up to `limit` bytes, stopping early only at EOF.
async fn read_chunk(
    reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    limit: usize,
) -> Result<Vec<u8>, StorageError> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
