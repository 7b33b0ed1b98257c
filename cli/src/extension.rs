use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use shared::{
    BlobLocation, Descriptor, LocationPurpose, PresignedPart, S3LocationProperties,
    CONTENT_TYPE_OCTET_STREAM,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::errors::{ClientError, Result};
use crate::extension_s3::S3Extension;
use crate::progress::Bar;
use crate::registry::USER_AGENT;

/// Where downloaded bytes go; usually a progress-wrapped file.
pub type BlobSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// A per-scheme transfer handler invoked when the registry answers with a
/// blob location instead of bytes.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn download(
        &self,
        blob: &Descriptor,
        location: &BlobLocation,
        into: BlobSink<'_>,
    ) -> Result<()>;

    async fn upload(&self, blob: &BlobSource, location: &BlobLocation) -> Result<()>;
}

/// Local blob content that can be (re)opened per transfer attempt; each
/// open seeks to the requested range and reports through the bar.
#[derive(Clone)]
pub struct BlobSource {
    pub descriptor: Descriptor,
    pub size: i64,
    path: PathBuf,
    bar: Option<Bar>,
}

impl BlobSource {
    pub fn new(path: &Path, descriptor: Descriptor, size: i64, bar: Option<Bar>) -> Self {
        Self {
            descriptor,
            size,
            path: path.to_path_buf(),
            bar,
        }
    }

    pub fn bar(&self) -> Option<&Bar> {
        self.bar.as_ref()
    }

    pub async fn open(&self, status: &str) -> Result<OpenedContent> {
        self.open_range(0, self.size.max(0) as u64, status).await
    }

    pub async fn open_range(
        &self,
        offset: u64,
        length: u64,
        status: &str,
    ) -> Result<OpenedContent> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        let limited = tokio::io::AsyncReadExt::take(file, length);
        match &self.bar {
            Some(bar) => {
                let reader = bar.wrap_reader_at(limited, offset as i64, status);
                let fragment = reader.fragment_id();
                Ok(OpenedContent {
                    reader: Box::new(reader),
                    fragment: Some(fragment),
                })
            }
            None => Ok(OpenedContent {
                reader: Box::new(limited),
                fragment: None,
            }),
        }
    }

    /// Forget the progress a failed attempt accumulated.
    pub fn discard_fragment(&self, fragment: Option<u64>) {
        if let (Some(bar), Some(fragment)) = (&self.bar, fragment) {
            bar.remove_fragment(fragment);
        }
    }
}

pub struct OpenedContent {
    pub reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    pub fragment: Option<u64>,
}

/// Scheme-keyed dispatcher, built once at startup and threaded through
/// the client.
#[derive(Clone)]
pub struct ExtensionDispatcher {
    extensions: Arc<HashMap<String, Arc<dyn Extension>>>,
}

impl ExtensionDispatcher {
    pub fn new() -> Self {
        let http: Arc<dyn Extension> = Arc::new(HttpExtension::new());
        let s3: Arc<dyn Extension> = Arc::new(S3Extension::new());
        let mut extensions: HashMap<String, Arc<dyn Extension>> = HashMap::new();
        extensions.insert("http".to_string(), http.clone());
        extensions.insert("https".to_string(), http);
        extensions.insert("s3".to_string(), s3);
        Self {
            extensions: Arc::new(extensions),
        }
    }

    fn lookup(&self, provider: &str) -> Result<&Arc<dyn Extension>> {
        self.extensions
            .get(provider)
            .ok_or_else(|| ClientError::Unsupported(format!("provider: {provider}")))
    }

    pub async fn download(
        &self,
        blob: &Descriptor,
        location: &BlobLocation,
        into: BlobSink<'_>,
    ) -> Result<()> {
        debug!("extension download via {}", location.provider);
        self.lookup(&location.provider)?
            .download(blob, location, into)
            .await
    }

    pub async fn upload(&self, blob: &BlobSource, location: &BlobLocation) -> Result<()> {
        debug!("extension upload via {}", location.provider);
        self.lookup(&location.provider)?
            .upload(blob, location)
            .await
    }
}

impl Default for ExtensionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a raw redirect URL in the location shape the dispatcher expects.
pub fn location_from_url(url: &str, purpose: LocationPurpose) -> BlobLocation {
    let provider = url.split("://").next().unwrap_or("https").to_string();
    let properties = S3LocationProperties {
        multipart: false,
        upload_id: String::new(),
        parts: vec![PresignedPart {
            url: url.to_string(),
            ..Default::default()
        }],
    };
    BlobLocation {
        provider,
        purpose,
        properties: serde_json::to_value(properties).unwrap_or_default(),
    }
}

pub(crate) fn parse_properties(location: &BlobLocation) -> Result<S3LocationProperties> {
    Ok(serde_json::from_value(location.properties.clone())?)
}

pub(crate) fn apply_signed_headers(
    mut request: reqwest::RequestBuilder,
    part: &PresignedPart,
) -> reqwest::RequestBuilder {
    if let Some(signed) = &part.signed_header {
        for (name, values) in signed {
            for value in values {
                request = request.header(name, value);
            }
        }
    }
    request
}

/// GET one presigned part and stream it into the sink.
pub(crate) async fn download_part(
    client: &reqwest::Client,
    part: &PresignedPart,
    into: BlobSink<'_>,
) -> Result<()> {
    let request = apply_signed_headers(client.get(&part.url), part);
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(ClientError::Other(format!(
            "unexpected status {} downloading blob",
            response.status()
        )));
    }
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        into.write_all(&chunk?).await?;
    }
    into.flush().await?;
    Ok(())
}

/// PUT/POST one range of the blob to a presigned part URL.
pub(crate) async fn upload_part(
    client: &reqwest::Client,
    blob: &BlobSource,
    part: &PresignedPart,
    offset: u64,
    length: u64,
) -> Result<()> {
    let method = part_method(part);
    let content = blob.open_range(offset, length, "pushing").await?;
    let fragment = content.fragment;
    let request = apply_signed_headers(
        client
            .request(method, &part.url)
            .header(CONTENT_TYPE, CONTENT_TYPE_OCTET_STREAM)
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(content.reader))),
        part,
    );
    let result = async {
        let response = request.send().await?;
        if response.status().as_u16() >= 400 {
            return Err(ClientError::Other(format!(
                "unexpected status {} uploading blob",
                response.status()
            )));
        }
        Ok(())
    }
    .await;
    if result.is_err() {
        blob.discard_fragment(fragment);
    }
    result
}

fn part_method(part: &PresignedPart) -> reqwest::Method {
    if !part.method.is_empty() {
        if let Ok(method) = part.method.parse() {
            return method;
        }
    }
    // s3 presigned object URLs carry their credential in the query
    if part.url.contains("X-Amz-Credential") {
        reqwest::Method::PUT
    } else {
        reqwest::Method::POST
    }
}

pub struct HttpExtension {
    client: reqwest::Client,
}

impl HttpExtension {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for HttpExtension {
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
            .ok_or_else(|| ClientError::Other("location without parts".to_string()))?;
        download_part(&self.client, part, into).await
    }

    async fn upload(&self, blob: &BlobSource, location: &BlobLocation) -> Result<()> {
        let properties = parse_properties(location)?;
        let part = properties
            .parts
            .first()
            .ok_or_else(|| ClientError::Other("location without parts".to_string()))?;
        upload_part(&self.client, blob, part, 0, blob.size.max(0) as u64).await
    }
}
