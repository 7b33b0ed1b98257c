use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use shared::{
    BlobLocation, Descriptor, Digest, ErrCode, ErrorInfo, Index, LocationPurpose, Manifest,
    CONTENT_TYPE_JSON,
};

use crate::errors::{ClientError, Result};

pub static USER_AGENT: &str = concat!("modelx/", env!("CARGO_PKG_VERSION"));

/// Typed operations over the registry wire protocol. Redirects are never
/// followed automatically; the engines inspect Location themselves.
#[derive(Clone)]
pub struct RegistryClient {
    registry: String,
    authorization: Option<String>,
    client: reqwest::Client,
}

/// What a blob GET produced: the bytes, or a side-channel URL to fetch.
pub enum BlobDownload {
    Content(Response),
    Redirect(String),
}

impl RegistryClient {
    pub fn new(registry: &str, authorization: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            registry: registry.trim_end_matches('/').to_string(),
            authorization: authorization.map(String::from),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.registry, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.authorization {
            Some(auth) => request.header(AUTHORIZATION, auth),
            None => request,
        }
    }

    /// Decode any >=400 response into the wire error body; non-JSON bodies
    /// are preserved as the message.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.as_u16() < 400 {
            return Ok(response);
        }
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains(CONTENT_TYPE_JSON))
            .unwrap_or(false);
        let mut info = if is_json {
            response
                .json::<ErrorInfo>()
                .await
                .unwrap_or_else(|e| ErrorInfo::new(ErrCode::Unknown, e.to_string()))
        } else {
            ErrorInfo::new(
                ErrCode::Unknown,
                response.text().await.unwrap_or_default(),
            )
        };
        info.http_status = status.as_u16();
        Err(ClientError::Remote(info))
    }

    fn wire_version(version: &str) -> &str {
        if version.is_empty() {
            "latest"
        } else {
            version
        }
    }

    pub async fn get_manifest(&self, repository: &str, version: &str) -> Result<Manifest> {
        let version = Self::wire_version(version);
        let request = self
            .client
            .get(self.url(&format!("/{repository}/manifests/{version}")));
        let response = self.authorized(request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn put_manifest(
        &self,
        repository: &str,
        version: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let version = Self::wire_version(version);
        let request = self
            .client
            .put(self.url(&format!("/{repository}/manifests/{version}")))
            .json(manifest);
        let response = self.authorized(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_manifest(&self, repository: &str, version: &str) -> Result<()> {
        let version = Self::wire_version(version);
        let request = self
            .client
            .delete(self.url(&format!("/{repository}/manifests/{version}")));
        let response = self.authorized(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn get_index(&self, repository: &str, search: &str) -> Result<Index> {
        let mut request = self.client.get(self.url(&format!("/{repository}/index")));
        if !search.is_empty() {
            request = request.query(&[("search", search)]);
        }
        let response = self.authorized(request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_global_index(&self, search: &str) -> Result<Index> {
        let mut request = self.client.get(self.url("/"));
        if !search.is_empty() {
            request = request.query(&[("search", search)]);
        }
        let response = self.authorized(request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn remove_index(&self, repository: &str) -> Result<()> {
        let request = self.client.delete(self.url(&format!("/{repository}/index")));
        let response = self.authorized(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn head_blob(&self, repository: &str, digest: &Digest) -> Result<bool> {
        let request = self
            .client
            .head(self.url(&format!("/{repository}/blobs/{digest}")));
        let response = self.authorized(request).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ClientError::Remote(ErrorInfo {
                http_status: status.as_u16(),
                code: ErrCode::Unknown,
                message: format!("unexpected status {status} checking blob"),
                detail: String::new(),
            })),
        }
    }

    pub async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobDownload> {
        let request = self
            .client
            .get(self.url(&format!("/{repository}/blobs/{digest}")));
        let response = self.authorized(request).send().await?;
        if response.status().is_redirection() {
            let location = redirect_location(&response)?;
            return Ok(BlobDownload::Redirect(location));
        }
        Ok(BlobDownload::Content(Self::check(response).await?))
    }

    /// Stream blob bytes to the registry. Returns the Location when the
    /// server answers with a redirect instead of accepting the bytes.
    pub async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        content_type: &str,
        content_length: i64,
        body: reqwest::Body,
    ) -> Result<Option<String>> {
        let request = self
            .client
            .put(self.url(&format!("/{repository}/blobs/{digest}")))
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, content_length)
            .body(body);
        let response = self.authorized(request).send().await?;
        if response.status().is_redirection() {
            return Ok(Some(redirect_location(&response)?));
        }
        Self::check(response).await?;
        Ok(None)
    }

    /// Ask for a side-channel location. Descriptor metadata rides in the
    /// query so the server can shape it (e.g. decide on multipart).
    pub async fn get_blob_location(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        purpose: LocationPurpose,
    ) -> Result<BlobLocation> {
        let mut query = vec![
            ("size", descriptor.size.to_string()),
            ("name", descriptor.name.clone()),
            ("media-type", descriptor.media_type.clone()),
        ];
        if let Some(annotations) = &descriptor.annotations {
            query.push(("annotations", serde_json::to_string(annotations)?));
        }
        let request = self
            .client
            .get(self.url(&format!(
                "/{repository}/blobs/{}/locations/{purpose}",
                descriptor.digest
            )))
            .query(&query);
        let response = self.authorized(request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

fn redirect_location(response: &Response) -> Result<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .ok_or_else(|| ClientError::Other("redirect without Location header".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_format() {
        assert!(USER_AGENT.starts_with("modelx/"));
    }

    #[test]
    fn test_registry_url_join() {
        let client = RegistryClient::new("https://registry.example.com/", None).unwrap();
        assert_eq!(
            client.url("/lib/m1/index"),
            "https://registry.example.com/lib/m1/index"
        );
    }

    #[test]
    fn test_wire_version_defaults_latest() {
        assert_eq!(RegistryClient::wire_version(""), "latest");
        assert_eq!(RegistryClient::wire_version("v1"), "v1");
    }
}
