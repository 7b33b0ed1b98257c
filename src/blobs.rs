use crate::{
    codes::ErrorResponse,
    manifests::repository_name,
    registry_store::RegistryStore,
    storage_driver::BlobContent,
};
use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
        HeaderMap, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::TryStreamExt;
use shared::{BlobLocation, Digest, ErrCode, LocationPurpose};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

fn parse_digest(raw: &str) -> Result<Digest, ErrorResponse> {
    Digest::parse(raw).map_err(ErrorResponse::from)
}

/// GET | HEAD /:project/:name/blobs/:digest
/// HEAD is a pure existence check; GET returns bytes, or 302 with a
/// presigned Location when the store defers to its side channel.
pub async fn get_blob(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name, digest)): Path<(String, String, String)>,
    method: Method,
) -> Result<Response, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    let digest = parse_digest(&digest)?;

    if method == Method::HEAD {
        return if store.exists_blob(&repository, &digest).await? {
            Ok(StatusCode::OK.into_response())
        } else {
            Err(ErrorResponse(shared::ErrorInfo::blob_unknown(&digest)))
        };
    }

    let result = store.get_blob(&repository, &digest).await?;

    if let Some(location) = result.redirect_location {
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            location
                .parse()
                .map_err(|e| ErrorResponse::internal(format!("location header: {e}")))?,
        );
        return Ok((StatusCode::FOUND, headers).into_response());
    }

    let content = result
        .content
        .ok_or_else(|| ErrorResponse::internal("blob response without content"))?;
    let mut headers = HeaderMap::new();
    if !content.content_type.is_empty() {
        if let Ok(value) = content.content_type.parse() {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if content.content_length >= 0 {
        if let Ok(value) = content.content_length.to_string().parse() {
            headers.insert(CONTENT_LENGTH, value);
        }
    }
    let body = Body::from_stream(ReaderStream::new(content.reader));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// PUT /:project/:name/blobs/:digest
/// Streams the body into the store, or answers 307 with a presigned
/// Location for the client to use instead.
pub async fn put_blob(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name, digest)): Path<(String, String, String)>,
    request: Request,
) -> Result<Response, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    let digest = parse_digest(&digest)?;
    debug!("PUT blob {}/{}", repository, digest);

    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if content_type.is_empty() {
        return Err(ErrorResponse::from_code(
            ErrCode::InvalidParameter,
            "content type: empty",
        ));
    }
    let content_length = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1);

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let content = BlobContent {
        content_type,
        content_length,
        reader: Box::new(StreamReader::new(stream)),
    };

    let result = store.put_blob(&repository, &digest, content).await?;
    if let Some(location) = result.redirect_location {
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            location
                .parse()
                .map_err(|e| ErrorResponse::internal(format!("location header: {e}")))?,
        );
        return Ok((StatusCode::TEMPORARY_REDIRECT, headers).into_response());
    }
    Ok(StatusCode::CREATED.into_response())
}

/// GET /:project/:name/blobs/:digest/locations/:purpose
/// Query parameters (size, name, media-type, annotations…) let the store
/// shape the location, e.g. decide on multipart.
pub async fn get_blob_location(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name, digest, purpose)): Path<(String, String, String, String)>,
    Query(properties): Query<HashMap<String, String>>,
) -> Result<Json<BlobLocation>, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    let digest = parse_digest(&digest)?;
    let purpose: LocationPurpose = purpose.parse().map_err(ErrorResponse::from)?;
    let location = store
        .get_blob_location(&repository, &digest, purpose, &properties)
        .await?;
    Ok(Json(location))
}
