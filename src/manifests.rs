use crate::{
    codes::ErrorResponse,
    registry_store::RegistryStore,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use shared::{ErrCode, Index, Manifest};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
pub struct SearchQuery {
    #[serde(default)]
    pub search: String,
}

/// GET /healthz
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub fn repository_name(project: &str, name: &str) -> Result<String, ErrorResponse> {
    let repository = format!("{project}/{name}");
    if !shared::is_valid_repository_name(&repository) {
        return Err(ErrorResponse::from_code(ErrCode::NameInvalid, repository));
    }
    Ok(repository)
}

fn valid_reference(reference: &str) -> Result<(), ErrorResponse> {
    if !shared::is_valid_reference(reference) {
        return Err(ErrorResponse::from_code(
            ErrCode::InvalidParameter,
            format!("reference: {reference}"),
        ));
    }
    Ok(())
}

/// GET /
/// Root catalog: one descriptor per repository (+ ?search=regex).
pub async fn get_global_index(
    State(store): State<Arc<RegistryStore>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Index>, ErrorResponse> {
    debug!("GET / search={:?}", query.search);
    let index = store.get_global_index(&query.search).await?;
    Ok(Json(index))
}

/// GET /:project/:name/index
pub async fn get_index(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Index>, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    let index = store.get_index(&repository, &query.search).await?;
    Ok(Json(index))
}

/// DELETE /:project/:name/index
/// Removes the entire repository, recursively.
pub async fn delete_index(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name)): Path<(String, String)>,
) -> Result<Response, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    debug!("DELETE repository {}", repository);
    store.remove_index(&repository).await?;
    Ok((StatusCode::ACCEPTED, "ok").into_response())
}

/// GET /:project/:name/manifests/:reference
pub async fn get_manifest(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name, reference)): Path<(String, String, String)>,
) -> Result<Json<Manifest>, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    valid_reference(&reference)?;
    let manifest = store.get_manifest(&repository, &reference).await?;
    Ok(Json(manifest))
}

/// PUT /:project/:name/manifests/:reference
/// The body must parse as a manifest before storage is touched; the write
/// rebuilds the per-repository and root catalogs before responding.
pub async fn put_manifest(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    valid_reference(&reference)?;
    debug!("PUT manifest {}@{}", repository, reference);

    let manifest: Manifest = serde_json::from_slice(&body)
        .map_err(|e| ErrorResponse(shared::ErrorInfo::manifest_invalid(e)))?;
    if manifest.config.digest.is_empty() && manifest.blobs.is_empty() {
        return Err(ErrorResponse::from_code(
            ErrCode::ManifestInvalid,
            "manifest has no config and no blobs",
        ));
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    store
        .put_manifest(&repository, &reference, content_type, &manifest)
        .await?;
    Ok(StatusCode::CREATED.into_response())
}

/// DELETE /:project/:name/manifests/:reference
/// Blobs stay behind as garbage-collection candidates.
pub async fn delete_manifest(
    State(store): State<Arc<RegistryStore>>,
    Path((project, name, reference)): Path<(String, String, String)>,
) -> Result<Response, ErrorResponse> {
    let repository = repository_name(&project, &name)?;
    valid_reference(&reference)?;
    store.delete_manifest(&repository, &reference).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}
