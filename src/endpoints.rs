use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::sync::Arc;

use crate::blobs::{get_blob, get_blob_location, put_blob};
use crate::codes::MAX_MANIFEST_BYTES;
use crate::manifests::{
    delete_index, delete_manifest, get_global_index, get_index, get_manifest, healthz,
    put_manifest,
};
use crate::registry_store::RegistryStore;

/// The modelx wire protocol.
///
/// | Method | Endpoint                                          | Success | Failure       |
/// | ------ | ------------------------------------------------- | ------- | ------------- |
/// | GET    | `/`                                               | `200`   | `401`         |
/// | GET    | `/healthz`                                        | `200`   |               |
/// | GET    | `/<repo>/index`                                   | `200`   | `404`/`400`   |
/// | DELETE | `/<repo>/index`                                   | `202`   | `404`         |
/// | GET    | `/<repo>/manifests/<version>`                     | `200`   | `404`/`400`   |
/// | PUT    | `/<repo>/manifests/<version>`                     | `201`   | `400`         |
/// | DELETE | `/<repo>/manifests/<version>`                     | `202`   | `404`         |
/// | HEAD   | `/<repo>/blobs/<digest>`                          | `200`   | `404`         |
/// | GET    | `/<repo>/blobs/<digest>`                          | `200`/`302` | `404`     |
/// | PUT    | `/<repo>/blobs/<digest>`                          | `201`/`307` | `400`     |
/// | GET    | `/<repo>/blobs/<digest>/locations/<purpose>`      | `200`   | `404`/`501`   |
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Endpoint {
    GetGlobalIndex,
    GetHealthz,
    GetIndex,
    DeleteIndex,
    GetManifest,
    PutManifest,
    DeleteManifest,
    HeadBlob,
    GetBlob,
    PutBlob,
    GetBlobLocation,
}

impl Endpoint {
    pub fn all() -> &'static [Endpoint] {
        &[
            Endpoint::GetGlobalIndex,
            Endpoint::GetHealthz,
            Endpoint::GetIndex,
            Endpoint::DeleteIndex,
            Endpoint::GetManifest,
            Endpoint::PutManifest,
            Endpoint::DeleteManifest,
            Endpoint::HeadBlob,
            Endpoint::GetBlob,
            Endpoint::PutBlob,
            Endpoint::GetBlobLocation,
        ]
    }

    pub fn method(&self) -> &str {
        match self {
            Endpoint::GetGlobalIndex
            | Endpoint::GetHealthz
            | Endpoint::GetIndex
            | Endpoint::GetManifest
            | Endpoint::GetBlob
            | Endpoint::GetBlobLocation => "GET",
            Endpoint::HeadBlob => "HEAD",
            Endpoint::PutManifest | Endpoint::PutBlob => "PUT",
            Endpoint::DeleteIndex | Endpoint::DeleteManifest => "DELETE",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Endpoint::GetGlobalIndex => "/",
            Endpoint::GetHealthz => "/healthz",
            Endpoint::GetIndex | Endpoint::DeleteIndex => "/<repo>/index",
            Endpoint::GetManifest | Endpoint::PutManifest | Endpoint::DeleteManifest => {
                "/<repo>/manifests/<version>"
            }
            Endpoint::HeadBlob | Endpoint::GetBlob | Endpoint::PutBlob => {
                "/<repo>/blobs/<digest>"
            }
            Endpoint::GetBlobLocation => "/<repo>/blobs/<digest>/locations/<purpose>",
        }
    }

    pub fn success_status(&self) -> Vec<u16> {
        match self {
            Endpoint::GetGlobalIndex
            | Endpoint::GetHealthz
            | Endpoint::GetIndex
            | Endpoint::GetManifest
            | Endpoint::HeadBlob
            | Endpoint::GetBlobLocation => vec![200],
            Endpoint::GetBlob => vec![200, 302],
            Endpoint::PutManifest => vec![201],
            Endpoint::PutBlob => vec![201, 307],
            Endpoint::DeleteIndex | Endpoint::DeleteManifest => vec![202],
        }
    }
}

pub fn router(store: Arc<RegistryStore>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", get(get_global_index))
        .route("/:project/:name/index", get(get_index).delete(delete_index))
        .route(
            "/:project/:name/manifests/:reference",
            get(get_manifest)
                .put(put_manifest)
                .delete(delete_manifest)
                .layer(DefaultBodyLimit::max(MAX_MANIFEST_BYTES)),
        )
        .route(
            "/:project/:name/blobs/:digest",
            get(get_blob)
                .put(put_blob)
                .layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/:project/:name/blobs/:digest/locations/:purpose",
            get(get_blob_location),
        )
        .with_state(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorageDriver;
    use crate::storage_driver::Backend;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use shared::{Descriptor, Digest, ErrorInfo, Index, Manifest};
    use tower::ServiceExt;

    async fn test_router() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let driver = LocalStorageDriver::new(dir.path()).await.unwrap();
        let store = RegistryStore::new(Backend::Local(driver), false)
            .await
            .unwrap();
        let router = router(Arc::new(store));
        (dir, router)
    }

    fn manifest_body() -> (Manifest, Digest, Vec<u8>) {
        let config_data = b"description: test".to_vec();
        let digest = Digest::from_bytes(&config_data);
        let mut manifest = Manifest::new();
        manifest.config = Descriptor {
            name: "modelx.yaml".to_string(),
            media_type: shared::MEDIA_TYPE_MODEL_CONFIG.to_string(),
            digest: digest.clone(),
            size: config_data.len() as i64,
            ..Default::default()
        };
        let raw = serde_json::to_vec(&manifest).unwrap();
        (manifest, digest, raw)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let raw = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let (_dir, router) = test_router().await;
        let response = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_manifest_put_then_index_visible() {
        let (_dir, router) = test_router().await;
        let (_, _, raw) = manifest_body();

        let response = router
            .clone()
            .oneshot(
                Request::put("/lib/m1/manifests/v1")
                    .header("content-type", "application/json")
                    .body(Body::from(raw))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(Request::get("/lib/m1/index").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let index: Index = body_json(response).await;
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].name, "v1");

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let global: Index = body_json(response).await;
        assert_eq!(global.manifests[0].name, "lib/m1");
    }

    #[tokio::test]
    async fn test_malformed_manifest_rejected() {
        let (_dir, router) = test_router().await;
        let response = router
            .clone()
            .oneshot(
                Request::put("/lib/m1/manifests/v1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"blobs": "oops"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let info: ErrorInfo = body_json(response).await;
        assert_eq!(info.code, shared::ErrCode::ManifestInvalid);

        // storage untouched: no index was created
        let response = router
            .oneshot(Request::get("/lib/m1/index").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_head() {
        let (_dir, router) = test_router().await;
        let data = b"model weights".to_vec();
        let digest = Digest::from_bytes(&data);
        let path = format!("/lib/m1/blobs/{digest}");

        let response = router
            .clone()
            .oneshot(
                Request::head(path.as_str()).body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .clone()
            .oneshot(
                Request::put(path.as_str())
                    .header("content-type", "application/octet-stream")
                    .header("content-length", data.len())
                    .body(Body::from(data.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(Request::head(path.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let raw = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(raw.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_blob_digest_mismatch_rejected() {
        let (_dir, router) = test_router().await;
        let wrong = Digest::from_bytes(b"something else");
        let response = router
            .oneshot(
                Request::put(format!("/lib/m1/blobs/{wrong}"))
                    .header("content-type", "application/octet-stream")
                    .body(Body::from("actual bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let info: ErrorInfo = body_json(response).await;
        assert_eq!(info.code, shared::ErrCode::DigestInvalid);
    }

    #[tokio::test]
    async fn test_invalid_digest_path() {
        let (_dir, router) = test_router().await;
        let response = router
            .oneshot(
                Request::get("/lib/m1/blobs/not-a-digest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_location_unsupported_on_local_backend() {
        let (_dir, router) = test_router().await;
        let digest = Digest::from_bytes(b"x");
        let response = router
            .oneshot(
                Request::get(format!("/lib/m1/blobs/{digest}/locations/upload?size=10"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_delete_manifest_and_repository() {
        let (_dir, router) = test_router().await;
        let (_, _, raw) = manifest_body();
        for version in ["v1", "v2"] {
            let response = router
                .clone()
                .oneshot(
                    Request::put(format!("/lib/m1/manifests/{version}"))
                        .header("content-type", "application/json")
                        .body(Body::from(raw.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = router
            .clone()
            .oneshot(
                Request::delete("/lib/m1/manifests/v1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router
            .clone()
            .oneshot(Request::get("/lib/m1/index").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let index: Index = body_json(response).await;
        assert_eq!(index.manifests.len(), 1);

        let response = router
            .clone()
            .oneshot(Request::delete("/lib/m1/index").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let global: Index = body_json(response).await;
        assert!(global.manifests.is_empty());
    }

    #[tokio::test]
    async fn test_search_query_filters_global_index() {
        let (_dir, router) = test_router().await;
        let (_, _, raw) = manifest_body();
        for repo in ["lib/gpt-small", "lib/gpt-large", "lib/bert"] {
            router
                .clone()
                .oneshot(
                    Request::put(format!("/{repo}/manifests/v1"))
                        .header("content-type", "application/json")
                        .body(Body::from(raw.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        let response = router
            .oneshot(
                Request::get("/?search=%5Elib/gpt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let global: Index = body_json(response).await;
        let names: Vec<_> = global.manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["lib/gpt-large", "lib/gpt-small"]);
    }

    #[test]
    fn test_endpoint_table_is_complete() {
        assert_eq!(Endpoint::all().len(), 11);
        for endpoint in Endpoint::all() {
            assert!(!endpoint.method().is_empty());
            assert!(endpoint.path().starts_with('/'));
            assert!(!endpoint.success_status().is_empty());
        }
    }
}
