pub mod auth;
pub mod blobs;
pub mod codes;
pub mod endpoints;
pub mod gc;
pub mod manifests;
pub mod registry_store;
pub mod s3_storage;
pub mod storage;
pub mod storage_driver;
