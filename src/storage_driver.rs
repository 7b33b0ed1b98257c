use chrono::{DateTime, Utc};
use shared::PresignedPart;
use std::path::PathBuf;
use tokio::io::AsyncRead;

use crate::s3_storage::S3StorageDriver;
use crate::storage::LocalStorageDriver;

#[derive(Debug)]
pub enum StorageError {
    IoError(std::io::Error),
    S3Error(String),
    NotFound,
    SizeMismatch { expected: i64, actual: i64 },
    Unsupported,
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "IO Error: {}", e),
            Self::S3Error(e) => write!(f, "S3 Error: {}", e),
            Self::NotFound => write!(f, "Object not found"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "Size mismatch: expected {} got {}", expected, actual)
            }
            Self::Unsupported => write!(f, "Operation unsupported by storage driver"),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::IoError(e)
        }
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

/// One stored object, streamed.
pub struct BlobContent {
    pub content_type: String,
    pub content_length: i64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl BlobContent {
    pub fn from_bytes(content_type: &str, data: Vec<u8>) -> Self {
        Self {
            content_type: content_type.to_string(),
            content_length: data.len() as i64,
            reader: Box::new(std::io::Cursor::new(data)),
        }
    }
}

/// Listing entry. Names are relative to the listed prefix.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub name: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub enum DriverType {
    Local,
    S3,
}

pub enum Backend {
    Local(LocalStorageDriver),
    S3(S3StorageDriver),
}

// all this just because we can't use trait objects async
macro_rules! backend_methods {
    ($enum_name:ident, $($variant:ident),+) => {
        impl $enum_name {
            pub fn kind(&self) -> DriverType {
                match self {
                    $(Self::$variant(_) => DriverType::$variant,)+
                }
            }

            pub async fn put(
                &self,
                path: &str,
                content: BlobContent,
            ) -> Result<(), StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.put(path, content).await,)+
                }
            }

            pub async fn get(&self, path: &str) -> Result<BlobContent, StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.get(path).await,)+
                }
            }

            pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.exists(path).await,)+
                }
            }

            pub async fn remove(
                &self,
                path: &str,
                recursive: bool,
            ) -> Result<(), StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.remove(path, recursive).await,)+
                }
            }

            pub async fn list(
                &self,
                prefix: &str,
                recursive: bool,
            ) -> Result<Vec<BlobMeta>, StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.list(prefix, recursive).await,)+
                }
            }

            pub async fn put_location(
                &self,
                path: &str,
            ) -> Result<PresignedPart, StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.put_location(path).await,)+
                }
            }

            pub async fn get_location(
                &self,
                path: &str,
            ) -> Result<PresignedPart, StorageError> {
                match self {
                    $(Self::$variant(driver) => driver.get_location(path).await,)+
                }
            }
        }
    };
}

backend_methods!(Backend, Local, S3);

impl Backend {
    pub fn base_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Local(driver) => Some(driver.base_path()),
            Self::S3(_) => None,
        }
    }

    /// The multipart location machinery only exists on s3.
    pub fn as_s3(&self) -> Option<&S3StorageDriver> {
        match self {
            Self::S3(driver) => Some(driver),
            Self::Local(_) => None,
        }
    }
}
