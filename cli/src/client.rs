use shared::{Index, Manifest};

use crate::errors::Result;
use crate::extension::ExtensionDispatcher;
use crate::reference::Reference;
use crate::registry::RegistryClient;

/// Blobs moved concurrently per push or pull.
pub const PUSH_PULL_CONCURRENCY: usize = 3;
/// Progress bar geometry.
pub(crate) const PROGRESS_WIDTH: usize = 40;
pub(crate) const PROGRESS_NAME_WIDTH: usize = 20;

/// The push/pull client: a typed registry client plus the per-scheme
/// transfer dispatcher for server-issued locations.
#[derive(Clone)]
pub struct Client {
    pub remote: RegistryClient,
    pub extension: ExtensionDispatcher,
}

impl Client {
    pub fn new(registry: &str, authorization: Option<&str>) -> Result<Self> {
        Ok(Self {
            remote: RegistryClient::new(registry, authorization)?,
            extension: ExtensionDispatcher::new(),
        })
    }

    pub fn from_reference(reference: &Reference) -> Result<Self> {
        Self::new(&reference.registry, reference.authorization.as_deref())
    }

    /// Cheap connectivity/auth probe.
    pub async fn ping(&self) -> Result<()> {
        self.remote.get_global_index("").await.map(|_| ())
    }

    pub async fn get_manifest(&self, repository: &str, version: &str) -> Result<Manifest> {
        self.remote.get_manifest(repository, version).await
    }

    pub async fn get_index(&self, repository: &str, search: &str) -> Result<Index> {
        self.remote.get_index(repository, search).await
    }

    pub async fn get_global_index(&self, search: &str) -> Result<Index> {
        self.remote.get_global_index(search).await
    }
}
