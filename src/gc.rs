use shared::{Digest, ErrorInfo};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::registry_store::RegistryStore;

/// Remove blobs in the repository that no live manifest references.
/// Returns the disposition of every unreferenced blob, `removed` or the
/// error that kept it in place. Never crosses repository boundaries.
pub async fn gc_repository(
    store: &RegistryStore,
    repository: &str,
) -> Result<HashMap<Digest, String>, ErrorInfo> {
    info!("start blob garbage collect: {}", repository);

    let index = store.get_index(repository, "").await?;
    let mut in_use: HashSet<Digest> = HashSet::new();
    for version in &index.manifests {
        let manifest = store.get_manifest(repository, &version.name).await?;
        in_use.insert(manifest.config.digest.clone());
        for blob in &manifest.blobs {
            in_use.insert(blob.digest.clone());
        }
    }

    let mut disposition = HashMap::new();
    for digest in store.list_blobs(repository).await? {
        if in_use.contains(&digest) {
            continue;
        }
        match store.delete_blob(repository, &digest).await {
            Ok(()) => {
                info!("removed unused blob {}/{}", repository, digest);
                disposition.insert(digest, "removed".to_string());
            }
            Err(e) => {
                warn!("remove unused blob {}/{}: {}", repository, digest, e);
                disposition.insert(digest, e.to_string());
            }
        }
    }
    info!("stop blob garbage collect: {}", repository);
    Ok(disposition)
}
