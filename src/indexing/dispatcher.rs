//! Master-side SCD batch dispatch.
//!
//! When a master drives a distributed rebuild it enumerates the SCD files
//! staged in the collection's master directory, triggers the per-worker index
//! RPC through the aggregated client, and moves dispatched files into a
//! sibling `backup/` directory so a re-run does not replay them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use super::scd::is_scd_filename;
use crate::Result;

/// Directory dispatched batches are moved into, next to the staging dir.
pub const SCD_BACKUP_DIR: &str = "backup";

/// The per-worker index RPC, fanned out by the external aggregator.
#[async_trait]
pub trait IndexService: Send + Sync {
    async fn index(&self, collection: &str, num_docs: u32) -> Result<()>;
}

/// Dispatches staged SCD batches for one collection.
pub struct ScdDispatcher {
    index_client: Arc<dyn IndexService>,
    collection: String,
}

impl ScdDispatcher {
    pub fn new(index_client: Arc<dyn IndexService>, collection: impl Into<String>) -> Self {
        Self {
            index_client,
            collection: collection.into(),
        }
    }

    /// Dispatch every staged SCD file under `scd_dir`.
    ///
    /// Returns the files moved to backup. Files that do not look like SCD
    /// batches are logged and left in place. Nothing is moved when the index
    /// call fails, so the batch can be re-dispatched.
    pub async fn dispatch(&self, scd_dir: &Path, num_docs: u32) -> Result<Vec<PathBuf>> {
        let staged = self.staged_files(scd_dir).await?;
        if staged.is_empty() {
            info!("no SCD files staged under {}", scd_dir.display());
            return Ok(Vec::new());
        }

        info!(
            "start distributed indexing: {} files for {}",
            staged.len(),
            self.collection
        );
        self.index_client.index(&self.collection, num_docs).await?;

        let backup_dir = scd_dir.join(SCD_BACKUP_DIR);
        fs::create_dir_all(&backup_dir).await?;
        info!(
            "moving {} SCD files to directory {}",
            staged.len(),
            backup_dir.display()
        );

        let mut moved = Vec::with_capacity(staged.len());
        for path in staged {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let target = backup_dir.join(file_name);
            match fs::rename(&path, &target).await {
                Ok(()) => moved.push(target),
                Err(err) => warn!("failed to move file {}: {}", path.display(), err),
            }
        }
        Ok(moved)
    }

    /// Staged SCD files in dispatch order (name order equals batch order).
    async fn staged_files(&self, scd_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut staged = Vec::new();
        let mut entries = fs::read_dir(scd_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_scd_filename(&name) {
                staged.push(entry.path());
            } else {
                warn!("SCD file not valid: {}", name);
            }
        }
        staged.sort();
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingIndexService {
        calls: Mutex<Vec<(String, u32)>>,
        fail: bool,
    }

    #[async_trait]
    impl IndexService for RecordingIndexService {
        async fn index(&self, collection: &str, num_docs: u32) -> Result<()> {
            if self.fail {
                return Err(crate::Error::Internal("index rpc failed".to_string()));
            }
            self.calls.lock().push((collection.to_string(), num_docs));
            Ok(())
        }
    }

    fn service(fail: bool) -> Arc<RecordingIndexService> {
        Arc::new(RecordingIndexService {
            calls: Mutex::new(Vec::new()),
            fail,
        })
    }

    #[tokio::test]
    async fn dispatch_moves_valid_files_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let valid = dir.path().join("B-00-201207282137-29781-I-C.SCD");
        let invalid = dir.path().join("notes.txt");
        std::fs::write(&valid, b"batch").unwrap();
        std::fs::write(&invalid, b"junk").unwrap();

        let index = service(false);
        let dispatcher = ScdDispatcher::new(index.clone(), "products");
        let moved = dispatcher.dispatch(dir.path(), 100).await.unwrap();

        assert_eq!(moved.len(), 1);
        assert!(!valid.exists(), "dispatched file must leave the staging dir");
        assert!(moved[0].exists());
        assert!(invalid.exists(), "non-SCD files stay put");
        assert_eq!(
            index.calls.lock().clone(),
            vec![("products".to_string(), 100)]
        );
    }

    #[tokio::test]
    async fn failed_index_call_leaves_files_staged() {
        let dir = tempfile::tempdir().unwrap();
        let valid = dir.path().join("B-00-201207282137-29781-I-C.SCD");
        std::fs::write(&valid, b"batch").unwrap();

        let dispatcher = ScdDispatcher::new(service(true), "products");
        let result = dispatcher.dispatch(dir.path(), 100).await;

        assert!(result.is_err());
        assert!(valid.exists(), "failed dispatch must not consume the batch");
    }

    #[tokio::test]
    async fn empty_staging_dir_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let index = service(false);
        let dispatcher = ScdDispatcher::new(index.clone(), "products");
        let moved = dispatcher.dispatch(dir.path(), 1).await.unwrap();
        assert!(moved.is_empty());
        assert!(index.calls.lock().is_empty(), "no files, no index call");
    }
}
