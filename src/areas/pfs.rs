use crate::areas::chunk_store::{ChunkStore, LocalChunkStore, MemoryChunkStore, RetryingChunkStore};
use crate::areas::metadata::{MetadataStore, Txn};
use crate::areas::storage::FileSetStorage;
use crate::config::Config;
use crate::errors::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A versioned file system over one chunk store.
///
/// Operations live in `crate::commands`, one file per resource. All of them
/// take `&self`; share a `Pfs` between tasks through an `Arc`.
#[derive(Debug)]
pub struct Pfs {
    config: Config,
    metadata: MetadataStore,
    storage: Arc<FileSetStorage>,
}

impl Pfs {
    /// Open a file system over `store`. Transient store faults are retried
    /// according to `config`.
    pub fn new(config: Config, store: Arc<dyn ChunkStore>) -> anyhow::Result<Self> {
        let config = config.validated()?;
        let store: Arc<dyn ChunkStore> = Arc::new(RetryingChunkStore::new(
            store,
            config.chunk_retry_attempts,
            config.chunk_retry_backoff(),
        ));

        Ok(Pfs {
            metadata: MetadataStore::new(config.txn_max_attempts),
            storage: Arc::new(FileSetStorage::new(store, config.clone())),
            config,
        })
    }

    /// Keep chunks under `path` on the local disk.
    pub fn open_local(config: Config, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::new(config, Arc::new(LocalChunkStore::without_faults(path)?))
    }

    pub fn in_memory(config: Config) -> anyhow::Result<Self> {
        Self::new(config, Arc::new(MemoryChunkStore::default()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub(crate) fn storage(&self) -> &Arc<FileSetStorage> {
        &self.storage
    }

    /// Re-run `check` after every metadata change until it yields a value.
    ///
    /// Gives up with `DeadlineExceeded` once `deadline` elapses. Dropping the
    /// returned future stops waiting and changes nothing.
    pub(crate) async fn wait_until<T>(
        &self,
        deadline: Option<Duration>,
        what: &str,
        mut check: impl FnMut(&mut Txn) -> Result<Option<T>>,
    ) -> Result<T> {
        let mut revisions = self.metadata.subscribe();
        let waiting = async {
            loop {
                revisions.borrow_and_update();
                if let Some(value) = self.metadata.read(&mut check)? {
                    return Ok(value);
                }
                revisions
                    .changed()
                    .await
                    .map_err(|_| Error::internal("metadata store shut down"))?;
            }
        };

        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, waiting)
                .await
                .map_err(|_| Error::deadline_exceeded(format!("timed out waiting for {what}")))?,
            None => waiting.await,
        }
    }
}
