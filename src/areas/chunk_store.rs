//! Content-addressed chunk storage
//!
//! Every piece of file content and every serialized index block lives in a
//! chunk, addressed by the SHA-1 of its bytes. Storing the same bytes twice
//! yields the same [`ChunkId`] and writes nothing new.
//!
//! ## Implementations
//!
//! - [`LocalChunkStore`]: zlib-compressed files under `<root>/xx/yyyy...`,
//!   written to a temp file and renamed into place
//! - [`MemoryChunkStore`]: a map guarded by a lock, for tests and scratch use
//! - [`RetryingChunkStore`]: wraps either of the above and retries
//!   [`TransientFault`]s with exponential backoff
//!
//! Both backing stores consult an injected [`FaultInjector`] before every
//! call.

use crate::areas::faults::{ChunkOp, FaultInjector, NoFaults, TransientFault};
use crate::artifacts::objects::chunk_id::ChunkId;
use anyhow::Context;
use bytes::Bytes;
use fake::rand;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Error)]
#[error("chunk {0} not found")]
pub struct ChunkNotFound(pub ChunkId);

pub trait ChunkStore: Send + Sync + Debug {
    /// Store `content`, returning its address.
    fn put(&self, content: Bytes) -> anyhow::Result<ChunkId>;

    /// Read a chunk, or the byte `range` of it.
    fn get(&self, id: &ChunkId, range: Option<Range<u64>>) -> anyhow::Result<Bytes>;

    fn delete(&self, id: &ChunkId) -> anyhow::Result<()>;

    fn list(&self) -> anyhow::Result<Vec<ChunkId>>;
}

fn slice(id: &ChunkId, content: Bytes, range: Option<Range<u64>>) -> anyhow::Result<Bytes> {
    let Some(range) = range else {
        return Ok(content);
    };

    let len = content.len() as u64;
    if range.start > len || range.start > range.end {
        anyhow::bail!(
            "range {}..{} is outside chunk {} of {} bytes",
            range.start,
            range.end,
            id.to_short_id(),
            len
        );
    }
    let end = range.end.min(len);

    Ok(content.slice(range.start as usize..end as usize))
}

#[derive(Debug)]
pub struct LocalChunkStore {
    path: Box<Path>,
    faults: Arc<dyn FaultInjector>,
}

impl LocalChunkStore {
    pub fn new(path: impl Into<PathBuf>, faults: Arc<dyn FaultInjector>) -> anyhow::Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Unable to create chunk directory {}", path.display()))?;

        Ok(LocalChunkStore {
            path: path.into_boxed_path(),
            faults,
        })
    }

    pub fn without_faults(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::new(path, Arc::new(NoFaults))
    }

    pub fn chunks_path(&self) -> &Path {
        &self.path
    }

    fn write_chunk(&self, chunk_path: &Path, content: Bytes) -> anyhow::Result<()> {
        let chunk_dir = chunk_path
            .parent()
            .with_context(|| format!("Invalid chunk path {}", chunk_path.display()))?;
        std::fs::create_dir_all(chunk_dir)
            .with_context(|| format!("Unable to create chunk directory {}", chunk_dir.display()))?;
        let temp_path = chunk_dir.join(Self::generate_temp_name());

        let compressed = Self::compress(content)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Unable to open chunk file {}", temp_path.display()))?;
        file.write_all(&compressed)
            .with_context(|| format!("Unable to write chunk file {}", temp_path.display()))?;

        // rename into place so readers never observe a partial chunk
        std::fs::rename(&temp_path, chunk_path)
            .with_context(|| format!("Unable to rename chunk file to {}", chunk_path.display()))?;

        Ok(())
    }

    fn compress(data: Bytes) -> anyhow::Result<Bytes> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&data)
            .context("Unable to compress chunk content")?;

        encoder
            .finish()
            .map(Bytes::from)
            .context("Unable to finish compressing chunk content")
    }

    fn decompress(data: &[u8]) -> anyhow::Result<Bytes> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Unable to decompress chunk content")?;

        Ok(decompressed.into())
    }

    fn generate_temp_name() -> String {
        format!("tmp-chunk-{}", rand::random::<u32>())
    }
}

impl ChunkStore for LocalChunkStore {
    fn put(&self, content: Bytes) -> anyhow::Result<ChunkId> {
        self.faults.before(ChunkOp::Put)?;

        let id = ChunkId::for_content(&content);
        let chunk_path = self.path.join(id.to_path());
        if !chunk_path.exists() {
            self.write_chunk(&chunk_path, content)?;
        }

        Ok(id)
    }

    fn get(&self, id: &ChunkId, range: Option<Range<u64>>) -> anyhow::Result<Bytes> {
        self.faults.before(ChunkOp::Get)?;

        let chunk_path = self.path.join(id.to_path());
        let raw = match std::fs::read(&chunk_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChunkNotFound(id.clone()).into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Unable to read chunk {}", chunk_path.display()));
            }
        };

        slice(id, Self::decompress(&raw)?, range)
    }

    fn delete(&self, id: &ChunkId) -> anyhow::Result<()> {
        self.faults.before(ChunkOp::Delete)?;

        let chunk_path = self.path.join(id.to_path());
        match std::fs::remove_file(&chunk_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Unable to delete chunk {}", chunk_path.display()))
            }
        }
    }

    fn list(&self) -> anyhow::Result<Vec<ChunkId>> {
        self.faults.before(ChunkOp::List)?;

        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.path).min_depth(2).max_depth(2) {
            let entry = entry.context("Unable to walk chunk directory")?;
            if !entry.file_type().is_file() {
                continue;
            }

            let dir = entry
                .path()
                .parent()
                .and_then(|parent| parent.file_name())
                .and_then(|name| name.to_str());
            let file = entry.file_name().to_str();
            if let (Some(dir), Some(file)) = (dir, file) {
                // leftover temp files fail to parse and are skipped
                if let Ok(id) = ChunkId::try_parse(format!("{dir}{file}")) {
                    ids.push(id);
                }
            }
        }
        ids.sort();

        Ok(ids)
    }
}

#[derive(Debug)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<ChunkId, Bytes>>,
    faults: Arc<dyn FaultInjector>,
}

impl MemoryChunkStore {
    pub fn new(faults: Arc<dyn FaultInjector>) -> Self {
        MemoryChunkStore {
            chunks: RwLock::new(HashMap::new()),
            faults,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|chunks| chunks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new(Arc::new(NoFaults))
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, content: Bytes) -> anyhow::Result<ChunkId> {
        self.faults.before(ChunkOp::Put)?;

        let id = ChunkId::for_content(&content);
        self.chunks
            .write()
            .map_err(|_| anyhow::anyhow!("chunk map lock poisoned"))?
            .entry(id.clone())
            .or_insert(content);

        Ok(id)
    }

    fn get(&self, id: &ChunkId, range: Option<Range<u64>>) -> anyhow::Result<Bytes> {
        self.faults.before(ChunkOp::Get)?;

        let content = self
            .chunks
            .read()
            .map_err(|_| anyhow::anyhow!("chunk map lock poisoned"))?
            .get(id)
            .cloned()
            .ok_or_else(|| ChunkNotFound(id.clone()))?;

        slice(id, content, range)
    }

    fn delete(&self, id: &ChunkId) -> anyhow::Result<()> {
        self.faults.before(ChunkOp::Delete)?;

        self.chunks
            .write()
            .map_err(|_| anyhow::anyhow!("chunk map lock poisoned"))?
            .remove(id);
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<ChunkId>> {
        self.faults.before(ChunkOp::List)?;

        let mut ids: Vec<ChunkId> = self
            .chunks
            .read()
            .map_err(|_| anyhow::anyhow!("chunk map lock poisoned"))?
            .keys()
            .cloned()
            .collect();
        ids.sort();

        Ok(ids)
    }
}

/// Retries transient faults of the wrapped store.
///
/// Non-transient errors (a missing chunk, a corrupt file) are returned on the
/// first occurrence.
#[derive(Debug, Clone)]
pub struct RetryingChunkStore {
    inner: Arc<dyn ChunkStore>,
    attempts: usize,
    backoff: Duration,
}

impl RetryingChunkStore {
    pub fn new(inner: Arc<dyn ChunkStore>, attempts: usize, backoff: Duration) -> Self {
        RetryingChunkStore {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }

    fn retry<T>(&self, op: ChunkOp, f: impl Fn() -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if err.downcast_ref::<TransientFault>().is_some() => {
                    if attempt >= self.attempts {
                        return Err(err).with_context(|| {
                            format!("chunk store {op:?} failed after {attempt} attempts")
                        });
                    }
                    warn!(?op, attempt, "transient chunk store fault, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl ChunkStore for RetryingChunkStore {
    fn put(&self, content: Bytes) -> anyhow::Result<ChunkId> {
        self.retry(ChunkOp::Put, || self.inner.put(content.clone()))
    }

    fn get(&self, id: &ChunkId, range: Option<Range<u64>>) -> anyhow::Result<Bytes> {
        self.retry(ChunkOp::Get, || self.inner.get(id, range.clone()))
    }

    fn delete(&self, id: &ChunkId) -> anyhow::Result<()> {
        self.retry(ChunkOp::Delete, || self.inner.delete(id))
    }

    fn list(&self) -> anyhow::Result<Vec<ChunkId>> {
        self.retry(ChunkOp::List, || self.inner.list())
    }
}
