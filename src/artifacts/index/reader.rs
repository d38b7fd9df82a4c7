use crate::areas::chunk_store::ChunkStore;
use crate::artifacts::index::{Entry, IndexChunk, IndexRoot, Tombstone};
use crate::artifacts::objects::chunk_id::ChunkId;
use crate::artifacts::objects::object::Unpackable;
use anyhow::Context;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

fn load_chunk(store: &dyn ChunkStore, id: &ChunkId) -> anyhow::Result<IndexChunk> {
    let bytes = store
        .get(id, None)
        .with_context(|| format!("Unable to load index chunk {}", id.to_short_id()))?;

    IndexChunk::deserialize(Cursor::new(bytes))
        .with_context(|| format!("Unable to decode index chunk {}", id.to_short_id()))
}

/// Whether `path` sorts after every path starting with `prefix`.
fn past_prefix(path: &str, prefix: &str) -> bool {
    path > prefix && !path.starts_with(prefix)
}

#[derive(Debug, Clone)]
pub struct IndexReader {
    store: Arc<dyn ChunkStore>,
    root: Option<IndexRoot>,
}

impl IndexReader {
    pub fn new(store: Arc<dyn ChunkStore>, root: Option<IndexRoot>) -> Self {
        IndexReader { store, root }
    }

    /// Every entry whose path starts with `prefix`, in index order.
    pub fn iter_prefix(&self, prefix: &str) -> PrefixIter {
        PrefixIter {
            store: self.store.clone(),
            prefix: prefix.to_string(),
            root: self.root.clone(),
            stack: Vec::new(),
            done: self.root.is_none(),
        }
    }

    pub fn iter(&self) -> PrefixIter {
        self.iter_prefix("")
    }

    /// Directory tombstones that sort before `prefix` but still cover paths
    /// below it, e.g. `/` and `/a/` for `/a/b`.
    pub fn covering_tombstones(&self, prefix: &str) -> anyhow::Result<Vec<Entry>> {
        let mut found = Vec::new();
        for dir in ancestor_dirs(prefix) {
            for entry in self.iter_prefix(&dir) {
                let entry = entry?;
                if entry.path() != dir {
                    break;
                }
                if let Entry::Tombstone(Tombstone { tag: None, .. }) = entry {
                    found.push(entry);
                }
            }
        }

        Ok(found)
    }

    /// Every chunk this index keeps alive: its own chunks and the content
    /// chunks its files point at.
    pub fn referenced_chunks(&self) -> anyhow::Result<BTreeSet<ChunkId>> {
        let mut found = BTreeSet::new();
        let mut pending: Vec<ChunkId> = self.root.iter().map(|root| root.chunk.clone()).collect();

        while let Some(id) = pending.pop() {
            if !found.insert(id.clone()) {
                continue;
            }
            match load_chunk(self.store.as_ref(), &id)? {
                IndexChunk::Ranges(ranges) => {
                    pending.extend(ranges.into_iter().map(|range| range.chunk));
                }
                IndexChunk::Entries(entries) => {
                    for entry in entries {
                        if let Entry::File(file) = entry {
                            found.extend(file.data.into_iter().map(|data| data.chunk));
                        }
                    }
                }
            }
        }

        Ok(found)
    }
}

/// `/`, `/a/`, ... for every directory strictly above the end of `prefix`.
fn ancestor_dirs(prefix: &str) -> Vec<String> {
    prefix
        .char_indices()
        .filter(|(position, c)| *c == '/' && position + 1 < prefix.len())
        .map(|(position, _)| prefix[..=position].to_string())
        .collect()
}

struct Frame {
    chunk: IndexChunk,
    next: usize,
}

/// Lazy iterator over one prefix of an index.
///
/// Loads at most one chunk per level at a time and stops at the first entry
/// past the prefix.
pub struct PrefixIter {
    store: Arc<dyn ChunkStore>,
    prefix: String,
    root: Option<IndexRoot>,
    stack: Vec<Frame>,
    done: bool,
}

impl PrefixIter {
    fn descend(&mut self, id: &ChunkId) -> anyhow::Result<()> {
        let chunk = load_chunk(self.store.as_ref(), id)?;
        let prefix = self.prefix.as_str();
        let next = match &chunk {
            IndexChunk::Entries(entries) => {
                entries.partition_point(|entry| entry.path() < prefix)
            }
            IndexChunk::Ranges(ranges) => {
                ranges.partition_point(|range| range.last_path.as_str() < prefix)
            }
        };
        self.stack.push(Frame { chunk, next });

        Ok(())
    }

    fn advance(&mut self) -> anyhow::Result<Option<Entry>> {
        if let Some(root) = self.root.take() {
            self.descend(&root.chunk)?;
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            if frame.next >= frame.chunk.len() {
                self.stack.pop();
                continue;
            }

            let position = frame.next;
            frame.next += 1;
            match &frame.chunk {
                IndexChunk::Ranges(ranges) => {
                    let child = ranges[position].chunk.clone();
                    self.descend(&child)?;
                }
                IndexChunk::Entries(entries) => {
                    let entry = &entries[position];
                    if past_prefix(entry.path(), &self.prefix) {
                        return Ok(None);
                    }
                    if entry.path().starts_with(&self.prefix) {
                        return Ok(Some(entry.clone()));
                    }
                }
            }
        }
    }
}

impl Iterator for PrefixIter {
    type Item = anyhow::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
