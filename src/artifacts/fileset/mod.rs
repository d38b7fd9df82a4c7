//! Filesets: a commit's file tree as stacked, mergeable layers
//!
//! - `path`: path normalization
//! - `layer`: building one layer from a batch of writes
//! - `merge`: k-way merge of stacked layers with tombstone semantics
//! - `compaction`: choosing which layers to merge
//! - `tree`: file infos, directory synthesis, listing
//! - `glob`: glob patterns
//! - `diff`: comparing two trees

pub mod compaction;
pub mod diff;
pub mod glob;
pub mod layer;
pub mod merge;
pub mod path;
pub mod tree;

use crate::areas::chunk_store::ChunkStore;
use crate::artifacts::fileset::merge::EntryStream;
use crate::artifacts::index::reader::IndexReader;
use crate::artifacts::index::writer::IndexWriter;
use crate::artifacts::index::{DataRef, Entry, IndexRoot};
use bytes::Bytes;
use std::sync::Arc;

/// An immutable, content-addressed fileset.
///
/// Cheap to clone: it is only the root of an index in the chunk store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FileSet {
    pub root: Option<IndexRoot>,
}

impl FileSet {
    pub fn empty() -> Self {
        FileSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn reader(&self, store: Arc<dyn ChunkStore>) -> IndexReader {
        IndexReader::new(store, self.root.clone())
    }

    /// Entries relevant to `prefix`: the ones below it plus the directory
    /// tombstones above it.
    pub fn stream(&self, store: Arc<dyn ChunkStore>, prefix: &str) -> anyhow::Result<EntryStream> {
        let reader = self.reader(store);
        let covering = reader.covering_tombstones(prefix)?;

        Ok(Box::new(
            covering
                .into_iter()
                .map(Ok)
                .chain(reader.iter_prefix(prefix)),
        ))
    }

    /// Write already sorted entries as a new fileset.
    pub fn write(
        store: &dyn ChunkStore,
        entries: impl IntoIterator<Item = anyhow::Result<Entry>>,
        index_chunk_size: usize,
        index_fanout: usize,
    ) -> anyhow::Result<FileSet> {
        let mut writer = IndexWriter::new(store, index_chunk_size, index_fanout);
        for entry in entries {
            writer.push(entry?)?;
        }

        Ok(FileSet {
            root: writer.finish()?,
        })
    }
}

/// A fileset stacked on top of a commit's base, with its compaction level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub fileset: FileSet,
    pub level: u32,
}

impl Layer {
    pub fn fresh(fileset: FileSet) -> Self {
        Layer { fileset, level: 0 }
    }
}

/// Split `content` into chunks of at most `chunk_size` bytes and store them.
pub fn write_content(
    store: &dyn ChunkStore,
    content: Bytes,
    chunk_size: usize,
) -> anyhow::Result<Vec<DataRef>> {
    let chunk_size = chunk_size.max(1);
    let mut refs = Vec::with_capacity(content.len().div_ceil(chunk_size));

    let mut start = 0;
    while start < content.len() {
        let end = (start + chunk_size).min(content.len());
        let piece = content.slice(start..end);
        let size = piece.len() as u64;
        let chunk = store.put(piece)?;
        refs.push(DataRef::new(chunk, 0, size));
        start = end;
    }

    Ok(refs)
}

/// Read the bytes behind `refs`, restricted to `offset..offset + len` of
/// their concatenation.
pub fn read_content(
    store: &dyn ChunkStore,
    refs: &[DataRef],
    offset: u64,
    len: Option<u64>,
) -> anyhow::Result<Vec<u8>> {
    let end = len.map_or(u64::MAX, |len| offset.saturating_add(len));
    let mut out = Vec::new();
    let mut position = 0u64;

    for data in refs {
        let (ref_start, ref_end) = (position, position + data.size);
        position = ref_end;
        if ref_end <= offset || ref_start >= end {
            continue;
        }

        let from = offset.saturating_sub(ref_start);
        let to = end.min(ref_end) - ref_start;
        let bytes = store.get(&data.chunk, Some(data.offset + from..data.offset + to))?;
        out.extend_from_slice(&bytes);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::areas::chunk_store::MemoryChunkStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_is_split_into_bounded_chunks() {
        let store = MemoryChunkStore::default();
        let refs = write_content(&store, Bytes::from_static(b"abcdefghij"), 4).unwrap();

        assert_eq!(
            refs.iter().map(|data| data.size).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert_eq!(read_content(&store, &refs, 0, None).unwrap(), b"abcdefghij");
    }

    #[test]
    fn ranged_reads_cross_chunk_boundaries() {
        let store = MemoryChunkStore::default();
        let refs = write_content(&store, Bytes::from_static(b"abcdefghij"), 4).unwrap();

        assert_eq!(read_content(&store, &refs, 3, Some(4)).unwrap(), b"defg");
        assert_eq!(read_content(&store, &refs, 8, Some(100)).unwrap(), b"ij");
        assert!(read_content(&store, &refs, 20, Some(1)).unwrap().is_empty());
    }

    #[test]
    fn empty_content_has_no_refs() {
        let store = MemoryChunkStore::default();

        assert!(write_content(&store, Bytes::new(), 4).unwrap().is_empty());
        assert!(store.is_empty());
    }
}
