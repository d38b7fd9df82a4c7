use crate::areas::chunk_store::ChunkStore;
use crate::artifacts::index::{Entry, IndexRoot, Range, encode_entry, encode_range, frame_chunk};
use tracing::debug;

/// Streams sorted entries into index chunks.
///
/// Entries must be pushed in index order. A chunk is cut once it reaches
/// `chunk_size` bytes, but never between two entries of the same path, so
/// the `last_path` of consecutive ranges is strictly increasing.
pub struct IndexWriter<'s> {
    store: &'s dyn ChunkStore,
    chunk_size: usize,
    fanout: usize,
    buffer: Vec<u8>,
    count: u32,
    last: Option<Entry>,
    offset: u64,
    leaves: Vec<Range>,
}

impl<'s> IndexWriter<'s> {
    pub fn new(store: &'s dyn ChunkStore, chunk_size: usize, fanout: usize) -> Self {
        IndexWriter {
            store,
            chunk_size: chunk_size.max(1),
            fanout: fanout.max(2),
            buffer: Vec::new(),
            count: 0,
            last: None,
            offset: 0,
            leaves: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: Entry) -> anyhow::Result<()> {
        if let Some(last) = &self.last {
            if Entry::index_order(&entry, last).is_le() {
                anyhow::bail!(
                    "index entries out of order: {:?} after {:?}",
                    entry.sort_key(),
                    last.sort_key()
                );
            }
            if self.buffer.len() >= self.chunk_size && entry.path() != last.path() {
                self.flush()?;
            }
        }

        encode_entry(&mut self.buffer, &entry)?;
        self.count += 1;
        self.last = Some(entry);

        Ok(())
    }

    /// Write the remaining chunks and return the root, or `None` when no
    /// entry was pushed.
    pub fn finish(mut self) -> anyhow::Result<Option<IndexRoot>> {
        self.flush()?;

        let mut ranges = std::mem::take(&mut self.leaves);
        match ranges.len() {
            0 => return Ok(None),
            1 => return Ok(ranges.pop().map(|range| IndexRoot::new(range.chunk, 0))),
            _ => {}
        }

        let mut height = 1;
        while ranges.len() > self.fanout {
            ranges = self.write_level(&ranges)?;
            height += 1;
        }

        let mut records = Vec::new();
        for range in &ranges {
            encode_range(&mut records, range)?;
        }
        let root = self
            .store
            .put(frame_chunk(true, ranges.len() as u32, &records))?;
        debug!(height, ranges = ranges.len(), "wrote index root");

        Ok(Some(IndexRoot::new(root, height)))
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        let Some(last) = &self.last else {
            return Ok(());
        };
        if self.count == 0 {
            return Ok(());
        }

        let chunk = frame_chunk(false, self.count, &self.buffer);
        let size = chunk.len() as u64;
        let id = self.store.put(chunk)?;
        self.leaves
            .push(Range::new(self.offset, last.path().to_string(), id));

        self.offset += size;
        self.buffer.clear();
        self.count = 0;

        Ok(())
    }

    /// Pack one level of ranges into chunks, returning the ranges of the
    /// level above.
    fn write_level(&self, ranges: &[Range]) -> anyhow::Result<Vec<Range>> {
        let mut above = Vec::new();
        let mut offset = 0;
        let mut records = Vec::new();
        let mut count = 0u32;

        for (position, range) in ranges.iter().enumerate() {
            encode_range(&mut records, range)?;
            count += 1;

            let is_last = position + 1 == ranges.len();
            if is_last || (records.len() >= self.chunk_size && count >= 2) {
                let chunk = frame_chunk(true, count, &records);
                let size = chunk.len() as u64;
                let id = self.store.put(chunk)?;
                above.push(Range::new(offset, range.last_path.clone(), id));

                offset += size;
                records.clear();
                count = 0;
            }
        }

        Ok(above)
    }
}
