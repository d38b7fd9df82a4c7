//! Range-addressable index over a sorted file listing
//!
//! A fileset is stored as a tree of index chunks in the chunk store:
//!
//! - leaf chunks hold [`Entry`] records (files and tombstones), sorted by
//!   `(path, kind, tag)`
//! - upper chunks hold [`Range`] records, one per child chunk, giving the
//!   child's byte offset in its level and the last path it contains
//!
//! A reader bisects the ranges to find the first chunk that can contain a
//! path, so a lookup only loads one chunk per level.
//!
//! ## Chunk format
//!
//! ```text
//! u8   chunk kind (0 = entries, 1 = ranges)
//! u32  record count
//! ...  records
//! ```
//!
//! Every record starts with a kind byte and a `u16`-prefixed path. Files add
//! a `u16`-prefixed tag and a `u32`-prefixed list of data refs (20-byte chunk
//! id, `u64` offset, `u64` size). Tagged tombstones add a tag. Ranges add a
//! `u64` offset and a 20-byte chunk id. Integers are big-endian.

pub mod reader;
pub mod writer;

use crate::artifacts::objects::chunk_id::ChunkId;
use crate::artifacts::objects::object::{Packable, Unpackable};
use anyhow::Context;
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use derive_new::new;
use std::cmp::Ordering;
use std::io::{BufRead, Write};

const MAX_PATH_SIZE: usize = u16::MAX as usize;

const CHUNK_ENTRIES: u8 = 0;
const CHUNK_RANGES: u8 = 1;

const RECORD_FILE: u8 = 0;
const RECORD_RANGE: u8 = 1;
const RECORD_TOMBSTONE: u8 = 2;
const RECORD_TAGGED_TOMBSTONE: u8 = 3;

/// A slice of a chunk holding part of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct DataRef {
    pub chunk: ChunkId,
    pub offset: u64,
    pub size: u64,
}

/// One tagged piece of a file. A path may carry several tags; their content
/// is concatenated in tag order.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct FileEntry {
    pub path: String,
    pub tag: String,
    pub data: Vec<DataRef>,
}

impl FileEntry {
    pub fn size(&self) -> u64 {
        self.data.iter().map(|data| data.size).sum()
    }
}

/// A deletion marker.
///
/// A path ending in `/` deletes everything below it; any other path deletes
/// that exact file, either every tag or only `tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct Tombstone {
    pub path: String,
    pub tag: Option<String>,
}

impl Tombstone {
    pub fn is_prefix(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Whether this tombstone deletes the `(path, tag)` file.
    pub fn covers(&self, path: &str, tag: &str) -> bool {
        if self.is_prefix() {
            return path.starts_with(&self.path);
        }

        self.path == path && self.tag.as_deref().is_none_or(|own| own == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Tombstone(Tombstone),
    File(FileEntry),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::Tombstone(tombstone) => &tombstone.path,
            Entry::File(file) => &file.path,
        }
    }

    /// Index order: by path, then untagged tombstones, tagged tombstones and
    /// files, then by tag.
    pub fn sort_key(&self) -> (&str, u8, &str) {
        match self {
            Entry::Tombstone(Tombstone { path, tag: None }) => (path, 0, ""),
            Entry::Tombstone(Tombstone {
                path,
                tag: Some(tag),
            }) => (path, 1, tag),
            Entry::File(file) => (&file.path, 2, &file.tag),
        }
    }

    /// Compare by [`Entry::sort_key`] only; entries equal in index order may
    /// still carry different data.
    pub fn index_order(a: &Entry, b: &Entry) -> Ordering {
        a.sort_key().cmp(&b.sort_key())
    }
}


/// Pointer from an upper index level to one child chunk.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct Range {
    /// Byte offset of the child chunk within its level
    pub offset: u64,
    /// Last path stored in the child chunk (and all of its descendants)
    pub last_path: String,
    pub chunk: ChunkId,
}

/// Entry point of a stored index.
///
/// `height` is 0 when the root chunk holds entries directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct IndexRoot {
    pub chunk: ChunkId,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexChunk {
    Entries(Vec<Entry>),
    Ranges(Vec<Range>),
}

impl IndexChunk {
    pub fn len(&self) -> usize {
        match self {
            IndexChunk::Entries(entries) => entries.len(),
            IndexChunk::Ranges(ranges) => ranges.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_string(buffer: &mut Vec<u8>, value: &str) -> anyhow::Result<()> {
    if value.len() > MAX_PATH_SIZE {
        anyhow::bail!("index string of {} bytes is too long", value.len());
    }
    buffer.write_u16::<NetworkEndian>(value.len() as u16)?;
    buffer.write_all(value.as_bytes())?;

    Ok(())
}

fn read_string(reader: &mut impl BufRead) -> anyhow::Result<String> {
    let len = reader.read_u16::<NetworkEndian>()? as usize;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw)?;

    String::from_utf8(raw).context("index string is not valid UTF-8")
}

/// Append the encoding of `entry` to `buffer`.
pub(crate) fn encode_entry(buffer: &mut Vec<u8>, entry: &Entry) -> anyhow::Result<()> {
    match entry {
        Entry::File(file) => {
            buffer.write_u8(RECORD_FILE)?;
            write_string(buffer, &file.path)?;
            write_string(buffer, &file.tag)?;
            buffer.write_u32::<NetworkEndian>(file.data.len() as u32)?;
            for data in &file.data {
                data.chunk.write_h40_to(buffer)?;
                buffer.write_u64::<NetworkEndian>(data.offset)?;
                buffer.write_u64::<NetworkEndian>(data.size)?;
            }
        }
        Entry::Tombstone(Tombstone { path, tag: None }) => {
            buffer.write_u8(RECORD_TOMBSTONE)?;
            write_string(buffer, path)?;
        }
        Entry::Tombstone(Tombstone {
            path,
            tag: Some(tag),
        }) => {
            buffer.write_u8(RECORD_TAGGED_TOMBSTONE)?;
            write_string(buffer, path)?;
            write_string(buffer, tag)?;
        }
    }

    Ok(())
}

pub(crate) fn encode_range(buffer: &mut Vec<u8>, range: &Range) -> anyhow::Result<()> {
    buffer.write_u8(RECORD_RANGE)?;
    write_string(buffer, &range.last_path)?;
    buffer.write_u64::<NetworkEndian>(range.offset)?;
    range.chunk.write_h40_to(buffer)?;

    Ok(())
}

/// Frame already-encoded records as a chunk.
pub(crate) fn frame_chunk(kind_is_ranges: bool, count: u32, records: &[u8]) -> Bytes {
    let mut chunk = Vec::with_capacity(records.len() + 5);
    chunk.push(if kind_is_ranges {
        CHUNK_RANGES
    } else {
        CHUNK_ENTRIES
    });
    chunk.extend_from_slice(&count.to_be_bytes());
    chunk.extend_from_slice(records);

    chunk.into()
}

fn decode_entry(kind: u8, reader: &mut impl BufRead) -> anyhow::Result<Entry> {
    let path = read_string(reader)?;
    match kind {
        RECORD_FILE => {
            let tag = read_string(reader)?;
            let count = reader.read_u32::<NetworkEndian>()?;
            let mut data = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let chunk = ChunkId::read_h40_from(reader)?;
                let offset = reader.read_u64::<NetworkEndian>()?;
                let size = reader.read_u64::<NetworkEndian>()?;
                data.push(DataRef::new(chunk, offset, size));
            }

            Ok(Entry::File(FileEntry::new(path, tag, data)))
        }
        RECORD_TOMBSTONE => Ok(Entry::Tombstone(Tombstone::new(path, None))),
        RECORD_TAGGED_TOMBSTONE => {
            let tag = read_string(reader)?;
            Ok(Entry::Tombstone(Tombstone::new(path, Some(tag))))
        }
        other => anyhow::bail!("unexpected record kind {other} in an entry chunk"),
    }
}

fn decode_range(kind: u8, reader: &mut impl BufRead) -> anyhow::Result<Range> {
    if kind != RECORD_RANGE {
        anyhow::bail!("unexpected record kind {kind} in a range chunk");
    }
    let last_path = read_string(reader)?;
    let offset = reader.read_u64::<NetworkEndian>()?;
    let chunk = ChunkId::read_h40_from(reader)?;

    Ok(Range::new(offset, last_path, chunk))
}

impl Packable for IndexChunk {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut records = Vec::new();
        match self {
            IndexChunk::Entries(entries) => {
                for entry in entries {
                    encode_entry(&mut records, entry)?;
                }
            }
            IndexChunk::Ranges(ranges) => {
                for range in ranges {
                    encode_range(&mut records, range)?;
                }
            }
        }

        Ok(frame_chunk(
            matches!(self, IndexChunk::Ranges(_)),
            self.len() as u32,
            &records,
        ))
    }
}

impl Unpackable for IndexChunk {
    fn deserialize(mut reader: impl BufRead) -> anyhow::Result<Self> {
        let chunk_kind = reader.read_u8().context("index chunk is empty")?;
        let count = reader
            .read_u32::<NetworkEndian>()
            .context("index chunk header is truncated")?;

        match chunk_kind {
            CHUNK_ENTRIES => {
                let mut entries = Vec::with_capacity(count as usize);
                for position in 0..count {
                    let kind = reader.read_u8()?;
                    let entry = decode_entry(kind, &mut reader)
                        .with_context(|| format!("corrupt index entry #{position}"))?;
                    entries.push(entry);
                }
                Ok(IndexChunk::Entries(entries))
            }
            CHUNK_RANGES => {
                let mut ranges = Vec::with_capacity(count as usize);
                for position in 0..count {
                    let kind = reader.read_u8()?;
                    let range = decode_range(kind, &mut reader)
                        .with_context(|| format!("corrupt index range #{position}"))?;
                    ranges.push(range);
                }
                Ok(IndexChunk::Ranges(ranges))
            }
            other => anyhow::bail!("unknown index chunk kind {other}"),
        }
    }
}
