//! Bounded k-way merge of stacked layers
//!
//! Layers are given lowest first. For every `(path, tag)`:
//!
//! - content from a layer survives unless a *higher* layer holds a tombstone
//!   covering it
//! - surviving content from all layers is concatenated, lowest first
//!
//! When tombstones are kept the output is itself a layer equivalent to the
//! whole stack, so merging is associative and compaction can merge any run
//! of adjacent layers. When they are dropped the output is a plain file
//! listing, which is what reads and the final composition of a commit want.

use crate::artifacts::index::{DataRef, Entry, FileEntry, Tombstone};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

pub type EntryStream = Box<dyn Iterator<Item = anyhow::Result<Entry>> + Send>;

struct Head {
    entry: Entry,
    layer: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        Entry::index_order(&self.entry, &other.entry).then(self.layer.cmp(&other.layer))
    }
}

pub struct Merge {
    sources: Vec<EntryStream>,
    heap: BinaryHeap<Reverse<Head>>,
    /// Directory tombstones per layer that may still cover upcoming paths
    active: Vec<Vec<String>>,
    keep_tombstones: bool,
    pending: VecDeque<Entry>,
    primed: bool,
    failed: bool,
}

/// Merge `sources` (lowest layer first).
pub fn merge(sources: Vec<EntryStream>, keep_tombstones: bool) -> Merge {
    let layers = sources.len();
    Merge {
        sources,
        heap: BinaryHeap::with_capacity(layers),
        active: vec![Vec::new(); layers],
        keep_tombstones,
        pending: VecDeque::new(),
        primed: false,
        failed: false,
    }
}

impl Merge {
    fn refill(&mut self, layer: usize) -> anyhow::Result<()> {
        if let Some(entry) = self.sources[layer].next() {
            self.heap.push(Reverse(Head {
                entry: entry?,
                layer,
            }));
        }
        Ok(())
    }

    /// Pull the next path group from the heap and resolve it into `pending`.
    fn next_group(&mut self) -> anyhow::Result<bool> {
        if !self.primed {
            self.primed = true;
            for layer in 0..self.sources.len() {
                self.refill(layer)?;
            }
        }

        let Some(Reverse(first)) = self.heap.pop() else {
            return Ok(false);
        };
        let path = first.entry.path().to_string();
        self.refill(first.layer)?;

        let mut group = vec![first];
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(head)| head.entry.path() == path)
        {
            if let Some(Reverse(head)) = self.heap.pop() {
                self.refill(head.layer)?;
                group.push(head);
            }
        }

        for active in &mut self.active {
            active.retain(|dir| path.starts_with(dir.as_str()));
        }
        self.resolve(&path, group);

        Ok(true)
    }

    fn resolve(&mut self, path: &str, group: Vec<Head>) {
        let mut tombstones: Vec<(usize, Tombstone)> = Vec::new();
        let mut files: Vec<(usize, FileEntry)> = Vec::new();
        for head in group {
            match head.entry {
                Entry::Tombstone(tombstone) => tombstones.push((head.layer, tombstone)),
                Entry::File(file) => files.push((head.layer, file)),
            }
        }

        let mut contents: BTreeMap<String, Vec<DataRef>> = BTreeMap::new();
        for (layer, file) in files {
            let by_dir = self.active[layer + 1..]
                .iter()
                .flatten()
                .any(|dir| path.starts_with(dir.as_str()));
            let by_path = tombstones
                .iter()
                .any(|(above, tombstone)| *above > layer && tombstone.covers(path, &file.tag));
            if by_dir || by_path {
                continue;
            }

            contents.entry(file.tag).or_default().extend(file.data);
        }

        let mut out = Vec::new();
        for (layer, tombstone) in tombstones {
            if tombstone.is_prefix() {
                self.active[layer].push(tombstone.path.clone());
            }
            if self.keep_tombstones {
                out.push(Entry::Tombstone(tombstone));
            }
        }
        for (tag, data) in contents {
            out.push(Entry::File(FileEntry::new(path.to_string(), tag, data)));
        }
        out.sort_by(Entry::index_order);
        out.dedup_by(|a, b| a.sort_key() == b.sort_key());

        self.pending.extend(out);
    }
}

impl Iterator for Merge {
    type Item = anyhow::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.failed {
                return None;
            }

            match self.next_group() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::objects::chunk_id::ChunkId;
    use pretty_assertions::assert_eq;

    fn data(label: &str) -> DataRef {
        DataRef::new(ChunkId::for_content(label.as_bytes()), 0, label.len() as u64)
    }

    fn put(path: &str, label: &str) -> Entry {
        Entry::File(FileEntry::new(path.into(), String::new(), vec![data(label)]))
    }

    fn tagged(path: &str, tag: &str, label: &str) -> Entry {
        Entry::File(FileEntry::new(path.into(), tag.into(), vec![data(label)]))
    }

    fn del(path: &str) -> Entry {
        Entry::Tombstone(Tombstone::new(path.into(), None))
    }

    fn layer(mut entries: Vec<Entry>) -> EntryStream {
        entries.sort_by(Entry::index_order);
        Box::new(entries.into_iter().map(Ok))
    }

    fn resolved(layers: Vec<Vec<Entry>>, keep: bool) -> Vec<Entry> {
        merge(layers.into_iter().map(layer).collect(), keep)
            .collect::<anyhow::Result<_>>()
            .unwrap()
    }

    #[test]
    fn content_from_all_layers_is_appended_in_layer_order() {
        let out = resolved(vec![vec![put("/f", "a")], vec![put("/f", "b")]], false);

        assert_eq!(
            out,
            vec![Entry::File(FileEntry::new(
                "/f".into(),
                String::new(),
                vec![data("a"), data("b")]
            ))]
        );
    }

    #[test]
    fn higher_tombstones_hide_lower_content_only() {
        let out = resolved(
            vec![
                vec![put("/f", "a"), put("/dir/x", "x")],
                vec![del("/"), put("/f", "b")],
            ],
            false,
        );

        assert_eq!(out, vec![put("/f", "b")]);
    }

    #[test]
    fn directory_tombstones_cover_descendants_but_not_siblings() {
        let out = resolved(
            vec![
                vec![put("/dir/a", "a"), put("/dir2", "d"), put("/dir", "f")],
                vec![del("/dir/")],
            ],
            false,
        );

        assert_eq!(out, vec![put("/dir", "f"), put("/dir2", "d")]);
    }

    #[test]
    fn tagged_tombstones_only_remove_their_tag() {
        let out = resolved(
            vec![
                vec![tagged("/f", "t1", "one"), tagged("/f", "t2", "two")],
                vec![Entry::Tombstone(Tombstone::new(
                    "/f".into(),
                    Some("t1".into()),
                ))],
            ],
            false,
        );

        assert_eq!(out, vec![tagged("/f", "t2", "two")]);
    }

    #[test]
    fn merging_runs_of_layers_is_associative() {
        let l1 = vec![put("/a", "1"), put("/b/c", "2")];
        let l2 = vec![del("/b/"), put("/a", "3")];
        let l3 = vec![del("/a"), put("/b/d", "4")];

        let flat = resolved(vec![l1.clone(), l2.clone(), l3.clone()], false);
        let lower_first = resolved(vec![resolved(vec![l1.clone(), l2.clone()], true), l3.clone()], false);
        let upper_first = resolved(vec![l1, resolved(vec![l2, l3], true)], false);

        assert_eq!(flat, vec![put("/b/d", "4")]);
        assert_eq!(lower_first, flat);
        assert_eq!(upper_first, flat);
    }

    #[test]
    fn source_errors_end_the_stream() {
        let broken: EntryStream = Box::new(std::iter::once(Err(anyhow::anyhow!("boom"))));
        let mut merged = merge(vec![layer(vec![put("/a", "a")]), broken], false);

        assert!(merged.next().unwrap().is_err());
        assert!(merged.next().is_none());
    }
}
