use crate::areas::chunk_store::ChunkStore;
use crate::artifacts::fileset::FileSet;
use crate::artifacts::fileset::path::{as_dir, normalize};
use crate::artifacts::index::{DataRef, Entry, FileEntry, Tombstone};
use crate::errors::Result;
use std::collections::{BTreeMap, BTreeSet};

/// Accumulates one batch of writes into a single layer.
///
/// Operations apply in call order: a delete drops whatever this batch
/// already wrote below the deleted path and leaves a tombstone for the
/// layers underneath, so `put; delete; put` keeps the last put.
#[derive(Debug, Default, Clone)]
pub struct LayerBuilder {
    tombstones: BTreeSet<(String, Option<String>)>,
    files: BTreeMap<(String, String), Vec<DataRef>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        LayerBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty() && self.files.is_empty()
    }

    /// Write `data` to `(path, tag)`, replacing that tag's content unless
    /// `append` is set.
    pub fn put(&mut self, path: &str, tag: &str, data: Vec<DataRef>, append: bool) -> Result<()> {
        let path = normalize(path)?;
        let key = (path, tag.to_string());

        if !append {
            self.tombstones
                .insert((key.0.clone(), Some(key.1.clone())));
            self.files.remove(&key);
        }
        self.files.entry(key).or_default().extend(data);

        Ok(())
    }

    /// Delete a file and the directory of the same name. A path ending in
    /// `/`, or the root, deletes only the directory contents.
    pub fn delete(&mut self, raw: &str) -> Result<()> {
        let path = normalize(raw)?;
        let dir = as_dir(&path);

        if path != "/" && !raw.ends_with('/') {
            self.files.retain(|(file, _), _| *file != path);
            self.tombstones.insert((path, None));
        }
        self.files.retain(|(file, _), _| !file.starts_with(&dir));
        self.tombstones.insert((dir, None));

        Ok(())
    }

    /// Copy already resolved source files below `dst`.
    ///
    /// `sources` pairs each source path's suffix relative to the copied root
    /// (empty for a single file) with its entries. The destination is
    /// cleared first unless `append` is set.
    pub fn copy(
        &mut self,
        dst: &str,
        sources: Vec<(String, Vec<FileEntry>)>,
        append: bool,
    ) -> Result<()> {
        let dst = normalize(dst)?;
        if !append {
            self.delete(&dst)?;
        }

        for (suffix, entries) in sources {
            let target = match suffix.as_str() {
                "" => dst.clone(),
                suffix => normalize(&format!("{dst}/{suffix}"))?,
            };
            for entry in entries {
                self.files
                    .entry((target.clone(), entry.tag))
                    .or_default()
                    .extend(entry.data);
            }
        }

        Ok(())
    }

    /// Entries of this layer in index order.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .tombstones
            .iter()
            .map(|(path, tag)| Entry::Tombstone(Tombstone::new(path.clone(), tag.clone())))
            .chain(self.files.iter().map(|((path, tag), data)| {
                Entry::File(FileEntry::new(path.clone(), tag.clone(), data.clone()))
            }))
            .collect();
        entries.sort_by(Entry::index_order);

        entries
    }

    pub fn write(
        &self,
        store: &dyn ChunkStore,
        index_chunk_size: usize,
        index_fanout: usize,
    ) -> anyhow::Result<FileSet> {
        FileSet::write(
            store,
            self.entries().into_iter().map(Ok),
            index_chunk_size,
            index_fanout,
        )
    }
}
