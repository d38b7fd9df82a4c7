//! Fileset storage
//!
//! Tracks the layers written to every open commit and turns them into a
//! single fileset when the commit is finished.
//!
//! - every write batch becomes one level-0 layer
//! - after each append a background compaction merges runs of
//!   `compaction_max_fan_in` same-level layers into one layer a level up
//! - finishing seals the commit, merges its layers onto the parent's tree
//!   and drops the tombstones
//!
//! Readers see the same content whether or not a compaction already ran.
//! Compaction only replaces a run of layers if that run is still in place
//! when the merged layer is ready.
//!
//! Garbage collection takes the collector lock exclusively; every path that
//! writes chunks holds it shared until the chunks are reachable from a
//! layer or a finished fileset.

use crate::areas::chunk_store::ChunkStore;
use crate::artifacts::fileset::compaction::{groups, plan};
use crate::artifacts::fileset::layer::LayerBuilder;
use crate::artifacts::fileset::merge::merge;
use crate::artifacts::fileset::{FileSet, Layer};
use crate::artifacts::index::Entry;
use crate::artifacts::metadata::keys::CommitKey;
use crate::config::Config;
use crate::errors::{Error, ErrorKind, Result};
use anyhow::Context;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

/// What storage holds for one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitFiles {
    Open {
        /// Oldest first
        layers: Vec<Layer>,
        sealed: bool,
        compacting: bool,
    },
    Finished(FileSet),
}

impl CommitFiles {
    fn open() -> Self {
        CommitFiles::Open {
            layers: Vec::new(),
            sealed: false,
            compacting: false,
        }
    }
}

#[derive(Debug)]
pub struct FileSetStorage {
    store: Arc<dyn ChunkStore>,
    config: Config,
    commits: Mutex<HashMap<CommitKey, CommitFiles>>,
    collector: RwLock<()>,
}

fn not_writable(commit: &CommitKey) -> Error {
    Error::failed_precondition(format!("commit {commit} is finished or being finished"))
}

impl FileSetStorage {
    pub fn new(store: Arc<dyn ChunkStore>, config: Config) -> Self {
        FileSetStorage {
            store,
            config,
            commits: Mutex::new(HashMap::new()),
            collector: RwLock::new(()),
        }
    }

    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.store.clone()
    }

    fn commits(&self) -> anyhow::Result<MutexGuard<'_, HashMap<CommitKey, CommitFiles>>> {
        self.commits
            .lock()
            .map_err(|_| anyhow::anyhow!("fileset storage lock poisoned"))
    }

    fn writing(&self) -> anyhow::Result<RwLockReadGuard<'_, ()>> {
        self.collector
            .read()
            .map_err(|_| anyhow::anyhow!("garbage collector lock poisoned"))
    }

    /// Snapshot of what storage holds for `commit`.
    pub fn files(&self, commit: &CommitKey) -> Result<Option<CommitFiles>> {
        Ok(self.commits()?.get(commit).cloned())
    }

    /// Build one layer with `build` and stack it on `commit`.
    ///
    /// Fails with a precondition error once the commit is sealed. Storage
    /// starts tracking a commit on its first layer, and only if `is_open`
    /// still confirms the commit; a forgotten commit is never brought back.
    /// Chunks written by a failed call are left for the garbage collector.
    pub fn append(
        self: &Arc<Self>,
        commit: &CommitKey,
        is_open: impl FnOnce() -> Result<bool>,
        build: impl FnOnce(&dyn ChunkStore) -> Result<LayerBuilder>,
    ) -> Result<()> {
        {
            let _writing = self.writing()?;
            if !self.is_writable(commit)? {
                return Err(not_writable(commit));
            }

            let builder = build(self.store.as_ref())?;
            if builder.is_empty() {
                return Ok(());
            }
            let fileset = builder
                .write(
                    self.store.as_ref(),
                    self.config.index_chunk_size,
                    self.config.index_fanout,
                )
                .with_context(|| format!("Unable to write a layer for commit {commit}"))?;

            let mut commits = self.commits()?;
            if !commits.contains_key(commit) {
                if !is_open()? {
                    return Err(Error::not_found(format!("open commit {commit}")));
                }
                commits.insert(commit.clone(), CommitFiles::open());
            }
            match commits.get_mut(commit) {
                Some(CommitFiles::Open {
                    layers,
                    sealed: false,
                    ..
                }) => {
                    layers.push(Layer::fresh(fileset));
                    debug!(%commit, layers = layers.len(), "appended layer");
                }
                _ => return Err(not_writable(commit)),
            }
        }

        self.schedule_compaction(commit);
        Ok(())
    }

    fn is_writable(&self, commit: &CommitKey) -> Result<bool> {
        Ok(match self.commits()?.get(commit) {
            None => true,
            Some(CommitFiles::Open { sealed, .. }) => !sealed,
            Some(CommitFiles::Finished(_)) => false,
        })
    }

    /// Seal `commit`, merge its layers onto `base` and hand the result to
    /// `record`.
    ///
    /// The commit is unsealed again if merging or `record` fails, so the
    /// caller may retry. On success storage remembers the finished fileset.
    pub fn finish(
        &self,
        commit: &CommitKey,
        base: &FileSet,
        record: impl FnOnce(&FileSet, u64) -> Result<()>,
    ) -> Result<FileSet> {
        let _writing = self.writing()?;
        let layers = self.seal(commit)?;

        let recorded = self
            .compose(base, &layers)
            .map_err(Error::from)
            .and_then(|(fileset, size)| record(&fileset, size).map(|()| fileset));
        match recorded {
            Ok(fileset) => {
                self.commits()?
                    .insert(commit.clone(), CommitFiles::Finished(fileset.clone()));
                debug!(%commit, layers = layers.len(), "finished fileset");
                Ok(fileset)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget([commit])?;
                Err(err)
            }
            Err(err) => {
                self.unseal(commit)?;
                Err(err)
            }
        }
    }

    fn seal(&self, commit: &CommitKey) -> Result<Vec<Layer>> {
        let mut commits = self.commits()?;
        match commits.entry(commit.clone()).or_insert_with(CommitFiles::open) {
            CommitFiles::Open { layers, sealed, .. } if !*sealed => {
                *sealed = true;
                Ok(layers.clone())
            }
            _ => Err(not_writable(commit)),
        }
    }

    fn unseal(&self, commit: &CommitKey) -> Result<()> {
        if let Some(CommitFiles::Open { sealed, .. }) = self.commits()?.get_mut(commit) {
            *sealed = false;
        }
        Ok(())
    }

    /// Drop every layer written to the open `commit`.
    pub fn clear(&self, commit: &CommitKey) -> Result<()> {
        match self.commits()?.get_mut(commit) {
            None => Ok(()),
            Some(CommitFiles::Open {
                layers,
                sealed: false,
                ..
            }) => {
                debug!(%commit, layers = layers.len(), "cleared layers");
                layers.clear();
                Ok(())
            }
            Some(_) => Err(not_writable(commit)),
        }
    }

    /// Record a fileset finished elsewhere, e.g. shared by an alias commit.
    pub fn adopt(&self, commit: &CommitKey, fileset: FileSet) -> Result<()> {
        self.commits()?
            .insert(commit.clone(), CommitFiles::Finished(fileset));
        Ok(())
    }

    /// Drop everything storage holds for `commits`. Their chunks become
    /// garbage unless something else references them.
    pub fn forget<'a>(&self, commits: impl IntoIterator<Item = &'a CommitKey>) -> Result<()> {
        let mut held = self.commits()?;
        for commit in commits {
            held.remove(commit);
        }
        Ok(())
    }

    /// Merge `filesets` (lowest first) into one. Returns the new fileset and
    /// the total size of its files.
    fn merge_filesets(
        &self,
        filesets: &[FileSet],
        keep_tombstones: bool,
    ) -> anyhow::Result<(FileSet, u64)> {
        let streams = filesets
            .iter()
            .map(|fileset| fileset.stream(self.store.clone(), ""))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut size = 0;
        let fileset = FileSet::write(
            self.store.as_ref(),
            merge(streams, keep_tombstones).inspect(|entry| {
                if let Ok(Entry::File(file)) = entry {
                    size += file.size();
                }
            }),
            self.config.index_chunk_size,
            self.config.index_fanout,
        )?;

        Ok((fileset, size))
    }

    /// Merge `layers` onto `base` into a tombstone-free fileset, at most
    /// `compaction_max_fan_in` filesets at a time.
    pub fn compose(&self, base: &FileSet, layers: &[Layer]) -> anyhow::Result<(FileSet, u64)> {
        let fan_in = self.config.compaction_max_fan_in.max(2);
        let mut pending: Vec<FileSet> = layers.iter().map(|layer| layer.fileset.clone()).collect();

        while pending.len() >= fan_in {
            pending = groups(pending.len(), fan_in)
                .into_iter()
                .map(|group| match group.len() {
                    1 => Ok(pending[group.start].clone()),
                    _ => self
                        .merge_filesets(&pending[group], true)
                        .map(|(fileset, _)| fileset),
                })
                .collect::<anyhow::Result<_>>()?;
        }

        let mut stack = Vec::with_capacity(pending.len() + 1);
        stack.push(base.clone());
        stack.extend(pending);

        self.merge_filesets(&stack, false)
            .context("Unable to compose the finished fileset")
    }

    fn schedule_compaction(self: &Arc<Self>, commit: &CommitKey) {
        let claimed = match self.commits() {
            Ok(mut commits) => match commits.get_mut(commit) {
                Some(CommitFiles::Open {
                    layers,
                    sealed: false,
                    compacting,
                }) if !*compacting => {
                    let levels: Vec<u32> = layers.iter().map(|layer| layer.level).collect();
                    let due = plan(&levels, self.config.compaction_max_fan_in).is_some();
                    *compacting = due;
                    due
                }
                _ => false,
            },
            Err(_) => false,
        };
        if !claimed {
            return;
        }

        let storage = self.clone();
        let commit = commit.clone();
        let job = move || storage.compact(&commit);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    /// Compact `commit` until no run is due, retrying failed steps.
    fn compact(&self, commit: &CommitKey) {
        let mut failures = 0;

        loop {
            match self.compact_step(commit) {
                Ok(true) => failures = 0,
                Ok(false) => break,
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.compaction_retry_attempts.max(1) {
                        warn!(%commit, failures, error = %format!("{err:#}"), "abandoning compaction");
                        break;
                    }
                    warn!(%commit, failures, error = %format!("{err:#}"), "compaction failed, retrying");
                    std::thread::sleep(self.config.chunk_retry_backoff() * failures as u32);
                }
            }
        }

        if let Ok(mut commits) = self.commits()
            && let Some(CommitFiles::Open { compacting, .. }) = commits.get_mut(commit)
        {
            *compacting = false;
        }
    }

    /// Merge the oldest due run of `commit`. Returns whether a run was
    /// replaced.
    fn compact_step(&self, commit: &CommitKey) -> anyhow::Result<bool> {
        let _writing = self.writing()?;

        let (run, inputs) = {
            let commits = self.commits()?;
            let Some(CommitFiles::Open {
                layers,
                sealed: false,
                ..
            }) = commits.get(commit)
            else {
                return Ok(false);
            };
            let levels: Vec<u32> = layers.iter().map(|layer| layer.level).collect();
            let Some(run) = plan(&levels, self.config.compaction_max_fan_in) else {
                return Ok(false);
            };
            (run.clone(), layers[run].to_vec())
        };

        let filesets: Vec<FileSet> = inputs.iter().map(|layer| layer.fileset.clone()).collect();
        let (merged, _) = self
            .merge_filesets(&filesets, true)
            .with_context(|| format!("Unable to compact layers of commit {commit}"))?;
        let level = inputs[0].level + 1;

        let mut commits = self.commits()?;
        if let Some(CommitFiles::Open {
            layers,
            sealed: false,
            ..
        }) = commits.get_mut(commit)
            && layers.get(run.clone()) == Some(&inputs[..])
        {
            layers.drain(run.clone());
            layers.insert(run.start, Layer { fileset: merged, level });
            debug!(%commit, ?run, level, layers = layers.len(), "compacted layers");
            return Ok(true);
        }

        Ok(false)
    }

    /// Delete every chunk not reachable from a fileset returned by `live`
    /// or held by storage. Returns how many chunks were deleted.
    ///
    /// `live` runs once writers are excluded.
    pub fn garbage_collect(&self, live: impl FnOnce() -> Result<Vec<FileSet>>) -> Result<usize> {
        let _collecting = self
            .collector
            .write()
            .map_err(|_| Error::internal("garbage collector lock poisoned"))?;

        let mut roots = live()?;
        for files in self.commits()?.values() {
            match files {
                CommitFiles::Open { layers, .. } => {
                    roots.extend(layers.iter().map(|layer| layer.fileset.clone()))
                }
                CommitFiles::Finished(fileset) => roots.push(fileset.clone()),
            }
        }

        let mut marked = BTreeSet::new();
        for fileset in roots {
            marked.extend(
                fileset
                    .reader(self.store.clone())
                    .referenced_chunks()
                    .context("Unable to mark live chunks")?,
            );
        }

        let mut swept = 0;
        for id in self.store.list()? {
            if !marked.contains(&id) {
                self.store.delete(&id)?;
                swept += 1;
            }
        }
        info!(marked = marked.len(), swept, "collected garbage chunks");

        Ok(swept)
    }
}
