//! File operations
//!
//! Writes go to an open commit as one layer per call. A write addressed to
//! a branch whose head is finished, or that has no head, opens a commit,
//! writes and finishes it again.
//!
//! Reads see a finished commit's tree, or for an open commit its layers
//! merged onto the nearest finished ancestor.

use crate::areas::pfs::Pfs;
use crate::areas::storage::CommitFiles;
use crate::artifacts::fileset::diff::{FileDiff, diff};
use crate::artifacts::fileset::glob::Glob;
use crate::artifacts::fileset::layer::LayerBuilder;
use crate::artifacts::fileset::merge::{EntryStream, merge};
use crate::artifacts::fileset::path::{as_dir, normalize};
use crate::artifacts::fileset::tree::{self, FileInfo, files_from_entries, with_dirs};
use crate::artifacts::fileset::{FileSet, Layer, read_content, write_content};
use crate::artifacts::index::{Entry, FileEntry};
use crate::artifacts::metadata::keys::{BranchKey, CommitKey, CommitRef};
use crate::commands::commit::resolve;
use crate::errors::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutFileOptions {
    /// Add to the file's content instead of replacing it
    pub append: bool,
    pub tag: String,
}

impl PutFileOptions {
    pub fn append() -> Self {
        PutFileOptions {
            append: true,
            ..Default::default()
        }
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        PutFileOptions {
            tag: tag.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum FileOp {
    Put {
        path: String,
        content: Bytes,
        options: PutFileOptions,
    },
    Delete {
        path: String,
    },
    Copy {
        src: CommitRef,
        src_path: String,
        dst_path: String,
        append: bool,
    },
}

/// Operations applied to a commit as a single layer, in order.
#[derive(Debug, Clone, Default)]
pub struct FileBatch {
    ops: Vec<FileOp>,
}

impl FileBatch {
    pub fn new() -> Self {
        FileBatch::default()
    }

    pub fn put(
        mut self,
        path: impl Into<String>,
        content: impl Into<Bytes>,
        options: PutFileOptions,
    ) -> Self {
        self.ops.push(FileOp::Put {
            path: path.into(),
            content: content.into(),
            options,
        });
        self
    }

    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.ops.push(FileOp::Delete { path: path.into() });
        self
    }

    pub fn copy(
        mut self,
        src: CommitRef,
        src_path: impl Into<String>,
        dst_path: impl Into<String>,
        append: bool,
    ) -> Self {
        self.ops.push(FileOp::Copy {
            src,
            src_path: src_path.into(),
            dst_path: dst_path.into(),
            append,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A batch operation, with copy sources already read.
enum Resolved {
    Put(String, Bytes, PutFileOptions),
    Delete(String),
    Copy(String, Vec<(String, Vec<FileEntry>)>, bool),
}

/// Files of `entries` at `src` or below it, keyed by their suffix relative
/// to `src`.
fn copy_sources(entries: Vec<Entry>, src: &str) -> Vec<(String, Vec<FileEntry>)> {
    let dir = as_dir(src);
    let mut sources: BTreeMap<String, Vec<FileEntry>> = BTreeMap::new();

    for entry in entries {
        let Entry::File(file) = entry else {
            continue;
        };
        let suffix = if file.path == src {
            String::new()
        } else if let Some(rest) = file.path.strip_prefix(&dir) {
            rest.to_string()
        } else {
            continue;
        };
        sources.entry(suffix).or_default().push(file);
    }

    sources.into_iter().collect()
}

impl Pfs {
    /// Apply `batch` to `commit` as one layer. Returns the commit written.
    pub fn modify_file(&self, commit: &CommitRef, batch: FileBatch) -> Result<CommitKey> {
        let ops = self.resolve_ops(batch)?;

        let Some(branch) = self.needs_auto_commit(commit)? else {
            let target = self.metadata().read(|txn| resolve(txn, commit))?;
            if target.is_finished() {
                return Err(Error::failed_precondition(format!(
                    "commit {} is finished",
                    target.commit
                )));
            }
            self.append_ops(&target.commit, ops)?;
            return Ok(target.commit);
        };

        let key = self.start_commit(&branch, None, "")?.commit;
        let written = self
            .append_ops(&key, ops)
            .and_then(|()| self.finish_key(&key, None).map(|_| ()));
        if let Err(err) = written {
            warn!(commit = %key, %err, "write failed, dropping its commit");
            if let Err(squash_err) = self.squash_job(&key.id.to_string()) {
                warn!(commit = %key, err = %squash_err, "unable to drop failed commit");
            }
            return Err(err);
        }

        self.finish_ready_commits()?;
        Ok(key)
    }

    /// The branch to open a commit on, when `commit` names a branch head
    /// that is finished or missing.
    fn needs_auto_commit(&self, commit: &CommitRef) -> Result<Option<BranchKey>> {
        if !commit.id.is_empty() {
            return Ok(None);
        }
        let Some(branch) = commit.branch_key() else {
            return Ok(None);
        };

        self.metadata().read(|txn| {
            txn.require_repo(&branch.repo)?;
            let head = txn
                .get_branch(&branch)
                .and_then(|info| info.head)
                .and_then(|head| txn.get_commit(&head));
            Ok(head
                .is_none_or(|head| head.is_finished())
                .then_some(branch))
        })
    }

    fn resolve_ops(&self, batch: FileBatch) -> Result<Vec<Resolved>> {
        batch
            .ops
            .into_iter()
            .map(|op| {
                Ok(match op {
                    FileOp::Put {
                        path,
                        content,
                        options,
                    } => Resolved::Put(normalize(&path)?, content, options),
                    FileOp::Delete { path } => {
                        normalize(&path)?;
                        Resolved::Delete(path)
                    }
                    FileOp::Copy {
                        src,
                        src_path,
                        dst_path,
                        append,
                    } => {
                        let src_path = normalize(&src_path)?;
                        let entries = self.view(&src, &src_path)?;
                        let sources = copy_sources(entries, &src_path);
                        if sources.is_empty() {
                            return Err(Error::not_found(format!("file {src_path} in {src}")));
                        }
                        Resolved::Copy(normalize(&dst_path)?, sources, append)
                    }
                })
            })
            .collect()
    }

    fn append_ops(&self, commit: &CommitKey, ops: Vec<Resolved>) -> Result<()> {
        let chunk_size = self.config().chunk_size;
        let is_open = || {
            self.metadata()
                .read(|txn| Ok(txn.get_commit(commit).is_some_and(|info| !info.is_finished())))
        };

        self.storage().append(commit, is_open, |store| {
            let mut builder = LayerBuilder::new();
            for op in ops {
                match op {
                    Resolved::Put(path, content, options) => {
                        let data = write_content(store, content, chunk_size)?;
                        builder.put(&path, &options.tag, data, options.append)?;
                    }
                    Resolved::Delete(path) => builder.delete(&path)?,
                    Resolved::Copy(dst, sources, append) => builder.copy(&dst, sources, append)?,
                }
            }
            Ok(builder)
        })?;

        debug!(%commit, "wrote layer");
        Ok(())
    }

    pub fn put_file(
        &self,
        commit: &CommitRef,
        path: &str,
        content: impl Into<Bytes>,
        options: PutFileOptions,
    ) -> Result<CommitKey> {
        self.modify_file(commit, FileBatch::new().put(path, content, options))
    }

    pub fn delete_file(&self, commit: &CommitRef, path: &str) -> Result<CommitKey> {
        self.modify_file(commit, FileBatch::new().delete(path))
    }

    /// Copy `src_path` of `src`, a file or a whole directory, to `dst_path`
    /// of `dst`. Content is shared, not rewritten.
    pub fn copy_file(
        &self,
        src: &CommitRef,
        src_path: &str,
        dst: &CommitRef,
        dst_path: &str,
        append: bool,
    ) -> Result<CommitKey> {
        self.modify_file(dst, FileBatch::new().copy(src.clone(), src_path, dst_path, append))
    }

    /// Merged file entries of `commit` whose path starts with `prefix`.
    fn view(&self, commit: &CommitRef, prefix: &str) -> Result<Vec<Entry>> {
        let lineage = self.metadata().read(|txn| {
            let mut lineage = vec![resolve(txn, commit)?];
            while let Some(current) = lineage.last().filter(|current| !current.is_finished()) {
                let Some(parent) = current.parent.clone() else {
                    break;
                };
                lineage.push(txn.require_commit(&parent)?);
            }
            Ok(lineage)
        })?;

        let mut base = FileSet::empty();
        let mut stacked: Vec<Vec<Layer>> = Vec::new();
        for ancestor in &lineage {
            match self.storage().files(&ancestor.commit)? {
                Some(CommitFiles::Finished(fileset)) => {
                    base = fileset;
                    break;
                }
                _ if ancestor.is_finished() => {
                    base = ancestor.fileset.clone().unwrap_or_default();
                    break;
                }
                Some(CommitFiles::Open { layers, .. }) => stacked.push(layers),
                None => {}
            }
        }

        let store = self.storage().store();
        let mut sources: Vec<EntryStream> = vec![base.stream(store.clone(), prefix)?];
        for layer in stacked.iter().rev().flatten() {
            sources.push(layer.fileset.stream(store.clone(), prefix)?);
        }
        Ok(merge(sources, false).collect::<anyhow::Result<Vec<_>>>()?)
    }

    /// Files of `commit` at `path` or below it.
    fn files_below(&self, commit: &CommitRef, path: &str) -> Result<Vec<FileInfo>> {
        let entries = self.view(commit, path)?;
        let dir = as_dir(path);

        Ok(files_from_entries(entries.into_iter().map(Ok))?
            .into_iter()
            .filter(|file| file.path == path || file.path.starts_with(&dir))
            .collect())
    }

    /// Files of `commit` matching `glob`.
    fn matching(&self, commit: &CommitRef, glob: &Glob) -> Result<Vec<FileInfo>> {
        let entries = self.view(commit, glob.literal_dir())?;
        let files = files_from_entries(entries.into_iter().map(Ok))?;

        Ok(files
            .into_iter()
            .filter(|file| glob.is_match(&file.path))
            .collect())
    }

    /// Content of the file at `path`, or of every file matching the glob
    /// `path`, concatenated in path order.
    pub fn get_file(&self, commit: &CommitRef, path: &str) -> Result<Bytes> {
        let files = if Glob::is_glob(path) {
            self.matching(commit, &Glob::compile(path)?)?
        } else {
            let path = normalize(path)?;
            self.files_below(commit, &path)?
                .into_iter()
                .filter(|file| file.path == path)
                .collect()
        };
        if files.is_empty() {
            return Err(Error::not_found(format!("file {path} in {commit}")));
        }

        let store = self.storage().store();
        let mut content = Vec::new();
        for file in files {
            content.extend(read_content(store.as_ref(), &file.data, 0, None)?);
        }

        Ok(Bytes::from(content))
    }

    /// `len` bytes of the file at `path` starting at `offset`, or everything
    /// after `offset` if `len` is `None`.
    pub fn get_file_range(
        &self,
        commit: &CommitRef,
        path: &str,
        offset: u64,
        len: Option<u64>,
    ) -> Result<Bytes> {
        let path = normalize(path)?;
        let file = self
            .files_below(commit, &path)?
            .into_iter()
            .find(|file| file.path == path)
            .ok_or_else(|| Error::not_found(format!("file {path} in {commit}")))?;

        let store = self.storage().store();
        Ok(Bytes::from(read_content(store.as_ref(), &file.data, offset, len)?))
    }

    pub fn inspect_file(&self, commit: &CommitRef, path: &str) -> Result<FileInfo> {
        let path = normalize(path)?;

        tree::inspect(&self.files_below(commit, &path)?, &path)
            .ok_or_else(|| Error::not_found(format!("file {path} in {commit}")))
    }

    /// Immediate children of the directory `path`, or the file itself.
    pub fn list_file(&self, commit: &CommitRef, path: &str) -> Result<Vec<FileInfo>> {
        let path = normalize(path)?;
        let files = self.files_below(commit, &path)?;

        if let Some(file) = files.iter().find(|file| file.path == path) {
            return Ok(vec![file.clone()]);
        }
        if files.is_empty() && path != "/" {
            return Err(Error::not_found(format!("directory {path} in {commit}")));
        }

        Ok(tree::children(&files, &path))
    }

    /// `path` and everything below it, each directory before its contents.
    pub fn walk_file(&self, commit: &CommitRef, path: &str) -> Result<Vec<FileInfo>> {
        let path = normalize(path)?;
        let root = self.inspect_file(commit, &path)?;
        if !root.is_dir() {
            return Ok(vec![root]);
        }

        let files = self.files_below(commit, &path)?;
        let mut walk = vec![root.clone()];
        walk.extend(
            with_dirs(&files)
                .into_iter()
                .filter(|info| info.path != root.path && info.path.starts_with(&root.path)),
        );

        Ok(walk)
    }

    /// Files and directories matching `pattern`, in path order.
    pub fn glob_file(&self, commit: &CommitRef, pattern: &str) -> Result<Vec<FileInfo>> {
        let glob = Glob::compile(pattern)?;
        let entries = self.view(commit, glob.literal_dir())?;
        let files = files_from_entries(entries.into_iter().map(Ok))?;

        Ok(with_dirs(&files)
            .into_iter()
            .filter(|info| glob.is_match(&info.path))
            .collect())
    }

    /// Compare `path` of `new` with `old`, or with `new`'s parent when
    /// `old` is `None`.
    pub fn diff_file(
        &self,
        new: &CommitRef,
        old: Option<&CommitRef>,
        path: &str,
    ) -> Result<FileDiff> {
        let path = normalize(path)?;
        let new_files = self.files_below(new, &path)?;

        let old = match old {
            Some(old) => Some(old.clone()),
            None => self
                .metadata()
                .read(|txn| resolve(txn, new))?
                .parent
                .map(CommitRef::from),
        };
        let old_files = match old {
            Some(old) => self.files_below(&old, &path)?,
            None => Vec::new(),
        };

        Ok(diff(&new_files, &old_files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::index::DataRef;
    use crate::artifacts::objects::chunk_id::ChunkId;
    use pretty_assertions::assert_eq;

    fn file(path: &str) -> Entry {
        Entry::File(FileEntry::new(
            path.into(),
            String::new(),
            vec![DataRef::new(ChunkId::for_content(path.as_bytes()), 0, 1)],
        ))
    }

    #[test]
    fn copy_sources_are_keyed_by_suffix() {
        let entries = vec![file("/src"), file("/src/a"), file("/src/b/c"), file("/srcx")];

        let suffixes: Vec<String> = copy_sources(entries, "/src")
            .into_iter()
            .map(|(suffix, _)| suffix)
            .collect();

        assert_eq!(suffixes, vec!["", "a", "b/c"]);
    }
}
