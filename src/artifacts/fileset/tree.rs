use crate::artifacts::fileset::path::{as_dir, child_of, parent_dirs};
use crate::artifacts::index::{DataRef, Entry};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    File,
    Dir,
}

/// A file or synthesized directory of a commit's tree.
///
/// Directory paths end in `/` and report the total size of their
/// descendants. Files report every tag they carry, with `data` holding the
/// content of all tags concatenated in tag order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub file_type: FileType,
    pub size_bytes: u64,
    pub tags: Vec<String>,
    pub data: Vec<DataRef>,
}

impl FileInfo {
    pub fn dir(path: &str, size_bytes: u64) -> Self {
        FileInfo {
            path: as_dir(path),
            file_type: FileType::Dir,
            size_bytes,
            tags: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

/// Fold a merged, tombstone-free entry stream into one info per file.
pub fn files_from_entries(
    entries: impl IntoIterator<Item = anyhow::Result<Entry>>,
) -> anyhow::Result<Vec<FileInfo>> {
    let mut files: Vec<FileInfo> = Vec::new();

    for entry in entries {
        let Entry::File(file) = entry? else {
            continue;
        };
        let size = file.size();
        match files.last_mut() {
            Some(last) if last.path == file.path => {
                last.size_bytes += size;
                last.tags.push(file.tag);
                last.data.extend(file.data);
            }
            _ => files.push(FileInfo {
                path: file.path,
                file_type: FileType::File,
                size_bytes: size,
                tags: vec![file.tag],
                data: file.data,
            }),
        }
    }

    Ok(files)
}

fn dir_sizes(files: &[FileInfo]) -> BTreeMap<String, u64> {
    let mut sizes = BTreeMap::new();
    for file in files {
        for dir in parent_dirs(&file.path) {
            *sizes.entry(dir).or_insert(0) += file.size_bytes;
        }
    }
    sizes
}

/// Files interleaved with their directories, each directory placed right
/// before its first descendant. The root is not included.
pub fn with_dirs(files: &[FileInfo]) -> Vec<FileInfo> {
    let sizes = dir_sizes(files);
    let mut emitted = BTreeSet::new();
    let mut out = Vec::with_capacity(files.len() + sizes.len());

    for file in files {
        for dir in parent_dirs(&file.path) {
            if emitted.insert(dir.clone()) {
                let size = sizes.get(&dir).copied().unwrap_or(0);
                out.push(FileInfo::dir(&dir, size));
            }
        }
        out.push(file.clone());
    }

    out
}

/// Immediate children of `dir`, given every file below it.
pub fn children(files: &[FileInfo], dir: &str) -> Vec<FileInfo> {
    let dir = as_dir(dir);
    let mut out: BTreeMap<String, FileInfo> = BTreeMap::new();

    for file in files {
        let Some(child) = child_of(&dir, &file.path) else {
            continue;
        };
        if child == file.path {
            out.insert(child, file.clone());
        } else {
            out.entry(child.clone())
                .or_insert_with(|| FileInfo::dir(&child, 0))
                .size_bytes += file.size_bytes;
        }
    }

    out.into_values().collect()
}

/// The file at `path`, or the directory at `path` if anything lives below
/// it, given every file starting with `path`.
pub fn inspect(files: &[FileInfo], path: &str) -> Option<FileInfo> {
    if let Some(file) = files.iter().find(|file| file.path == path) {
        return Some(file.clone());
    }

    let dir = as_dir(path);
    let below: Vec<&FileInfo> = files
        .iter()
        .filter(|file| file.path.starts_with(&dir))
        .collect();
    if below.is_empty() && path != "/" {
        return None;
    }

    Some(FileInfo::dir(
        &dir,
        below.iter().map(|file| file.size_bytes).sum(),
    ))
}
