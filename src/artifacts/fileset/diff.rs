use crate::artifacts::fileset::path::parent_dirs;
use crate::artifacts::fileset::tree::{FileInfo, with_dirs};
use std::collections::{BTreeMap, BTreeSet};

/// Result of comparing two trees.
///
/// `new_files` holds what changed as seen in the new tree, `old_files` the
/// same as seen in the old tree. A modified file appears in both; an added
/// one only in `new_files`. Directories above a changed file are included
/// with their size in the respective tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    pub new_files: Vec<FileInfo>,
    pub old_files: Vec<FileInfo>,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.old_files.is_empty()
    }
}

/// Compare two file listings (files only, sorted by path).
pub fn diff(new: &[FileInfo], old: &[FileInfo]) -> FileDiff {
    let old_by_path: BTreeMap<&str, &FileInfo> =
        old.iter().map(|file| (file.path.as_str(), file)).collect();
    let new_by_path: BTreeMap<&str, &FileInfo> =
        new.iter().map(|file| (file.path.as_str(), file)).collect();

    let changed: BTreeSet<&str> = new_by_path
        .iter()
        .filter(|(path, file)| {
            old_by_path
                .get(*path)
                .is_none_or(|previous| previous.data != file.data || previous.tags != file.tags)
        })
        .map(|(path, _)| *path)
        .chain(
            old_by_path
                .keys()
                .filter(|path| !new_by_path.contains_key(*path))
                .copied(),
        )
        .collect();

    FileDiff {
        new_files: changed_view(new, &changed),
        old_files: changed_view(old, &changed),
    }
}

fn changed_view(files: &[FileInfo], changed: &BTreeSet<&str>) -> Vec<FileInfo> {
    let touched: Vec<&FileInfo> = files
        .iter()
        .filter(|file| changed.contains(file.path.as_str()))
        .collect();
    let dirs: BTreeSet<String> = touched
        .iter()
        .flat_map(|file| parent_dirs(&file.path))
        .collect();

    with_dirs(files)
        .into_iter()
        .filter(|info| {
            if info.is_dir() {
                dirs.contains(&info.path)
            } else {
                changed.contains(info.path.as_str())
            }
        })
        .collect()
}
