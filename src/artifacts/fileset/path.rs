//! File path normalization
//!
//! Stored paths are absolute, `/`-separated and never end in `/` (except
//! the root itself). Directory tombstones are the only entries whose path
//! ends in `/`.

use crate::errors::{Error, Result};

/// Normalize a caller-supplied path.
///
/// Leading slashes are added, duplicate slashes and `.` components removed.
/// `..` components and control characters are rejected.
pub fn normalize(raw: &str) -> Result<String> {
    if let Some(c) = raw.chars().find(|c| c.is_control()) {
        return Err(Error::invalid_argument(format!(
            "path {raw:?} contains control character {c:?}"
        )));
    }

    let mut normalized = String::with_capacity(raw.len() + 1);
    for component in raw.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(Error::invalid_argument(format!(
                    "path {raw:?} must not contain \"..\""
                )));
            }
            component => {
                normalized.push('/');
                normalized.push_str(component);
            }
        }
    }

    if normalized.is_empty() {
        normalized.push('/');
    }

    Ok(normalized)
}

/// The directory form of a normalized path: `/a` becomes `/a/`, `/` stays.
pub fn as_dir(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Directories strictly above `path`, outermost first, without the root.
///
/// `/a/b/c` yields `/a/` and `/a/b/`.
pub fn parent_dirs(path: &str) -> Vec<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .char_indices()
        .filter(|(position, c)| *c == '/' && *position > 0)
        .map(|(position, _)| trimmed[..=position].to_string())
        .collect()
}

/// The immediate child of `dir` on the way to `path`, as a file path or a
/// directory path ending in `/`.
///
/// `child_of("/", "/a/b")` is `/a/`; `child_of("/a/", "/a/b")` is `/a/b`.
pub fn child_of(dir: &str, path: &str) -> Option<String> {
    let rest = path.strip_prefix(dir)?;
    if rest.is_empty() {
        return None;
    }

    Some(match rest.find('/') {
        Some(end) => path[..dir.len() + end + 1].to_string(),
        None => path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("file", "/file")]
    #[case("/dir//file", "/dir/file")]
    #[case("./dir/./file/", "/dir/file")]
    #[case("", "/")]
    #[case("///", "/")]
    fn paths_are_normalized(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("/dir/../file")]
    #[case("/bad\nname")]
    #[case("/bell\u{7}")]
    fn unsafe_paths_are_rejected(#[case] raw: &str) {
        assert_eq!(
            normalize(raw).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn parent_dirs_exclude_the_root_and_the_path_itself() {
        assert_eq!(parent_dirs("/a/b/c"), vec!["/a/", "/a/b/"]);
        assert!(parent_dirs("/top").is_empty());
        assert_eq!(parent_dirs("/a/b/"), vec!["/a/"]);
    }

    #[test]
    fn children_are_files_or_directories() {
        assert_eq!(child_of("/", "/a/b").as_deref(), Some("/a/"));
        assert_eq!(child_of("/a/", "/a/b").as_deref(), Some("/a/b"));
        assert_eq!(child_of("/a/", "/b"), None);
        assert_eq!(child_of("/a/", "/a/"), None);
    }
}
