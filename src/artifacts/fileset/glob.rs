use crate::artifacts::fileset::path::normalize;
use crate::errors::{Error, Result};
use regex::Regex;

const META_CHARS: &[char] = &['*', '?', '[', '\\'];

/// A compiled glob pattern.
///
/// `*` matches within one path component, `**` across components, `?` one
/// character other than `/`, and `[...]` a character class (`[!...]`
/// negates). `\` escapes the next character.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn compile(pattern: &str) -> Result<Self> {
        let pattern = normalize(pattern)?;
        let regex = Regex::new(&Self::translate(&pattern)?).map_err(|err| {
            Error::invalid_argument(format!("malformed glob pattern {pattern:?}: {err}"))
        })?;

        Ok(Glob { pattern, regex })
    }

    /// Whether `pattern` uses any glob syntax at all.
    pub fn is_glob(pattern: &str) -> bool {
        pattern.contains(META_CHARS)
    }

    pub fn is_match(&self, path: &str) -> bool {
        let path = match path {
            "/" => "/",
            path => path.trim_end_matches('/'),
        };
        self.regex.is_match(path)
    }

    /// The directory every match lives under; scans can start there.
    pub fn literal_dir(&self) -> &str {
        let literal = match self.pattern.find(META_CHARS) {
            Some(end) => &self.pattern[..end],
            None => &self.pattern,
        };
        match literal.rfind('/') {
            Some(end) => &literal[..=end],
            None => "/",
        }
    }

    fn translate(pattern: &str) -> Result<String> {
        let mut regex = String::from("^");
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    regex.push_str(".*");
                }
                '*' => regex.push_str("[^/]*"),
                '?' => regex.push_str("[^/]"),
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "glob pattern {pattern:?} ends with an escape"
                        ))
                    })?;
                    regex.push_str(&regex::escape(&escaped.to_string()));
                }
                '[' => {
                    let mut class = String::from("[");
                    if chars.peek() == Some(&'!') {
                        chars.next();
                        class.push('^');
                    }
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        if c == '[' || c == '\\' {
                            class.push('\\');
                        }
                        class.push(c);
                    }
                    if !closed || class.len() <= 1 || class == "[^" {
                        return Err(Error::invalid_argument(format!(
                            "malformed glob pattern {pattern:?}: unterminated character class"
                        )));
                    }
                    class.push(']');
                    regex.push_str(&class);
                }
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');

        Ok(regex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use rstest::rstest;

    #[rstest]
    #[case("dir1/*", "/dir1/file1.1", true)]
    #[case("dir1/*", "/dir2/file2.1", false)]
    #[case("dir1/*", "/dir1/sub/file", false)]
    #[case("/**", "/dir1/sub/file", true)]
    #[case("/**/file", "/a/b/file", true)]
    #[case("/file?", "/file1", true)]
    #[case("/file?", "/file10", false)]
    #[case("/[ab]*", "/apple", true)]
    #[case("/[!ab]*", "/apple", false)]
    #[case("/a.b", "/axb", false)]
    #[case("/dir", "/dir/", true)]
    fn patterns_match_paths(#[case] pattern: &str, #[case] path: &str, #[case] expected: bool) {
        assert_eq!(Glob::compile(pattern).unwrap().is_match(path), expected);
    }

    #[rstest]
    #[case("/[abc")]
    #[case("/[]")]
    #[case("/[z-a]")]
    #[case("/trailing\\")]
    fn malformed_patterns_are_invalid(#[case] pattern: &str) {
        assert_eq!(
            Glob::compile(pattern).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[rstest]
    #[case("/dir1/*", "/dir1/")]
    #[case("/dir1/sub/file", "/dir1/sub/")]
    #[case("*", "/")]
    #[case("/a/b?/c", "/a/")]
    fn literal_dirs_bound_the_scan(#[case] pattern: &str, #[case] dir: &str) {
        assert_eq!(Glob::compile(pattern).unwrap().literal_dir(), dir);
    }
}
