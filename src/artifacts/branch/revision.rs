use crate::artifacts::branch::names::BranchName;
use crate::artifacts::branch::{ANCESTOR_REGEX, FROM_ROOT_REGEX, PARENT_REGEX};
use crate::artifacts::objects::job_id::JobId;
use crate::errors::{Error, Result};
use regex::Regex;

/// A commit expression, as accepted by `inspect_commit` and friends.
///
/// Supported forms:
/// - a job ID (`6f3c...`) or a branch name (`master`)
/// - `<rev>^` / `<rev>^N`: the parent, or the Nth generation back
/// - `<rev>~` / `<rev>~N`: same as `^`
/// - `<rev>.N`: the Nth commit counted from the root of `<rev>`'s lineage,
///   starting at 1
///
/// Suffixes can be chained (`master^2~1`); they apply left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// A job ID or a branch name, resolved later against the metadata store
    Base(String),
    /// Walk `n` parents back
    Ancestor(Box<Revision>, usize),
    /// The `n`th commit from the root of the lineage
    FromRoot(Box<Revision>, usize),
}

impl Revision {
    pub fn try_parse(revision: &str) -> Result<Revision> {
        if let Some(caps) = Self::compile(PARENT_REGEX)?.captures(revision) {
            let base = Self::try_parse(&caps[1])?;
            let generations = Self::generations(&caps[2], revision)?;

            return Ok(Revision::Ancestor(Box::new(base), generations));
        }

        if let Some(caps) = Self::compile(ANCESTOR_REGEX)?.captures(revision) {
            let base = Self::try_parse(&caps[1])?;
            let generations = Self::generations(&caps[2], revision)?;

            return Ok(Revision::Ancestor(Box::new(base), generations));
        }

        if let Some(caps) = Self::compile(FROM_ROOT_REGEX)?.captures(revision) {
            let base = Self::try_parse(&caps[1])?;
            let position = Self::generations(&caps[2], revision)?;
            if position == 0 {
                return Err(Error::invalid_argument(format!(
                    "commit positions start at 1 in {revision:?}"
                )));
            }

            return Ok(Revision::FromRoot(Box::new(base), position));
        }

        if !JobId::looks_like_id(revision) {
            // validates the branch form and produces the usual error
            BranchName::try_parse(revision)?;
        }

        Ok(Revision::Base(revision.to_string()))
    }

    /// The job ID or branch name at the bottom of the expression.
    pub fn base(&self) -> &str {
        match self {
            Revision::Base(base) => base,
            Revision::Ancestor(inner, _) | Revision::FromRoot(inner, _) => inner.base(),
        }
    }

    fn compile(pattern: &str) -> Result<Regex> {
        Regex::new(pattern)
            .map_err(|err| Error::internal(format!("invalid revision regex {pattern}: {err}")))
    }

    fn generations(digits: &str, revision: &str) -> Result<usize> {
        if digits.is_empty() {
            return Ok(1);
        }

        digits.parse().map_err(|_| {
            Error::invalid_argument(format!("invalid ancestry count in {revision:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn base(name: &str) -> Box<Revision> {
        Box::new(Revision::Base(name.to_string()))
    }

    #[test]
    fn plain_names_and_ids_are_bases() {
        let id = JobId::generate();

        assert_eq!(
            Revision::try_parse("master").unwrap(),
            Revision::Base("master".into())
        );
        assert_eq!(
            Revision::try_parse(id.as_ref()).unwrap(),
            Revision::Base(id.to_string())
        );
    }

    #[rstest]
    #[case("master^", 1)]
    #[case("master^3", 3)]
    #[case("master~", 1)]
    #[case("master~0", 0)]
    #[case("master~12", 12)]
    fn ancestry_suffixes_count_generations(#[case] raw: &str, #[case] generations: usize) {
        assert_eq!(
            Revision::try_parse(raw).unwrap(),
            Revision::Ancestor(base("master"), generations)
        );
    }

    #[test]
    fn suffixes_chain_left_to_right() {
        let parsed = Revision::try_parse("master^2~1").unwrap();

        assert_eq!(
            parsed,
            Revision::Ancestor(Box::new(Revision::Ancestor(base("master"), 2)), 1)
        );
        assert_eq!(parsed.base(), "master");
    }

    #[test]
    fn dot_suffix_counts_from_the_root() {
        assert_eq!(
            Revision::try_parse("master.4").unwrap(),
            Revision::FromRoot(base("master"), 4)
        );
        assert_eq!(
            Revision::try_parse("master.0").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[rstest]
    #[case("")]
    #[case("bad name")]
    #[case("^")]
    #[case("bad:name~2")]
    fn malformed_revisions_are_rejected(#[case] raw: &str) {
        assert_eq!(
            Revision::try_parse(raw).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
