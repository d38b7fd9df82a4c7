//! Compaction planning
//!
//! Layers are compacted log-structured style: every write adds a level-0
//! layer, and whenever `fan_in` adjacent layers share a level they are
//! merged into a single layer one level up. A commit with `n` writes thus
//! keeps at most `(fan_in - 1)` layers per level, `O(fan_in * log n)` in
//! total, which bounds the fan-in of every read.

use std::ops::Range;

/// The oldest run of `fan_in` adjacent layers sharing a level, if any.
pub fn plan(levels: &[u32], fan_in: usize) -> Option<Range<usize>> {
    let fan_in = fan_in.max(2);
    let mut start = 0;

    for position in 1..=levels.len() {
        let run_ends = position == levels.len() || levels[position] != levels[start];
        if position - start >= fan_in {
            return Some(start..start + fan_in);
        }
        if run_ends {
            start = position;
        }
    }

    None
}

/// Partition `len` layers into consecutive groups of at most `fan_in`.
pub fn groups(len: usize, fan_in: usize) -> Vec<Range<usize>> {
    let fan_in = fan_in.max(2);
    (0..len)
        .step_by(fan_in)
        .map(|start| start..(start + fan_in).min(len))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn nothing_to_do_below_the_fan_in() {
        assert_eq!(plan(&[], 3), None);
        assert_eq!(plan(&[0, 0], 3), None);
        assert_eq!(plan(&[1, 0, 0], 3), None);
    }

    #[test]
    fn full_runs_are_compacted_oldest_first() {
        assert_eq!(plan(&[0, 0, 0], 3), Some(0..3));
        assert_eq!(plan(&[2, 1, 1, 1, 0, 0, 0], 3), Some(1..4));
        assert_eq!(plan(&[1, 0, 0, 0, 0], 3), Some(1..4));
    }

    #[test]
    fn groups_cover_every_layer_once() {
        assert_eq!(groups(7, 3), vec![0..3, 3..6, 6..7]);
        assert!(groups(0, 3).is_empty());
    }

    proptest! {
        #[test]
        fn repeated_compaction_bounds_layers_per_level(writes in 1usize..400, fan_in in 2usize..6) {
            let mut levels: Vec<u32> = Vec::new();
            for _ in 0..writes {
                levels.push(0);
                while let Some(run) = plan(&levels, fan_in) {
                    let level = levels[run.start] + 1;
                    levels.splice(run, [level]);
                }
            }

            for level in levels.iter().copied() {
                let count = levels.iter().filter(|other| **other == level).count();
                prop_assert!(count < fan_in);
            }
        }
    }
}
