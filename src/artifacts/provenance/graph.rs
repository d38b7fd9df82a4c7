use crate::artifacts::metadata::keys::BranchKey;
use crate::errors::{Error, Result};
use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet, HashMap};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct VisitState: u8 {
        const NONE = 0b00;
        const ON_PATH = 0b01;
        const DONE = 0b10;
    }
}

/// Branch to direct provenance.
pub type Edges = BTreeMap<BranchKey, BTreeSet<BranchKey>>;

/// Order `nodes` so that every branch comes after the members of `nodes`
/// it depends on.
///
/// `upstream` returns a branch's direct provenance. Edges leaving `nodes`
/// are ignored. A cycle among `nodes` is an invalid argument.
pub fn topo_sort(
    nodes: &BTreeSet<BranchKey>,
    mut upstream: impl FnMut(&BranchKey) -> Result<BTreeSet<BranchKey>>,
) -> Result<Vec<BranchKey>> {
    let mut state: HashMap<BranchKey, VisitState> = HashMap::new();
    let mut order = Vec::with_capacity(nodes.len());

    for start in nodes {
        if state.get(start).copied().unwrap_or(VisitState::NONE) != VisitState::NONE {
            continue;
        }

        // (node, upstream still to visit)
        let mut stack: Vec<(BranchKey, Vec<BranchKey>)> = Vec::new();
        state.insert(start.clone(), VisitState::ON_PATH);
        stack.push((start.clone(), pending(nodes, upstream(start)?)));

        while let Some((node, remaining)) = stack.last_mut() {
            let Some(next) = remaining.pop() else {
                state.insert(node.clone(), VisitState::DONE);
                order.push(node.clone());
                stack.pop();
                continue;
            };

            let seen = state.get(&next).copied().unwrap_or(VisitState::NONE);
            if seen.contains(VisitState::ON_PATH) {
                return Err(Error::invalid_argument(format!(
                    "branch {next} cannot be in the provenance of its own branch"
                )));
            }
            if seen.contains(VisitState::DONE) {
                continue;
            }

            state.insert(next.clone(), VisitState::ON_PATH);
            let next_upstream = pending(nodes, upstream(&next)?);
            stack.push((next, next_upstream));
        }
    }

    Ok(order)
}

fn pending(nodes: &BTreeSet<BranchKey>, upstream: BTreeSet<BranchKey>) -> Vec<BranchKey> {
    upstream
        .into_iter()
        .filter(|branch| nodes.contains(branch))
        .rev()
        .collect()
}

/// `direct ∪ provenance(p) for p in direct`.
pub fn closure(
    direct: &BTreeSet<BranchKey>,
    mut provenance_of: impl FnMut(&BranchKey) -> Result<BTreeSet<BranchKey>>,
) -> Result<BTreeSet<BranchKey>> {
    let mut closure = direct.clone();
    for branch in direct {
        closure.extend(provenance_of(branch)?);
    }

    Ok(closure)
}

/// Provenance of every branch in `edges`, computed from direct edges only.
pub fn full_provenance(edges: &Edges) -> Result<BTreeMap<BranchKey, BTreeSet<BranchKey>>> {
    let nodes: BTreeSet<BranchKey> = edges.keys().cloned().collect();
    let order = topo_sort(&nodes, |branch| {
        Ok(edges.get(branch).cloned().unwrap_or_default())
    })?;

    let mut provenance: BTreeMap<BranchKey, BTreeSet<BranchKey>> = BTreeMap::new();
    for branch in order {
        let direct = edges.get(&branch).cloned().unwrap_or_default();
        let computed = closure(&direct, |upstream| {
            Ok(provenance.get(upstream).cloned().unwrap_or_default())
        })?;
        provenance.insert(branch, computed);
    }

    Ok(provenance)
}

/// Invert a provenance relation into subvenance.
pub fn transpose(
    provenance: &BTreeMap<BranchKey, BTreeSet<BranchKey>>,
) -> BTreeMap<BranchKey, BTreeSet<BranchKey>> {
    let mut subvenance: BTreeMap<BranchKey, BTreeSet<BranchKey>> = provenance
        .keys()
        .map(|branch| (branch.clone(), BTreeSet::new()))
        .collect();
    for (branch, upstream) in provenance {
        for source in upstream {
            subvenance
                .entry(source.clone())
                .or_default()
                .insert(branch.clone());
        }
    }

    subvenance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn branch(repo: &str) -> BranchKey {
        BranchKey::parse(repo, "master").unwrap()
    }

    fn edges(pairs: &[(&str, &[&str])]) -> Edges {
        pairs
            .iter()
            .map(|(node, upstream)| {
                (
                    branch(node),
                    upstream.iter().map(|name| branch(name)).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn diamonds_are_sorted_upstream_first() {
        let graph = edges(&[("d", &["b", "c"]), ("b", &["a"]), ("c", &["a"]), ("a", &[])]);
        let nodes = graph.keys().cloned().collect();

        let order = topo_sort(&nodes, |node| Ok(graph[node].clone())).unwrap();
        let position = |name: &str| order.iter().position(|node| *node == branch(name)).unwrap();

        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[test]
    fn cycles_are_rejected() {
        let graph = edges(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let nodes = graph.keys().cloned().collect();

        let err = topo_sort(&nodes, |node| Ok(graph[node].clone())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("cannot be in the provenance of its own branch"));
    }

    #[test]
    fn provenance_and_subvenance_are_transposes() {
        let graph = edges(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);

        let provenance = full_provenance(&graph).unwrap();
        let subvenance = transpose(&provenance);

        assert_eq!(provenance[&branch("c")], BTreeSet::from([branch("a"), branch("b")]));
        assert_eq!(subvenance[&branch("a")], BTreeSet::from([branch("b"), branch("c")]));
        assert!(subvenance[&branch("c")].is_empty());
    }

    proptest! {
        // edges only point from higher to lower indices, so every generated graph is a DAG
        #[test]
        fn closures_are_acyclic_and_self_consistent(
            raw in proptest::collection::vec(proptest::collection::btree_set(0usize..12, 0..4), 1..12)
        ) {
            let names: Vec<String> = (0..raw.len()).map(|n| format!("r{n}")).collect();
            let graph: Edges = raw
                .iter()
                .enumerate()
                .map(|(node, upstream)| {
                    let direct = upstream
                        .iter()
                        .filter(|up| **up < node)
                        .map(|up| branch(&names[*up]))
                        .collect();
                    (branch(&names[node]), direct)
                })
                .collect();

            let provenance = full_provenance(&graph).unwrap();
            for (node, upstream) in &provenance {
                prop_assert!(!upstream.contains(node));

                let mut expected = graph[node].clone();
                for direct in &graph[node] {
                    expected.extend(provenance[direct].iter().cloned());
                }
                prop_assert_eq!(upstream, &expected);
            }
        }
    }
}
