//! Dependency-graph passes: transposition and topological layering.
//!
//! The paper records, per item, the list of items it was derived from.
//! These helpers turn that per-item view into the reverse graph used by
//! `rm`-style closure computation, and into the layered ordering that
//! drives `rebuild` and `update`.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Transpose `item -> its dependencies` into `item -> its dependents`.
pub fn transpose(deps: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, BTreeSet<String>> {
    let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (item, item_deps) in deps {
        for dep in item_deps {
            graph
                .entry(dep.clone())
                .or_default()
                .insert(item.clone());
        }
    }
    graph
}

/// Layer the items so that each layer depends only on earlier layers.
///
/// The first layer is exactly the items with an empty dependency list.
/// A dependency cycle (or a dependency naming a non-item) never resolves
/// and is reported as an invariant violation.
pub fn layered(deps: &BTreeMap<String, Vec<String>>) -> Result<Vec<BTreeSet<String>>> {
    let mut known: BTreeSet<String> = BTreeSet::new();
    let mut unknown: Vec<(&String, BTreeSet<&String>)> = Vec::new();
    for (item, item_deps) in deps {
        if item_deps.is_empty() {
            known.insert(item.clone());
        } else {
            unknown.push((item, item_deps.iter().collect()));
        }
    }
    let mut layers = vec![known.clone()];
    while !unknown.is_empty() {
        let next: BTreeSet<String> = unknown
            .iter()
            .filter(|(_, d)| d.iter().all(|dep| known.contains(*dep)))
            .map(|(p, _)| (*p).clone())
            .collect();
        if next.is_empty() {
            return Err(Error::Invariant("cyclic dependencies".into()));
        }
        unknown.retain(|(p, _)| !next.contains(*p));
        known.extend(next.iter().cloned());
        layers.push(next);
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    v.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn layers_respect_dependencies() {
        let d = deps(&[
            ("/data/a", &[]),
            ("/data/b", &[]),
            ("/data/c", &["/data/a", "/data/b"]),
            ("/data/d", &["/data/c"]),
        ]);
        let layers = layered(&d).unwrap();
        assert_eq!(layers.len(), 3);
        assert!(layers[0].contains("/data/a") && layers[0].contains("/data/b"));
        assert_eq!(layers[1].iter().collect::<Vec<_>>(), vec!["/data/c"]);
        assert_eq!(layers[2].iter().collect::<Vec<_>>(), vec!["/data/d"]);
    }

    #[test]
    fn cycle_is_detected() {
        let d = deps(&[("/data/a", &["/data/b"]), ("/data/b", &["/data/a"])]);
        assert!(matches!(layered(&d), Err(Error::Invariant(_))));
    }

    #[test]
    fn transpose_reverses_every_edge() {
        let d = deps(&[("/data/c", &["/data/a"]), ("/data/a", &[])]);
        let graph = transpose(&d);
        assert!(graph["/data/a"].contains("/data/c"));
        assert!(!graph.contains_key("/data/c"));
    }
}
