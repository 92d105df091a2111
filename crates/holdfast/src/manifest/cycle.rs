//! Cycle detection over a named dependency graph.
//!
//! `plan.rs` (grounding for the rest of this workspace's graph handling)
//! uses Kahn's algorithm and only reports *whether* a cycle exists via a
//! leftover-node count. The manifest resolver needs to report *which*
//! nodes form the cycle so an operator can fix the right `depends_on`
//! line, so this is a fresh 3-colour depth-first search with a parent map
//! for path reconstruction, built in the same deterministic-iteration-order
//! idiom (`BTreeMap`/`BTreeSet`) as `plan.rs`.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// The cycle path, e.g. `["a", "b", "c", "a"]` for `a -> b -> c -> a`.
    pub path: Vec<String>,
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.join(" -> "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Find the first cycle reachable from a deterministic traversal of `graph`,
/// if any. `graph` maps a node name to the names it depends on.
pub fn find_cycle(graph: &BTreeMap<String, Vec<String>>) -> Option<Cycle> {
    let mut colour: BTreeMap<&str, Colour> = graph.keys().map(|k| (k.as_str(), Colour::White)).collect();
    let mut parent: BTreeMap<&str, &str> = BTreeMap::new();

    let nodes: BTreeSet<&str> = graph.keys().map(|s| s.as_str()).collect();
    for start in nodes {
        if colour.get(start) != Some(&Colour::White) {
            continue;
        }
        if let Some(cycle) = visit(start, graph, &mut colour, &mut parent) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    graph: &'a BTreeMap<String, Vec<String>>,
    colour: &mut BTreeMap<&'a str, Colour>,
    parent: &mut BTreeMap<&'a str, &'a str>,
) -> Option<Cycle> {
    colour.insert(node, Colour::Grey);

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            let dep = dep.as_str();
            let Some(dep_key) = graph.get_key_value(dep).map(|(k, _)| k.as_str()) else {
                // Dangling reference; reported separately by the lint pass.
                continue;
            };

            match colour.get(dep_key).copied().unwrap_or(Colour::White) {
                Colour::White => {
                    parent.insert(dep_key, node);
                    if let Some(cycle) = visit(dep_key, graph, colour, parent) {
                        return Some(cycle);
                    }
                }
                Colour::Grey => {
                    return Some(reconstruct(node, dep_key, parent));
                }
                Colour::Black => {}
            }
        }
    }

    colour.insert(node, Colour::Black);
    None
}

fn reconstruct<'a>(from: &'a str, back_to: &'a str, parent: &BTreeMap<&'a str, &'a str>) -> Cycle {
    let mut path = vec![from.to_string()];
    let mut current = from;
    while current != back_to {
        match parent.get(current) {
            Some(p) => {
                path.push(p.to_string());
                current = p;
            }
            None => break,
        }
    }
    path.push(back_to.to_string());
    path.reverse();
    Cycle { path }
}
