//! Dependency graph resolution.
//!
//! Works on submission indices so ties in the topological order are broken
//! by submission order.

use super::LifecycleError;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// Name and declared dependencies of one submitted service.
pub(crate) struct GraphNode<'a> {
    pub name: &'a str,
    pub dependencies: &'a BTreeSet<String>,
}

/// Compute the activation order.
///
/// Checks run in this order: cycles, then unresolved dependencies. The
/// returned order lists every node after all of its dependencies; among
/// nodes that are ready at the same time, the earliest submitted goes first.
pub(crate) fn resolve(nodes: &[GraphNode<'_>]) -> Result<Vec<usize>, LifecycleError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.name, i))
        .collect();

    if let Some(cycle) = find_cycle(nodes, &index) {
        return Err(LifecycleError::DependencyCycle { cycle });
    }

    for node in nodes {
        if let Some(missing) = node
            .dependencies
            .iter()
            .find(|dep| !index.contains_key(dep.as_str()))
        {
            return Err(LifecycleError::UnresolvedDependency {
                service: node.name.to_string(),
                missing: missing.clone(),
            });
        }
    }

    Ok(topological_order(nodes, &index))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search for a back edge. Returns the names on the cycle, in
/// dependency order starting from the first one reached.
fn find_cycle(nodes: &[GraphNode<'_>], index: &HashMap<&str, usize>) -> Option<Vec<String>> {
    fn visit(
        current: usize,
        nodes: &[GraphNode<'_>],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[current] = Mark::OnStack;
        stack.push(current);

        for dep in nodes[current].dependencies {
            // Unknown names are reported by the unresolved check
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&i| i == next).unwrap_or(0);
                    return Some(
                        stack[start..]
                            .iter()
                            .map(|&i| nodes[i].name.to_string())
                            .collect(),
                    );
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, nodes, index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[current] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack = Vec::new();
    for start in 0..nodes.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, nodes, index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn's algorithm with a min-heap on submission index.
fn topological_order(nodes: &[GraphNode<'_>], index: &HashMap<&str, usize>) -> Vec<usize> {
    let mut remaining: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in node.dependencies {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, &count)| count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(next)) = ready.pop() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    order
}
