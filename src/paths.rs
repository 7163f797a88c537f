use std::collections::VecDeque;

use crate::dominator::{ReferenceGraph, UNDEF_ID32, dedup_roots};

/// Shortest reference chain `[root, o1, ..., target]` from any GC root to
/// `target`, found by a breadth-first search seeded with every root.
///
/// Returns an empty list for unreachable targets and a single-element list
/// when the target is itself a GC root. Only scratch structures are
/// allocated, the heap model is never mutated.
pub fn find_path_to_gc_root<G: ReferenceGraph>(graph: &G, target: u32) -> Vec<u32> {
    let node_count = graph.node_count();
    if target >= node_count {
        return Vec::new();
    }
    let roots = dedup_roots(graph.roots(), node_count);
    if roots.contains(&target) {
        return vec![target];
    }

    let mut parent = vec![UNDEF_ID32; node_count as usize];
    let mut visited = vec![false; node_count as usize];
    let mut queue = VecDeque::with_capacity(roots.len());
    for &root in &roots {
        visited[root as usize] = true;
        queue.push_back(root);
    }

    let mut succs = Vec::new();
    while let Some(node) = queue.pop_front() {
        succs.clear();
        graph.successors(node, &mut succs);
        for &s in &succs {
            if s >= node_count || visited[s as usize] {
                continue;
            }
            visited[s as usize] = true;
            parent[s as usize] = node;
            if s == target {
                return reconstruct(&parent, target);
            }
            queue.push_back(s);
        }
    }
    Vec::new()
}

fn reconstruct(parent: &[u32], target: u32) -> Vec<u32> {
    let mut path = vec![target];
    let mut cursor = target;
    while parent[cursor as usize] != UNDEF_ID32 {
        cursor = parent[cursor as usize];
        path.push(cursor);
    }
    path.reverse();
    path
}

/// Every distinct acyclic reference chain of at most `max_depth` nodes from
/// any GC root to `target`, by depth-limited DFS per root.
///
/// Intended for exploration, not default queries: cost grows with the
/// number of distinct chains, and chains reached from several roots through
/// a shared subtree are reported once per root with overlapping suffixes.
pub fn find_all_paths<G: ReferenceGraph>(
    graph: &G,
    target: u32,
    max_depth: usize,
) -> Vec<Vec<u32>> {
    let node_count = graph.node_count();
    let mut results = Vec::new();
    if target >= node_count || max_depth == 0 {
        return results;
    }
    let roots = dedup_roots(graph.roots(), node_count);
    let mut on_path = vec![false; node_count as usize];
    let mut path = Vec::new();
    for root in roots {
        descend(
            graph,
            root,
            target,
            max_depth,
            &mut on_path,
            &mut path,
            &mut results,
        );
    }
    results
}

fn descend<G: ReferenceGraph>(
    graph: &G,
    node: u32,
    target: u32,
    max_depth: usize,
    on_path: &mut [bool],
    path: &mut Vec<u32>,
    results: &mut Vec<Vec<u32>>,
) {
    if node as usize >= on_path.len() || on_path[node as usize] {
        return;
    }
    path.push(node);
    on_path[node as usize] = true;
    if node == target {
        results.push(path.clone());
    } else if path.len() < max_depth {
        let mut succs = Vec::new();
        graph.successors(node, &mut succs);
        for s in succs {
            descend(graph, s, target, max_depth, on_path, path, results);
        }
    }
    on_path[node as usize] = false;
    path.pop();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecGraph {
        succs: Vec<Vec<u32>>,
        roots: Vec<u32>,
    }

    impl ReferenceGraph for VecGraph {
        fn node_count(&self) -> u32 {
            self.succs.len() as u32
        }

        fn roots(&self) -> Vec<u32> {
            self.roots.clone()
        }

        fn successors(&self, node: u32, out: &mut Vec<u32>) {
            out.extend_from_slice(&self.succs[node as usize]);
        }

        fn shallow_size(&self, _node: u32) -> u64 {
            0
        }
    }

    #[test]
    fn shortest_path_is_reconstructed_root_first() {
        // r(0) -> a(1) -> b(2), plus a longer detour r -> c(3) -> a
        let graph = VecGraph {
            succs: vec![vec![1, 3], vec![2], vec![], vec![1]],
            roots: vec![0],
        };
        assert_eq!(find_path_to_gc_root(&graph, 2), vec![0, 1, 2]);
    }

    #[test]
    fn root_target_is_a_single_element_path() {
        let graph = VecGraph {
            succs: vec![vec![1], vec![]],
            roots: vec![0],
        };
        assert_eq!(find_path_to_gc_root(&graph, 0), vec![0]);
    }

    #[test]
    fn unreachable_target_yields_empty_path() {
        let graph = VecGraph {
            succs: vec![vec![], vec![2], vec![1]],
            roots: vec![0],
        };
        assert!(find_path_to_gc_root(&graph, 2).is_empty());
        assert!(find_path_to_gc_root(&graph, 99).is_empty());
    }

    #[test]
    fn bfs_beats_any_other_path_length() {
        // two routes to 4: 0->1->4 and 0->2->3->4
        let graph = VecGraph {
            succs: vec![vec![2, 1], vec![4], vec![3], vec![4], vec![]],
            roots: vec![0],
        };
        let path = find_path_to_gc_root(&graph, 4);
        assert_eq!(path.len(), 3);
        assert_eq!(path, vec![0, 1, 4]);
    }

    #[test]
    fn all_paths_enumerates_distinct_chains_within_depth() {
        let graph = VecGraph {
            succs: vec![vec![2, 1], vec![4], vec![3], vec![4], vec![]],
            roots: vec![0],
        };
        let mut paths = find_all_paths(&graph, 4, 4);
        paths.sort();
        assert_eq!(paths, vec![vec![0, 1, 4], vec![0, 2, 3, 4]]);
        // tighter depth cuts the long chain
        assert_eq!(find_all_paths(&graph, 4, 3), vec![vec![0, 1, 4]]);
    }

    #[test]
    fn all_paths_does_not_loop_on_cycles() {
        // r(0) -> a(1) <-> b(2), target b
        let graph = VecGraph {
            succs: vec![vec![1], vec![2], vec![1]],
            roots: vec![0],
        };
        assert_eq!(find_all_paths(&graph, 2, 8), vec![vec![0, 1, 2]]);
    }
}
