use std::time::Duration;

use log::{info, warn};

use crate::errors::HprofScopeError;
use crate::errors::HprofScopeError::Cancelled;
use crate::progress::{CancelToken, ProgressSink, StallWatchdog};

/// id32 sentinel for "no dominator computed / unreachable".
pub const UNDEF_ID32: u32 = u32::MAX;
/// id32 sentinel for the synthetic root that dominates every GC root.
pub const VIRTUAL_ROOT_ID32: u32 = u32::MAX - 1;

// rpo-space sentinel; rpo index 0 is the virtual root
const UNDEF_RPO: u32 = u32::MAX;

const CHECKPOINT_INTERVAL: u32 = 10_000;
const PREDECESSOR_STALL_THRESHOLD: Duration = Duration::from_secs(30);

/// The reachable object graph as the engine sees it: dense nodes,
/// root set, outbound edges. Implemented over the object store by the heap
/// layer and over plain vectors in tests.
pub trait ReferenceGraph {
    fn node_count(&self) -> u32;
    /// Live root ids, duplicates allowed (deduplicated here).
    fn roots(&self) -> Vec<u32>;
    /// Appends the outbound references of `node` to `out`. Only references
    /// that resolve to a live id32 may be produced.
    fn successors(&self, node: u32, out: &mut Vec<u32>);
    fn shallow_size(&self, node: u32) -> u64;
}

pub struct DominatorParams {
    /// Iterations without a strict decrease in per-iteration change count
    /// before the computation gives up on a cyclic tangle and returns the
    /// current approximation.
    pub stagnation_patience: u32,
}

impl Default for DominatorParams {
    fn default() -> Self {
        DominatorParams {
            stagnation_patience: 20,
        }
    }
}

pub struct DominatorResult {
    /// Immediate dominator per id32: `UNDEF_ID32` for unreachable objects,
    /// `VIRTUAL_ROOT_ID32` for objects dominated only by the synthetic root.
    pub idom: Vec<u32>,
    /// Retained bytes per id32; equals shallow size for unreachable objects
    /// and leaves.
    pub retained: Vec<u64>,
    /// Set when the stagnation guard aborted the iteration; dominators of
    /// the nodes still flip-flopping are the last value seen.
    pub approximate: bool,
    pub iterations: u32,
    pub reachable_count: u32,
}

impl DominatorResult {
    pub fn is_reachable(&self, id32: u32) -> bool {
        self.idom
            .get(id32 as usize)
            .is_some_and(|&d| d != UNDEF_ID32)
    }

    pub fn retained_of(&self, id32: u32) -> Option<u64> {
        self.retained.get(id32 as usize).copied()
    }

    /// Immediate dominator, `None` for unreachable objects and for objects
    /// whose only dominator is the synthetic root.
    pub fn idom_of(&self, id32: u32) -> Option<u32> {
        match self.idom.get(id32 as usize).copied() {
            None | Some(UNDEF_ID32) | Some(VIRTUAL_ROOT_ID32) => None,
            Some(d) => Some(d),
        }
    }
}

/// Cooper–Harvey–Kennedy iterative dominators plus retained sizes.
///
/// A synthetic root at RPO index 0 dominates every GC root; without it,
/// `intersect` has no common ancestor for objects reachable from two roots
/// and the iteration oscillates.
pub fn compute_dominators<G: ReferenceGraph>(
    graph: &G,
    params: &DominatorParams,
    progress: &mut dyn ProgressSink,
    cancel: &dyn CancelToken,
) -> Result<DominatorResult, HprofScopeError> {
    let node_count = graph.node_count();
    let roots = dedup_roots(graph.roots(), node_count);

    // stage 1, 0.0-0.2: reverse post-order from every root
    let (rpo_nodes, rpo_of) = build_reverse_post_order(graph, &roots, progress, cancel)?;
    let rpo_len = rpo_nodes.len() as u32;
    let reachable_count = rpo_len - 1;

    let mut is_root = vec![false; rpo_len as usize];
    for &r in &roots {
        is_root[rpo_of[r as usize] as usize] = true;
    }

    // stage 2, 0.2-0.4: predecessor map in CSR form
    let preds = build_predecessors(graph, &rpo_nodes, &rpo_of, &is_root, progress, cancel)?;

    // stage 3, 0.4-0.7: iterate to fixed point
    let mut idom = vec![UNDEF_RPO; rpo_len as usize];
    idom[0] = 0;
    for &r in &roots {
        idom[rpo_of[r as usize] as usize] = 0;
    }

    let mut iterations = 0u32;
    let mut approximate = false;
    let mut prev_changed = u64::MAX;
    let mut stagnant = 0u32;
    let mut best_fraction = 0.4f64;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        iterations += 1;
        let mut changed = 0u64;
        for i in 1..rpo_len {
            if is_root[i as usize] {
                continue;
            }
            let mut new_idom = UNDEF_RPO;
            for &p in preds.of(i) {
                if idom[p as usize] == UNDEF_RPO {
                    continue;
                }
                new_idom = if new_idom == UNDEF_RPO {
                    p
                } else {
                    intersect(&idom, new_idom, p)
                };
            }
            if new_idom != UNDEF_RPO && idom[i as usize] != new_idom {
                idom[i as usize] = new_idom;
                changed += 1;
            }
        }
        if changed == 0 {
            break;
        }
        if changed >= prev_changed {
            stagnant += 1;
        } else {
            stagnant = 0;
        }
        prev_changed = changed;
        if stagnant >= params.stagnation_patience {
            warn!(
                "dominator iteration stagnated after {iterations} iterations \
                 ({changed} nodes still changing), returning approximation"
            );
            approximate = true;
            break;
        }
        let fraction =
            0.4 + 0.3 * (1.0 - changed as f64 / f64::from(reachable_count.max(1))).clamp(0.0, 1.0);
        best_fraction = best_fraction.max(fraction);
        progress.tick(
            best_fraction,
            &format!("dominator iteration {iterations}, {changed} changed"),
        );
    }
    if !approximate {
        info!("dominators converged in {iterations} iterations");
    }

    // stage 4, 0.7-1.0: retained sizes, leaves first.
    // Reverse RPO visits every node before its dominator, so folding each
    // node's retained bytes into its idom is the O(V) children-list sum.
    let mut retained = Vec::with_capacity(node_count as usize);
    for id32 in 0..node_count {
        retained.push(graph.shallow_size(id32));
    }
    for i in (1..rpo_len).rev() {
        if (rpo_len - i) % CHECKPOINT_INTERVAL == 0 {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            progress.tick(
                0.7 + 0.3 * f64::from(rpo_len - i) / f64::from(rpo_len),
                "retained sizes",
            );
        }
        let d = idom[i as usize];
        if d != UNDEF_RPO && d != 0 {
            let node = rpo_nodes[i as usize];
            let parent = rpo_nodes[d as usize];
            retained[parent as usize] += retained[node as usize];
        }
    }
    progress.tick(1.0, "retained sizes");

    // translate idom back into id32 space
    let mut idom_by_id32 = vec![UNDEF_ID32; node_count as usize];
    for id32 in 0..node_count {
        let r = rpo_of[id32 as usize];
        if r == UNDEF_RPO {
            continue;
        }
        idom_by_id32[id32 as usize] = match idom[r as usize] {
            UNDEF_RPO => UNDEF_ID32,
            0 => VIRTUAL_ROOT_ID32,
            d => rpo_nodes[d as usize],
        };
    }

    Ok(DominatorResult {
        idom: idom_by_id32,
        retained,
        approximate,
        iterations,
        reachable_count,
    })
}

pub(crate) fn dedup_roots(roots: Vec<u32>, node_count: u32) -> Vec<u32> {
    let mut seen = vec![false; node_count as usize];
    let mut out = Vec::with_capacity(roots.len());
    for r in roots {
        if r < node_count && !seen[r as usize] {
            seen[r as usize] = true;
            out.push(r);
        }
    }
    out
}

/// DFS from every root, emitting post-order; the reverse is the iteration
/// order. Index 0 is reserved for the virtual root.
fn build_reverse_post_order<G: ReferenceGraph>(
    graph: &G,
    roots: &[u32],
    progress: &mut dyn ProgressSink,
    cancel: &dyn CancelToken,
) -> Result<(Vec<u32>, Vec<u32>), HprofScopeError> {
    let node_count = graph.node_count();
    let mut visited = vec![false; node_count as usize];
    let mut post = Vec::new();
    let mut visits = 0u32;

    struct Frame {
        node: u32,
        succs: Vec<u32>,
        next: usize,
    }

    for &root in roots {
        if visited[root as usize] {
            continue;
        }
        visited[root as usize] = true;
        let mut succs = Vec::new();
        graph.successors(root, &mut succs);
        let mut stack = vec![Frame {
            node: root,
            succs,
            next: 0,
        }];
        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.succs.len() {
                let s = frame.succs[frame.next];
                frame.next += 1;
                if s < node_count && !visited[s as usize] {
                    visited[s as usize] = true;
                    visits += 1;
                    if visits % CHECKPOINT_INTERVAL == 0 {
                        if cancel.is_cancelled() {
                            return Err(Cancelled);
                        }
                        progress.tick(
                            0.2 * f64::from(post.len() as u32) / f64::from(node_count.max(1)),
                            "reverse post-order",
                        );
                    }
                    let mut succs = Vec::new();
                    graph.successors(s, &mut succs);
                    stack.push(Frame {
                        node: s,
                        succs,
                        next: 0,
                    });
                }
            } else {
                post.push(frame.node);
                stack.pop();
            }
        }
    }

    // rpo_nodes[0] is the virtual root; it has no id32
    let mut rpo_nodes = Vec::with_capacity(post.len() + 1);
    rpo_nodes.push(UNDEF_ID32);
    rpo_nodes.extend(post.iter().rev());
    let mut rpo_of = vec![UNDEF_RPO; node_count as usize];
    for (i, &node) in rpo_nodes.iter().enumerate().skip(1) {
        rpo_of[node as usize] = i as u32;
    }
    progress.tick(0.2, "reverse post-order");
    Ok((rpo_nodes, rpo_of))
}

struct Csr {
    offsets: Vec<u64>,
    edges: Vec<u32>,
}

impl Csr {
    fn of(&self, rpo_index: u32) -> &[u32] {
        let start = self.offsets[rpo_index as usize] as usize;
        let end = self.offsets[rpo_index as usize + 1] as usize;
        &self.edges[start..end]
    }
}

/// Two successor sweeps: count in-degrees, then fill. Every root gets the
/// virtual root as an extra predecessor. Watchdogged at 30s.
fn build_predecessors<G: ReferenceGraph>(
    graph: &G,
    rpo_nodes: &[u32],
    rpo_of: &[u32],
    is_root: &[bool],
    progress: &mut dyn ProgressSink,
    cancel: &dyn CancelToken,
) -> Result<Csr, HprofScopeError> {
    let rpo_len = rpo_nodes.len();
    let mut watchdog = StallWatchdog::new("predecessor scan", PREDECESSOR_STALL_THRESHOLD);
    let mut succs = Vec::new();

    let checkpoint = |i: usize,
                          base: f64,
                          watchdog: &mut StallWatchdog,
                          progress: &mut dyn ProgressSink|
     -> Result<(), HprofScopeError> {
        if i % CHECKPOINT_INTERVAL as usize == 0 {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            watchdog.advanced();
            watchdog.check();
            progress.tick(base + 0.1 * i as f64 / rpo_len as f64, "predecessor map");
        }
        Ok(())
    };

    // first sweep: in-degree per rpo index
    let mut counts = vec![0u64; rpo_len];
    for (i, &node) in rpo_nodes.iter().enumerate().skip(1) {
        checkpoint(i, 0.2, &mut watchdog, progress)?;
        succs.clear();
        graph.successors(node, &mut succs);
        for &s in &succs {
            let target = rpo_of.get(s as usize).copied().unwrap_or(UNDEF_RPO);
            if target != UNDEF_RPO {
                counts[target as usize] += 1;
            }
        }
    }
    for (i, &root_flag) in is_root.iter().enumerate() {
        if root_flag {
            counts[i] += 1;
        }
    }

    let mut offsets = Vec::with_capacity(rpo_len + 1);
    offsets.push(0u64);
    for &c in &counts {
        offsets.push(offsets.last().unwrap() + c);
    }
    let total_edges = *offsets.last().unwrap() as usize;
    let mut edges = vec![0u32; total_edges];
    let mut cursors = offsets.clone();

    // the virtual root precedes every GC root
    for (i, &root_flag) in is_root.iter().enumerate() {
        if root_flag {
            edges[cursors[i] as usize] = 0;
            cursors[i] += 1;
        }
    }

    // second sweep: fill edges
    for (i, &node) in rpo_nodes.iter().enumerate().skip(1) {
        checkpoint(i, 0.3, &mut watchdog, progress)?;
        succs.clear();
        graph.successors(node, &mut succs);
        for &s in &succs {
            let target = rpo_of.get(s as usize).copied().unwrap_or(UNDEF_RPO);
            if target != UNDEF_RPO {
                edges[cursors[target as usize] as usize] = i as u32;
                cursors[target as usize] += 1;
            }
        }
    }
    progress.tick(0.4, "predecessor map");
    Ok(Csr { offsets, edges })
}

/// Walks both fingers up the current dominator tree until they meet. The
/// UNDEF guards cover transient states on cyclic graphs the RPO cannot
/// fully linearize.
fn intersect(idom: &[u32], a: u32, b: u32) -> u32 {
    let mut finger_a = a;
    let mut finger_b = b;
    while finger_a != finger_b {
        while finger_a > finger_b {
            let up = idom[finger_a as usize];
            if up == UNDEF_RPO {
                return finger_b;
            }
            finger_a = up;
        }
        while finger_b > finger_a {
            let up = idom[finger_b as usize];
            if up == UNDEF_RPO {
                return finger_a;
            }
            finger_b = up;
        }
    }
    finger_a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NeverCancel, NoProgress};

    struct VecGraph {
        succs: Vec<Vec<u32>>,
        roots: Vec<u32>,
        shallow: Vec<u64>,
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

        fn shallow_size(&self, node: u32) -> u64 {
            self.shallow[node as usize]
        }
    }

    fn run(graph: &VecGraph) -> DominatorResult {
        compute_dominators(
            graph,
            &DominatorParams::default(),
            &mut NoProgress,
            &NeverCancel,
        )
        .unwrap()
    }

    #[test]
    fn chain_retains_transitively() {
        // r(0) -> a(1) -> b(2)
        let graph = VecGraph {
            succs: vec![vec![1], vec![2], vec![]],
            roots: vec![0],
            shallow: vec![32, 24, 40],
        };
        let result = run(&graph);
        assert_eq!(result.idom[0], VIRTUAL_ROOT_ID32);
        assert_eq!(result.idom[1], 0);
        assert_eq!(result.idom[2], 1);
        assert_eq!(result.retained, vec![96, 64, 40]);
        assert!(!result.approximate);
        assert_eq!(result.reachable_count, 3);
    }

    #[test]
    fn shared_child_is_dominated_by_virtual_root() {
        // r1(0) -> c(2) <- r2(1)
        let graph = VecGraph {
            succs: vec![vec![2], vec![2], vec![]],
            roots: vec![0, 1],
            shallow: vec![8, 8, 16],
        };
        let result = run(&graph);
        assert_eq!(result.idom[2], VIRTUAL_ROOT_ID32);
        assert_eq!(result.retained[0], 8);
        assert_eq!(result.retained[1], 8);
        assert_eq!(result.retained[2], 16);
        assert!(result.idom_of(2).is_none());
    }

    #[test]
    fn cycle_below_one_root_converges() {
        // r(0) -> a(1) -> b(2) -> a(1)
        let graph = VecGraph {
            succs: vec![vec![1], vec![2], vec![1]],
            roots: vec![0],
            shallow: vec![8, 24, 40],
        };
        let result = run(&graph);
        assert_eq!(result.idom[1], 0);
        assert_eq!(result.idom[2], 1);
        assert_eq!(result.retained[0], 72);
        assert!(!result.approximate);
        assert!(result.iterations < 20);
    }

    #[test]
    fn unreachable_island_keeps_shallow_sizes() {
        // r(0); x(1) <-> y(2) unreachable
        let graph = VecGraph {
            succs: vec![vec![], vec![2], vec![1]],
            roots: vec![0],
            shallow: vec![8, 100, 200],
        };
        let result = run(&graph);
        assert_eq!(result.idom[1], UNDEF_ID32);
        assert_eq!(result.idom[2], UNDEF_ID32);
        assert!(!result.is_reachable(1));
        assert_eq!(result.retained[1], 100);
        assert_eq!(result.retained[2], 200);
        assert_eq!(result.reachable_count, 1);
    }

    #[test]
    fn diamond_joins_at_fork() {
        // r(0) -> a(1), r -> b(2), a -> c(3), b -> c(3)
        let graph = VecGraph {
            succs: vec![vec![1, 2], vec![3], vec![3], vec![]],
            roots: vec![0],
            shallow: vec![10, 20, 30, 40],
        };
        let result = run(&graph);
        assert_eq!(result.idom[3], 0, "join point is dominated by the fork");
        assert_eq!(result.retained[1], 20);
        assert_eq!(result.retained[2], 30);
        assert_eq!(result.retained[0], 100);
    }

    #[test]
    fn duplicate_roots_are_deduplicated() {
        let graph = VecGraph {
            succs: vec![vec![1], vec![]],
            roots: vec![0, 0, 0],
            shallow: vec![8, 8],
        };
        let result = run(&graph);
        assert_eq!(result.reachable_count, 2);
        assert_eq!(result.retained[0], 16);
    }

    #[test]
    fn cancellation_surfaces_as_cancelled() {
        let graph = VecGraph {
            succs: vec![vec![1], vec![]],
            roots: vec![0],
            shallow: vec![8, 8],
        };
        let cancel = crate::progress::FnCancel(|| true);
        let result = compute_dominators(
            &graph,
            &DominatorParams::default(),
            &mut NoProgress,
            &cancel,
        );
        assert!(matches!(result, Err(Cancelled)));
    }

    #[test]
    fn idom_chains_terminate_at_the_virtual_root() {
        let graph = VecGraph {
            succs: vec![vec![1, 2], vec![3], vec![3, 4], vec![], vec![1]],
            roots: vec![0],
            shallow: vec![1; 5],
        };
        let result = run(&graph);
        for node in 0..graph.node_count() {
            if !result.is_reachable(node) {
                continue;
            }
            let mut cursor = node;
            let mut steps = 0;
            while result.idom[cursor as usize] != VIRTUAL_ROOT_ID32 {
                cursor = result.idom[cursor as usize];
                steps += 1;
                assert!(steps <= graph.node_count(), "idom chain must be a tree");
            }
        }
    }

    #[test]
    fn dominator_tree_sums_are_consistent() {
        // P5: shallow[r] + sum(retained[children(r)]) == retained[r]
        let graph = VecGraph {
            succs: vec![vec![1, 2], vec![3], vec![3, 4], vec![], vec![]],
            roots: vec![0],
            shallow: vec![1, 2, 4, 8, 16],
        };
        let result = run(&graph);
        for node in 0..graph.node_count() {
            let children_sum: u64 = (0..graph.node_count())
                .filter(|&c| result.idom[c as usize] == node)
                .map(|c| result.retained[c as usize])
                .sum();
            assert_eq!(
                result.retained[node as usize],
                graph.shallow[node as usize] + children_sum
            );
        }
    }
}
