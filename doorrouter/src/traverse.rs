use std::collections::{BTreeSet, VecDeque};

use hashbrown::HashSet;

use crate::graph::{EdgeId, Graph, NodeId, NodeSet};
use crate::reduce::LogicView;

/// Result of one traversal, expanded onto the original graph.
#[derive(Clone, Debug)]
pub struct Reachability {
    pub start: NodeId,
    pub strict: bool,
    pub reached: NodeSet,
    pub used_edges: BTreeSet<EdgeId>,
    pub guaranteed: Vec<Option<NodeSet>>,
    pub full_guaranteed: Vec<Vec<NodeSet>>,
    pub rank: Vec<Option<usize>>,
    /// False when a seek traversal stopped before the fixpoint.
    pub complete: bool,
}

impl Reachability {
    pub fn guaranteed(&self, node: NodeId) -> Option<&NodeSet> {
        self.guaranteed[node].as_ref()
    }

    /// Shortest hop path from the start to `node` over admitted edges.
    pub fn path_to(&self, graph: &Graph, node: NodeId) -> Option<Vec<NodeId>> {
        let rank = self.rank[node]?;
        let mut path = vec![node];
        let mut current = node;
        for r in (0..rank).rev() {
            current = graph.nodes[current]
                .reverse_edges
                .iter()
                .filter(|e| self.used_edges.contains(e))
                .map(|&e| graph.edges[e].source)
                .find(|&s| self.rank[s] == Some(r))?;
            path.push(current);
        }
        path.reverse();
        Some(path)
    }
}

/// Alternative guarantee combinations for one node: a lower cover of the
/// visited sets of every walk reaching it, kept as an antichain of minimal
/// sets. Every walk visits all nodes of at least one alternative.
#[derive(Clone, Debug, Default)]
pub struct GuaranteeReducer {
    pub alternatives: Vec<NodeSet>,
}

impl GuaranteeReducer {
    /// Returns true if the alternatives changed. Past `limit` the family
    /// collapses into its common subset, which still covers every walk.
    pub fn push(&mut self, g: NodeSet, limit: usize) -> bool {
        if self.alternatives.iter().any(|a| a.is_subset(&g)) {
            return false;
        }
        self.alternatives.retain(|a| !g.is_subset(a));
        self.alternatives.push(g);
        if self.alternatives.len() > limit {
            if let Some(common) = common_subset(&self.alternatives) {
                self.alternatives = vec![common];
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }
}

fn common_subset(sets: &[NodeSet]) -> Option<NodeSet> {
    let mut iter = sets.iter();
    let first = iter.next()?.clone();
    Some(iter.fold(first, |acc, a| acc.intersection(a).copied().collect()))
}

// Visited sets of admissible walks, keeping only maximal ones. Used to
// decide which conditional edges a walk can open.
#[derive(Clone, Debug, Default)]
struct WalkSets {
    alternatives: Vec<NodeSet>,
}

impl WalkSets {
    fn push(&mut self, g: NodeSet, limit: usize) -> bool {
        if self.alternatives.iter().any(|a| g.is_subset(a)) {
            return false;
        }
        let dominated = self.alternatives.iter().filter(|a| a.is_subset(&g)).count();
        if self.alternatives.len() - dominated >= limit {
            return false;
        }
        self.alternatives.retain(|a| !a.is_subset(&g));
        self.alternatives.push(g);
        true
    }

    fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }
}

struct Traverser<'a> {
    view: &'a LogicView,
    start: NodeId,
    strict: bool,
    limit: usize,
    lsr: Vec<WalkSets>,
    used: BTreeSet<usize>,
    lazy: bool,
    complex_nodes: HashSet<NodeId>,
}

impl<'a> Traverser<'a> {
    fn new(graph: &Graph, view: &'a LogicView, start: NodeId, strict: bool) -> Self {
        let mut lsr = vec![WalkSets::default(); graph.nodes.len()];
        lsr[start].alternatives.push([start].into_iter().collect());
        Traverser {
            view,
            start,
            strict,
            limit: graph.config.fg_cache_limit,
            lsr,
            used: BTreeSet::new(),
            lazy: graph.config.lazy_complex_nodes,
            complex_nodes: HashSet::new(),
        }
    }

    fn seek_satisfied(&self, seek: &NodeSet) -> bool {
        seek.iter().all(|&n| !self.lsr[self.view.leader[n]].is_empty())
    }

    /// Runs to the fixpoint, or until every seek node is reached.
    fn run(&mut self, seek: Option<&NodeSet>) -> bool {
        if let Some(seek) = seek {
            if self.seek_satisfied(seek) {
                return false;
            }
        }
        let mut modified_vertices: HashSet<NodeId> = HashSet::new();
        modified_vertices.insert(self.start);
        loop {
            while !modified_vertices.is_empty() {
                let mut new_modified_vertices: HashSet<NodeId> = HashSet::new();
                // Process in sorted order to keep the traversal deterministic.
                let mut modified_vec: Vec<NodeId> = modified_vertices.into_iter().collect();
                modified_vec.sort();
                for src in modified_vec {
                    self.expand(src, &mut new_modified_vertices);
                    if let Some(seek) = seek {
                        if self.seek_satisfied(seek) {
                            return false;
                        }
                    }
                }
                modified_vertices = new_modified_vertices;
            }
            if self.lazy && !self.complex_nodes.is_empty() {
                self.lazy = false;
                modified_vertices = std::mem::take(&mut self.complex_nodes);
                continue;
            }
            return true;
        }
    }

    fn expand(&mut self, src: NodeId, modified: &mut HashSet<NodeId>) {
        let view = self.view;
        let common = common_subset(&self.lsr[src].alternatives);
        for &ve in &view.out_edges[src] {
            let edge = &view.edges[ve];
            if self.strict && edge.questionable {
                continue;
            }
            if self.lazy && !edge.condition.is_empty() {
                self.complex_nodes.insert(src);
                continue;
            }
            let covering: Vec<NodeSet> = match &common {
                Some(c) if edge.condition.is_subset(c) => self.lsr[src].alternatives.clone(),
                _ => self.lsr[src]
                    .alternatives
                    .iter()
                    .filter(|a| edge.condition.is_subset(a))
                    .cloned()
                    .collect(),
            };
            if covering.is_empty() {
                continue;
            }
            self.used.insert(ve);
            let dst = edge.destination;
            if dst == self.start {
                continue;
            }
            let mut improved = false;
            for mut g in covering {
                g.insert(dst);
                if self.lsr[dst].push(g, self.limit) {
                    improved = true;
                }
            }
            if improved {
                modified.insert(dst);
            }
        }
    }
}

/// Reachability from `start`, with guarantees, over the given view.
pub fn traverse(
    graph: &Graph,
    view: &LogicView,
    start: NodeId,
    strict: bool,
    seek: Option<&NodeSet>,
) -> Reachability {
    let mut traverser = Traverser::new(graph, view, start, strict);
    let complete = traverser.run(seek);

    let reached_leaders: NodeSet = (0..graph.nodes.len())
        .filter(|&n| !traverser.lsr[n].is_empty())
        .collect();
    let reached = view.remap_nodes(&reached_leaders);
    let used_edges = view.remap_edges(&traverser.used, &reached_leaders);
    let rank = compute_rank(graph, start, &used_edges);
    let guaranteed = compute_guaranteed(graph, start, &reached, &used_edges, &rank);
    let full_guaranteed = compute_full_guaranteed(graph, start, &used_edges);

    Reachability {
        start,
        strict,
        reached,
        used_edges,
        guaranteed,
        full_guaranteed,
        rank,
        complete,
    }
}

fn compute_rank(graph: &Graph, start: NodeId, used_edges: &BTreeSet<EdgeId>) -> Vec<Option<usize>> {
    let mut rank: Vec<Option<usize>> = vec![None; graph.nodes.len()];
    rank[start] = Some(0);
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(start);
    while let Some(u) = queue.pop_front() {
        let r = rank[u].unwrap_or(0);
        for &e in &graph.nodes[u].edges {
            if !used_edges.contains(&e) {
                continue;
            }
            let v = graph.edges[e].destination;
            if rank[v].is_none() {
                rank[v] = Some(r + 1);
                queue.push_back(v);
            }
        }
    }
    rank
}

/// Alternatives built as `M ∪ cond(e) ∪ {d}` for each alternative `M` of the
/// source of an admitted edge `e: s -> d`. Any walk reaching `d` over `e`
/// has visited some `M` and everything `e` requires.
fn compute_full_guaranteed(
    graph: &Graph,
    start: NodeId,
    used_edges: &BTreeSet<EdgeId>,
) -> Vec<Vec<NodeSet>> {
    let limit = graph.config.fg_cache_limit;
    let mut reducers = vec![GuaranteeReducer::default(); graph.nodes.len()];
    reducers[start].alternatives.push([start].into_iter().collect());

    let mut modified_vertices: HashSet<NodeId> = HashSet::new();
    modified_vertices.insert(start);
    while !modified_vertices.is_empty() {
        let mut new_modified_vertices: HashSet<NodeId> = HashSet::new();
        let mut modified_vec: Vec<NodeId> = modified_vertices.into_iter().collect();
        modified_vec.sort();
        for src in modified_vec {
            for &e in &graph.nodes[src].edges {
                if !used_edges.contains(&e) {
                    continue;
                }
                let edge = &graph.edges[e];
                let dst = edge.destination;
                if dst == start {
                    continue;
                }
                let mut changed = false;
                for mut g in reducers[src].alternatives.clone() {
                    if !graph.config.no_logic {
                        g.extend(edge.true_condition.iter().copied());
                    }
                    g.insert(dst);
                    if reducers[dst].push(g, limit) {
                        changed = true;
                    }
                }
                if changed {
                    new_modified_vertices.insert(dst);
                }
            }
        }
        modified_vertices = new_modified_vertices;
    }

    reducers
        .into_iter()
        .map(|r| {
            let mut alternatives = r.alternatives;
            alternatives.sort();
            alternatives
        })
        .collect()
}

/// Greatest fixpoint of `g(d) = {d} ∪ ⋂ (g(s) ∪ cond(e))` over admitted
/// edges `e: s -> d`. Unknown values start at the top and only shrink.
fn compute_guaranteed(
    graph: &Graph,
    start: NodeId,
    reached: &NodeSet,
    used_edges: &BTreeSet<EdgeId>,
    rank: &[Option<usize>],
) -> Vec<Option<NodeSet>> {
    let mut guaranteed: Vec<Option<NodeSet>> = vec![None; graph.nodes.len()];
    guaranteed[start] = Some([start].into_iter().collect());

    let mut order: Vec<NodeId> = reached.iter().copied().filter(|&n| n != start).collect();
    order.sort_by_key(|&n| (rank[n], n));

    let mut changed = true;
    while changed {
        changed = false;
        for &d in &order {
            let mut meet: Option<NodeSet> = None;
            for &e in &graph.nodes[d].reverse_edges {
                if !used_edges.contains(&e) {
                    continue;
                }
                let edge = &graph.edges[e];
                let Some(gs) = &guaranteed[edge.source] else {
                    continue;
                };
                let mut incoming: NodeSet = gs.clone();
                if !graph.config.no_logic {
                    incoming.extend(edge.true_condition.iter().copied());
                }
                meet = Some(match meet {
                    None => incoming,
                    Some(m) => m.intersection(&incoming).copied().collect(),
                });
            }
            let Some(mut new) = meet else {
                continue;
            };
            if let Some(old) = &guaranteed[d] {
                new = new.intersection(old).copied().collect();
            }
            new.insert(d);
            if guaranteed[d].as_ref() != Some(&new) {
                guaranteed[d] = Some(new);
                changed = true;
            }
        }
    }
    guaranteed
}

/// Nodes from which root can be reached again. A node counts only if each
/// of its alternatives can take some covered edge to a confirmed node.
pub fn backward_reachable_to_root(graph: &Graph, root_reach: &Reachability) -> NodeSet {
    let mut confirmed: NodeSet = [graph.root].into_iter().collect();
    let mut changed = true;
    while changed {
        changed = false;
        for n in 0..graph.nodes.len() {
            if confirmed.contains(&n) {
                continue;
            }
            let own: Vec<NodeSet>;
            let alternatives = if root_reach.full_guaranteed[n].is_empty() {
                own = vec![[n].into_iter().collect()];
                &own
            } else {
                &root_reach.full_guaranteed[n]
            };
            let returns = alternatives.iter().all(|alt| {
                graph.nodes[n].edges.iter().any(|&e| {
                    let edge = &graph.edges[e];
                    edge.enabled
                        && confirmed.contains(&edge.destination)
                        && (graph.config.no_logic || edge.true_condition.is_subset(alt))
                })
            });
            if returns {
                confirmed.insert(n);
                changed = true;
            }
        }
    }
    confirmed
}
