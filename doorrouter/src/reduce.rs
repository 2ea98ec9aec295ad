use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{EdgeId, Graph, NodeId, NodeSet};

#[derive(Clone, Debug)]
pub struct ViewEdge {
    pub origins: Vec<EdgeId>,
    pub source: NodeId,
    pub destination: NodeId,
    pub condition: NodeSet,
    pub questionable: bool,
}

/// The graph as seen by the traversal: nodes collapsed into groups, each
/// represented by its lowest-id member. The identity view has one group per
/// node.
#[derive(Clone, Debug)]
pub struct LogicView {
    pub edges: Vec<ViewEdge>,
    pub out_edges: Vec<Vec<usize>>,
    pub leader: Vec<NodeId>,
    pub members: BTreeMap<NodeId, Vec<NodeId>>,
    /// Conditionless edges inside a group, admitted whenever the group is reached.
    pub internal_edges: BTreeMap<NodeId, Vec<EdgeId>>,
}

fn is_free(graph: &Graph, e: EdgeId) -> bool {
    let edge = &graph.edges[e];
    edge.enabled && !edge.questionable && (graph.config.no_logic || edge.true_condition.is_empty())
}

impl LogicView {
    pub fn identity(graph: &Graph, excluded: &BTreeSet<EdgeId>) -> Self {
        let leader: Vec<NodeId> = (0..graph.nodes.len()).collect();
        Self::build(graph, leader, excluded)
    }

    /// Joins nodes linked both ways by free edges, unless either end is
    /// interesting.
    pub fn reduced(graph: &Graph) -> Self {
        let interesting = graph.interesting_nodes();
        let n = graph.nodes.len();
        let mut leader: Vec<Option<NodeId>> = vec![None; n];
        for seed in 0..n {
            if leader[seed].is_some() {
                continue;
            }
            leader[seed] = Some(seed);
            if interesting.contains(&seed) {
                continue;
            }
            // Ascending seeds make the first member the lowest id.
            let mut stack = vec![seed];
            while let Some(u) = stack.pop() {
                for &e in &graph.nodes[u].edges {
                    let v = graph.edges[e].destination;
                    if v == u || leader[v].is_some() || interesting.contains(&v) || !is_free(graph, e)
                    {
                        continue;
                    }
                    let back = graph.find_edges(v, u).any(|r| is_free(graph, r));
                    if back {
                        leader[v] = Some(seed);
                        stack.push(v);
                    }
                }
            }
        }
        let leader = leader
            .into_iter()
            .enumerate()
            .map(|(i, l)| l.unwrap_or(i))
            .collect();
        Self::build(graph, leader, &BTreeSet::new())
    }

    fn build(graph: &Graph, leader: Vec<NodeId>, excluded: &BTreeSet<EdgeId>) -> Self {
        let n = graph.nodes.len();
        let mut members: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (i, &l) in leader.iter().enumerate() {
            members.entry(l).or_default().push(i);
        }

        let mut edges: Vec<ViewEdge> = vec![];
        let mut out_edges: Vec<Vec<usize>> = vec![vec![]; n];
        let mut internal_edges: BTreeMap<NodeId, Vec<EdgeId>> = BTreeMap::new();
        let mut index: BTreeMap<(NodeId, NodeId, NodeSet, bool), usize> = BTreeMap::new();
        for &e in &graph.all_edges {
            let edge = &graph.edges[e];
            if excluded.contains(&e) || !edge.enabled {
                continue;
            }
            let source = leader[edge.source];
            let destination = leader[edge.destination];
            if source == destination && is_free(graph, e) {
                internal_edges.entry(source).or_default().push(e);
                continue;
            }
            let condition: NodeSet = if graph.config.no_logic {
                NodeSet::new()
            } else {
                edge.true_condition.iter().map(|&c| leader[c]).collect()
            };
            let key = (source, destination, condition, edge.questionable);
            match index.get(&key) {
                Some(&idx) => edges[idx].origins.push(e),
                None => {
                    let idx = edges.len();
                    out_edges[source].push(idx);
                    edges.push(ViewEdge {
                        origins: vec![e],
                        source,
                        destination,
                        condition: key.2.clone(),
                        questionable: edge.questionable,
                    });
                    index.insert(key, idx);
                }
            }
        }

        LogicView {
            edges,
            out_edges,
            leader,
            members,
            internal_edges,
        }
    }

    pub fn group_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_singleton(&self, node: NodeId) -> bool {
        self.members.get(&self.leader[node]).map_or(false, |m| m.len() == 1)
    }

    /// Expands leaders into the members of their groups.
    pub fn remap_nodes(&self, leaders: &NodeSet) -> NodeSet {
        let mut out = NodeSet::new();
        for l in leaders {
            match self.members.get(l) {
                Some(m) => out.extend(m.iter().copied()),
                None => {
                    out.insert(*l);
                }
            }
        }
        out
    }

    /// Original edges behind the given view edges, plus the internal edges
    /// of each reached group.
    pub fn remap_edges(&self, view_edges: &BTreeSet<usize>, reached: &NodeSet) -> BTreeSet<EdgeId> {
        let mut out: BTreeSet<EdgeId> = BTreeSet::new();
        for &ve in view_edges {
            out.extend(self.edges[ve].origins.iter().copied());
        }
        for l in reached {
            if let Some(internal) = self.internal_edges.get(l) {
                out.extend(internal.iter().copied());
            }
        }
        out
    }
}
