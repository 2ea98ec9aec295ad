use crate::error::{RouterError, ValidationFailure};
use crate::reduce::LogicView;
use crate::requirement::{Requirement, VerifyContext};
use crate::settings::RouterConfig;
use crate::traverse::{self, Reachability};
use doorrouter_logic::{EdgeKind, IndexedVec, LogicData, RequirementDecl};
use hashbrown::HashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

pub type NodeId = usize;
pub type EdgeId = usize;
pub type NodeSet = BTreeSet<NodeId>;

/// Values derived from the root traversal, refreshed before every commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeState {
    pub rank: Option<usize>,
    pub rooted: bool,
    pub guaranteed: Option<NodeSet>,
    pub full_guaranteed: Vec<NodeSet>,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub label: String,
    pub connectable: bool,
    pub tags: BTreeSet<String>,
    pub edges: BTreeSet<EdgeId>,
    pub reverse_edges: BTreeSet<EdgeId>,
    pub state: NodeState,
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub source: NodeId,
    pub destination: NodeId,
    pub true_condition: NodeSet,
    pub enabled: bool,
    pub questionable: bool,
    pub generated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeLogEntry {
    Add {
        source: String,
        destination: String,
    },
    Remove {
        source: String,
        destination: String,
    },
    Commit {
        generation: usize,
    },
    Rollback {
        generation: usize,
    },
}

// In-progress mutations, undone in reverse order on rollback.
#[derive(Clone, Debug)]
enum Change {
    EdgeAdded(EdgeId),
    EdgeRemoved(EdgeId),
    EdgeEnabled { edge: EdgeId, old: bool },
    Unconnected { node: NodeId, was_present: bool },
    NodeState { node: NodeId, old: NodeState },
}

pub struct Graph {
    pub config: RouterConfig,
    pub labels: IndexedVec<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub all_edges: BTreeSet<EdgeId>,
    pub root: NodeId,
    pub goal: Vec<NodeSet>,
    pub connectable: NodeSet,
    pub unconnected: NodeSet,
    pub requirements: Vec<Requirement>,
    /// Nodes that must all be rooted before the key node may be joined.
    pub dependencies: BTreeMap<NodeId, NodeSet>,
    /// For each required node, the nodes that `Require` it.
    pub requirers: BTreeMap<NodeId, NodeSet>,
    pub changelog: Vec<ChangeLogEntry>,
    pub generation: usize,
    journal: Vec<Change>,
    cache: HashMap<(NodeId, bool), Rc<Reachability>>,
    backward_cache: Option<Rc<NodeSet>>,
    reduced_view: Option<Rc<LogicView>>,
    identity_view: Option<Rc<LogicView>>,
}

fn lookup(labels: &IndexedVec<String>, label: &str) -> Result<NodeId, RouterError> {
    labels
        .index_by_key
        .get(label)
        .copied()
        .ok_or_else(|| RouterError::MissingAccessPoint(label.to_string()))
}

impl Graph {
    pub fn new(data: &LogicData, config: RouterConfig) -> Result<Graph, RouterError> {
        let labels = data.nodes.clone();
        let nodes: Vec<Node> = labels
            .keys
            .iter()
            .zip(data.connectable.iter())
            .map(|(label, &connectable)| Node {
                label: label.clone(),
                connectable,
                tags: BTreeSet::new(),
                edges: BTreeSet::new(),
                reverse_edges: BTreeSet::new(),
                state: NodeState::default(),
            })
            .collect();
        let root = lookup(&labels, data.start.as_deref().unwrap_or("root"))?;

        let mut graph = Graph {
            config,
            labels,
            nodes,
            edges: vec![],
            all_edges: BTreeSet::new(),
            root,
            goal: vec![],
            connectable: NodeSet::new(),
            unconnected: NodeSet::new(),
            requirements: vec![],
            dependencies: BTreeMap::new(),
            requirers: BTreeMap::new(),
            changelog: vec![],
            generation: 0,
            journal: vec![],
            cache: HashMap::new(),
            backward_cache: None,
            reduced_view: None,
            identity_view: None,
        };

        let mut decls: Vec<RequirementDecl> = data.requirements.clone();
        for decl in &data.edges {
            let source = lookup(&graph.labels, &decl.source)?;
            let destination = lookup(&graph.labels, &decl.destination)?;
            for alt in &decl.condition {
                let condition = alt
                    .iter()
                    .map(|x| lookup(&graph.labels, x))
                    .collect::<Result<NodeSet, RouterError>>()?;
                graph.insert_edge(source, destination, condition.clone(), false);
                if matches!(decl.kind, EdgeKind::Symmetric | EdgeKind::ReturnBridge) {
                    graph.insert_edge(destination, source, condition, false);
                }
            }
            let set = [decl.source.clone()].into_iter().collect();
            match decl.kind {
                EdgeKind::ReturnBridge => decls.push(RequirementDecl::Bridge {
                    node: decl.destination.clone(),
                    set,
                }),
                EdgeKind::RequiredOneWay => decls.push(RequirementDecl::Require {
                    node: decl.destination.clone(),
                    set,
                }),
                EdgeKind::OneWay | EdgeKind::Symmetric => {}
            }
        }

        for conj in &data.goal {
            let set = conj
                .iter()
                .map(|x| lookup(&graph.labels, x))
                .collect::<Result<NodeSet, RouterError>>()?;
            graph.goal.push(set);
        }
        if graph.goal.is_empty() {
            // Without a goal, reaching root is enough.
            graph.goal.push([root].into_iter().collect());
        }

        let resolve = |label: &str| lookup(&graph.labels, label);
        let mut requirements: Vec<Requirement> = vec![];
        let mut full_guarantees: BTreeMap<NodeId, usize> = BTreeMap::new();
        for decl in &decls {
            let req = Requirement::from_decl(decl, &resolve, &graph.config)?;
            // Several lines for one node combine into a single requirement.
            if let Requirement::FullGuarantee { node, alternatives } = &req {
                if let Some(&idx) = full_guarantees.get(node) {
                    if let Requirement::FullGuarantee {
                        alternatives: existing,
                        ..
                    } = &mut requirements[idx]
                    {
                        existing.extend(alternatives.iter().cloned());
                    }
                    continue;
                }
                full_guarantees.insert(*node, requirements.len());
            }
            requirements.push(req);
        }
        for req in &requirements {
            graph.register_requirement(req);
        }
        graph.requirements = requirements;

        for n in 0..graph.nodes.len() {
            if !graph.nodes[n].connectable {
                continue;
            }
            graph.connectable.insert(n);
            let linked = graph.neighbors(n).any(|m| graph.nodes[m].connectable);
            if !linked {
                graph.unconnected.insert(n);
            }
        }

        graph.refresh();
        graph.journal.clear();
        info!(
            "Built graph: {} nodes, {} edges, {} requirements, {} unconnected",
            graph.nodes.len(),
            graph.all_edges.len(),
            graph.requirements.len(),
            graph.unconnected.len()
        );
        Ok(graph)
    }

    fn register_requirement(&mut self, req: &Requirement) {
        match req {
            Requirement::Tag { node, tags } => {
                self.nodes[*node].tags.extend(tags.iter().cloned());
            }
            Requirement::Dependency { node, set } => {
                self.dependencies
                    .entry(*node)
                    .or_default()
                    .extend(set.iter().copied());
            }
            Requirement::Require { node, set } => {
                for &m in set {
                    self.requirers.entry(m).or_default().insert(*node);
                }
            }
            Requirement::Orphanless { node } => {
                let incoming: Vec<EdgeId> = self.nodes[*node].reverse_edges.iter().copied().collect();
                for e in incoming {
                    let source = self.edges[e].source;
                    if self.find_edges(*node, source).next().is_some() {
                        self.edges[e].questionable = true;
                    }
                }
            }
            Requirement::ComplexOr { children, .. } | Requirement::ComplexAnd { children, .. } => {
                for child in children {
                    self.register_requirement(child);
                }
            }
            _ => {}
        }
    }

    pub fn label(&self, node: NodeId) -> &str {
        &self.nodes[node].label
    }

    pub fn node_id(&self, label: &str) -> Result<NodeId, RouterError> {
        lookup(&self.labels, label)
    }

    pub fn labels_of<'a, 'b>(&'a self, nodes: impl IntoIterator<Item = &'b NodeId>) -> Vec<&'a str> {
        nodes.into_iter().map(|&n| self.label(n)).collect()
    }

    /// Nodes joined to `node` by a live edge in either direction.
    pub fn neighbors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let n = &self.nodes[node];
        n.edges
            .iter()
            .map(|&e| self.edges[e].destination)
            .chain(n.reverse_edges.iter().map(|&e| self.edges[e].source))
    }

    pub fn find_edges(&self, source: NodeId, destination: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.nodes[source]
            .edges
            .iter()
            .copied()
            .filter(move |&e| self.edges[e].destination == destination)
    }

    pub fn is_complex(&self, node: NodeId) -> bool {
        let n = &self.nodes[node];
        n.edges
            .iter()
            .chain(n.reverse_edges.iter())
            .any(|&e| !self.edges[e].true_condition.is_empty())
    }

    pub fn dependencies_met(&self, node: NodeId) -> bool {
        match self.dependencies.get(&node) {
            Some(deps) => deps.iter().all(|&d| self.nodes[d].state.rooted),
            None => true,
        }
    }

    pub fn tags_compatible(&self, a: NodeId, b: NodeId) -> bool {
        let (ta, tb) = (&self.nodes[a].tags, &self.nodes[b].tags);
        if ta.is_empty() && tb.is_empty() {
            return true;
        }
        !ta.is_disjoint(tb)
    }

    /// Generated pairs `(a, b)` with `a < b`.
    pub fn generated_pairs(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.all_edges
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| e.generated)
            .map(|e| (e.source.min(e.destination), e.source.max(e.destination)))
            .collect()
    }

    pub fn connected_fraction(&self) -> f64 {
        if self.connectable.is_empty() {
            return 1.0;
        }
        1.0 - self.unconnected.len() as f64 / self.connectable.len() as f64
    }

    fn insert_edge(
        &mut self,
        source: NodeId,
        destination: NodeId,
        true_condition: NodeSet,
        generated: bool,
    ) -> EdgeId {
        let id = self.edges.len();
        self.edges.push(Edge {
            source,
            destination,
            true_condition,
            enabled: true,
            questionable: false,
            generated,
        });
        self.attach_edge(id);
        id
    }

    fn attach_edge(&mut self, id: EdgeId) {
        let (source, destination) = (self.edges[id].source, self.edges[id].destination);
        self.all_edges.insert(id);
        self.nodes[source].edges.insert(id);
        self.nodes[destination].reverse_edges.insert(id);
    }

    fn detach_edge(&mut self, id: EdgeId) {
        let (source, destination) = (self.edges[id].source, self.edges[id].destination);
        self.all_edges.remove(&id);
        self.nodes[source].edges.remove(&id);
        self.nodes[destination].reverse_edges.remove(&id);
    }

    fn log_edge(&mut self, id: EdgeId, added: bool) {
        let source = self.label(self.edges[id].source).to_string();
        let destination = self.label(self.edges[id].destination).to_string();
        self.changelog.push(if added {
            ChangeLogEntry::Add {
                source,
                destination,
            }
        } else {
            ChangeLogEntry::Remove {
                source,
                destination,
            }
        });
    }

    pub fn add_edge(
        &mut self,
        source: NodeId,
        destination: NodeId,
        true_condition: NodeSet,
        generated: bool,
    ) -> EdgeId {
        let id = self.insert_edge(source, destination, true_condition, generated);
        self.journal.push(Change::EdgeAdded(id));
        self.log_edge(id, true);
        self.clear_rooted_cache();
        id
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        assert!(self.all_edges.contains(&id), "edge {id} is not in the graph");
        self.detach_edge(id);
        self.journal.push(Change::EdgeRemoved(id));
        self.log_edge(id, false);
        self.clear_rooted_cache();
    }

    pub fn set_edge_enabled(&mut self, id: EdgeId, enabled: bool) {
        let old = self.edges[id].enabled;
        if old == enabled {
            return;
        }
        self.edges[id].enabled = enabled;
        self.journal.push(Change::EdgeEnabled { edge: id, old });
        self.clear_rooted_cache();
    }

    fn set_unconnected(&mut self, node: NodeId, present: bool) {
        let was_present = self.unconnected.contains(&node);
        if was_present == present {
            return;
        }
        if present {
            self.unconnected.insert(node);
        } else {
            self.unconnected.remove(&node);
        }
        self.journal.push(Change::Unconnected { node, was_present });
        self.clear_rooted_cache();
    }

    fn set_node_state(&mut self, node: NodeId, state: NodeState) {
        if self.nodes[node].state == state {
            return;
        }
        let old = std::mem::replace(&mut self.nodes[node].state, state);
        self.journal.push(Change::NodeState { node, old });
    }

    /// Joins two unconnected nodes with a generated edge in each direction.
    pub fn connect(&mut self, a: NodeId, b: NodeId) -> (EdgeId, EdgeId) {
        let forward = self.add_edge(a, b, NodeSet::new(), true);
        let backward = self.add_edge(b, a, NodeSet::new(), true);
        self.set_unconnected(a, false);
        self.set_unconnected(b, false);
        (forward, backward)
    }

    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        let generated: Vec<EdgeId> = self
            .find_edges(a, b)
            .chain(self.find_edges(b, a))
            .filter(|&e| self.edges[e].generated)
            .collect();
        for e in generated {
            self.remove_edge(e);
        }
        for n in [a, b] {
            if !self.has_generated_edges(n) {
                self.set_unconnected(n, true);
            }
        }
    }

    fn has_generated_edges(&self, node: NodeId) -> bool {
        let n = &self.nodes[node];
        n.edges
            .iter()
            .chain(n.reverse_edges.iter())
            .any(|&e| self.edges[e].generated)
    }

    pub fn commit(&mut self) {
        self.refresh();
        self.changelog.push(ChangeLogEntry::Commit {
            generation: self.generation,
        });
        self.generation += 1;
        self.journal.clear();
    }

    pub fn rollback(&mut self) {
        while let Some(change) = self.journal.pop() {
            match change {
                Change::EdgeAdded(id) => {
                    self.detach_edge(id);
                    if id + 1 == self.edges.len() {
                        self.edges.pop();
                    }
                }
                Change::EdgeRemoved(id) => self.attach_edge(id),
                Change::EdgeEnabled { edge, old } => self.edges[edge].enabled = old,
                Change::Unconnected { node, was_present } => {
                    if was_present {
                        self.unconnected.insert(node);
                    } else {
                        self.unconnected.remove(&node);
                    }
                }
                Change::NodeState { node, old } => self.nodes[node].state = old,
            }
        }
        self.changelog.push(ChangeLogEntry::Rollback {
            generation: self.generation,
        });
        self.clear_rooted_cache();
    }

    pub fn clear_rooted_cache(&mut self) {
        self.cache.clear();
        self.backward_cache = None;
        self.reduced_view = None;
        self.identity_view = None;
    }

    /// Nodes whose grouping must stay visible to requirements and the connector.
    pub fn interesting_nodes(&self) -> NodeSet {
        let mut out = NodeSet::new();
        out.insert(self.root);
        for conj in &self.goal {
            out.extend(conj.iter().copied());
        }
        for &e in &self.all_edges {
            out.extend(self.edges[e].true_condition.iter().copied());
        }
        for req in &self.requirements {
            out.extend(req.nodes());
        }
        for (n, node) in self.nodes.iter().enumerate() {
            if !node.tags.is_empty() {
                out.insert(n);
            }
        }
        out.extend(self.unconnected.iter().copied());
        out
    }

    pub fn get_reduced_graph(&mut self) -> Rc<LogicView> {
        if let Some(view) = &self.reduced_view {
            return view.clone();
        }
        let view = Rc::new(LogicView::reduced(self));
        debug!(
            "Reduced {} nodes to {} groups",
            self.nodes.len(),
            view.group_count()
        );
        self.reduced_view = Some(view.clone());
        view
    }

    fn identity(&mut self) -> Rc<LogicView> {
        if let Some(view) = &self.identity_view {
            return view.clone();
        }
        let view = Rc::new(LogicView::identity(self, &BTreeSet::new()));
        self.identity_view = Some(view.clone());
        view
    }

    fn view_for(&mut self, start: NodeId) -> Rc<LogicView> {
        if self.config.use_reduction {
            let view = self.get_reduced_graph();
            if view.is_singleton(start) {
                return view;
            }
        }
        self.identity()
    }

    pub fn reachable_with_guarantees(&mut self, start: NodeId, strict: bool) -> Rc<Reachability> {
        if let Some(r) = self.cache.get(&(start, strict)) {
            return r.clone();
        }
        let view = self.view_for(start);
        let r = Rc::new(traverse::traverse(self, &view, start, strict, None));
        self.cache.insert((start, strict), r.clone());
        r
    }

    /// Stops as soon as every node in `seek` is reached. Never memoized.
    pub fn reachable_seek(&mut self, start: NodeId, seek: &NodeSet) -> Reachability {
        let view = self.view_for(start);
        traverse::traverse(self, &view, start, false, Some(seek))
    }

    /// Uncached traversal with some edges left out.
    pub fn reachable_excluding(
        &self,
        start: NodeId,
        strict: bool,
        excluded: &BTreeSet<EdgeId>,
    ) -> Reachability {
        let view = LogicView::identity(self, excluded);
        traverse::traverse(self, &view, start, strict, None)
    }

    pub fn reachable_from_root(&mut self) -> NodeSet {
        self.reachable_with_guarantees(self.root, false).reached.clone()
    }

    /// Nodes from which root can be reached again.
    pub fn root_reachable_from(&mut self) -> Rc<NodeSet> {
        if let Some(b) = &self.backward_cache {
            return b.clone();
        }
        let root_reach = self.reachable_with_guarantees(self.root, false);
        let backward = Rc::new(traverse::backward_reachable_to_root(self, &root_reach));
        self.backward_cache = Some(backward.clone());
        backward
    }

    /// Writes the root traversal back into each node's state.
    pub fn refresh(&mut self) {
        let r = self.reachable_with_guarantees(self.root, false);
        for n in 0..self.nodes.len() {
            let state = NodeState {
                rank: r.rank[n],
                rooted: r.reached.contains(&n),
                guaranteed: r.guaranteed[n].clone(),
                full_guaranteed: r.full_guaranteed[n].clone(),
            };
            self.set_node_state(n, state);
        }
    }

    pub fn goal_reached(&mut self) -> bool {
        let reached = self.reachable_from_root();
        self.goal.iter().any(|conj| conj.is_subset(&reached))
    }

    /// The goal is reached and the route can come back to root from it.
    pub fn verify_goal(&mut self) -> bool {
        let reached = self.reachable_from_root();
        let backward = self.root_reachable_from();
        self.goal
            .iter()
            .any(|conj| conj.iter().all(|n| reached.contains(n) && backward.contains(n)))
    }

    pub fn points_of_no_return(&mut self) -> NodeSet {
        let reached = self.reachable_from_root();
        let backward = self.root_reachable_from();
        reached.difference(&backward).copied().collect()
    }

    pub fn no_return_check(&mut self) -> Result<(), ValidationFailure> {
        let stuck = self.points_of_no_return();
        if stuck.is_empty() {
            return Ok(());
        }
        let seek: NodeSet = self.goal.iter().flatten().copied().collect();
        for n in stuck {
            let r = self.reachable_seek(n, &seek);
            if !self.goal.iter().any(|conj| conj.is_subset(&r.reached)) {
                return Err(ValidationFailure::NoReturn(self.label(n).to_string()));
            }
        }
        Ok(())
    }

    pub fn verify_context(&mut self) -> VerifyContext {
        VerifyContext {
            root: self.reachable_with_guarantees(self.root, false),
            strict_root: self.reachable_with_guarantees(self.root, true),
        }
    }

    pub fn verify(&mut self) -> Result<(), ValidationFailure> {
        let ctx = self.verify_context();
        for req in &self.requirements {
            req.verify(self, &ctx)?;
        }
        if self.config.avoid_softlocks {
            self.no_return_check()?;
        }
        Ok(())
    }

    /// Re-applies a changelog to a freshly built graph.
    pub fn replay(&mut self, entries: &[ChangeLogEntry]) -> Result<(), RouterError> {
        for entry in entries {
            match entry {
                ChangeLogEntry::Add {
                    source,
                    destination,
                } => {
                    let (a, b) = (self.node_id(source)?, self.node_id(destination)?);
                    self.add_edge(a, b, NodeSet::new(), true);
                    self.set_unconnected(a, false);
                    self.set_unconnected(b, false);
                }
                ChangeLogEntry::Remove {
                    source,
                    destination,
                } => {
                    let (a, b) = (self.node_id(source)?, self.node_id(destination)?);
                    let edge = self
                        .find_edges(a, b)
                        .find(|&e| self.edges[e].generated)
                        .ok_or_else(|| {
                            RouterError::MissingAccessPoint(format!("{source}>{destination}"))
                        })?;
                    self.remove_edge(edge);
                    for n in [a, b] {
                        if !self.has_generated_edges(n) {
                            self.set_unconnected(n, true);
                        }
                    }
                }
                ChangeLogEntry::Commit { .. } => self.commit(),
                ChangeLogEntry::Rollback { .. } => self.rollback(),
            }
        }
        Ok(())
    }
}
