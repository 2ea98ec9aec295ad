use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use doorrouter_logic::{LabelSet, RequirementDecl};
use strum_macros::IntoStaticStr;

use crate::error::{RouterError, ValidationFailure};
use crate::graph::{EdgeId, Graph, NodeId, NodeSet};
use crate::settings::RouterConfig;
use crate::traverse::Reachability;

const REACHABLE_FROM_WITHOUT_MAX_DEPTH: usize = 24;

/// Traversals shared by every requirement check of one mutation.
pub struct VerifyContext {
    pub root: Rc<Reachability>,
    pub strict_root: Rc<Reachability>,
}

#[derive(Clone, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Requirement {
    Require {
        node: NodeId,
        set: NodeSet,
    },
    Guarantee {
        node: NodeId,
        set: NodeSet,
    },
    Bridge {
        node: NodeId,
        set: NodeSet,
    },
    Orphanless {
        node: NodeId,
    },
    Tag {
        node: NodeId,
        tags: BTreeSet<String>,
    },
    Unreachable {
        targets: NodeSet,
    },
    Nongoal {
        targets: NodeSet,
    },
    ReachableFromWithout {
        node: NodeId,
        from: NodeId,
        avoid: NodeSet,
    },
    Dependency {
        node: NodeId,
        set: NodeSet,
    },
    FullGuarantee {
        node: NodeId,
        alternatives: Vec<NodeSet>,
    },
    ComplexOr {
        node: Option<NodeId>,
        children: Vec<Requirement>,
    },
    ComplexAnd {
        node: Option<NodeId>,
        children: Vec<Requirement>,
    },
}

type Resolver<'a> = dyn Fn(&str) -> Result<NodeId, RouterError> + 'a;

fn resolve_set(set: &LabelSet, resolve: &Resolver) -> Result<NodeSet, RouterError> {
    set.iter().map(|x| resolve(x)).collect()
}

impl Requirement {
    pub fn from_decl(
        decl: &RequirementDecl,
        resolve: &Resolver,
        config: &RouterConfig,
    ) -> Result<Requirement, RouterError> {
        let req = match decl {
            RequirementDecl::Require { node, set } => Requirement::Require {
                node: resolve(node)?,
                set: resolve_set(set, resolve)?,
            },
            RequirementDecl::Guarantee { node, set } => Requirement::Guarantee {
                node: resolve(node)?,
                set: resolve_set(set, resolve)?,
            },
            RequirementDecl::Missable { node, set } => {
                let node = resolve(node)?;
                let set = resolve_set(set, resolve)?;
                let mut children = vec![Requirement::Unreachable {
                    targets: set.clone(),
                }];
                if config.goal_based_missables {
                    children.push(Requirement::Nongoal {
                        targets: set.clone(),
                    });
                }
                children.push(Requirement::Guarantee { node, set });
                Requirement::ComplexOr {
                    node: Some(node),
                    children,
                }
            }
            RequirementDecl::Bridge { node, set } => Requirement::Bridge {
                node: resolve(node)?,
                set: resolve_set(set, resolve)?,
            },
            RequirementDecl::Orphanless { node } => Requirement::Orphanless {
                node: resolve(node)?,
            },
            RequirementDecl::Tag { node, tags } => Requirement::Tag {
                node: resolve(node)?,
                tags: tags.clone(),
            },
            RequirementDecl::Unreachable { targets } => Requirement::Unreachable {
                targets: resolve_set(targets, resolve)?,
            },
            RequirementDecl::Nongoal { targets } => Requirement::Nongoal {
                targets: resolve_set(targets, resolve)?,
            },
            RequirementDecl::ReachableFromWithout { node, from, avoid } => {
                Requirement::ReachableFromWithout {
                    node: resolve(node)?,
                    from: resolve(from)?,
                    avoid: resolve_set(avoid, resolve)?,
                }
            }
            RequirementDecl::Dependency { node, set } => Requirement::Dependency {
                node: resolve(node)?,
                set: resolve_set(set, resolve)?,
            },
            RequirementDecl::FullGuarantee { node, alternatives } => Requirement::FullGuarantee {
                node: resolve(node)?,
                alternatives: alternatives
                    .iter()
                    .map(|alt| resolve_set(alt, resolve))
                    .collect::<Result<Vec<NodeSet>, RouterError>>()?,
            },
            RequirementDecl::ComplexOr(children) => Requirement::ComplexOr {
                node: None,
                children: children
                    .iter()
                    .map(|c| Requirement::from_decl(c, resolve, config))
                    .collect::<Result<Vec<Requirement>, RouterError>>()?,
            },
            RequirementDecl::ComplexAnd(children) => Requirement::ComplexAnd {
                node: None,
                children: children
                    .iter()
                    .map(|c| Requirement::from_decl(c, resolve, config))
                    .collect::<Result<Vec<Requirement>, RouterError>>()?,
            },
        };
        Ok(req)
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// The node whose rootedness gates verification, if any.
    pub fn bound_node(&self) -> Option<NodeId> {
        match self {
            Requirement::Require { node, .. }
            | Requirement::Guarantee { node, .. }
            | Requirement::Bridge { node, .. }
            | Requirement::Orphanless { node }
            | Requirement::Tag { node, .. }
            | Requirement::ReachableFromWithout { node, .. }
            | Requirement::Dependency { node, .. }
            | Requirement::FullGuarantee { node, .. } => Some(*node),
            Requirement::Unreachable { .. } | Requirement::Nongoal { .. } => None,
            Requirement::ComplexOr { node, .. } | Requirement::ComplexAnd { node, .. } => *node,
        }
    }

    /// Every node the requirement mentions.
    pub fn nodes(&self) -> NodeSet {
        let mut out = NodeSet::new();
        match self {
            Requirement::Require { node, set }
            | Requirement::Guarantee { node, set }
            | Requirement::Bridge { node, set }
            | Requirement::Dependency { node, set } => {
                out.insert(*node);
                out.extend(set.iter().copied());
            }
            Requirement::Orphanless { node } | Requirement::Tag { node, .. } => {
                out.insert(*node);
            }
            Requirement::Unreachable { targets } | Requirement::Nongoal { targets } => {
                out.extend(targets.iter().copied());
            }
            Requirement::ReachableFromWithout { node, from, avoid } => {
                out.insert(*node);
                out.insert(*from);
                out.extend(avoid.iter().copied());
            }
            Requirement::FullGuarantee { node, alternatives } => {
                out.insert(*node);
                out.extend(alternatives.iter().flatten().copied());
            }
            Requirement::ComplexOr { node, children } | Requirement::ComplexAnd { node, children } => {
                out.extend(node.iter().copied());
                for child in children {
                    out.extend(child.nodes());
                }
            }
        }
        out
    }

    fn describe(&self, graph: &Graph) -> String {
        match self.bound_node() {
            Some(n) => format!("{} {}", self.name(), graph.label(n)),
            None => self.name().to_string(),
        }
    }

    fn fail(&self, graph: &Graph, detail: String) -> ValidationFailure {
        ValidationFailure::Requirement {
            requirement: self.describe(graph),
            detail,
        }
    }

    /// Checks the requirement, skipping it while its bound node is unrooted.
    pub fn verify(&self, graph: &Graph, ctx: &VerifyContext) -> Result<(), ValidationFailure> {
        if let Some(n) = self.bound_node() {
            if !ctx.root.reached.contains(&n) {
                return Ok(());
            }
        }
        match self {
            Requirement::Require { node, set } => self.verify_require(graph, ctx, *node, set),
            Requirement::Guarantee { node, set } => {
                let guaranteed = ctx.root.guaranteed(*node).cloned().unwrap_or_default();
                let missing: Vec<&str> = graph.labels_of(set.difference(&guaranteed));
                if !missing.is_empty() {
                    return Err(self.fail(graph, format!("not guaranteed: {}", missing.join(", "))));
                }
                for alt in &ctx.root.full_guaranteed[*node] {
                    if !set.is_subset(alt) {
                        let missing = graph.labels_of(set.difference(alt));
                        return Err(self.fail(
                            graph,
                            format!("an alternative route skips {}", missing.join(", ")),
                        ));
                    }
                }
                Ok(())
            }
            Requirement::Bridge { node, set } => {
                let excluded: BTreeSet<EdgeId> = graph.nodes[*node]
                    .reverse_edges
                    .iter()
                    .copied()
                    .filter(|&e| set.contains(&graph.edges[e].source))
                    .collect();
                let r = graph.reachable_excluding(graph.root, true, &excluded);
                if r.reached.contains(node) {
                    return Err(self.fail(graph, "reachable from elsewhere".to_string()));
                }
                Ok(())
            }
            Requirement::Orphanless { node } => {
                for &n in &ctx.strict_root.reached {
                    if n == *node {
                        continue;
                    }
                    if ctx.strict_root.guaranteed(n).is_some_and(|g| g.contains(node)) {
                        return Err(self.fail(graph, format!("{} depends on it", graph.label(n))));
                    }
                }
                Ok(())
            }
            Requirement::Tag { node, tags } => {
                let n = &graph.nodes[*node];
                for &e in n.edges.iter().chain(n.reverse_edges.iter()) {
                    let edge = &graph.edges[e];
                    if !edge.generated {
                        continue;
                    }
                    let partner = if edge.source == *node {
                        edge.destination
                    } else {
                        edge.source
                    };
                    if graph.nodes[partner].tags.is_disjoint(tags) {
                        return Err(self.fail(
                            graph,
                            format!("partner {} is not tagged", graph.label(partner)),
                        ));
                    }
                }
                Ok(())
            }
            Requirement::Unreachable { targets } => {
                let reached: Vec<&str> = graph.labels_of(targets.intersection(&ctx.root.reached));
                if !reached.is_empty() {
                    return Err(self.fail(graph, format!("reached {}", reached.join(", "))));
                }
                Ok(())
            }
            Requirement::Nongoal { targets } => {
                let clean = graph.goal.iter().any(|conj| {
                    conj.is_subset(&ctx.root.reached)
                        && conj.iter().all(|m| {
                            !targets.contains(m)
                                && ctx.root.guaranteed(*m).map_or(true, |g| g.is_disjoint(targets))
                        })
                });
                if !clean {
                    return Err(self.fail(graph, "every goal route needs it".to_string()));
                }
                Ok(())
            }
            Requirement::ReachableFromWithout { node, from, avoid } => {
                if reachable_from_without(graph, ctx, *node, *from, avoid) {
                    Ok(())
                } else {
                    Err(self.fail(
                        graph,
                        format!("no route from {} avoiding {:?}", graph.label(*from), graph.labels_of(avoid)),
                    ))
                }
            }
            Requirement::Dependency { .. } => Ok(()),
            Requirement::FullGuarantee { node, alternatives } => {
                for alt in &ctx.root.full_guaranteed[*node] {
                    if !alternatives.iter().any(|s| s.is_subset(alt)) {
                        let labels = graph.labels_of(alt);
                        return Err(self.fail(
                            graph,
                            format!("route via {} has none of the alternatives", labels.join(", ")),
                        ));
                    }
                }
                Ok(())
            }
            Requirement::ComplexOr { children, .. } => {
                let mut messages: Vec<String> = vec![];
                for child in children {
                    match child.verify(graph, ctx) {
                        Ok(()) => return Ok(()),
                        Err(e) => messages.push(e.to_string()),
                    }
                }
                Err(self.fail(graph, messages.join("; ")))
            }
            Requirement::ComplexAnd { children, .. } => {
                for child in children {
                    child.verify(graph, ctx)?;
                }
                Ok(())
            }
        }
    }

    fn verify_require(
        &self,
        graph: &Graph,
        ctx: &VerifyContext,
        node: NodeId,
        set: &NodeSet,
    ) -> Result<(), ValidationFailure> {
        let guaranteed = ctx.root.guaranteed(node).cloned().unwrap_or_default();
        for &m in set {
            if ctx.root.guaranteed(m).is_some_and(|g| g.contains(&node)) {
                return Err(ValidationFailure::Impossible(format!(
                    "{} and {} require each other",
                    graph.label(node),
                    graph.label(m)
                )));
            }
        }
        let missing = graph.labels_of(set.difference(&guaranteed));
        if !missing.is_empty() {
            return Err(self.fail(graph, format!("not guaranteed: {}", missing.join(", "))));
        }
        for &m in set {
            let Some(requirers) = graph.requirers.get(&m) else {
                continue;
            };
            if requirers.len() < 2 {
                continue;
            }
            let avoid: NodeSet = requirers.iter().copied().filter(|&r| r != node).collect();
            if !admitted_path_avoiding(graph, &ctx.root, m, node, &avoid) {
                return Err(self.fail(
                    graph,
                    format!("{} only leads here through another requirer", graph.label(m)),
                ));
            }
        }
        Ok(())
    }
}

fn admitted_path_avoiding(
    graph: &Graph,
    reach: &Reachability,
    from: NodeId,
    to: NodeId,
    avoid: &NodeSet,
) -> bool {
    let mut seen: NodeSet = [from].into_iter().collect();
    let mut queue: VecDeque<NodeId> = VecDeque::from([from]);
    while let Some(u) = queue.pop_front() {
        if u == to {
            return true;
        }
        for &e in &graph.nodes[u].edges {
            if !reach.used_edges.contains(&e) {
                continue;
            }
            let v = graph.edges[e].destination;
            if avoid.contains(&v) || !seen.insert(v) {
                continue;
            }
            queue.push_back(v);
        }
    }
    false
}

/// Breadth-first search from `from` to `node`, at most
/// `REACHABLE_FROM_WITHOUT_MAX_DEPTH` edges deep. Conditions may use anything
/// guaranteed at `from` plus the nodes on the path. Each node keeps at most
/// `fg_cache_limit` undominated visited sets.
fn reachable_from_without(
    graph: &Graph,
    ctx: &VerifyContext,
    node: NodeId,
    from: NodeId,
    avoid: &NodeSet,
) -> bool {
    let Some(base) = ctx.root.guaranteed(from) else {
        return false;
    };
    if avoid.contains(&from) {
        return false;
    }
    let limit = graph.config.fg_cache_limit;
    let start: NodeSet = [from].into_iter().collect();
    let mut seen: Vec<Vec<NodeSet>> = vec![vec![]; graph.nodes.len()];
    seen[from].push(start.clone());
    let mut frontier: Vec<(NodeId, NodeSet)> = vec![(from, start)];
    for depth in 0..=REACHABLE_FROM_WITHOUT_MAX_DEPTH {
        if frontier.iter().any(|(u, _)| *u == node) {
            return true;
        }
        if depth == REACHABLE_FROM_WITHOUT_MAX_DEPTH {
            break;
        }
        let mut next: Vec<(NodeId, NodeSet)> = vec![];
        for (u, visited) in &frontier {
            for &e in &graph.nodes[*u].edges {
                let edge = &graph.edges[e];
                let v = edge.destination;
                if !edge.enabled || avoid.contains(&v) || visited.contains(&v) {
                    continue;
                }
                let covered = graph.config.no_logic
                    || edge
                        .true_condition
                        .iter()
                        .all(|c| base.contains(c) || visited.contains(c));
                if !covered {
                    continue;
                }
                let mut extended = visited.clone();
                extended.insert(v);
                let known = &mut seen[v];
                if known.iter().any(|k| extended.is_subset(k)) {
                    continue;
                }
                known.retain(|k| !k.is_subset(&extended));
                if known.len() >= limit {
                    continue;
                }
                known.push(extended.clone());
                next.push((v, extended));
            }
        }
        if next.is_empty() {
            return false;
        }
        frontier = next;
    }
    false
}
