use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use doorrouter_logic::LogicData;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};

use crate::error::{RouterError, ValidationFailure};
use crate::graph::{Graph, NodeId};
use crate::settings::RouterConfig;

const ITERATION_STREAM: u64 = 0;
const ATTEMPT_STREAM: u64 = 1;

pub type PairValidator<'a> = &'a dyn Fn(&Graph, NodeId, NodeId) -> bool;

/// Optional filters on candidate pairs. The strict one is tried first; the
/// lenient one only when the strict one leaves nothing.
#[derive(Default, Clone, Copy)]
pub struct Validators<'a> {
    pub strict: Option<PairValidator<'a>>,
    pub lenient: Option<PairValidator<'a>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectSummary {
    pub longest_path: Vec<String>,
    pub generated_edges: usize,
    pub static_edges: usize,
    pub loops: usize,
}

impl fmt::Display for ConnectSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Longest path: {}", self.longest_path.join(" > "))?;
        writeln!(
            f,
            "Edges: {} generated, {} static",
            self.generated_edges, self.static_edges
        )?;
        write!(f, "Loops: {}", self.loops)
    }
}

fn seeded_rng(seed: u64, stream: u64, index: u64) -> StdRng {
    let mut rng_seed = [0u8; 32];
    rng_seed[..8].copy_from_slice(&seed.to_le_bytes());
    rng_seed[8..16].copy_from_slice(&index.to_le_bytes());
    rng_seed[16..24].copy_from_slice(&stream.to_le_bytes());
    StdRng::from_seed(rng_seed)
}

fn attempt_seed(seed: u64, attempt: usize) -> u64 {
    if attempt == 0 {
        seed
    } else {
        seeded_rng(seed, ATTEMPT_STREAM, attempt as u64).next_u64()
    }
}

/// Connected undirected pairs among rooted nodes whose removal would split
/// the rooted graph.
pub fn rooted_bridges(graph: &Graph) -> BTreeSet<(NodeId, NodeId)> {
    let n = graph.nodes.len();
    let rooted = |x: NodeId| graph.nodes[x].state.rooted;
    let pairs: Vec<(NodeId, NodeId)> = graph
        .all_edges
        .iter()
        .map(|&e| &graph.edges[e])
        .filter(|e| e.enabled && e.source != e.destination)
        .filter(|e| rooted(e.source) && rooted(e.destination))
        .map(|e| (e.source.min(e.destination), e.source.max(e.destination)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut adj: Vec<Vec<(NodeId, usize)>> = vec![vec![]; n];
    for (i, &(a, b)) in pairs.iter().enumerate() {
        adj[a].push((b, i));
        adj[b].push((a, i));
    }

    let mut disc: Vec<Option<usize>> = vec![None; n];
    let mut low: Vec<usize> = vec![0; n];
    let mut time = 0;
    let mut bridges = BTreeSet::new();
    for s in 0..n {
        if !rooted(s) || disc[s].is_some() {
            continue;
        }
        disc[s] = Some(time);
        low[s] = time;
        time += 1;
        // (node, pair index used to enter it, next neighbor to visit)
        let mut stack: Vec<(NodeId, Option<usize>, usize)> = vec![(s, None, 0)];
        while let Some(top) = stack.last_mut() {
            let (u, parent_pair) = (top.0, top.1);
            if top.2 < adj[u].len() {
                let (v, pair) = adj[u][top.2];
                top.2 += 1;
                if Some(pair) == parent_pair {
                    continue;
                }
                match disc[v] {
                    Some(d) => low[u] = low[u].min(d),
                    None => {
                        disc[v] = Some(time);
                        low[v] = time;
                        time += 1;
                        stack.push((v, Some(pair), 0));
                    }
                }
            } else {
                stack.pop();
                if let (Some(&(p, _, _)), Some(pair)) = (stack.last(), parent_pair) {
                    low[p] = low[p].min(low[u]);
                    if disc[p].is_some_and(|dp| low[u] > dp) {
                        bridges.insert(pairs[pair]);
                    }
                }
            }
        }
    }
    bridges
}

fn add_candidates(graph: &Graph) -> Vec<NodeId> {
    graph
        .unconnected
        .iter()
        .copied()
        .filter(|&a| graph.nodes[a].state.rooted && graph.dependencies_met(a))
        .collect()
}

fn partners(graph: &Graph, a: NodeId) -> Vec<NodeId> {
    graph
        .unconnected
        .iter()
        .copied()
        .filter(|&b| b != a && graph.dependencies_met(b) && graph.tags_compatible(a, b))
        .collect()
}

fn has_add_options(graph: &Graph) -> bool {
    add_candidates(graph)
        .into_iter()
        .any(|a| !partners(graph, a).is_empty())
}

fn try_add(graph: &mut Graph, validators: &Validators, rng: &mut StdRng) -> Result<(), ValidationFailure> {
    let skip = graph.config.skip_complex_nodes;
    let candidates: Vec<NodeId> = add_candidates(graph)
        .into_iter()
        .filter(|&a| !(skip > 0.0 && graph.is_complex(a) && rng.gen_bool(skip)))
        .collect();
    let Some(&a) = candidates.choose(rng) else {
        return Err(ValidationFailure::NoOptions(
            "no rooted unconnected nodes".to_string(),
        ));
    };
    let mut options = partners(graph, a);
    if let Some(strict) = validators.strict {
        let filtered: Vec<NodeId> = options.iter().copied().filter(|&b| strict(graph, a, b)).collect();
        if !filtered.is_empty() {
            options = filtered;
        } else if let Some(lenient) = validators.lenient {
            options.retain(|&b| lenient(graph, a, b));
        } else {
            options.clear();
        }
    } else if let Some(lenient) = validators.lenient {
        options.retain(|&b| lenient(graph, a, b));
    }
    let unrooted: Vec<NodeId> = options
        .iter()
        .copied()
        .filter(|&b| !graph.nodes[b].state.rooted)
        .collect();
    let pool = if unrooted.is_empty() { &options } else { &unrooted };
    let Some(&b) = pool.choose(rng) else {
        return Err(ValidationFailure::NoOptions(format!(
            "nothing to join with {}",
            graph.label(a)
        )));
    };
    graph.connect(a, b);
    Ok(())
}

fn try_remove(graph: &mut Graph, rng: &mut StdRng) -> Result<(), ValidationFailure> {
    let pairs: Vec<(NodeId, NodeId)> = graph.generated_pairs().into_iter().collect();
    let bridges = rooted_bridges(graph);
    let removable: Vec<(NodeId, NodeId)> = pairs
        .iter()
        .copied()
        .filter(|p| !bridges.contains(p))
        .collect();
    let choice = match removable.choose(rng) {
        Some(&p) => Some(p),
        None => pairs.iter().copied().max_by_key(|&(a, b)| {
            let rank = |x: NodeId| graph.nodes[x].state.rank.unwrap_or(0);
            (rank(a).max(rank(b)), std::cmp::Reverse(a))
        }),
    };
    let Some((a, b)) = choice else {
        return Err(ValidationFailure::NoOptions(
            "no generated edges to remove".to_string(),
        ));
    };
    graph.disconnect(a, b);
    Ok(())
}

pub fn summarize(graph: &mut Graph, loops: usize) -> ConnectSummary {
    let r = graph.reachable_with_guarantees(graph.root, false);
    let deepest = r
        .reached
        .iter()
        .copied()
        .max_by_key(|&n| (r.rank[n], std::cmp::Reverse(n)))
        .unwrap_or(graph.root);
    let longest_path = r
        .path_to(graph, deepest)
        .unwrap_or_default()
        .into_iter()
        .map(|n| graph.label(n).to_string())
        .collect();
    let generated_edges = graph
        .all_edges
        .iter()
        .filter(|&&e| graph.edges[e].generated)
        .count();
    ConnectSummary {
        longest_path,
        generated_edges,
        static_edges: graph.all_edges.len() - generated_edges,
        loops,
    }
}

/// Randomly adds and removes connections until the goal is reachable and
/// enough of the map is connected.
pub fn connect_everything(graph: &mut Graph, validators: &Validators) -> Result<ConnectSummary, RouterError> {
    let start_time = Instant::now();
    let seed = graph.config.seed;
    let mut iteration: usize = 0;
    let mut failures: usize = 0;
    loop {
        if graph.verify_goal() {
            let fraction = graph.connected_fraction();
            if fraction >= graph.config.map_size
                || (fraction >= graph.config.map_strictness && !has_add_options(graph))
            {
                let summary = summarize(graph, iteration);
                info!("Connected after {iteration} iterations:\n{summary}");
                return Ok(summary);
            }
        }
        let elapsed = start_time.elapsed();
        if iteration >= graph.config.retry_limit
            || failures >= graph.config.retry_limit_close
            || elapsed > graph.config.time_limit()
        {
            return Err(RouterError::BudgetExhausted {
                iterations: iteration,
                elapsed,
            });
        }

        let mut rng = seeded_rng(seed, ITERATION_STREAM, iteration as u64);
        iteration += 1;
        let add_probability = 0.9f64.powi(failures.min(i32::MAX as usize) as i32).max(0.1);
        let add = graph.generated_pairs().is_empty() || rng.gen_bool(add_probability);
        let result = if add {
            try_add(graph, validators, &mut rng)
        } else {
            try_remove(graph, &mut rng)
        }
        .and_then(|()| graph.verify());

        let message = match result {
            Ok(()) => {
                graph.commit();
                failures = 0;
                (if add { "added" } else { "removed" }).to_string()
            }
            Err(e) => {
                graph.rollback();
                failures += 1;
                e.to_string()
            }
        };
        let unrootable = graph.nodes.iter().filter(|n| !n.state.rooted).count();
        let goal_reached = graph.goal_reached();
        info!(
            "[iteration {iteration}] unconnected: {}, unrootable: {unrootable}, goal reached: {goal_reached}, {message}",
            graph.unconnected.len()
        );
    }
}

/// Builds a graph and connects it, rebuilding with a derived seed whenever
/// the search budget runs out.
pub fn build_graph(
    data: &LogicData,
    config: &RouterConfig,
    validators: &Validators,
) -> Result<(Graph, ConnectSummary), RouterError> {
    let mut attempt = 0;
    loop {
        let mut attempt_config = config.clone();
        attempt_config.seed = attempt_seed(config.seed, attempt);
        let mut graph = Graph::new(data, attempt_config)?;
        match connect_everything(&mut graph, validators) {
            Ok(summary) => return Ok((graph, summary)),
            Err(e @ RouterError::BudgetExhausted { .. }) => {
                attempt += 1;
                if config.max_build_attempts.is_some_and(|max| attempt >= max) {
                    return Err(e);
                }
                warn!("[attempt {attempt}] {e}; rebuilding");
            }
            Err(e) => return Err(e),
        }
    }
}
