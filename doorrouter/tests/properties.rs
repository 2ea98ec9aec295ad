use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Result};
use doorrouter::graph::{Graph, NodeSet};
use doorrouter::settings::RouterConfig;
use doorrouter_logic::LogicData;

fn load_scenario_data() -> Result<Vec<(String, LogicData)>> {
    let scenarios_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scenarios");
    let mut out = vec![];
    for entry in std::fs::read_dir(scenarios_dir)? {
        let entry = entry?;
        let data = LogicData::load(&entry.path().join("nodes.txt"), &entry.path().join("logic.txt"))?;
        out.push((entry.file_name().to_string_lossy().to_string(), data));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn config(use_reduction: bool) -> RouterConfig {
    RouterConfig {
        use_reduction,
        ..RouterConfig::default()
    }
}

// Everything guaranteed at a node must be impossible to route around.
#[test]
fn test_guarantees_are_sound() -> Result<()> {
    for (name, data) in load_scenario_data()? {
        let mut graph = Graph::new(&data, config(true))?;
        let r = graph.reachable_with_guarantees(graph.root, false);
        for &n in &r.reached {
            let Some(guaranteed) = r.guaranteed(n) else {
                bail!("{name}: {} reached without guarantees", graph.label(n));
            };
            for &g in guaranteed {
                if g == n || g == graph.root {
                    continue;
                }
                let mut pruned = Graph::new(&data, config(true))?;
                let touching: BTreeSet<usize> = pruned.nodes[g]
                    .edges
                    .union(&pruned.nodes[g].reverse_edges)
                    .copied()
                    .collect();
                for e in touching {
                    pruned.set_edge_enabled(e, false);
                }
                if pruned.reachable_from_root().contains(&n) {
                    bail!(
                        "{name}: {} still reachable without {}",
                        graph.label(n),
                        graph.label(g)
                    );
                }
            }
        }
    }
    Ok(())
}

#[test]
fn test_reduction_equivalence() -> Result<()> {
    for (name, data) in load_scenario_data()? {
        let mut plain = Graph::new(&data, config(false))?;
        let mut reduced = Graph::new(&data, config(true))?;
        let a = plain.reachable_with_guarantees(plain.root, false);
        let b = reduced.reachable_with_guarantees(reduced.root, false);
        assert_eq!(a.reached, b.reached, "{name}: reachable sets differ");
        let plain_ranks: Vec<(&str, Option<usize>)> =
            (0..plain.nodes.len()).map(|n| (plain.label(n), a.rank[n])).collect();
        let reduced_ranks: Vec<(&str, Option<usize>)> =
            (0..reduced.nodes.len()).map(|n| (reduced.label(n), b.rank[n])).collect();
        assert_eq!(plain_ranks, reduced_ranks, "{name}: ranks differ");
        assert_eq!(a.guaranteed, b.guaranteed, "{name}: guarantees differ");
        assert_eq!(
            a.full_guaranteed, b.full_guaranteed,
            "{name}: alternatives differ"
        );
        assert_eq!(
            *plain.root_reachable_from(),
            *reduced.root_reachable_from(),
            "{name}: backward sets differ"
        );
    }
    Ok(())
}

#[test]
fn test_corridor_is_reduced() -> Result<()> {
    let data = LogicData::parse(
        "root\na\nb\nc\nd\nkey\ne\n",
        "root=a\na=b\nb=c\nc=d\nd=key\nc>e key\n",
    )?;
    let mut graph = Graph::new(&data, config(true))?;
    let view = graph.get_reduced_graph();
    assert_eq!(view.group_count(), 4);
    let a = graph.node_id("a")?;
    assert_eq!(view.leader[graph.node_id("d")?], a);
    assert!(view.is_singleton(graph.root));
    let group: NodeSet = [a].into_iter().collect();
    assert_eq!(view.remap_nodes(&group).len(), 4);
    Ok(())
}

#[test]
fn test_lazy_complex_nodes_reach_the_same_fixpoint() -> Result<()> {
    for (name, data) in load_scenario_data()? {
        let mut eager = Graph::new(&data, config(true))?;
        let mut lazy = Graph::new(
            &data,
            RouterConfig {
                lazy_complex_nodes: true,
                ..RouterConfig::default()
            },
        )?;
        let a = eager.reachable_from_root();
        let b = lazy.reachable_from_root();
        assert_eq!(a, b, "{name}: lazy traversal differs");
    }
    Ok(())
}

#[test]
fn test_no_logic_ignores_conditions() -> Result<()> {
    let data = LogicData::parse("root\na\nb\nc\n", "root=a\na=b\nroot>c b\n")?;
    let mut graph = Graph::new(
        &data,
        RouterConfig {
            no_logic: true,
            ..RouterConfig::default()
        },
    )?;
    let c = graph.node_id("c")?;
    assert!(graph.reachable_from_root().contains(&c));
    Ok(())
}

#[test]
fn test_seek_stops_early() -> Result<()> {
    let data = LogicData::parse("root\na\nb\nc\n", "root>a\na>b\nb>c\n")?;
    let mut graph = Graph::new(&data, config(false))?;
    let seek: NodeSet = [graph.node_id("a")?].into_iter().collect();
    let r = graph.reachable_seek(graph.root, &seek);
    assert!(!r.complete);
    assert!(r.reached.contains(&graph.node_id("a")?));
    assert!(!r.reached.contains(&graph.node_id("c")?));

    let full = graph.reachable_with_guarantees(graph.root, false);
    assert!(full.complete);
    Ok(())
}

#[test]
fn test_alternative_cap_keeps_a_cover() -> Result<()> {
    let data = LogicData::parse("root\na\nb\nc\n", "root=a\nroot=b\na=c\nb=c\n")?;
    let mut graph = Graph::new(&data, config(false))?;
    let (a, b, c) = (graph.node_id("a")?, graph.node_id("b")?, graph.node_id("c")?);
    let root = graph.root;
    let r = graph.reachable_with_guarantees(root, false);
    let via_a: NodeSet = [root, a, c].into_iter().collect();
    let via_b: NodeSet = [root, b, c].into_iter().collect();
    assert_eq!(r.full_guaranteed[c], vec![via_a, via_b]);

    let mut capped = Graph::new(
        &data,
        RouterConfig {
            fg_cache_limit: 1,
            use_reduction: false,
            ..RouterConfig::default()
        },
    )?;
    let r = capped.reachable_with_guarantees(root, false);
    let common: NodeSet = [root, c].into_iter().collect();
    assert_eq!(r.full_guaranteed[c], vec![common]);
    Ok(())
}
