use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use doorrouter::connect::{
    build_graph, connect_everything, rooted_bridges, ConnectSummary, PairValidator, Validators,
};
use doorrouter::error::RouterError;
use doorrouter::graph::Graph;
use doorrouter::output::RouterOutput;
use doorrouter::settings::{load_router_config, RouterConfig};
use doorrouter_logic::LogicData;

fn data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data")
}

fn load_hub() -> Result<(LogicData, RouterConfig)> {
    let dir = data_dir();
    let data = LogicData::load(&dir.join("hub_nodes.txt"), &dir.join("hub_logic.txt"))?;
    let config = load_router_config(&dir.join("hub_config.json"))?;
    Ok((data, config))
}

fn generated_labels(graph: &Graph) -> BTreeSet<(String, String)> {
    graph
        .generated_pairs()
        .into_iter()
        .map(|(a, b)| (graph.label(a).to_string(), graph.label(b).to_string()))
        .collect()
}

#[test]
fn test_hub_reaches_goal() -> Result<()> {
    let (data, config) = load_hub()?;
    let mut graph = Graph::new(&data, config)?;
    assert_eq!(graph.unconnected.len(), 8);
    assert!(!graph.goal_reached());

    let summary = connect_everything(&mut graph, &Validators::default())?;
    assert!(graph.goal_reached());
    assert!(graph.verify_goal());
    assert!(graph.unconnected.is_empty());
    assert_eq!(summary.generated_edges, 8);
    assert_eq!(summary.static_edges, 16);

    // Every exit leads into a leaf room.
    for (a, b) in generated_labels(&graph) {
        assert!(a.starts_with('r') && b.starts_with('l'), "{a} joined to {b}");
    }
    Ok(())
}

#[test]
fn test_same_seed_same_map() -> Result<()> {
    let (data, config) = load_hub()?;
    let mut first = Graph::new(&data, config.clone())?;
    connect_everything(&mut first, &Validators::default())?;
    let mut second = Graph::new(&data, config)?;
    connect_everything(&mut second, &Validators::default())?;
    assert_eq!(generated_labels(&first), generated_labels(&second));
    assert_eq!(first.changelog, second.changelog);
    Ok(())
}

#[test]
fn test_changelog_replay() -> Result<()> {
    let (data, config) = load_hub()?;
    let mut graph = Graph::new(&data, config.clone())?;
    let summary = connect_everything(&mut graph, &Validators::default())?;

    let mut replayed = Graph::new(&data, config)?;
    replayed.replay(&graph.changelog)?;
    assert_eq!(replayed.all_edges, graph.all_edges);
    assert_eq!(generated_labels(&replayed), generated_labels(&graph));
    assert_eq!(replayed.unconnected, graph.unconnected);
    assert!(replayed.goal_reached());

    let output = RouterOutput::new(&graph, &summary);
    assert_eq!(output.generated_edges().len(), 8);
    assert!(output.unconnected.is_empty());
    Ok(())
}

#[test]
fn test_strict_validator_is_respected() -> Result<()> {
    let (data, config) = load_hub()?;
    let mut graph = Graph::new(&data, config)?;
    let r1 = graph.node_id("r1")?;
    let l1 = graph.node_id("l1")?;
    // Only r1 may take l1.
    let pin: PairValidator =
        &|g: &Graph, a: usize, b: usize| (a == r1) == (b == l1) || g.label(b).starts_with('r');
    let validators = Validators {
        strict: Some(pin),
        lenient: None,
    };
    connect_everything(&mut graph, &validators)?;
    assert!(generated_labels(&graph).contains(&("r1".to_string(), "l1".to_string())));
    Ok(())
}

#[test]
fn test_build_graph() -> Result<()> {
    let (data, config) = load_hub()?;
    let config = RouterConfig {
        max_build_attempts: Some(3),
        ..config
    };
    let (mut graph, summary) = build_graph(&data, &config, &Validators::default())?;
    assert_eq!(graph.config.seed, config.seed);
    assert!(graph.goal_reached());
    assert_eq!(summary.generated_edges, 8);
    Ok(())
}

#[test]
fn test_budget_exhausted() -> Result<()> {
    let (data, config) = load_hub()?;
    let config = RouterConfig {
        retry_limit: 0,
        max_build_attempts: Some(1),
        ..config
    };
    match build_graph(&data, &config, &Validators::default()) {
        Err(RouterError::BudgetExhausted { iterations, .. }) => assert_eq!(iterations, 0),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("built a map without any iterations"),
    }
    Ok(())
}

#[test]
fn test_rooted_bridges() -> Result<()> {
    let data = LogicData::parse("root\na\nb\nc\nd\ne\n", "root=a\na=b\nb=c\nc=a\na=d\n")?;
    let graph = Graph::new(&data, RouterConfig::default())?;
    let (root, a, d) = (graph.root, graph.node_id("a")?, graph.node_id("d")?);
    let expected: BTreeSet<(usize, usize)> = [(root, a), (a, d)].into_iter().collect();
    assert_eq!(rooted_bridges(&graph), expected);
    Ok(())
}

#[test]
fn test_summary_display() {
    let summary = ConnectSummary {
        longest_path: vec!["root".to_string(), "a".to_string(), "b".to_string()],
        generated_edges: 2,
        static_edges: 6,
        loops: 3,
    };
    assert_eq!(
        summary.to_string(),
        "Longest path: root > a > b\nEdges: 2 generated, 6 static\nLoops: 3"
    );
}
