use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use doorrouter::graph::Graph;
use doorrouter::settings::RouterConfig;
use doorrouter_logic::LogicData;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ScenariosList {
    scenarios: Vec<Scenario>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Scenario {
    #[serde(rename = "name")]
    _name: Option<String>,
    start: Option<String>,
    #[serde(default)]
    strict: bool,
    reachable: Option<Vec<String>>,
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    excludes: Vec<String>,
    root_reachable_from: Option<Vec<String>>,
    no_return: Option<Vec<String>>,
    #[serde(default)]
    ranks: BTreeMap<String, usize>,
    #[serde(default)]
    guaranteed: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    full_guaranteed: BTreeMap<String, Vec<Vec<String>>>,
}

fn labels(graph: &Graph, nodes: &BTreeSet<usize>) -> BTreeSet<String> {
    nodes.iter().map(|&n| graph.label(n).to_string()).collect()
}

fn test_scenario(data: &LogicData, scenario: &Scenario, use_reduction: bool) -> Result<()> {
    let config = RouterConfig {
        use_reduction,
        ..RouterConfig::default()
    };
    let mut graph = Graph::new(data, config)?;
    let start = match &scenario.start {
        Some(label) => graph.node_id(label)?,
        None => graph.root,
    };
    let r = graph.reachable_with_guarantees(start, scenario.strict);
    let reached = labels(&graph, &r.reached);

    if let Some(expected) = &scenario.reachable {
        let expected: BTreeSet<String> = expected.iter().cloned().collect();
        if reached != expected {
            bail!("Reachable set {:?}, expected {:?}", reached, expected);
        }
    }
    for label in &scenario.includes {
        if !reached.contains(label) {
            bail!("{label} should be reachable; reached {:?}", reached);
        }
    }
    for label in &scenario.excludes {
        if reached.contains(label) {
            bail!("{label} should not be reachable");
        }
    }
    for (label, &rank) in &scenario.ranks {
        let n = graph.node_id(label)?;
        if r.rank[n] != Some(rank) {
            bail!("Rank of {label} is {:?}, expected {rank}", r.rank[n]);
        }
    }
    for (label, expected) in &scenario.guaranteed {
        let n = graph.node_id(label)?;
        let actual = labels(&graph, r.guaranteed(n).context("node not reached")?);
        let expected: BTreeSet<String> = expected.iter().cloned().collect();
        if actual != expected {
            bail!("Guarantees of {label} are {:?}, expected {:?}", actual, expected);
        }
    }
    for (label, expected) in &scenario.full_guaranteed {
        let n = graph.node_id(label)?;
        let actual: BTreeSet<BTreeSet<String>> =
            r.full_guaranteed[n].iter().map(|alt| labels(&graph, alt)).collect();
        let expected: BTreeSet<BTreeSet<String>> = expected
            .iter()
            .map(|alt| alt.iter().cloned().collect())
            .collect();
        if actual != expected {
            bail!("Alternatives of {label} are {:?}, expected {:?}", actual, expected);
        }
    }
    if let Some(expected) = &scenario.root_reachable_from {
        let backward = graph.root_reachable_from();
        let actual = labels(&graph, &backward);
        let expected: BTreeSet<String> = expected.iter().cloned().collect();
        if actual != expected {
            bail!("Root reachable from {:?}, expected {:?}", actual, expected);
        }
    }
    if let Some(expected) = &scenario.no_return {
        let stuck = graph.points_of_no_return();
        let actual = labels(&graph, &stuck);
        let expected: BTreeSet<String> = expected.iter().cloned().collect();
        if actual != expected {
            bail!("Points of no return {:?}, expected {:?}", actual, expected);
        }
    }
    Ok(())
}

#[test]
fn test_logic_scenarios() -> Result<()> {
    let scenarios_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scenarios");
    let mut entries: Vec<_> = std::fs::read_dir(&scenarios_dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        println!("{}", entry.file_name().to_string_lossy());
        let data = LogicData::load(&entry.path().join("nodes.txt"), &entry.path().join("logic.txt"))?;

        let scenarios_path = entry.path().join("scenarios.json");
        let scenarios_str = std::fs::read_to_string(&scenarios_path)
            .context(format!("loading {}", scenarios_path.display()))?;
        let scenarios_list: ScenariosList = serde_json::from_str(&scenarios_str)
            .context(format!("parsing {}", scenarios_path.display()))?;
        for scenario in &scenarios_list.scenarios {
            for use_reduction in [false, true] {
                println!("Scenario: {:?}, reduction: {}", scenario, use_reduction);
                test_scenario(&data, scenario, use_reduction)?;
            }
        }
    }
    Ok(())
}
