use anyhow::Result;
use doorrouter::error::{RouterError, ValidationFailure};
use doorrouter::graph::{Graph, NodeSet};
use doorrouter::requirement::Requirement;
use doorrouter::settings::RouterConfig;
use doorrouter_logic::LogicData;

fn build(nodes: &str, logic: &str) -> Result<Graph> {
    let data = LogicData::parse(nodes, logic)?;
    let config = RouterConfig {
        avoid_softlocks: false,
        ..RouterConfig::default()
    };
    Ok(Graph::new(&data, config)?)
}

fn is_requirement_failure(result: Result<(), ValidationFailure>) -> bool {
    matches!(result, Err(ValidationFailure::Requirement { .. }))
}

#[test]
fn test_require_needs_every_route_through_the_set() -> Result<()> {
    let mut graph = build("root\na\nb\nc\n", "root=a\na=b\nb>>c\n")?;
    graph.verify()?;

    let (root, c) = (graph.root, graph.node_id("c")?);
    graph.add_edge(root, c, NodeSet::new(), false);
    assert!(is_requirement_failure(graph.verify()));
    Ok(())
}

#[test]
fn test_mutual_require_is_impossible() -> Result<()> {
    let mut graph = build("root\na\nb\n", "root>a\na>>b\nb>>a\n")?;
    assert!(matches!(graph.verify(), Err(ValidationFailure::Impossible(_))));
    Ok(())
}

#[test]
fn test_bridge_forbids_other_entrances() -> Result<()> {
    let mut graph = build("root\na\nb\n", "root=a\na=>b\n")?;
    graph.verify()?;

    let (root, b) = (graph.root, graph.node_id("b")?);
    graph.add_edge(root, b, NodeSet::new(), false);
    assert!(is_requirement_failure(graph.verify()));
    Ok(())
}

#[test]
fn test_unreachable() -> Result<()> {
    let mut graph = build("root\na\nz\n", "root=a\n.unreachable z\n")?;
    graph.verify()?;

    let (a, z) = (graph.node_id("a")?, graph.node_id("z")?);
    graph.add_edge(a, z, NodeSet::new(), false);
    let err = graph.verify().unwrap_err();
    assert!(err.to_string().contains("unreachable"));
    Ok(())
}

#[test]
fn test_missable() -> Result<()> {
    // x is reachable, needed for the goal, and not on the way to c.
    let mut graph = build("root\na\nc\nx\n", "root=a\na=c\na=x\n.goal x\n.missable c x\n")?;
    assert!(matches!(
        graph.requirements[0],
        Requirement::ComplexOr { node: Some(_), ref children } if children.len() == 3
    ));
    assert!(is_requirement_failure(graph.verify()));

    // x always comes before c.
    let mut graph = build("root\na\nc\nx\n", "root=a\na=x\nx=c\n.goal a\n.missable c x\n")?;
    graph.verify()?;
    Ok(())
}

#[test]
fn test_reachable_from_without() -> Result<()> {
    let nodes = "root\na\nb\nc\nd\n";
    let logic = "root=a\na=b\nb=c\na=d\nd=c\n";
    let mut graph = build(nodes, &format!("{logic}.reachable_from_without c a b\n"))?;
    graph.verify()?;

    let mut graph = build(nodes, &format!("{logic}.reachable_from_without c a b d\n"))?;
    assert!(is_requirement_failure(graph.verify()));
    Ok(())
}

#[test]
fn test_full_guarantee() -> Result<()> {
    let nodes = "root\na\nb\nc\nk1\nk2\n";
    let logic = "root=a\na=k1\nk1=c\nk1=b\nb=c\n";
    let mut graph = build(nodes, &format!("{logic}.full_guarantee c k2\n.full_guarantee c k1\n"))?;
    let full_guarantees = graph
        .requirements
        .iter()
        .filter(|r| matches!(r, Requirement::FullGuarantee { .. }))
        .count();
    assert_eq!(full_guarantees, 1);
    graph.verify()?;

    let mut graph = build(nodes, &format!("{logic}.full_guarantee c k2\n"))?;
    assert!(is_requirement_failure(graph.verify()));
    Ok(())
}

#[test]
fn test_full_guarantee_checks_the_shortest_route() -> Result<()> {
    // k hangs off h, so root>h>n never collects it.
    let nodes = "root\nh\nk\nn\n";
    let logic = "root>h\nh=k\nh>n\nn>root\n";
    let mut graph = build(nodes, &format!("{logic}.full_guarantee n k\n"))?;
    assert!(is_requirement_failure(graph.verify()));

    let mut graph = build(nodes, &format!("{logic}.full_guarantee n h\n"))?;
    graph.verify()?;
    Ok(())
}

#[test]
fn test_reachable_from_without_on_a_grid() -> Result<()> {
    let mut nodes = String::from("root\nt\n");
    let mut logic = String::from("root=g0_0\nroot=t\n");
    for r in 0..6 {
        for c in 0..6 {
            nodes.push_str(&format!("g{r}_{c}\n"));
            if c + 1 < 6 {
                logic.push_str(&format!("g{r}_{c}=g{r}_{}\n", c + 1));
            }
            if r + 1 < 6 {
                logic.push_str(&format!("g{r}_{c}=g{}_{c}\n", r + 1));
            }
        }
    }
    // t hangs off root, so avoiding root leaves the grid sealed.
    logic.push_str(".reachable_from_without t g0_0 root\n");
    let mut graph = build(&nodes, &logic)?;
    assert!(is_requirement_failure(graph.verify()));
    Ok(())
}

#[test]
fn test_orphanless_marks_return_edges() -> Result<()> {
    let mut graph = build("root\na\nb\nc\n", "root=a\na=b\nb=c\n.orphanless b\n")?;
    let b = graph.node_id("b")?;
    for &e in &graph.nodes[b].reverse_edges {
        assert!(graph.edges[e].questionable);
    }
    for &e in &graph.nodes[b].edges {
        assert!(!graph.edges[e].questionable);
    }
    let strict = graph.reachable_with_guarantees(graph.root, true);
    assert!(!strict.reached.contains(&b));
    graph.verify()?;
    Ok(())
}

#[test]
fn test_tags_and_dependencies() -> Result<()> {
    let graph = build(
        "+root\n+hub\na\nb\nc\nd\n",
        "root=hub\nhub=a\nhub=b\n.tag a red\n.tag b red\nd=d\n.dependency c d\n",
    )?;
    let (a, b, c, d) = (
        graph.node_id("a")?,
        graph.node_id("b")?,
        graph.node_id("c")?,
        graph.node_id("d")?,
    );
    assert!(graph.tags_compatible(a, b));
    assert!(!graph.tags_compatible(a, c));
    assert!(!graph.tags_compatible(c, d));
    assert!(graph.nodes[d].tags.contains("d"));
    assert!(graph.dependencies_met(a));
    assert!(!graph.dependencies_met(c));
    Ok(())
}

#[test]
fn test_tag_checks_generated_partners() -> Result<()> {
    let mut graph = build(
        "+root\n+hub\na\nb\nc\n",
        "root=hub\nhub=a\nhub=b\n.tag a red\n.tag c red\n",
    )?;
    let (a, b, c) = (graph.node_id("a")?, graph.node_id("b")?, graph.node_id("c")?);
    graph.connect(a, b);
    assert!(is_requirement_failure(graph.verify()));
    graph.rollback();
    graph.connect(a, c);
    graph.verify()?;
    Ok(())
}

#[test]
fn test_no_return_check() -> Result<()> {
    let mut graph = build("root\na\nb\nc\n", "root=a\na>b\nb=c\n.goal a\n")?;
    assert!(matches!(
        graph.no_return_check(),
        Err(ValidationFailure::NoReturn(ref label)) if label == "b"
    ));

    // The goal is still reachable from the dead end.
    let mut graph = build("root\na\nb\nc\n", "root=a\na>b\nb=c\n.goal c\n")?;
    graph.no_return_check()?;
    Ok(())
}

#[test]
fn test_no_return_when_the_way_back_needs_a_skippable_item() -> Result<()> {
    let mut graph = build("root\nh\nk\nn\n", "root>h\nh=k\nk>root\nh>n\nn>root k\n.goal k\n")?;
    let n = graph.node_id("n")?;
    assert_eq!(graph.points_of_no_return(), NodeSet::from([n]));
    assert!(matches!(
        graph.no_return_check(),
        Err(ValidationFailure::NoReturn(ref label)) if label == "n"
    ));

    // Once k sits on the only route to n the return is safe.
    let mut graph = build("root\nh\nk\nn\n", "root>h\nh=k\nk>root\nk>n\nn>root k\n.goal k\n")?;
    assert!(graph.points_of_no_return().is_empty());
    graph.no_return_check()?;
    Ok(())
}

#[test]
fn test_missing_access_point() -> Result<()> {
    let data = LogicData::parse("root\na\n", "root=a\na=nowhere\n")?;
    match Graph::new(&data, RouterConfig::default()) {
        Err(RouterError::MissingAccessPoint(label)) => assert_eq!(label, "nowhere"),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("graph built with a missing node"),
    }
    Ok(())
}
