use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::connect::ConnectSummary;
use crate::graph::{ChangeLogEntry, Graph};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OutputEdge {
    pub source: String,
    pub destination: String,
    pub condition: Vec<String>,
    pub generated: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RouterOutput {
    pub seed: u64,
    pub edges: Vec<OutputEdge>,
    pub unconnected: Vec<String>,
    pub ranks: BTreeMap<String, usize>,
    pub summary: String,
    pub changelog: Vec<ChangeLogEntry>,
}

impl RouterOutput {
    pub fn new(graph: &Graph, summary: &ConnectSummary) -> Self {
        let edges = graph
            .all_edges
            .iter()
            .map(|&e| {
                let edge = &graph.edges[e];
                OutputEdge {
                    source: graph.label(edge.source).to_string(),
                    destination: graph.label(edge.destination).to_string(),
                    condition: graph
                        .labels_of(&edge.true_condition)
                        .into_iter()
                        .map(|x| x.to_string())
                        .collect(),
                    generated: edge.generated,
                }
            })
            .collect();
        let ranks = graph
            .nodes
            .iter()
            .filter_map(|n| n.state.rank.map(|r| (n.label.clone(), r)))
            .collect();
        RouterOutput {
            seed: graph.config.seed,
            edges,
            unconnected: graph
                .labels_of(&graph.unconnected)
                .into_iter()
                .map(|x| x.to_string())
                .collect(),
            ranks,
            summary: summary.to_string(),
            changelog: graph.changelog.clone(),
        }
    }

    /// Generated connections only, as `(source, destination)` label pairs.
    pub fn generated_edges(&self) -> Vec<(&str, &str)> {
        self.edges
            .iter()
            .filter(|e| e.generated)
            .map(|e| (e.source.as_str(), e.destination.as_str()))
            .collect()
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("unable to write {}", path.display()))
}

pub fn read_changelog(path: &Path) -> Result<Vec<ChangeLogEntry>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let entries = serde_json::from_str(&json)
        .with_context(|| format!("unable to parse {}", path.display()))?;
    Ok(entries)
}
