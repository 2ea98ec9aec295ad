use anyhow::{Context, Result};
use clap::Parser;
use doorrouter::connect::{build_graph, summarize, ConnectSummary, Validators};
use doorrouter::graph::Graph;
use doorrouter::output::{read_changelog, write_json, RouterOutput};
use doorrouter::settings::{load_router_config, RouterConfig};
use doorrouter_logic::LogicData;
use log::info;
use std::path::{Path, PathBuf};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    nodes: PathBuf,

    #[arg(long)]
    logic: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_attempts: Option<usize>,

    /// Rebuild from a saved changelog instead of searching.
    #[arg(long)]
    replay_changelog: Option<PathBuf>,

    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    output_changelog: Option<PathBuf>,
}

fn get_config(args: &Args) -> Result<RouterConfig> {
    let mut config = match &args.config {
        Some(path) => load_router_config(path)?,
        None => RouterConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.max_attempts.is_some() {
        config.max_build_attempts = args.max_attempts;
    }
    Ok(config)
}

fn replay(data: &LogicData, config: RouterConfig, path: &Path) -> Result<(Graph, ConnectSummary)> {
    let entries = read_changelog(path)?;
    let mut graph = Graph::new(data, config)?;
    graph
        .replay(&entries)
        .with_context(|| format!("unable to replay {}", path.display()))?;
    let summary = summarize(&mut graph, 0);
    Ok((graph, summary))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let config = get_config(&args)?;
    let data = LogicData::load(&args.nodes, &args.logic)?;

    let (graph, summary) = match &args.replay_changelog {
        Some(path) => replay(&data, config, path)?,
        None => build_graph(&data, &config, &Validators::default())?,
    };
    info!("Final seed {}:\n{summary}", graph.config.seed);

    let output = RouterOutput::new(&graph, &summary);
    if let Some(output_path) = &args.output {
        println!("Writing output to {}", output_path.display());
        write_json(output_path, &output)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    if let Some(changelog_path) = &args.output_changelog {
        println!("Writing changelog to {}", changelog_path.display());
        write_json(changelog_path, &graph.changelog)?;
    }
    Ok(())
}
