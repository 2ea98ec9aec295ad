use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub seed: u64,
    /// Fraction of connectable nodes that must end up connected.
    pub map_size: f64,
    /// Lower fraction accepted once no further ADD is possible.
    pub map_strictness: f64,
    pub skip_complex_nodes: f64,
    pub avoid_softlocks: bool,
    pub lazy_complex_nodes: bool,
    pub goal_based_missables: bool,
    pub retry_limit: usize,
    pub retry_limit_close: usize,
    /// Seconds.
    pub time_limit: u64,
    pub fg_cache_limit: usize,
    pub no_logic: bool,
    pub use_reduction: bool,
    pub max_build_attempts: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            seed: 0,
            map_size: 1.0,
            map_strictness: 0.8,
            skip_complex_nodes: 0.0,
            avoid_softlocks: true,
            lazy_complex_nodes: false,
            goal_based_missables: true,
            retry_limit: 10000,
            retry_limit_close: 1000,
            time_limit: 600,
            fg_cache_limit: 16,
            no_logic: false,
            use_reduction: true,
            max_build_attempts: None,
        }
    }
}

impl RouterConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("map_size", self.map_size),
            ("map_strictness", self.map_strictness),
            ("skip_complex_nodes", self.skip_complex_nodes),
        ] {
            ensure!(
                (0.0..=1.0).contains(&value),
                "{name} must be between 0 and 1, got {value}"
            );
        }
        ensure!(self.fg_cache_limit > 0, "fg_cache_limit must be positive");
        Ok(())
    }
}

pub fn parse_router_config(config_json: &str) -> Result<RouterConfig> {
    let mut des = serde_json::Deserializer::from_str(config_json);
    let config: RouterConfig = serde_path_to_error::deserialize(&mut des)?;
    config.validate()?;
    Ok(config)
}

pub fn load_router_config(path: &Path) -> Result<RouterConfig> {
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    parse_router_config(&config_str).with_context(|| format!("unable to parse {}", path.display()))
}
