//! Loads a [`SimConfig`] from an optional TOML file, falling back to the
//! fully-defaulted configuration when no path is given.

use std::path::Path;

use anyhow::Context;
use psim_config::SimConfig;

pub fn load(path: Option<&Path>) -> anyhow::Result<SimConfig> {
    let Some(path) = path else {
        return Ok(SimConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    SimConfig::from_toml_str(&raw).with_context(|| format!("parsing configuration file {}", path.display()))
}
