pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load and parse the config file.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    parse(&raw).with_context(|| format!("cannot parse config file {}", path.display()))
}

pub fn parse(raw: &str) -> Result<Config> {
    let config: Config = toml::from_str(raw)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.session.cluster_size > 0
        && config.session.cluster_node >= config.session.cluster_size
    {
        anyhow::bail!(
            "session.cluster_node {} out of range for cluster_size {}",
            config.session.cluster_node,
            config.session.cluster_size
        );
    }
    for listener in &config.listeners {
        if let Some(tls) = &listener.tls {
            if tls.cert_db_dir.as_os_str().is_empty() {
                anyhow::bail!("listener {}: empty cert_db_dir", listener.address);
            }
        }
    }
    Ok(())
}
