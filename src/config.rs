use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Kernel-construction knobs for the collective execution core.
///
/// These mirror environment toggles of the surrounding runtime; they change
/// how device work is batched, never the numeric result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollConfig {
    /// Reduce directly from peer memory with an aligned + leftover kernel
    /// pair instead of staging peer segments through separate copies.
    pub reduce_scatter_monolithic_kernel: bool,
    /// Merge all per-peer reductions into a single kernel launch.
    pub enable_single_reduce_kernel: bool,
    /// Broadcast the reduced block with an aligned + leftover kernel pair
    /// instead of one copy per peer.
    pub all_gather_monolithic_kernel: bool,
    /// Pull-based all-gather. Not implemented for the all-to-all allreduce
    /// path; rejected at entry initialization.
    pub all_gather_topo_read: bool,
}

impl Default for CollConfig {
    fn default() -> Self {
        CollConfig {
            reduce_scatter_monolithic_kernel: false,
            enable_single_reduce_kernel: false,
            all_gather_monolithic_kernel: false,
            all_gather_topo_read: false,
        }
    }
}

impl CollConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gives_defaults() {
        let config: CollConfig = toml::from_str("").unwrap();
        assert!(!config.reduce_scatter_monolithic_kernel);
        assert!(!config.enable_single_reduce_kernel);
        assert!(!config.all_gather_monolithic_kernel);
        assert!(!config.all_gather_topo_read);
    }

    #[test]
    fn parse_flags() {
        let text = "reduce_scatter_monolithic_kernel = true\nall_gather_monolithic_kernel = true\n";
        let config: CollConfig = toml::from_str(text).unwrap();
        assert!(config.reduce_scatter_monolithic_kernel);
        assert!(config.all_gather_monolithic_kernel);
        assert!(!config.enable_single_reduce_kernel);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<CollConfig>("no_such_flag = true\n").is_err());
    }
}
