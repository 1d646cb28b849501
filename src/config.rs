//! Loader configuration
//!
//! Every field is runtime-mutable through `Navigator::apply_config`.
//! Persisted as JSON; missing fields fall back to defaults so older files
//! keep loading.

use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::core::EvictionOrder;
use crate::paths::{self, PathConfig};

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "imgwin.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Base window W; the adaptive table scales the half-window from it
    pub window_size: usize,
    /// Preloads allowed in flight at once (0 = 3/4 of the CPU count)
    pub max_concurrent_loads: usize,
    /// Memory ceiling for resident images (0 = auto from available RAM)
    pub max_memory_mb: usize,
    /// Shrink to 50% of the limit under pressure instead of 75%
    pub aggressive_memory_management: bool,
    pub cache_count_limit: usize,
    /// 0 = same as the memory ceiling
    pub cache_cost_limit_mb: usize,
    pub eviction_order: EvictionOrder,
    /// Decode threads (0 = CPU count)
    pub worker_threads: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            max_concurrent_loads: 0,
            max_memory_mb: 0,
            aggressive_memory_management: false,
            cache_count_limit: 1000,
            cache_cost_limit_mb: 0,
            eviction_order: EvictionOrder::Lru,
            worker_threads: 0,
        }
    }
}

impl LoaderConfig {
    pub fn effective_max_concurrent(&self) -> usize {
        match self.max_concurrent_loads {
            0 => (num_cpus::get() * 3 / 4).max(1),
            n => n,
        }
    }

    pub fn effective_worker_threads(&self) -> usize {
        match self.worker_threads {
            0 => num_cpus::get().max(2),
            n => n,
        }
    }

    /// Read from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Read from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Default location: `<config_dir>/imgwin.json`
    pub fn default_path(paths: &PathConfig) -> std::path::PathBuf {
        paths::config_file(CONFIG_FILE, paths)
    }
}
