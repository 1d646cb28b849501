use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment override for the config directory
pub const CONFIG_DIR_ENV: &str = "IMGWIN_CONFIG_DIR";

/// Overrides for default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (IMGWIN_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. IMGWIN_CONFIG_DIR environment variable
/// 3. Local folder IF imgwin.json or imgwin.log exist there
/// 4. Platform config directory from dirs-next
///
/// Platform paths:
/// - Linux: ~/.config/imgwin/{name}
/// - macOS: ~/Library/Application Support/imgwin/{name}
/// - Windows: %APPDATA%\imgwin\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    config_dir(config).join(name)
}

/// Path to a data file (logs)
///
/// Same priority as `config_file`, falling back to the platform data dir.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve(config, dirs_next::data_dir()).join(name)
}

/// Create the config directory if missing
pub fn ensure_config_dir(config: &PathConfig) -> Result<PathBuf> {
    let dir = config_dir(config);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    }
    Ok(dir)
}

fn has_local_config_files(dir: &Path) -> bool {
    ["imgwin.json", "imgwin.log"].iter().any(|f| dir.join(f).exists())
}

fn config_dir(config: &PathConfig) -> PathBuf {
    resolve(config, dirs_next::config_dir())
}

fn resolve(config: &PathConfig, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_config_files(&current_dir) {
            return current_dir;
        }
    }
    match platform {
        Some(dir) => dir.join("imgwin"),
        None => PathBuf::from("."),
    }
}
