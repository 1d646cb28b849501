use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Decode: image 0.25 (png, jpeg, tiff, tga, webp)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Windowed image cache: navigation simulator and benchmark
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Glob pattern selecting images, e.g. "shots/*.png"
    #[arg(value_name = "PATTERN", conflicts_with = "synthetic")]
    pub pattern: Option<String>,

    /// Generate N synthetic items instead of reading files
    #[arg(short = 's', long = "synthetic", value_name = "N")]
    pub synthetic: Option<usize>,

    /// Synthetic image size
    #[arg(long = "size", value_names = ["W", "H"], num_args = 2, default_values_t = [256u32, 256u32])]
    pub size: Vec<u32>,

    /// Simulated decode time for synthetic items
    #[arg(long = "latency-ms", value_name = "MS", default_value_t = 2)]
    pub latency_ms: u64,

    /// Base window size W (overrides config)
    #[arg(short = 'w', long = "window", value_name = "N")]
    pub window: Option<usize>,

    /// Memory ceiling in MB, 0 = auto (overrides config)
    #[arg(short = 'm', long = "max-mem", value_name = "MB")]
    pub max_mem: Option<usize>,

    /// Decode threads, 0 = CPU count (overrides config)
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Concurrent preloads, 0 = auto (overrides config)
    #[arg(long = "concurrent", value_name = "N")]
    pub concurrent: Option<usize>,

    /// Shrink to 50% of the memory limit under pressure instead of 75%
    #[arg(short = 'a', long = "aggressive")]
    pub aggressive: bool,

    /// Sequential steps to simulate
    #[arg(long = "steps", value_name = "N", default_value_t = 200)]
    pub steps: usize,

    /// Random jumps to simulate
    #[arg(long = "jumps", value_name = "N", default_value_t = 10)]
    pub jumps: usize,

    /// Delay between sequential steps
    #[arg(long = "step-ms", value_name = "MS", default_value_t = 5)]
    pub step_ms: u64,

    /// Seed for jump targets
    #[arg(long = "seed", value_name = "N")]
    pub seed: Option<u64>,

    /// Print final statistics as JSON
    #[arg(long = "json")]
    pub json: bool,

    /// Write the effective configuration back to the config file
    #[arg(long = "save-config")]
    pub save_config: bool,

    /// Enable logging to file (default: imgwin.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["imgwin", "--synthetic", "1000"]);
        assert_eq!(args.synthetic, Some(1000));
        assert_eq!(args.size, vec![256, 256]);
        assert_eq!(args.steps, 200);
        assert!(args.log_file.is_none());
        assert_eq!(args.verbosity, 0);
    }

    #[test]
    fn test_log_flag_optional_value() {
        let args = Args::parse_from(["imgwin", "-vv", "--log", "-s", "10"]);
        assert_eq!(args.log_file, Some(None));
        assert_eq!(args.verbosity, 2);

        let args = Args::parse_from(["imgwin", "--log", "out.log", "-s", "10"]);
        assert_eq!(args.log_file, Some(Some(PathBuf::from("out.log"))));
    }

    #[test]
    fn test_pattern_conflicts_with_synthetic() {
        assert!(Args::try_parse_from(["imgwin", "*.png", "--synthetic", "5"]).is_err());
    }
}
