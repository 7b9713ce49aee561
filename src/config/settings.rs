//! Configuration settings for zfsrecomp
//!
//! Defines the CLI surface, the supported ZFS compression codecs, and
//! the resolved configuration handed to the rewrite engine.

use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// ZFS dataset compression codecs the tool will set as a target.
///
/// `Test` is a dry-run sentinel: dataset-mutating commands are logged
/// instead of executed and files are opened read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Pool default compression (`compression=on`)
    On,
    /// No compression
    Off,
    /// gzip at the default level (6)
    Gzip,
    /// gzip at an explicit level, 1-9
    GzipLevel(u8),
    /// lz4
    Lz4,
    /// lzjb
    Lzjb,
    /// zero-length-encoding
    Zle,
    /// Dry-run sentinel
    Test,
}

impl Codec {
    /// True for the dry-run sentinel.
    pub fn is_test(&self) -> bool {
        matches!(self, Codec::Test)
    }

    /// True when the target disables compression.
    pub fn is_off(&self) -> bool {
        matches!(self, Codec::Off)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::On => write!(f, "on"),
            Codec::Off => write!(f, "off"),
            Codec::Gzip => write!(f, "gzip"),
            Codec::GzipLevel(n) => write!(f, "gzip-{}", n),
            Codec::Lz4 => write!(f, "lz4"),
            Codec::Lzjb => write!(f, "lzjb"),
            Codec::Zle => write!(f, "zle"),
            Codec::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("test") {
            return Ok(Codec::Test);
        }
        match s {
            "on" => Ok(Codec::On),
            "off" => Ok(Codec::Off),
            "gzip" => Ok(Codec::Gzip),
            "lz4" => Ok(Codec::Lz4),
            "lzjb" => Ok(Codec::Lzjb),
            "zle" => Ok(Codec::Zle),
            _ => match s.strip_prefix("gzip-").and_then(|l| l.parse::<u8>().ok()) {
                Some(level @ 1..=9) => Ok(Codec::GzipLevel(level)),
                _ => Err(format!(
                    "unsupported or unknown ZFS compression '{}' \
                     (expected on|off|gzip|gzip-1..gzip-9|lz4|lzjb|zle|test)",
                    s
                )),
            },
        }
    }
}

/// zfsrecomp - rewrite files in place under a different ZFS compression codec
#[derive(Parser, Debug, Clone)]
#[command(name = "zfsrecomp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Apply a new ZFS dataset compression codec to existing files")]
#[command(long_about = r#"
zfsrecomp rewrites regular files in place on ZFS datasets so that their
blocks are re-stored under a different dataset-level compression codec.
The dataset's `compression` property is switched to the target codec
for the duration of each rewrite and restored afterwards. A per-file
extended attribute records the codec a file was last rewritten under,
making repeated runs cheap.

Examples:
  zfsrecomp -c -T gzip-6 /tank/data            # recompress a tree
  zfsrecomp -c -T lz4 -J8 -S /tank/data        # 8 fully-concurrent workers
  zfsrecomp -c -T test -v /tank/data           # dry run, show what would happen
"#)]
pub struct CliArgs {
    /// Apply compression (without this the tool is read-only)
    #[arg(short = 'c')]
    pub compress: bool,

    /// Target compression codec, or 'test' for a dry run
    #[arg(short = 'T', value_name = "CODEC", default_value = "test")]
    pub target: Codec,

    /// Largest file size to rewrite, in bytes (0 = unlimited)
    #[arg(short = 'm', value_name = "SIZE", default_value_t = 0)]
    pub max_size: u64,

    /// Rewrite with N worker threads (0 = one per CPU); disk I/O is
    /// exclusive
    #[arg(short = 'j', value_name = "N")]
    pub jobs_exclusive: Option<usize>,

    /// Rewrite with N worker threads (0 = one per CPU); everything is
    /// concurrent
    #[arg(short = 'J', value_name = "N")]
    pub jobs_concurrent: Option<usize>,

    /// Sort the work queue ascending by file size
    #[arg(short = 'S')]
    pub sort_by_size: bool,

    /// M of the workers consume the (sorted) queue from the tail,
    /// starting with the largest files
    #[arg(short = 'R', value_name = "M", default_value_t = 0)]
    pub reverse: usize,

    /// Make a backup of each file before rewriting it (single-threaded)
    #[arg(short = 'b')]
    pub backup: bool,

    /// Follow symbolic links; rewrite the target if it is a regular file
    #[arg(short = 'L')]
    pub follow_symlinks: bool,

    /// Detect hard links and process each inode only once
    #[arg(short = 'f')]
    pub detect_hard_links: bool,

    /// Do not verify file contents after rewriting (not recommended)
    #[arg(short = 'n')]
    pub no_verify: bool,

    /// Allow rewriting even when the marker or dataset codec already
    /// matches the target (undo mode)
    #[arg(short = 'F')]
    pub allow_recompress: bool,

    /// Restore the original dataset compression only at the end
    /// instead of as soon as each dataset goes idle
    #[arg(short = 'q')]
    pub no_quick_reset: bool,

    /// List files which fail to rewrite
    #[arg(short = 'l')]
    pub list_failures: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Files and directories to process
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,
}

/// Resolved configuration for a rewrite run.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Whether rewriting is enabled at all (`-c`)
    pub apply: bool,
    /// Target codec
    pub target: Codec,
    /// Largest file size to rewrite; 0 means unlimited
    pub max_size: u64,
    /// Verify contents after rewriting
    pub verify: bool,
    /// Back up each file before rewriting
    pub backup: bool,
    /// Follow symbolic links
    pub follow_symlinks: bool,
    /// Skip hard-linked duplicates
    pub detect_hard_links: bool,
    /// Rewrite even when the marker or dataset already matches
    pub allow_recompress: bool,
    /// Restore dataset codecs as soon as their refcount drops to zero
    pub quick_reset: bool,
    /// Serialize the read+write section across workers
    pub exclusive_io: bool,
    /// Sort the queue ascending by size before dispatch
    pub sort_by_size: bool,
    /// Number of worker threads
    pub workers: usize,
    /// Workers assigned to the tail of the queue
    pub reverse_workers: usize,
    /// List files which fail to rewrite
    pub list_failures: bool,
    /// Verbosity level
    pub verbose: u8,
}

impl RewriteConfig {
    /// Build a configuration from parsed CLI arguments, validating
    /// flag combinations the same way the usage text promises.
    pub fn from_cli(args: &CliArgs) -> std::result::Result<Self, String> {
        if !args.compress
            && (args.backup
                || args.jobs_exclusive.is_some()
                || args.jobs_concurrent.is_some()
                || args.sort_by_size
                || args.reverse > 0
                || args.no_quick_reset)
        {
            return Err("options -b, -j, -J, -S, -R and -q require -c".to_string());
        }
        if args.jobs_exclusive.is_some() && args.jobs_concurrent.is_some() {
            return Err("options -j and -J are mutually exclusive".to_string());
        }

        let (mut workers, exclusive_io) = match (args.jobs_exclusive, args.jobs_concurrent) {
            (Some(n), _) => (n, true),
            (None, Some(n)) => (n, false),
            (None, None) => (1, true),
        };
        if workers == 0 {
            workers = num_cpus::get().max(1);
        }

        let mut reverse = args.reverse;
        if reverse > 0 && !args.sort_by_size {
            tracing::warn!("reverse workers are ignored when the queue is not sorted (-S)");
            reverse = 0;
        }
        if reverse > workers {
            reverse = workers;
        }

        if args.backup && workers > 1 {
            tracing::warn!("using backup files imposes single-threaded processing");
            workers = 1;
            reverse = reverse.min(1);
        }

        Ok(Self {
            apply: args.compress,
            target: args.target,
            max_size: args.max_size,
            verify: !args.no_verify,
            backup: args.backup,
            follow_symlinks: args.follow_symlinks,
            detect_hard_links: args.detect_hard_links,
            allow_recompress: args.allow_recompress,
            quick_reset: !args.no_quick_reset,
            exclusive_io,
            sort_by_size: args.sort_by_size,
            workers,
            reverse_workers: reverse,
            list_failures: args.list_failures,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs::parse_from(["zfsrecomp", "-c", "/tank/data"])
    }

    #[test]
    fn test_codec_round_trip() {
        for name in [
            "on", "off", "gzip", "gzip-1", "gzip-9", "lz4", "lzjb", "zle", "test",
        ] {
            let codec: Codec = name.parse().unwrap();
            assert_eq!(codec.to_string(), name);
        }
    }

    #[test]
    fn test_codec_rejects_unknown() {
        assert!("zstd".parse::<Codec>().is_err());
        assert!("gzip-0".parse::<Codec>().is_err());
        assert!("gzip-10".parse::<Codec>().is_err());
        assert!("".parse::<Codec>().is_err());
    }

    #[test]
    fn test_codec_test_is_case_insensitive() {
        assert_eq!("TEST".parse::<Codec>().unwrap(), Codec::Test);
        assert_eq!("Test".parse::<Codec>().unwrap(), Codec::Test);
        // other codec names are matched exactly
        assert!("LZ4".parse::<Codec>().is_err());
    }

    #[test]
    fn test_backup_forces_single_worker() {
        let mut args = base_args();
        args.backup = true;
        args.jobs_concurrent = Some(8);
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert_eq!(config.workers, 1);
        assert!(!config.exclusive_io);
    }

    #[test]
    fn test_reverse_requires_sort() {
        let mut args = base_args();
        args.jobs_exclusive = Some(4);
        args.reverse = 2;
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert_eq!(config.reverse_workers, 0);

        args.sort_by_size = true;
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert_eq!(config.reverse_workers, 2);
    }

    #[test]
    fn test_reverse_clamped_to_workers() {
        let mut args = base_args();
        args.jobs_exclusive = Some(2);
        args.sort_by_size = true;
        args.reverse = 5;
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert_eq!(config.reverse_workers, 2);
    }

    #[test]
    fn test_rewrite_flags_require_compress() {
        let mut args = CliArgs::parse_from(["zfsrecomp", "/tank/data"]);
        args.backup = true;
        assert!(RewriteConfig::from_cli(&args).is_err());
    }

    #[test]
    fn test_exclusive_io_selection() {
        let mut args = base_args();
        args.jobs_exclusive = Some(4);
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert!(config.exclusive_io);
        assert_eq!(config.workers, 4);

        let mut args = base_args();
        args.jobs_concurrent = Some(4);
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert!(!config.exclusive_io);
    }

    #[test]
    fn test_zero_workers_means_auto_detect() {
        let mut args = base_args();
        args.jobs_concurrent = Some(0);
        let config = RewriteConfig::from_cli(&args).unwrap();
        assert!(config.workers >= 1);
        assert!(!config.exclusive_io);
    }

    #[test]
    fn test_default_is_single_exclusive_worker() {
        let config = RewriteConfig::from_cli(&base_args()).unwrap();
        assert_eq!(config.workers, 1);
        assert!(config.exclusive_io);
        assert!(config.verify);
        assert!(config.quick_reset);
        assert_eq!(config.target, Codec::Test);
    }
}
