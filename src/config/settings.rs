//! CLI arguments and runtime options
//!
//! Defines the clap command surface, the runtime [`SyncOptions`] built
//! from it, and the size/duration/age parsers used by flag values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// skysync - sync files between cloud object stores and local filesystems
#[derive(Parser, Debug, Clone)]
#[command(name = "skysync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sync files and directories between storage backends")]
#[command(long_about = r#"
skysync reconciles a destination tree toward a source tree with minimal
transfers. Source and destination are scheme-qualified paths of the form
remote-name:sub/path, where remote-name is a section in the config file;
a bare path means the local filesystem.

Examples:
  skysync sync /home/me/photos backup:photos     # make dest match source
  skysync copy backup:photos restored/           # copy without deleting
  skysync --dry-run sync src: dst:               # show what would happen
  skysync check /data mirror:data                # compare, never modify
"#)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Bandwidth limit in bytes/s (e.g. 512k, 10M), 0 for unlimited
    #[arg(long, global = true, value_name = "SIZE")]
    pub bwlimit: Option<String>,

    /// Number of equality checkers to run in parallel
    #[arg(long, global = true, default_value = "8", value_name = "N")]
    pub checkers: usize,

    /// Number of file transfers to run in parallel
    #[arg(long, global = true, default_value = "4", value_name = "N")]
    pub transfers: usize,

    /// Compare checksums instead of mod times to decide equality
    #[arg(short = 'c', long, global = true)]
    pub checksum: bool,

    /// Compare sizes only, never mod times or checksums
    #[arg(long, global = true)]
    pub size_only: bool,

    /// Skip all files that already exist on the destination
    #[arg(long, global = true)]
    pub ignore_existing: bool,

    /// Config file location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Connection establishment timeout
    #[arg(long, global = true, default_value = "1m", value_name = "DUR")]
    pub contimeout: String,

    /// Inactivity timeout on in-flight transfers
    #[arg(long, global = true, default_value = "5m", value_name = "DUR")]
    pub timeout: String,

    /// Do a trial run with no permanent changes
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Maximum mod-time difference still treated as equal
    #[arg(long, global = true, default_value = "1ns", value_name = "DUR")]
    pub modify_window: String,

    /// Retry the whole operation this many times
    #[arg(long, global = true, default_value = "3", value_name = "N")]
    pub retries: usize,

    /// Interval between stats printouts (0 to disable)
    #[arg(long, global = true, default_value = "1m", value_name = "DUR")]
    pub stats: String,

    /// Delete extraneous destination files before transferring
    #[arg(long, global = true, conflicts_with_all = ["delete_during", "delete_after"])]
    pub delete_before: bool,

    /// Delete extraneous destination files while transferring (default)
    #[arg(long, global = true, conflicts_with_all = ["delete_before", "delete_after"])]
    pub delete_during: bool,

    /// Delete extraneous destination files only after all transfers succeed
    #[arg(long, global = true, conflicts_with_all = ["delete_before", "delete_during"])]
    pub delete_after: bool,

    /// Also delete destination files excluded by the filters
    #[arg(long, global = true)]
    pub delete_excluded: bool,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all non-error output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Write log output to a file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Do not verify TLS certificates (HTTP backends)
    #[arg(long, global = true)]
    pub no_check_certificate: bool,

    /// Exclude files matching pattern
    #[arg(long, global = true, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Read exclude patterns from file
    #[arg(long, global = true, value_name = "FILE")]
    pub exclude_from: Vec<PathBuf>,

    /// Include files matching pattern
    #[arg(long, global = true, value_name = "PATTERN")]
    pub include: Vec<String>,

    /// Read include patterns from file
    #[arg(long, global = true, value_name = "FILE")]
    pub include_from: Vec<PathBuf>,

    /// Add a filter rule: '+ PATTERN', '- PATTERN' or '!' to clear
    #[arg(long, global = true, value_name = "RULE")]
    pub filter: Vec<String>,

    /// Read filter rules from file
    #[arg(long, global = true, value_name = "FILE")]
    pub filter_from: Vec<PathBuf>,

    /// Read a manifest of literal paths to transfer
    #[arg(long, global = true, value_name = "FILE")]
    pub files_from: Vec<PathBuf>,

    /// Skip files smaller than this
    #[arg(long, global = true, value_name = "SIZE")]
    pub min_size: Option<String>,

    /// Skip files larger than this
    #[arg(long, global = true, value_name = "SIZE")]
    pub max_size: Option<String>,

    /// Skip files younger than this
    #[arg(long, global = true, value_name = "DUR")]
    pub min_age: Option<String>,

    /// Skip files older than this
    #[arg(long, global = true, value_name = "DUR")]
    pub max_age: Option<String>,

    /// Print the active filter rules and exit
    #[arg(long, global = true)]
    pub dump_filters: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Copy source to destination, skipping identical files
    Copy {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        destination: String,
    },
    /// Make destination identical to source, deleting extraneous files
    Sync {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        destination: String,
    },
    /// Move files from source to destination
    Move {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        destination: String,
    },
    /// Check that source and destination match, changing nothing
    Check {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        destination: String,
    },
    /// List objects with sizes
    Ls {
        /// Remote or path
        remote: String,
    },
    /// List directories
    Lsd {
        /// Remote or path
        remote: String,
    },
    /// List objects with sizes and modification times
    Lsl {
        /// Remote or path
        remote: String,
    },
    /// Print MD5 checksums of all objects
    Md5sum {
        /// Remote or path
        remote: String,
    },
    /// Print SHA-1 checksums of all objects
    Sha1sum {
        /// Remote or path
        remote: String,
    },
    /// Total object count and size
    Size {
        /// Remote or path
        remote: String,
    },
    /// Create the directory (container, bucket) if it doesn't exist
    Mkdir {
        /// Remote or path
        remote: String,
    },
    /// Remove the directory if empty
    Rmdir {
        /// Remote or path
        remote: String,
    },
    /// Remove the directory and all its contents
    Purge {
        /// Remote or path
        remote: String,
    },
    /// Delete the files matching the filters
    Delete {
        /// Remote or path
        remote: String,
    },
    /// Show the configured remotes
    Config,
    /// Show version
    Version,
}

/// Delete phase ordering relative to transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Fully enumerate and execute deletions before any transfer
    Before,
    /// Interleave deletions with transfers (default)
    #[default]
    During,
    /// Buffer deletions and run them only after every transfer succeeds
    After,
}

/// Runtime option set built from the CLI
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Parallel equality checkers
    pub checkers: usize,
    /// Parallel transfer workers
    pub transfers: usize,
    /// Bandwidth cap in bytes/s, None for unlimited
    pub bwlimit: Option<u64>,
    /// Compare by checksum instead of mod time
    pub checksum: bool,
    /// Compare by size only
    pub size_only: bool,
    /// Skip files already present on the destination
    pub ignore_existing: bool,
    /// Trial run, no mutations
    pub dry_run: bool,
    /// Configured mod-time comparison window
    pub modify_window: Duration,
    /// Whole-run retry count
    pub retries: usize,
    /// Stats reporter interval, None disables
    pub stats_interval: Option<Duration>,
    /// Delete phase ordering
    pub delete_mode: DeleteMode,
    /// Excluded destination files become deletion candidates
    pub delete_excluded: bool,
    /// Connection establishment deadline for backend transports
    pub contimeout: Duration,
    /// In-flight transfer inactivity watchdog
    pub timeout: Duration,
    /// Verbosity level
    pub verbose: u8,
    /// Suppress non-error output
    pub quiet: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkers: 8,
            transfers: 4,
            bwlimit: None,
            checksum: false,
            size_only: false,
            ignore_existing: false,
            dry_run: false,
            modify_window: Duration::from_nanos(1),
            retries: 3,
            stats_interval: Some(Duration::from_secs(60)),
            delete_mode: DeleteMode::During,
            delete_excluded: false,
            contimeout: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
            verbose: 0,
            quiet: false,
        }
    }
}

impl SyncOptions {
    /// Build runtime options from parsed CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, String> {
        let bwlimit = match &args.bwlimit {
            Some(s) => {
                let limit = parse_size(s).map_err(|e| format!("Invalid --bwlimit: {}", e))?;
                if limit == 0 {
                    None
                } else {
                    Some(limit as u64)
                }
            }
            None => None,
        };

        let stats = parse_duration(&args.stats).map_err(|e| format!("Invalid --stats: {}", e))?;
        let delete_mode = if args.delete_before {
            DeleteMode::Before
        } else if args.delete_after {
            DeleteMode::After
        } else {
            DeleteMode::During
        };

        Ok(Self {
            checkers: if args.checkers == 0 {
                num_cpus::get()
            } else {
                args.checkers
            },
            transfers: if args.transfers == 0 {
                num_cpus::get()
            } else {
                args.transfers
            },
            bwlimit,
            checksum: args.checksum,
            size_only: args.size_only,
            ignore_existing: args.ignore_existing,
            dry_run: args.dry_run,
            modify_window: parse_duration(&args.modify_window)
                .map_err(|e| format!("Invalid --modify-window: {}", e))?,
            retries: args.retries.max(1),
            stats_interval: if stats.is_zero() { None } else { Some(stats) },
            delete_mode,
            delete_excluded: args.delete_excluded,
            contimeout: parse_duration(&args.contimeout)
                .map_err(|e| format!("Invalid --contimeout: {}", e))?,
            timeout: parse_duration(&args.timeout)
                .map_err(|e| format!("Invalid --timeout: {}", e))?,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }
}

/// Parse a human-readable size string to bytes, binary prefixes
pub fn parse_size(size: &str) -> Result<i64, String> {
    let size = size.trim();
    if size.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = match size.chars().last().unwrap() {
        'k' | 'K' => (&size[..size.len() - 1], 1i64 << 10),
        'm' | 'M' => (&size[..size.len() - 1], 1i64 << 20),
        'g' | 'G' => (&size[..size.len() - 1], 1i64 << 30),
        _ => (size, 1i64),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err("size must be a non-negative number".to_string());
    }

    Ok((num * multiplier as f64) as i64)
}

// Suffix tables; longer suffixes listed first so "ms" wins over "s"
const DURATION_UNITS: &[(&str, f64)] = &[
    ("ns", 1e-9),
    ("us", 1e-6),
    ("µs", 1e-6),
    ("ms", 1e-3),
    ("s", 1.0),
    ("m", 60.0),
    ("h", 3600.0),
];

const AGE_UNITS: &[(&str, f64)] = &[
    ("ms", 1e-3),
    ("s", 1.0),
    ("m", 60.0),
    ("h", 3600.0),
    ("d", 86400.0),
    ("w", 7.0 * 86400.0),
    ("M", 30.0 * 86400.0),
    ("y", 365.0 * 86400.0),
];

fn parse_with_units(text: &str, units: &[(&str, f64)]) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration string".to_string());
    }

    for (suffix, scale) in units {
        if let Some(num_str) = text.strip_suffix(suffix) {
            // Guard against "ms" being split as "m" + "s" by checking the
            // remaining text parses as a bare number
            if let Ok(num) = num_str.trim().parse::<f64>() {
                return to_duration(num * scale);
            }
        }
    }

    // Bare numbers are seconds
    let num: f64 = text
        .parse()
        .map_err(|_| format!("invalid duration: {}", text))?;
    to_duration(num)
}

fn to_duration(seconds: f64) -> Result<Duration, String> {
    if seconds < 0.0 {
        return Err("duration must be non-negative".to_string());
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}

/// Parse a duration with `ns us µs ms s m h` suffixes
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    parse_with_units(text, DURATION_UNITS)
}

/// Parse an age with the extended `d w M y` suffixes
pub fn parse_age(text: &str) -> Result<Duration, String> {
    parse_with_units(text, AGE_UNITS)
}
