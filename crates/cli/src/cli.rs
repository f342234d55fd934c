//! Command-line definitions, exit codes and error rendering

use clap::{ArgGroup, Args, Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Success exit code
pub const EXIT_OK: i32 = 0;
/// At least one replay target or prune candidate failed
pub const EXIT_PARTIAL: i32 = 1;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Cache error exit code
pub const EXIT_CACHE: i32 = 3;

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("Configuration error: {message}")]
    #[diagnostic(code(chainreplay::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Cache operation error (exit code 3)
    #[error("Cache error: {message}")]
    #[diagnostic(code(chainreplay::cli::cache))]
    Cache {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new cache error
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            help: None,
        }
    }
}

impl From<chainreplay_cache::Error> for CliError {
    fn from(err: chainreplay_cache::Error) -> Self {
        let help = err.help().map(|h| h.to_string());
        match err {
            chainreplay_cache::Error::Configuration { message } => Self::Config { message, help },
            other => Self::Cache {
                message: other.to_string(),
                help,
            },
        }
    }
}

/// Exit code for an error
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Cache { .. } => EXIT_CACHE,
    }
}

/// Success response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct OkEnvelope<T> {
    /// Status indicator; "ok", or "partial" when some work failed
    pub status: &'static str,
    /// The actual data payload
    pub data: T,
}

impl<T> OkEnvelope<T> {
    /// Envelope for a run where every unit succeeded
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }

    /// Envelope for a run where some units failed
    #[must_use]
    pub const fn partial(data: T) -> Self {
        Self {
            status: "partial",
            data,
        }
    }
}

/// Error response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope<E> {
    /// Status indicator, always "error"
    pub status: &'static str,
    /// The error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Create a new error envelope
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// Render error appropriately based on JSON flag
pub fn render_error(err: &CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": match err {
                CliError::Config { .. } => "config",
                CliError::Cache { .. } => "cache",
            },
            "message": err.to_string()
        }));
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(_) => eprintln!("Error serializing error response"),
        }
    } else {
        let report = Report::new(err.clone());
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}

/// Record/replay cache maintenance for blockchain indexers
#[derive(Parser, Debug)]
#[command(name = "chainreplay", version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Logging verbosity level; falls back to CHAINREPLAY_LOG_LEVEL, then warn.
    #[arg(short = 'l', long, global = true, value_enum)]
    pub level: Option<crate::tracing::LogLevel>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "compact")]
    pub log_format: crate::tracing::TracingFormat,

    /// Tracing filter directives (e.g. `chainreplay_cache=trace`); overrides RUST_LOG and --level.
    #[arg(long, global = true, value_name = "DIRECTIVES")]
    pub log_filter: Option<String>,

    /// Emit a JSON envelope instead of a text summary.
    #[arg(long, global = true)]
    pub json: bool,

    /// Cache root; overrides CHAINREPLAY_CACHE_DIR.
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay recorded batches through configured runners.
    Replay(ReplayArgs),
    /// Delete old partitions or shrink the cache to a size budget.
    Cleanup(CleanupArgs),
}

/// Arguments for `chainreplay replay`
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ReplayArgs {
    /// JSON file listing `{project, chain, runner, configIdentity}` targets.
    #[arg(long, short = 't', value_name = "FILE")]
    pub targets: PathBuf,

    /// Only replay these projects (repeatable).
    #[arg(long = "project", short = 'p', value_name = "NAME")]
    pub projects: Vec<String>,

    /// Only replay these chains (repeatable).
    #[arg(long = "chain", short = 'c', value_name = "NAME")]
    pub chains: Vec<String>,

    /// Skip blocks below this height.
    #[arg(long, value_name = "HEIGHT")]
    pub from_block: Option<u64>,

    /// Skip blocks above this height.
    #[arg(long, value_name = "HEIGHT")]
    pub to_block: Option<u64>,

    /// Targets replayed at once.
    #[arg(long, default_value_t = chainreplay_cache::replay::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// List the files that would be replayed without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `chainreplay cleanup`
#[derive(Args, Debug, Clone, PartialEq, Eq)]
#[command(group(ArgGroup::new("policy").required(true).multiple(true).args(["max_age_days", "max_size"])))]
pub struct CleanupArgs {
    /// Remove date partitions at least this many days old.
    #[arg(long, value_name = "DAYS")]
    pub max_age_days: Option<u64>,

    /// Shrink the cache below this size (e.g. 500MB, 2GiB, 1048576).
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub max_size: Option<u64>,

    /// Only prune these projects (repeatable).
    #[arg(long = "project", short = 'p', value_name = "NAME")]
    pub projects: Vec<String>,

    /// Only prune these chains (repeatable).
    #[arg(long = "chain", short = 'c', value_name = "NAME")]
    pub chains: Vec<String>,

    /// Report what would be removed without deleting.
    #[arg(long)]
    pub dry_run: bool,
}

/// Parse a byte size such as `1048576`, `500MB` or `2GiB`
///
/// Decimal suffixes (`KB`, `MB`, `GB`, `TB`) are powers of 1000, binary
/// suffixes (`KiB`, `MiB`, `GiB`, `TiB`) powers of 1024. Case-insensitive.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size '{input}': expected a number"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{input}': {e}"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "mb" | "m" => 1_000_000,
        "gb" | "g" => 1_000_000_000,
        "tb" | "t" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        other => return Err(format!("invalid size '{input}': unknown unit '{other}'")),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("invalid size '{input}': too large"))
}

/// Parse process arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracing::{LogLevel, TracingFormat};

    #[test]
    fn replay_arguments() {
        let cli = Cli::try_parse_from([
            "chainreplay",
            "replay",
            "--targets",
            "targets.json",
            "-p",
            "dex",
            "--project",
            "nft",
            "--chain",
            "mainnet",
            "--from-block",
            "100",
            "--to-block",
            "200",
            "--concurrency",
            "8",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.targets, PathBuf::from("targets.json"));
        assert_eq!(args.projects, vec!["dex", "nft"]);
        assert_eq!(args.chains, vec!["mainnet"]);
        assert_eq!(args.from_block, Some(100));
        assert_eq!(args.to_block, Some(200));
        assert_eq!(args.concurrency, 8);
        assert!(args.dry_run);
    }

    #[test]
    fn replay_defaults() {
        let cli = Cli::try_parse_from(["chainreplay", "replay", "-t", "t.json"]).unwrap();
        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(
            args.concurrency,
            chainreplay_cache::replay::DEFAULT_CONCURRENCY
        );
        assert!(!args.dry_run);
        assert!(args.projects.is_empty());
        assert!(cli.level.is_none());
        assert_eq!(cli.log_format, TracingFormat::Compact);
    }

    #[test]
    fn replay_requires_targets() {
        assert!(Cli::try_parse_from(["chainreplay", "replay"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "chainreplay",
            "cleanup",
            "--max-age-days",
            "7",
            "--root",
            "/tmp/cache",
            "-l",
            "debug",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(cli.level, Some(LogLevel::Debug));
        assert!(cli.json);
        assert!(cli.log_filter.is_none());
    }

    #[test]
    fn log_format_and_filter_flags() {
        let cli = Cli::try_parse_from([
            "chainreplay",
            "--log-format",
            "json",
            "--log-filter",
            "chainreplay_cache=trace",
            "replay",
            "-t",
            "t.json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, TracingFormat::Json);
        assert_eq!(cli.log_filter.as_deref(), Some("chainreplay_cache=trace"));
        assert!(
            Cli::try_parse_from(["chainreplay", "--log-format", "loud", "replay", "-t", "t"])
                .is_err()
        );
    }

    #[test]
    fn cleanup_needs_a_policy() {
        assert!(Cli::try_parse_from(["chainreplay", "cleanup"]).is_err());
        assert!(Cli::try_parse_from(["chainreplay", "cleanup", "--dry-run"]).is_err());

        let cli = Cli::try_parse_from([
            "chainreplay",
            "cleanup",
            "--max-age-days",
            "30",
            "--max-size",
            "2GiB",
            "-c",
            "mainnet",
        ])
        .unwrap();
        let Commands::Cleanup(args) = cli.command else {
            panic!("expected cleanup");
        };
        assert_eq!(args.max_age_days, Some(30));
        assert_eq!(args.max_size, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(args.chains, vec!["mainnet"]);
    }

    #[test]
    fn size_units() {
        assert_eq!(parse_size("1048576"), Ok(1_048_576));
        assert_eq!(parse_size("500MB"), Ok(500_000_000));
        assert_eq!(parse_size("500mb"), Ok(500_000_000));
        assert_eq!(parse_size("2GiB"), Ok(2 << 30));
        assert_eq!(parse_size(" 3 KiB "), Ok(3 * 1024));
        assert_eq!(parse_size("1TB"), Ok(1_000_000_000_000));
        assert_eq!(parse_size("10b"), Ok(10));
    }

    #[test]
    fn size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("-5").is_err());
        assert!(parse_size("99999999999TiB").is_err());
    }

    #[test]
    fn cache_errors_map_to_exit_codes() {
        let cfg: CliError = chainreplay_cache::Error::configuration("no root").into();
        assert_eq!(exit_code_for(&cfg), EXIT_CLI);
        assert!(cfg.to_string().contains("no root"));

        let io: CliError = chainreplay_cache::Error::io_no_path(
            std::io::Error::other("disk gone"),
            "write",
        )
        .into();
        assert_eq!(exit_code_for(&io), EXIT_CACHE);
        assert!(matches!(io, CliError::Cache { help: Some(_), .. }));
    }

    #[test]
    fn envelopes() {
        assert_eq!(OkEnvelope::new(1).status, "ok");
        assert_eq!(OkEnvelope::partial(1).status, "partial");
        let json = serde_json::to_value(ErrorEnvelope::new("x")).unwrap();
        assert_eq!(json["status"], "error");
    }
}
