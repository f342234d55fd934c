//! chainreplay binary

// CLI binary needs to output to stdout/stderr - this is intentional
#![allow(clippy::print_stdout, clippy::print_stderr)]

use chainreplay_cache::CacheConfig;
use chainreplay_cache::config::ENV_CACHE_DIR;
use chainreplay_cli::cli::{self, Cli, CliError, Commands, EXIT_OK, exit_code_for, render_error};
use chainreplay_cli::commands;
use chainreplay_cli::runners::builtin_registry;
use chainreplay_cli::tracing::{Level, LogLevel, TracingConfig, init_tracing};

fn main() {
    // Tracing may be unusable during a panic, so report directly.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();
    let json = cli.json;
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            render_error(&err, json);
            exit_code_for(&err)
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32, CliError> {
    let json = cli.json;
    // --root stands in for CHAINREPLAY_CACHE_DIR so root probing honours it
    let root = cli.root.as_ref().map(|p| p.display().to_string());
    let config = CacheConfig::from_lookup(|key| match (key, &root) {
        (ENV_CACHE_DIR, Some(root)) => Some(root.clone()),
        _ => std::env::var(key).ok(),
    })?;

    let level = match cli.level {
        Some(level) => level,
        None => config
            .log_level
            .as_deref()
            .map(str::parse::<LogLevel>)
            .transpose()
            .map_err(|e| {
                CliError::config_with_help(e, "Use one of trace, debug, info, warn, error")
            })?
            .unwrap_or(LogLevel::Warn),
    };
    init_tracing(TracingConfig {
        format: cli.log_format,
        level: Level::from(level),
        filter: cli.log_filter.clone(),
    })
    .map_err(|e| CliError::config(e.to_string()))?;

    let span = chainreplay_cli::command_span!(match &cli.command {
        Commands::Replay(_) => "replay",
        Commands::Cleanup(_) => "cleanup",
    });
    let _guard = span.enter();
    tracing::debug!(root = %config.root.display(), mode = %config.mode, "Configuration loaded");

    match cli.command {
        Commands::Cleanup(args) => commands::cleanup::run(&config, &args, json),
        Commands::Replay(args) => run_with_tokio(|| async move {
            commands::replay::run(&config, &args, &builtin_registry(), json).await
        }),
    }
}

/// Create a tokio runtime and drive `f` to completion
fn run_with_tokio<F, Fut>(f: F) -> Result<i32, CliError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<i32, CliError>>,
{
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::cache(format!("failed to create tokio runtime: {e}")))?;
    let code = rt.block_on(f())?;
    tracing::debug!(exit_code = code, ok = code == EXIT_OK, "Command finished");
    Ok(code)
}
