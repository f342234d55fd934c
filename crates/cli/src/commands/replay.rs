//! `chainreplay replay`

use super::envelope_json;
use crate::cli::{CliError, EXIT_OK, EXIT_PARTIAL, ReplayArgs};
use chainreplay_cache::{
    CacheConfig, ReplayOptions, ReplaySummary, RunnerRegistry, load_targets, replay_targets,
};
use std::fmt::Write as _;

/// Load the targets file and replay every selected target
pub async fn execute(
    config: &CacheConfig,
    args: &ReplayArgs,
    registry: &RunnerRegistry,
) -> Result<ReplaySummary, CliError> {
    if let (Some(from), Some(to)) = (args.from_block, args.to_block)
        && from > to
    {
        return Err(CliError::config_with_help(
            format!("--from-block {from} is above --to-block {to}"),
            "Swap the bounds or drop one of them",
        ));
    }

    let targets = load_targets(&args.targets)?;
    if targets.is_empty() {
        tracing::warn!(path = %args.targets.display(), "Targets file lists no targets");
    }

    let options = ReplayOptions {
        projects: args.projects.clone(),
        chains: args.chains.clone(),
        from_block: args.from_block,
        to_block: args.to_block,
        concurrency: args.concurrency,
        dry_run: args.dry_run,
    };
    tracing::info!(
        targets = targets.len(),
        concurrency = options.concurrency,
        dry_run = options.dry_run,
        "Starting replay"
    );
    Ok(replay_targets(config, targets, registry, &options).await)
}

/// Text or JSON rendering of a summary
pub fn render(summary: &ReplaySummary, json: bool) -> Result<String, CliError> {
    if json {
        return envelope_json(summary, summary.is_success());
    }

    let mut out = String::new();
    for report in &summary.succeeded {
        let _ = writeln!(
            out,
            "ok    {}/{} ({}, {}): {} files, {} batches{}",
            report.project,
            report.chain,
            report.runner,
            report.config_hash,
            report.files,
            report.batches,
            if report.skipped_files > 0 {
                format!(", {} missing", report.skipped_files)
            } else {
                String::new()
            }
        );
        for path in &report.planned {
            let _ = writeln!(out, "      {}", path.display());
        }
    }
    for failure in &summary.failed {
        let _ = writeln!(out, "FAIL  {}: {}", failure.target, failure.error);
    }
    let _ = write!(
        out,
        "{}{} targets ok, {} failed, {} files, {} batches",
        if summary.dry_run { "[dry run] " } else { "" },
        summary.succeeded.len(),
        summary.failed.len(),
        summary.total_files(),
        summary.total_batches()
    );
    Ok(out)
}

/// Run the command and print its summary to stderr
///
/// Stdout stays free for runners that stream batches.
pub async fn run(
    config: &CacheConfig,
    args: &ReplayArgs,
    registry: &RunnerRegistry,
    json: bool,
) -> Result<i32, CliError> {
    let summary = execute(config, args, registry).await?;
    eprintln!("{}", render(&summary, json)?);
    Ok(if summary.is_success() {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    })
}
