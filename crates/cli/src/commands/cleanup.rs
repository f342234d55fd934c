//! `chainreplay cleanup`

use super::{envelope_json, format_bytes};
use crate::cli::{CleanupArgs, CliError, EXIT_OK, EXIT_PARTIAL};
use chainreplay_cache::{CacheConfig, PruneReport, Pruner, RetentionFilter};
use serde::Serialize;
use std::fmt::Write as _;

/// Reports of the policies that ran, age first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    /// Result of `--max-age-days`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_age: Option<PruneReport>,
    /// Result of `--max-size`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_size: Option<PruneReport>,
}

impl CleanupSummary {
    fn reports(&self) -> impl Iterator<Item = (&'static str, &PruneReport)> {
        [("age", self.by_age.as_ref()), ("size", self.by_size.as_ref())]
            .into_iter()
            .filter_map(|(name, report)| report.map(|r| (name, r)))
    }

    /// True when every selected partition was removed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reports().all(|(_, r)| r.errors.is_empty())
    }
}

/// Apply the age policy, then the size policy
pub fn execute(config: &CacheConfig, args: &CleanupArgs) -> Result<CleanupSummary, CliError> {
    let pruner = Pruner::new(&config.root)
        .with_filter(RetentionFilter::new(&args.projects, &args.chains))
        .dry_run(args.dry_run);

    let mut summary = CleanupSummary::default();
    if let Some(days) = args.max_age_days {
        summary.by_age = Some(pruner.by_age(days)?);
    }
    if let Some(max) = args.max_size {
        summary.by_size = Some(pruner.by_size(max)?);
    }
    Ok(summary)
}

/// Text or JSON rendering of a summary
pub fn render(summary: &CleanupSummary, json: bool) -> Result<String, CliError> {
    if json {
        return envelope_json(summary, summary.is_success());
    }

    let mut out = String::new();
    for (policy, report) in summary.reports() {
        let verb = if report.dry_run { "would remove" } else { "removed" };
        let _ = writeln!(
            out,
            "{policy}: {verb} {} partitions ({}), {} -> {}",
            report.partitions_removed,
            format_bytes(report.bytes_removed),
            format_bytes(report.total_bytes_before),
            format_bytes(report.total_bytes_after),
        );
        for path in &report.removed {
            let _ = writeln!(out, "  - {}", path.display());
        }
        for failure in &report.errors {
            let _ = writeln!(out, "  ! {}: {}", failure.path.display(), failure.error);
        }
    }
    Ok(out.trim_end().to_string())
}

/// Run the command and print its summary
pub fn run(config: &CacheConfig, args: &CleanupArgs, json: bool) -> Result<i32, CliError> {
    let summary = execute(config, args)?;
    println!("{}", render(&summary, json)?);
    Ok(if summary.is_success() {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainreplay_cache::{Mode, Recorder, normalize_batches};
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn args() -> CleanupArgs {
        CleanupArgs {
            max_age_days: None,
            max_size: None,
            projects: Vec::new(),
            chains: Vec::new(),
            dry_run: false,
        }
    }

    fn seed(config: &CacheConfig, days_ago: i64, lo: u64) {
        let rec = Recorder::new(config, "dex", "mainnet", &json!({}))
            .unwrap()
            .with_mode(Mode::Record);
        let batches = normalize_batches(&[json!({"height": lo}), json!({"height": lo + 1})]).unwrap();
        rec.record_batches_at(batches, Utc::now() - TimeDelta::days(days_ago))
            .unwrap();
    }

    #[test]
    fn age_policy_removes_old_partitions() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path());
        seed(&config, 40, 1);
        seed(&config, 1, 10);

        let mut a = args();
        a.max_age_days = Some(30);
        let summary = execute(&config, &a).unwrap();
        assert!(summary.is_success());
        assert!(summary.by_size.is_none());
        assert_eq!(summary.by_age.as_ref().unwrap().partitions_removed, 1);

        let text = render(&summary, false).unwrap();
        assert!(text.starts_with("age: removed 1 partitions"));
    }

    #[test]
    fn dry_run_keeps_files_and_reports_both_policies() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path());
        seed(&config, 40, 1);
        seed(&config, 1, 10);

        let mut a = args();
        a.max_age_days = Some(30);
        a.max_size = Some(0);
        a.dry_run = true;
        let summary = execute(&config, &a).unwrap();
        assert_eq!(summary.by_age.as_ref().unwrap().partitions_removed, 1);
        assert_eq!(summary.by_size.as_ref().unwrap().partitions_removed, 2);

        let rec = Recorder::new(&config, "dex", "mainnet", &json!({})).unwrap();
        assert!(rec.list_replay_files().unwrap().iter().all(|f| f.path.exists()));

        let text = render(&summary, false).unwrap();
        assert!(text.contains("age: would remove 1 partitions"));
        assert!(text.contains("size: would remove 2 partitions"));

        let json: serde_json::Value =
            serde_json::from_str(&render(&summary, true).unwrap()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["byAge"]["dryRun"], true);
        assert_eq!(json["data"]["bySize"]["partitionsRemoved"], 2);
    }

    #[test]
    fn filter_limits_scope() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path());
        seed(&config, 40, 1);

        let mut a = args();
        a.max_age_days = Some(30);
        a.projects = vec!["other".into()];
        let summary = execute(&config, &a).unwrap();
        assert_eq!(summary.by_age.unwrap().partitions_removed, 0);
    }

    #[test]
    fn empty_root_is_fine() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path().join("never-created"));
        let mut a = args();
        a.max_size = Some(1);
        let summary = execute(&config, &a).unwrap();
        assert_eq!(summary.by_size.unwrap(), PruneReport::default());
    }
}
