//! Retention for the partition tree
//!
//! Cached data lives in `<root>/<project>/<chain>/<fingerprint>/<YYYY-MM-DD>/`.
//! The [`Pruner`] removes whole date partitions, either every partition at
//! least `N` days old or the oldest partitions until the selected namespaces
//! fit a byte budget. Deletion failures are collected in the report instead
//! of aborting the sweep. Manifests are left as they are; entries pointing at
//! removed partitions are treated as absent by readers.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Restricts pruning to some projects and/or chains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionFilter {
    /// Project names to include; `None` means all
    pub projects: Option<BTreeSet<String>>,
    /// Chain names to include; `None` means all
    pub chains: Option<BTreeSet<String>>,
}

impl RetentionFilter {
    /// Build a filter from optional name lists; empty lists mean no restriction
    #[must_use]
    pub fn new(projects: &[String], chains: &[String]) -> Self {
        let set = |names: &[String]| {
            (!names.is_empty()).then(|| names.iter().cloned().collect::<BTreeSet<_>>())
        };
        Self {
            projects: set(projects),
            chains: set(chains),
        }
    }

    fn allows_project(&self, name: &str) -> bool {
        self.projects.as_ref().is_none_or(|s| s.contains(name))
    }

    fn allows_chain(&self, name: &str) -> bool {
        self.chains.as_ref().is_none_or(|s| s.contains(name))
    }
}

/// A partition that could not be removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneFailure {
    /// Partition directory
    pub path: PathBuf,
    /// Error description
    pub error: String,
}

/// Outcome of a prune run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Whether deletions were only simulated
    pub dry_run: bool,
    /// Partitions removed (or that would be removed)
    pub partitions_removed: usize,
    /// Bytes freed (or that would be freed)
    pub bytes_removed: u64,
    /// Size of the selected namespaces before pruning
    pub total_bytes_before: u64,
    /// Size of the selected namespaces after pruning
    pub total_bytes_after: u64,
    /// Removed partition directories
    pub removed: Vec<PathBuf>,
    /// Partitions that failed to delete
    pub errors: Vec<PruneFailure>,
}

#[derive(Debug, Clone)]
struct Partition {
    date: NaiveDate,
    path: PathBuf,
    size: u64,
}

/// Prunes date partitions under a cache root
#[derive(Debug, Clone)]
pub struct Pruner {
    root: PathBuf,
    filter: RetentionFilter,
    dry_run: bool,
}

impl Pruner {
    /// Pruner over every namespace below `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filter: RetentionFilter::default(),
            dry_run: false,
        }
    }

    /// Only consider matching projects and chains
    #[must_use]
    pub fn with_filter(mut self, filter: RetentionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Log intended deletions without performing them
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Remove every partition at least `days` days old
    pub fn by_age(&self, days: u64) -> Result<PruneReport> {
        self.by_age_at(days, Utc::now())
    }

    /// Remove every partition whose UTC midnight is at or before `now - days`
    pub fn by_age_at(&self, days: u64, now: DateTime<Utc>) -> Result<PruneReport> {
        let (partitions, total) = self.scan()?;
        let cutoff = i64::try_from(days)
            .ok()
            .and_then(TimeDelta::try_days)
            .and_then(|age| now.checked_sub_signed(age));

        let mut report = self.report(total);
        let Some(cutoff) = cutoff else {
            return Ok(report);
        };
        for partition in partitions {
            let midnight = partition.date.and_time(chrono::NaiveTime::MIN).and_utc();
            if midnight <= cutoff {
                self.remove(&partition, &mut report);
            }
        }
        report.total_bytes_after = total.saturating_sub(report.bytes_removed);
        Ok(report)
    }

    /// Remove the oldest partitions until the selected namespaces fit `max_bytes`
    pub fn by_size(&self, max_bytes: u64) -> Result<PruneReport> {
        let (mut partitions, total) = self.scan()?;
        let mut report = self.report(total);
        if total <= max_bytes {
            tracing::debug!(total, max_bytes, "Cache within size budget");
            return Ok(report);
        }

        partitions.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));
        let mut current = total;
        for partition in partitions {
            if current <= max_bytes {
                break;
            }
            if self.remove(&partition, &mut report) {
                current = current.saturating_sub(partition.size);
            }
        }
        report.total_bytes_after = current;
        Ok(report)
    }

    fn report(&self, total: u64) -> PruneReport {
        PruneReport {
            dry_run: self.dry_run,
            total_bytes_before: total,
            total_bytes_after: total,
            ..PruneReport::default()
        }
    }

    /// Remove one partition, recording the outcome; true when it is gone
    fn remove(&self, partition: &Partition, report: &mut PruneReport) -> bool {
        if self.dry_run {
            tracing::info!(
                path = %partition.path.display(),
                bytes = partition.size,
                "Would remove partition"
            );
        } else if let Err(e) = fs::remove_dir_all(&partition.path) {
            tracing::warn!(
                path = %partition.path.display(),
                error = %e,
                "Failed to remove partition"
            );
            report.errors.push(PruneFailure {
                path: partition.path.clone(),
                error: e.to_string(),
            });
            return false;
        } else {
            tracing::info!(
                path = %partition.path.display(),
                bytes = partition.size,
                "Removed partition"
            );
        }
        report.partitions_removed += 1;
        report.bytes_removed += partition.size;
        report.removed.push(partition.path.clone());
        true
    }

    /// Collect partitions and the total size of the selected namespaces
    fn scan(&self) -> Result<(Vec<Partition>, u64)> {
        let mut partitions = Vec::new();
        let mut total = 0u64;
        if !self.root.exists() {
            return Ok((partitions, total));
        }

        for (project, project_dir) in subdirs(&self.root)? {
            if !self.filter.allows_project(&project) {
                continue;
            }
            for (chain, chain_dir) in subdirs(&project_dir)? {
                if !self.filter.allows_chain(&chain) {
                    continue;
                }
                for (_, namespace_dir) in subdirs(&chain_dir)? {
                    total += directory_size(&namespace_dir);
                    for (name, path) in subdirs(&namespace_dir)? {
                        if let Some(date) = parse_partition_name(&name) {
                            let size = directory_size(&path);
                            partitions.push(Partition { date, path, size });
                        }
                    }
                }
            }
        }
        Ok((partitions, total))
    }
}

/// Parse a strictly `YYYY-MM-DD` partition name into a calendar date
#[must_use]
pub fn parse_partition_name(name: &str) -> Option<NaiveDate> {
    let bytes = name.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return None;
    }
    NaiveDate::parse_from_str(name, "%Y-%m-%d").ok()
}

/// Child directories of `dir` with their names, in name order
fn subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(e, dir, "read_dir"))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(e, dir, "read_dir_entry"))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.push((name.to_string(), path));
        }
    }
    out.sort();
    Ok(out)
}

/// Total size of all files below `path`; unreadable entries count as zero
fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
