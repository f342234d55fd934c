//! Replay of recorded namespaces through pluggable runners
//!
//! A replay run takes a list of [`ReplayTarget`]s, resolves each target's
//! runner from a [`RunnerRegistry`] and feeds it the recorded batches one file
//! at a time. Targets run concurrently inside a bounded window; one failing
//! target never stops the others.

use crate::batch::Batch;
use crate::config::{CacheConfig, Mode};
use crate::coverage::BlockRange;
use crate::manifest::ReplayFile;
use crate::recorder::{Recorder, RecorderStats};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default number of targets replayed at once
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Consumer of replayed batches
#[async_trait]
pub trait Runner: Send + Sync {
    /// Handle the batches of one recorded file, in height order
    async fn replay(&self, project: &str, chain: &str, batches: Vec<Batch>) -> Result<()>;
}

/// Named runners available to a replay run
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `runner` under `name`, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, runner: Arc<dyn Runner>) -> &mut Self {
        self.runners.insert(name.into(), runner);
        self
    }

    /// Builder form of [`RunnerRegistry::register`]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        self.register(name, runner);
        self
    }

    /// Look up a runner by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Runner>> {
        self.runners
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRunner {
                name: name.to_string(),
            })
    }

    /// Registered runner names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("runners", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A namespace to replay and the runner consuming it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTarget {
    /// Project name
    pub project: String,
    /// Chain name
    pub chain: String,
    /// Runner name in the registry
    pub runner: String,
    /// Identity value the namespace was recorded with
    #[serde(default)]
    pub config_identity: Value,
}

impl ReplayTarget {
    /// `project/chain` label used in logs and reports
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.project, self.chain)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetsDocument {
    List(Vec<ReplayTarget>),
    Wrapped { targets: Vec<ReplayTarget> },
}

/// Parse a targets document: a JSON array or `{"targets": [...]}`
pub fn parse_targets(json: &str) -> Result<Vec<ReplayTarget>> {
    let doc: TargetsDocument = serde_json::from_str(json)
        .map_err(|e| Error::configuration(format!("invalid targets document: {e}")))?;
    Ok(match doc {
        TargetsDocument::List(targets) | TargetsDocument::Wrapped { targets } => targets,
    })
}

/// Read and parse a targets file
pub fn load_targets(path: &Path) -> Result<Vec<ReplayTarget>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
    parse_targets(&content)
}

/// Knobs for a replay run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Only replay these projects (all when empty)
    pub projects: Vec<String>,
    /// Only replay these chains (all when empty)
    pub chains: Vec<String>,
    /// Skip heights below this block
    pub from_block: Option<u64>,
    /// Skip heights above this block
    pub to_block: Option<u64>,
    /// Maximum number of targets replayed at once
    pub concurrency: usize,
    /// Plan only; runners are not invoked
    pub dry_run: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            chains: Vec::new(),
            from_block: None,
            to_block: None,
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
        }
    }
}

impl ReplayOptions {
    fn selects(&self, target: &ReplayTarget) -> bool {
        (self.projects.is_empty() || self.projects.contains(&target.project))
            && (self.chains.is_empty() || self.chains.contains(&target.chain))
    }

    fn range(&self) -> BlockRange {
        BlockRange::new(
            self.from_block.unwrap_or(0),
            self.to_block.unwrap_or(u64::MAX),
        )
    }
}

/// Per-target result of a successful replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    /// Project name
    pub project: String,
    /// Chain name
    pub chain: String,
    /// Runner name
    pub runner: String,
    /// Namespace fingerprint
    pub config_hash: String,
    /// Files replayed (or planned, for a dry run)
    pub files: usize,
    /// Batches handed to the runner
    pub batches: usize,
    /// Manifest entries whose file was missing
    pub skipped_files: usize,
    /// Files that would be replayed; only filled for a dry run
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<PathBuf>,
    /// Namespace contents; only filled for a dry run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RecorderStats>,
}

/// A target that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    /// `project/chain` label
    pub target: String,
    /// Error description
    pub error: String,
}

/// Outcome of a replay run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    /// Whether the run was a dry run
    pub dry_run: bool,
    /// Targets that completed
    pub succeeded: Vec<TargetReport>,
    /// Targets that failed
    pub failed: Vec<TargetFailure>,
}

impl ReplaySummary {
    /// True when no target failed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Batches replayed across all targets
    #[must_use]
    pub fn total_batches(&self) -> usize {
        self.succeeded.iter().map(|r| r.batches).sum()
    }

    /// Files replayed across all targets
    #[must_use]
    pub fn total_files(&self) -> usize {
        self.succeeded.iter().map(|r| r.files).sum()
    }
}

/// Replay every selected target, at most `options.concurrency` at a time
pub async fn replay_targets(
    config: &CacheConfig,
    targets: Vec<ReplayTarget>,
    registry: &RunnerRegistry,
    options: &ReplayOptions,
) -> ReplaySummary {
    let mut summary = ReplaySummary {
        dry_run: options.dry_run,
        ..ReplaySummary::default()
    };
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut join_set = JoinSet::new();

    for target in targets.into_iter().filter(|t| options.selects(t)) {
        let label = target.label();
        let runner = match registry.get(&target.runner) {
            Ok(runner) => runner,
            Err(e) => {
                tracing::error!(namespace = %label, runner = %target.runner, "Unknown runner");
                summary.failed.push(TargetFailure {
                    target: label,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let config = config.clone();
        let options = options.clone();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire().await;
            let result = replay_target(&config, &target, runner, &options).await;
            (label, result)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(report))) => summary.succeeded.push(report),
            Ok((target, Err(e))) => {
                tracing::error!(namespace = %target, error = %e, "Replay failed");
                summary.failed.push(TargetFailure {
                    target,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Replay task panicked");
                summary.failed.push(TargetFailure {
                    target: "<unknown>".to_string(),
                    error: format!("task failed: {e}"),
                });
            }
        }
    }

    summary
        .succeeded
        .sort_by(|a, b| (&a.project, &a.chain).cmp(&(&b.project, &b.chain)));
    summary.failed.sort_by(|a, b| a.target.cmp(&b.target));
    summary
}

async fn replay_target(
    config: &CacheConfig,
    target: &ReplayTarget,
    runner: Arc<dyn Runner>,
    options: &ReplayOptions,
) -> Result<TargetReport> {
    let label = target.label();
    let recorder = Recorder::new(config, &target.project, &target.chain, &target.config_identity)?
        .with_mode(Mode::Replay);
    let range = options.range();

    let files: Vec<ReplayFile> = blocking(&label, {
        let recorder = recorder.clone();
        move || recorder.list_replay_files()
    })
    .await?
    .into_iter()
    .filter(|f| BlockRange::from(f).intersects(&range))
    .collect();

    let mut report = TargetReport {
        project: target.project.clone(),
        chain: target.chain.clone(),
        runner: target.runner.clone(),
        config_hash: recorder.config_hash().to_string(),
        files: 0,
        batches: 0,
        skipped_files: 0,
        planned: Vec::new(),
        stats: None,
    };

    if options.dry_run {
        report.stats = Some(
            blocking(&label, {
                let recorder = recorder.clone();
                move || recorder.stats()
            })
            .await?,
        );
        report.files = files.len();
        report.planned = files.into_iter().map(|f| f.path).collect();
        tracing::info!(namespace = %label, files = report.files, "Replay planned");
        return Ok(report);
    }

    for file in files {
        let read = blocking(&label, {
            let recorder = recorder.clone();
            let path = file.path.clone();
            move || recorder.read_file(&path)?.read_all()
        })
        .await;
        let batches: Vec<Batch> = match read {
            Ok(batches) => batches
                .into_iter()
                .filter(|b| range.contains(b.height()))
                .collect(),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    namespace = %label,
                    path = %file.path.display(),
                    "Recorded file is missing, skipping"
                );
                report.skipped_files += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if batches.is_empty() {
            continue;
        }

        let count = batches.len();
        tracing::debug!(
            namespace = %label,
            path = %file.path.display(),
            batches = count,
            "Replaying file"
        );
        runner
            .replay(&target.project, &target.chain, batches)
            .await?;
        report.files += 1;
        report.batches += count;
    }

    tracing::info!(
        namespace = %label,
        files = report.files,
        batches = report.batches,
        skipped = report.skipped_files,
        "Replay complete"
    );
    Ok(report)
}

/// Run blocking cache I/O off the async workers
async fn blocking<T, F>(label: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::runner(label, format!("blocking task failed: {e}")))?
}
