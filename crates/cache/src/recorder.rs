//! Recorder facade tying namespaces, codec, manifest and coverage together

use crate::batch::{Batch, normalize_batches};
use crate::codec::{BatchReader, FileHeader, batch_file_name, read_batch_file, write_batch_file};
use crate::config::{CacheConfig, Mode};
use crate::coverage::{self, SwapPolicy};
use crate::identity::{fingerprint, namespace_path, validate_segment};
use crate::lock::LockOptions;
use crate::manifest::{ManifestEntry, ManifestStore, ReplayFile};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Partition directory format (UTC calendar date)
pub const PARTITION_FORMAT: &str = "%Y-%m-%d";

/// Records and replays batches for one `(project, chain, identity)` namespace
///
/// Cloning is cheap and clones share nothing but configuration; every
/// operation goes back to disk.
#[derive(Debug, Clone)]
pub struct Recorder {
    root: PathBuf,
    project: String,
    chain: String,
    config_hash: String,
    mode: Mode,
    policy: SwapPolicy,
    lock_options: LockOptions,
    namespace_dir: PathBuf,
    store: ManifestStore,
    cancel: Option<CancellationToken>,
}

/// Summary of what a namespace holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStats {
    /// Number of manifest entries
    pub files: usize,
    /// Lowest recorded height
    pub min_block: Option<u64>,
    /// Highest recorded height
    pub max_block: Option<u64>,
}

impl Recorder {
    /// Create a recorder for the namespace derived from `identity`
    ///
    /// Project and chain names are validated before anything touches disk.
    pub fn new(
        config: &CacheConfig,
        project: &str,
        chain: &str,
        identity: &Value,
    ) -> Result<Self> {
        validate_segment("project", project)?;
        validate_segment("chain", chain)?;

        let config_hash = fingerprint(project, chain, identity);
        let namespace_dir = namespace_path(&config.root, project, chain, &config_hash);
        let store = ManifestStore::in_dir(&namespace_dir, config.lock.clone());
        Ok(Self {
            root: config.root.clone(),
            project: project.to_string(),
            chain: chain.to_string(),
            config_hash,
            mode: config.mode,
            policy: SwapPolicy {
                auto_use: config.auto_use,
                require_full_coverage: config.require_full_coverage,
            },
            lock_options: config.lock.clone(),
            namespace_dir,
            store,
            cancel: None,
        })
    }

    /// Override the recording mode
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the cache root
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self.namespace_dir =
            namespace_path(&self.root, &self.project, &self.chain, &self.config_hash);
        self.store = self.manifest_store();
        self
    }

    /// Abort manifest lock waits once `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self.store = self.manifest_store();
        self
    }

    /// Override the auto-swap policy
    #[must_use]
    pub fn with_swap_policy(mut self, policy: SwapPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project name
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Chain name
    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Namespace fingerprint
    #[must_use]
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Current mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Directory holding this namespace's manifest and partitions
    #[must_use]
    pub fn namespace_dir(&self) -> &Path {
        &self.namespace_dir
    }

    /// Normalize and record raw pipeline batches
    pub fn record_batch(&self, raw: &[Value]) -> Result<Option<ManifestEntry>> {
        if !self.should_record(raw.len()) {
            return Ok(None);
        }
        let batches = normalize_batches(raw)?;
        self.record_batches(batches)
    }

    /// Record already normalized batches into today's partition
    pub fn record_batches(&self, batches: Vec<Batch>) -> Result<Option<ManifestEntry>> {
        self.record_batches_at(batches, Utc::now())
    }

    /// Record batches into the partition for the UTC date of `at`
    pub fn record_batches_at(
        &self,
        batches: Vec<Batch>,
        at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>> {
        if !self.should_record(batches.len()) {
            return Ok(None);
        }
        let (Some(first), Some(last)) = (batches.first(), batches.last()) else {
            return Ok(None);
        };
        let (min_block, max_block) = (first.height(), last.height());

        let partition = at.format(PARTITION_FORMAT).to_string();
        let partition_dir = self.namespace_dir.join(&partition);
        fs::create_dir_all(&partition_dir)
            .map_err(|e| Error::io(e, &partition_dir, "create_dir_all"))?;

        let file_name = batch_file_name(min_block, max_block);
        let path = partition_dir.join(&file_name);
        let header = FileHeader::new(
            &self.project,
            &self.chain,
            &self.config_hash,
            min_block,
            max_block,
        );
        write_batch_file(&path, &header, &batches)?;

        let entry = ManifestEntry {
            path: format!("{partition}/{file_name}"),
            min_block,
            max_block,
        };
        self.store.update(|mut manifest| {
            manifest.upsert(entry.clone());
            Ok(manifest)
        })?;

        tracing::info!(
            project = %self.project,
            chain = %self.chain,
            path = %entry.path,
            min_block,
            max_block,
            batches = batches.len(),
            "Recorded batches"
        );
        Ok(Some(entry))
    }

    /// Recorded files with absolute paths, ordered by first height
    pub fn list_replay_files(&self) -> Result<Vec<ReplayFile>> {
        self.store.list()
    }

    /// Open a recorded file, skipping its header
    pub fn read_file(&self, path: &Path) -> Result<BatchReader> {
        read_batch_file(path, true)
    }

    /// Replace live batches with cached ones when coverage allows
    pub fn auto_swap_blocks(&self, live: Vec<Batch>) -> Result<Vec<Batch>> {
        if !self.policy.auto_use || live.is_empty() {
            return Ok(live);
        }
        let files = self.list_replay_files()?;
        coverage::auto_swap(live, &files, self.policy, |path| {
            self.read_file(path)?.read_all()
        })
    }

    /// Number of recorded files and the block span they cover
    pub fn stats(&self) -> Result<RecorderStats> {
        let files = self.list_replay_files()?;
        Ok(RecorderStats {
            files: files.len(),
            min_block: files.iter().map(|f| f.min_block).min(),
            max_block: files.iter().map(|f| f.max_block).max(),
        })
    }

    fn manifest_store(&self) -> ManifestStore {
        let store = ManifestStore::in_dir(&self.namespace_dir, self.lock_options.clone());
        match &self.cancel {
            Some(token) => store.with_cancellation(token.clone()),
            None => store,
        }
    }

    fn should_record(&self, count: usize) -> bool {
        if !self.mode.is_recording() {
            tracing::debug!(
                project = %self.project,
                chain = %self.chain,
                mode = %self.mode,
                "Recording disabled, skipping batches"
            );
            return false;
        }
        if count == 0 {
            tracing::debug!(project = %self.project, chain = %self.chain, "No batches to record");
            return false;
        }
        true
    }
}
