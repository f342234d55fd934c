//! Per-namespace index of recorded batch files
//!
//! Every access goes through [`ManifestStore`], which holds the manifest lock
//! for the duration of the read or read-modify-write cycle. A missing or
//! unreadable manifest is treated as empty.

use crate::lock::{FileLock, LockOptions};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Manifest file name inside a namespace directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Lock marker file name inside a namespace directory
pub const MANIFEST_LOCK_FILE: &str = "manifest.json.lock";

/// One recorded batch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Path relative to the namespace directory, `/`-separated
    pub path: String,
    /// Height of the first batch in the file
    pub min_block: u64,
    /// Height of the last batch in the file
    pub max_block: u64,
}

/// Manifest document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Recorded files, sorted by `min_block`
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Add an entry, replacing any entry for the same path
    pub fn upsert(&mut self, entry: ManifestEntry) {
        self.files.retain(|e| e.path != entry.path);
        self.files.push(entry);
    }

    fn sort(&mut self) {
        self.files.sort_by_key(|e| e.min_block);
    }
}

/// A manifest entry resolved against its namespace directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFile {
    /// Absolute path of the batch file
    pub path: PathBuf,
    /// Height of the first batch
    pub min_block: u64,
    /// Height of the last batch
    pub max_block: u64,
}

/// Locked access to one namespace's manifest
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    lock: FileLock,
}

impl ManifestStore {
    /// Store for the manifest at `path`; its lock lives next to it
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        let path = path.into();
        let lock_path = path.with_file_name(MANIFEST_LOCK_FILE);
        Self {
            path,
            lock: FileLock::new(lock_path, lock_options),
        }
    }

    /// Store for the manifest of the namespace at `dir`
    #[must_use]
    pub fn in_dir(dir: &Path, lock_options: LockOptions) -> Self {
        Self::new(dir.join(MANIFEST_FILE), lock_options)
    }

    /// Abort lock waits as soon as `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.lock = self.lock.with_cancellation(token);
        self
    }

    /// Manifest file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock marker path
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Read the manifest under the lock, resolving entries to absolute paths
    pub fn list(&self) -> Result<Vec<ReplayFile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let manifest = {
            let _guard = self.lock.acquire()?;
            self.read()
        };
        let base = self.base_dir();
        Ok(manifest
            .files
            .into_iter()
            .map(|entry| ReplayFile {
                path: base.join(&entry.path),
                min_block: entry.min_block,
                max_block: entry.max_block,
            })
            .collect())
    }

    /// Read-modify-write the manifest under the lock
    ///
    /// The lock is released on every exit path; an error from `mutate` is
    /// returned unchanged and leaves the manifest untouched.
    pub fn update<F>(&self, mutate: F) -> Result<Manifest>
    where
        F: FnOnce(Manifest) -> Result<Manifest>,
    {
        let _guard = self.lock.acquire()?;
        let mut manifest = mutate(self.read())?;
        manifest.sort();
        self.write(&manifest)?;
        Ok(manifest)
    }

    fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    fn read(&self) -> Manifest {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Manifest::default(),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read manifest, treating as empty"
                );
                return Manifest::default();
            }
        };
        match serde_json::from_slice(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupt manifest, treating as empty"
                );
                Manifest::default()
            }
        }
    }

    fn write(&self, manifest: &Manifest) -> Result<()> {
        let dir = self.base_dir();
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;

        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| Error::serialization(format!("Failed to encode manifest: {e}")))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".manifest-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| Error::io(e, &dir, "create_temp"))?;
        tmp.write_all(&json)
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io(e.error, &self.path, "rename"))?;
        Ok(())
    }
}
