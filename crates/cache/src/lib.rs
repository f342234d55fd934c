//! Record/replay cache for blockchain indexing batches
//!
//! Indexing pipelines process blocks in batches (a block header plus its logs
//! and transactions). This crate lets a pipeline:
//! - record every batch it processes into compressed, namespaced files
//! - replay those batches later without going back to the remote source
//! - substitute cached batches for live ones when coverage is provable
//! - keep the accumulated cache within age or size limits
//!
//! # Layout
//!
//! ```text
//! <root>/<project>/<chain>/<fingerprint>/
//!   manifest.json
//!   manifest.json.lock
//!   <YYYY-MM-DD>/<minBlock>-<maxBlock>.ndjson.gz
//! ```
//!
//! The fingerprint is derived from the project, the chain and a
//! caller-supplied identity value (see [`identity::fingerprint`]), so
//! pipelines with different configurations never share data.
//!
//! # Entry points
//!
//! - [`Recorder`] for recording, listing and auto-swapping one namespace
//! - [`Pruner`] for retention over a whole cache root
//! - [`replay_targets`] for replaying many namespaces through [`Runner`]s

#![expect(
    clippy::missing_errors_doc,
    reason = "Every fallible function returns the crate Error"
)]

pub mod batch;
pub mod codec;
pub mod config;
pub mod coverage;
mod error;
pub mod identity;
pub mod lock;
pub mod manifest;
pub mod recorder;
pub mod replay;
pub mod retention;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use batch::{Batch, BlockHeader, Log, Transaction, normalize_batch, normalize_batches};
pub use codec::{BatchReader, FileHeader, read_batch_file, write_batch_file};
pub use config::{CacheConfig, Mode};
pub use coverage::{BlockRange, SwapPolicy};
pub use lock::{LockGuard, LockOptions, LockOwner, acquire_lock};
pub use manifest::{Manifest, ManifestEntry, ManifestStore, ReplayFile};
pub use recorder::{Recorder, RecorderStats};
pub use replay::{
    ReplayOptions, ReplaySummary, ReplayTarget, Runner, RunnerRegistry, TargetFailure,
    TargetReport, load_targets, parse_targets, replay_targets,
};
pub use retention::{PruneFailure, PruneReport, Pruner, RetentionFilter};
