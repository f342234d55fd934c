//! Error types for the replay cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::lock::LockOwner;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(chainreplay::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or required-input error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(chainreplay::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A raw batch could not be normalized
    #[error("Invalid batch field `{field}`: {message}")]
    #[diagnostic(
        code(chainreplay::cache::validation),
        help("Batches need a block height under header.height, header.number or blockNumber")
    )]
    Validation {
        /// Field that failed validation
        field: String,
        /// What was wrong with it
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(chainreplay::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Manifest lock could not be acquired within the configured budget
    #[error(
        "Timed out after {waited_ms}ms waiting for lock {}{}",
        path.display(),
        holder.as_ref().map_or(String::new(), |h| format!(" (held by pid {} on {} since {}, age {}ms)", h.pid, h.host, h.at, lock_age_ms.unwrap_or_default()))
    )]
    #[diagnostic(
        code(chainreplay::cache::lock_timeout),
        help("Another process is updating this namespace; retry later or remove the lock file if its holder is gone")
    )]
    LockTimeout {
        /// Lock file path
        path: Box<Path>,
        /// Metadata of the current holder, if the lock file was readable
        holder: Option<LockOwner>,
        /// Age of the contended lock file in milliseconds
        lock_age_ms: Option<u64>,
        /// Total time spent waiting in milliseconds
        waited_ms: u64,
    },

    /// Lock wait aborted through the cancellation hook
    #[error("Lock wait cancelled: {}", path.display())]
    #[diagnostic(code(chainreplay::cache::lock_cancelled))]
    LockCancelled {
        /// Lock file path
        path: Box<Path>,
    },

    /// A replay target references a runner that was never registered
    #[error("Unknown runner `{name}`")]
    #[diagnostic(
        code(chainreplay::replay::unknown_runner),
        help("Register the runner before replaying or fix the `runner` field of the target")
    )]
    UnknownRunner {
        /// Runner name from the target declaration
        name: String,
    },

    /// A runner reported a failure while replaying batches
    #[error("Runner failed for {target}: {message}")]
    #[diagnostic(code(chainreplay::replay::runner))]
    Runner {
        /// Target label (`project/chain`)
        target: String,
        /// Failure description
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a validation error for a batch field
    #[must_use]
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a runner failure
    #[must_use]
    pub fn runner(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runner {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// True when the error is an I/O "not found" failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
