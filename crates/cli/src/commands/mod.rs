//! Subcommand implementations
//!
//! Each command returns its exit code; hard failures surface as [`CliError`].

pub mod cleanup;
pub mod replay;

use crate::cli::{CliError, OkEnvelope};
use serde::Serialize;

/// Serialize `data` in an ok or partial envelope
pub(crate) fn envelope_json<T: Serialize>(data: T, complete: bool) -> Result<String, CliError> {
    let envelope = if complete {
        OkEnvelope::new(data)
    } else {
        OkEnvelope::partial(data)
    };
    serde_json::to_string_pretty(&envelope)
        .map_err(|e| CliError::cache(format!("failed to serialize summary: {e}")))
}

/// Human-readable byte count
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut unit = 0;
    let mut whole = bytes;
    let mut rem = 0;
    while whole >= 1024 && unit < UNITS.len() - 1 {
        rem = whole % 1024;
        whole /= 1024;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{whole}.{} {}", rem * 10 / 1024, UNITS[unit])
    }
}
