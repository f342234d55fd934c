//! Namespace fingerprints
//!
//! A namespace is `<root>/<project>/<chain>/<fingerprint>`. The fingerprint is
//! the first 16 hex characters of a SHA-256 over the canonical JSON encoding of
//! `{chain, identity, project}`, so two recorders describing the same indexing
//! configuration share cached data even when their identity objects were built
//! with different key orders.

use crate::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Number of hex characters kept from the digest
pub const FINGERPRINT_LEN: usize = 16;

/// Compute the configuration fingerprint for a namespace
#[must_use]
pub fn fingerprint(project: &str, chain: &str, identity: &Value) -> String {
    let envelope = serde_json::json!({
        "project": project,
        "chain": chain,
        "identity": identity,
    });
    let digest = Sha256::digest(canonical_json(&envelope).as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Directory holding the manifest and batch files of a namespace
#[must_use]
pub fn namespace_path(root: &Path, project: &str, chain: &str, fingerprint: &str) -> PathBuf {
    root.join(project).join(chain).join(fingerprint)
}

/// Serialize a JSON value with object keys sorted at every depth
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a plain string cannot fail
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Check that a project or chain name is usable as a single directory name
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::configuration(format!("{kind} name must not be empty")));
    }
    if value == "." || value == ".." || value.contains(['/', '\\']) || value.contains('\0') {
        return Err(Error::configuration(format!(
            "{kind} name `{value}` is not a valid directory name"
        )));
    }
    Ok(())
}
