//! Built-in replay runners
//!
//! - `log`: emits one tracing event per replayed file
//! - `ndjson`: writes every replayed batch as a JSON line

use async_trait::async_trait;
use chainreplay_cache::{Batch, Error, Result, Runner, RunnerRegistry};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Logs a summary of each replayed file
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRunner;

#[async_trait]
impl Runner for LogRunner {
    async fn replay(&self, project: &str, chain: &str, batches: Vec<Batch>) -> Result<()> {
        let logs: usize = batches.iter().map(|b| b.logs.len()).sum();
        let transactions: usize = batches.iter().map(|b| b.transactions.len()).sum();
        tracing::info!(
            project,
            chain,
            batches = batches.len(),
            min_block = batches.first().map(Batch::height),
            max_block = batches.last().map(Batch::height),
            logs,
            transactions,
            "Replayed batches"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct Line<'a> {
    project: &'a str,
    chain: &'a str,
    #[serde(flatten)]
    batch: &'a Batch,
}

/// Writes `{project, chain, ...batch}` JSON lines to a shared writer
pub struct NdjsonRunner<W> {
    out: Mutex<W>,
}

impl NdjsonRunner<io::Stdout> {
    /// Runner writing to standard output
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> NdjsonRunner<W> {
    /// Runner writing to `out`
    pub const fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Take back the writer
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W> std::fmt::Debug for NdjsonRunner<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdjsonRunner").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W: Write + Send> Runner for NdjsonRunner<W> {
    async fn replay(&self, project: &str, chain: &str, batches: Vec<Batch>) -> Result<()> {
        let target = format!("{project}/{chain}");
        let mut buf = Vec::new();
        for batch in &batches {
            serde_json::to_writer(&mut buf, &Line {
                project,
                chain,
                batch,
            })
            .map_err(|e| Error::serialization(e.to_string()))?;
            buf.push(b'\n');
        }

        // One write per file keeps lines from concurrent targets whole.
        let mut out = self
            .out
            .lock()
            .map_err(|_| Error::runner(&target, "output writer poisoned"))?;
        out.write_all(&buf)
            .and_then(|()| out.flush())
            .map_err(|e| Error::runner(&target, format!("write failed: {e}")))
    }
}

/// Registry holding the `log` and `ndjson` runners
#[must_use]
pub fn builtin_registry() -> RunnerRegistry {
    RunnerRegistry::new()
        .with("log", Arc::new(LogRunner))
        .with("ndjson", Arc::new(NdjsonRunner::stdout()))
}
