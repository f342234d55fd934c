//! Gzip-compressed NDJSON batch files
//!
//! A batch file holds one [`FileHeader`] line followed by one JSON [`Batch`]
//! per line. Files are written to a temporary sibling and renamed into place,
//! so readers never observe a partially written file at the final path.

use crate::batch::Batch;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Value of the header `kind` field
pub const FILE_KIND: &str = "chainreplay.batches";

/// Current batch file format version
pub const FILE_VERSION: u32 = 1;

/// Extension used for batch files
pub const FILE_EXTENSION: &str = "ndjson.gz";

/// First line of every batch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    /// Always [`FILE_KIND`]
    pub kind: String,
    /// Project that recorded the file
    pub project: String,
    /// Chain the data came from
    pub chain: String,
    /// Namespace fingerprint
    pub config_hash: String,
    /// Format version, [`FILE_VERSION`] when written by this crate
    pub file_version: u32,
    /// Height of the first batch
    pub min_block: u64,
    /// Height of the last batch
    pub max_block: u64,
    /// When the file was written
    pub created_at: DateTime<Utc>,
}

impl FileHeader {
    /// Build a header for a freshly recorded batch set
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        chain: impl Into<String>,
        config_hash: impl Into<String>,
        min_block: u64,
        max_block: u64,
    ) -> Self {
        Self {
            kind: FILE_KIND.to_string(),
            project: project.into(),
            chain: chain.into(),
            config_hash: config_hash.into(),
            file_version: FILE_VERSION,
            min_block,
            max_block,
            created_at: Utc::now(),
        }
    }
}

/// File name for a batch set covering `min_block..=max_block`
#[must_use]
pub fn batch_file_name(min_block: u64, max_block: u64) -> String {
    format!("{min_block}-{max_block}.{FILE_EXTENSION}")
}

/// Write `batches` to `path`, replacing any previous file atomically
pub fn write_batch_file(path: &Path, header: &FileHeader, batches: &[Batch]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    // Dropping the temp file on any early return removes it
    let tmp = tempfile::Builder::new()
        .prefix(".batch-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io(e, dir, "create_temp"))?;

    let mut encoder = GzEncoder::new(BufWriter::new(tmp.as_file()), Compression::default());
    write_line(&mut encoder, header, tmp.path())?;
    for batch in batches {
        write_line(&mut encoder, batch, tmp.path())?;
    }
    let mut writer = encoder
        .finish()
        .map_err(|e| Error::io(e, tmp.path(), "compress"))?;
    writer
        .flush()
        .map_err(|e| Error::io(e, tmp.path(), "write"))?;
    drop(writer);
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, tmp.path(), "sync"))?;

    tmp.persist(path)
        .map_err(|e| Error::io(e.error, path, "rename"))?;
    Ok(())
}

fn write_line<W: Write, T: Serialize>(out: &mut W, value: &T, path: &Path) -> Result<()> {
    serde_json::to_writer(&mut *out, value)
        .map_err(|e| Error::serialization(format!("Failed to encode {}: {e}", path.display())))?;
    out.write_all(b"\n")
        .map_err(|e| Error::io(e, path, "write"))
}

/// Open a batch file for reading
///
/// With `skip_header` the first line is discarded unparsed; otherwise it is
/// decoded and validated as a [`FileHeader`], available through
/// [`BatchReader::header`].
pub fn read_batch_file(path: &Path, skip_header: bool) -> Result<BatchReader> {
    BatchReader::open(path, skip_header)
}

type LineSource = Lines<BufReader<GzDecoder<File>>>;

/// Single-pass reader yielding groups of batches
///
/// By default the whole file is yielded as exactly one group, which is what
/// replay consumers expect. [`BatchReader::with_group_size`] switches to
/// incremental groups of bounded size. Reading stops after the first error.
pub struct BatchReader {
    path: PathBuf,
    lines: LineSource,
    line_no: usize,
    header: Option<FileHeader>,
    group_size: Option<NonZeroUsize>,
    yielded: bool,
    done: bool,
}

impl std::fmt::Debug for BatchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchReader")
            .field("path", &self.path)
            .field("line_no", &self.line_no)
            .field("group_size", &self.group_size)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl BatchReader {
    fn open(path: &Path, skip_header: bool) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path, "open"))?;
        let mut reader = Self {
            path: path.to_path_buf(),
            lines: BufReader::new(GzDecoder::new(file)).lines(),
            line_no: 0,
            header: None,
            group_size: None,
            yielded: false,
            done: false,
        };

        let first = reader
            .next_line()?
            .ok_or_else(|| Error::serialization(format!("{}: missing header line", path.display())))?;
        if !skip_header {
            let header: FileHeader = serde_json::from_str(&first).map_err(|e| {
                Error::serialization(format!("{}: invalid header: {e}", path.display()))
            })?;
            if header.kind != FILE_KIND || header.file_version > FILE_VERSION {
                return Err(Error::serialization(format!(
                    "{}: unsupported batch file (kind `{}`, version {})",
                    path.display(),
                    header.kind,
                    header.file_version
                )));
            }
            reader.header = Some(header);
        }
        Ok(reader)
    }

    /// Yield at most `size` batches per group instead of the whole file
    #[must_use]
    pub fn with_group_size(mut self, size: NonZeroUsize) -> Self {
        self.group_size = Some(size);
        self
    }

    /// Parsed header, when the reader was opened without skipping it
    #[must_use]
    pub const fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    /// Path being read
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain the reader into a flat list of batches
    pub fn read_all(self) -> Result<Vec<Batch>> {
        let mut out = Vec::new();
        for group in self {
            out.extend(group?);
        }
        Ok(out)
    }

    /// Next non-empty line, decompressing as needed
    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            match self.lines.next() {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::io(e, &self.path, "decompress")),
                Some(Ok(line)) => {
                    self.line_no += 1;
                    if !line.trim().is_empty() {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }

    fn next_group(&mut self) -> Result<Option<Vec<Batch>>> {
        let limit = self.group_size.map_or(usize::MAX, NonZeroUsize::get);
        let mut group = Vec::new();
        while group.len() < limit {
            let Some(line) = self.next_line()? else {
                self.done = true;
                break;
            };
            let batch: Batch = serde_json::from_str(&line).map_err(|e| {
                Error::serialization(format!(
                    "{}:{}: malformed batch: {e}",
                    self.path.display(),
                    self.line_no
                ))
            })?;
            group.push(batch);
        }

        // A well-formed file always produces at least one (possibly empty) group
        if group.is_empty() && self.yielded {
            return Ok(None);
        }
        self.yielded = true;
        Ok(Some(group))
    }
}

impl Iterator for BatchReader {
    type Item = Result<Vec<Batch>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done && self.yielded {
            return None;
        }
        match self.next_group() {
            Ok(Some(group)) => Some(Ok(group)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.yielded = true;
                Some(Err(e))
            }
        }
    }
}
