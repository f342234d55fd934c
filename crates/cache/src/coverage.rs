//! Block-range coverage and stitching of cached batch files
//!
//! Auto-swap replaces a slice of live batches with cached batches only when it
//! can prove the cache holds the same range. Any doubt falls back to the live
//! batches.

use crate::batch::Batch;
use crate::manifest::ReplayFile;
use crate::Result;
use std::path::Path;

/// Inclusive block interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRange {
    /// First height
    pub min: u64,
    /// Last height
    pub max: u64,
}

impl BlockRange {
    /// Create a range; bounds are swapped if given in reverse
    #[must_use]
    pub const fn new(a: u64, b: u64) -> Self {
        if a <= b {
            Self { min: a, max: b }
        } else {
            Self { min: b, max: a }
        }
    }

    /// Smallest range containing every batch height, `None` for no batches
    #[must_use]
    pub fn of_batches(batches: &[Batch]) -> Option<Self> {
        let min = batches.iter().map(Batch::height).min()?;
        let max = batches.iter().map(Batch::height).max()?;
        Some(Self { min, max })
    }

    /// Whether `height` lies inside the range
    #[must_use]
    pub const fn contains(&self, height: u64) -> bool {
        self.min <= height && height <= self.max
    }

    /// Whether two inclusive ranges share at least one height
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        !(self.max < other.min || other.max < self.min)
    }

    /// Number of heights in the range
    #[must_use]
    pub fn len(&self) -> u128 {
        u128::from(self.max) - u128::from(self.min) + 1
    }

    /// Always false; a range holds at least one height
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl From<&ReplayFile> for BlockRange {
    fn from(file: &ReplayFile) -> Self {
        Self::new(file.min_block, file.max_block)
    }
}

/// Auto-swap switches, usually taken from the cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapPolicy {
    /// Substitute at all
    pub auto_use: bool,
    /// Only substitute when the cached data provably covers the live range
    pub require_full_coverage: bool,
}

/// Files whose block range intersects `range`, in manifest order
#[must_use]
pub fn select_overlapping(files: &[ReplayFile], range: BlockRange) -> Vec<ReplayFile> {
    files
        .iter()
        .filter(|f| BlockRange::from(*f).intersects(&range))
        .cloned()
        .collect()
}

/// Whether the union of `intervals` covers every height of `range`
pub fn covers_range(intervals: impl IntoIterator<Item = BlockRange>, range: BlockRange) -> bool {
    let mut sorted: Vec<BlockRange> = intervals.into_iter().collect();
    sorted.sort_by_key(|r| r.min);

    // u128 so that max + 1 cannot overflow at u64::MAX
    let end = u128::from(range.max);
    let mut cursor = u128::from(range.min);
    for interval in sorted {
        if cursor > end {
            break;
        }
        if u128::from(interval.min) > cursor {
            return false;
        }
        cursor = cursor.max(u128::from(interval.max) + 1);
    }
    cursor > end
}

/// Keep batches inside `range`, order by height and drop duplicate heights
///
/// The sort is stable, so among equal heights the batch seen first wins.
#[must_use]
pub fn stitch(batches: impl IntoIterator<Item = Batch>, range: BlockRange) -> Vec<Batch> {
    let mut kept: Vec<Batch> = batches
        .into_iter()
        .filter(|b| range.contains(b.height()))
        .collect();
    kept.sort_by_key(Batch::height);
    kept.dedup_by_key(|b| b.height());
    kept
}

/// Whether stitched batches start and end exactly on `range` with no gaps
#[must_use]
pub fn is_gapless(batches: &[Batch], range: BlockRange) -> bool {
    match (batches.first(), batches.last()) {
        (Some(first), Some(last)) => {
            first.height() == range.min
                && last.height() == range.max
                && u128::try_from(batches.len()).unwrap_or(u128::MAX) >= range.len()
        }
        _ => false,
    }
}

/// Substitute `live` with cached batches when policy and coverage allow
///
/// `files` is the namespace listing and `read` loads one file. A file that
/// disappeared since listing is skipped; any other read error is returned.
pub fn auto_swap<R>(
    live: Vec<Batch>,
    files: &[ReplayFile],
    policy: SwapPolicy,
    mut read: R,
) -> Result<Vec<Batch>>
where
    R: FnMut(&Path) -> Result<Vec<Batch>>,
{
    if !policy.auto_use {
        return Ok(live);
    }
    let Some(range) = BlockRange::of_batches(&live) else {
        return Ok(live);
    };
    if files.is_empty() {
        tracing::debug!(min_block = range.min, max_block = range.max, "No cached files");
        return Ok(live);
    }

    let selected = select_overlapping(files, range);
    if selected.is_empty() {
        tracing::debug!(
            min_block = range.min,
            max_block = range.max,
            "No cached files overlap live range"
        );
        return Ok(live);
    }
    if policy.require_full_coverage && !covers_range(selected.iter().map(BlockRange::from), range)
    {
        tracing::debug!(
            min_block = range.min,
            max_block = range.max,
            files = selected.len(),
            "Cached files do not cover live range"
        );
        return Ok(live);
    }

    let mut cached = Vec::new();
    for file in &selected {
        match read(&file.path) {
            Ok(batches) => cached.extend(batches),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    path = %file.path.display(),
                    "Manifest references a missing file, skipping"
                );
            }
            Err(e) => return Err(e),
        }
    }

    let stitched = stitch(cached, range);
    if stitched.is_empty() {
        tracing::debug!(
            min_block = range.min,
            max_block = range.max,
            files = selected.len(),
            "No cached batches readable for live range"
        );
        return Ok(live);
    }
    if policy.require_full_coverage && !is_gapless(&stitched, range) {
        tracing::debug!(
            min_block = range.min,
            max_block = range.max,
            stitched = stitched.len(),
            "Stitched cache has gaps, keeping live batches"
        );
        return Ok(live);
    }

    tracing::info!(
        min_block = range.min,
        max_block = range.max,
        batches = stitched.len(),
        files = selected.len(),
        "Serving live range from cache"
    );
    Ok(stitched)
}
