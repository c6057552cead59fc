//! Key-range bucketing. Windows are aligned to multiples of the bucket size, never to the data,
//! so the same key always lands in the same window across runs.

use std::collections::BTreeMap;

use recon_core::{KeyRange, SyncError, WindowStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub start: i64,
    /// Inclusive; `start + bucket_size - 1`.
    pub end: i64,
    pub actual_min: Option<i64>,
    pub actual_max: Option<i64>,
}

impl Bucket {
    pub fn range(&self) -> KeyRange {
        KeyRange::between(self.start, self.end)
    }

    /// The bucket's range with the lower bound raised to `from`.
    pub fn range_from(&self, from: i64) -> KeyRange {
        KeyRange::between(self.start.max(from), self.end)
    }
}

fn check_size(bucket_size: i64) -> Result<(), SyncError> {
    if bucket_size <= 0 {
        return Err(SyncError::Config(format!(
            "bucket size must be positive, got {bucket_size}"
        )));
    }
    Ok(())
}

/// Every aligned window of the key space up to `max_key`, in ascending order.
///
/// The enumeration starts at the origin window, or at the window holding `min_key` when keys
/// go negative, whatever keys exist. Syncs visit [`plan_buckets`] instead, which keeps only
/// windows holding rows.
pub fn buckets(min_key: i64, max_key: i64, bucket_size: i64) -> Result<Vec<Bucket>, SyncError> {
    check_size(bucket_size)?;
    let mut out = Vec::new();
    if min_key > max_key {
        return Ok(out);
    }
    let mut start = min_key
        .min(0)
        .div_euclid(bucket_size)
        .saturating_mul(bucket_size);
    loop {
        let end = start.saturating_add(bucket_size - 1);
        out.push(Bucket {
            start,
            end,
            actual_min: None,
            actual_max: None,
        });
        match end.checked_add(1) {
            Some(next) if next <= max_key => start = next,
            _ => break,
        }
    }
    Ok(out)
}

/// Like [`buckets`], keeping only windows in which either store reported a row.
///
/// `observed` may mix statistics from both sides; rows of the same window are merged.
pub fn plan_buckets(
    min_key: i64,
    max_key: i64,
    bucket_size: i64,
    observed: &[WindowStats],
) -> Result<Vec<Bucket>, SyncError> {
    check_size(bucket_size)?;
    let mut windows: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
    for stats in observed.iter().filter(|s| s.rows > 0) {
        windows
            .entry(stats.window)
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(stats.min_key);
                *hi = (*hi).max(stats.max_key);
            })
            .or_insert((stats.min_key, stats.max_key));
    }

    if min_key > max_key || windows.is_empty() {
        return Ok(Vec::new());
    }
    let first = min_key.div_euclid(bucket_size);
    let last = max_key.div_euclid(bucket_size);
    Ok(windows
        .range(first..=last)
        .map(|(window, (lo, hi))| {
            let start = window.saturating_mul(bucket_size);
            Bucket {
                start,
                end: start.saturating_add(bucket_size - 1),
                actual_min: Some(*lo),
                actual_max: Some(*hi),
            }
        })
        .collect())
}

/// Lowest and highest key over a set of window statistics.
pub fn key_bounds(observed: &[WindowStats]) -> Option<(i64, i64)> {
    let min = observed.iter().filter(|s| s.rows > 0).map(|s| s.min_key).min()?;
    let max = observed.iter().filter(|s| s.rows > 0).map(|s| s.max_key).max()?;
    Some((min, max))
}
