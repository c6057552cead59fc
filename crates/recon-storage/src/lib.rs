//! Store seams for the reconciliation engine: upstream readers, downstream transactions,
//! checkpoints, plus the Postgres and in-memory implementations behind them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use recon_core::{
    parse_datetime, AggregatedStatistic, DownstreamRow, FieldMap, Key, KeyRange, RelationTable,
    SourceTable, StatisticsTable, StoreError, TargetTable, UpstreamRecord, Value, WindowStats,
};

pub mod checkpoint;
pub mod memory;
pub mod postgres;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use memory::{MemoryDownstream, MemoryUpstream};
pub use postgres::{classify_sqlx_error, connect_pool, PgDownstreamStore, PgUpstreamReader};
pub use recon_core::RetryDisposition;

pub const CRATE_NAME: &str = "recon-storage";

/// Filter evaluated against raw upstream fields before a record enters the diff.
pub type RecordPredicate<'a> = &'a (dyn Fn(&FieldMap) -> bool + Send + Sync);

pub fn accept_all(_: &FieldMap) -> bool {
    true
}

/// Read-only access to the upstream system of record.
#[async_trait]
pub trait UpstreamReader: Send + Sync {
    /// Records whose key falls in `range`, ascending by key, keys unique.
    async fn read(
        &self,
        source: &SourceTable,
        range: KeyRange,
        predicate: RecordPredicate<'_>,
    ) -> Result<Vec<UpstreamRecord>, StoreError>;

    /// Records whose `field` (not the key) falls in `range`, ordered by `field` then key.
    async fn read_related(
        &self,
        source: &SourceTable,
        field: &str,
        range: KeyRange,
    ) -> Result<Vec<UpstreamRecord>, StoreError>;

    async fn window_stats(
        &self,
        source: &SourceTable,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, StoreError>;
}

/// The owned downstream store. All writes go through a [`DownstreamTx`].
#[async_trait]
pub trait DownstreamStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn DownstreamTx>, StoreError>;

    /// Committed rows in `range` ascending by key, soft-deleted rows included.
    async fn read_range(
        &self,
        target: &TargetTable,
        range: KeyRange,
    ) -> Result<Vec<DownstreamRow>, StoreError>;

    async fn window_stats(
        &self,
        target: &TargetTable,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, StoreError>;
}

#[async_trait]
pub trait DownstreamTx: Send {
    async fn read_range(
        &mut self,
        target: &TargetTable,
        range: KeyRange,
    ) -> Result<Vec<DownstreamRow>, StoreError>;

    async fn insert_rows(&mut self, target: &TargetTable, rows: &[FieldMap])
        -> Result<u64, StoreError>;

    /// Overwrites `fields` on existing rows matched by key and clears the soft-delete flag.
    async fn update_fields(
        &mut self,
        target: &TargetTable,
        rows: &[FieldMap],
        fields: &[String],
    ) -> Result<u64, StoreError>;

    async fn set_soft_deleted(
        &mut self,
        target: &TargetTable,
        keys: &[Key],
        deleted: bool,
    ) -> Result<u64, StoreError>;

    async fn read_memberships(
        &mut self,
        relation: &RelationTable,
        owners: &[Key],
    ) -> Result<BTreeMap<Key, BTreeSet<Key>>, StoreError>;

    /// Replaces the full member set of every owner in `memberships`.
    async fn replace_memberships(
        &mut self,
        relation: &RelationTable,
        memberships: &BTreeMap<Key, BTreeSet<Key>>,
    ) -> Result<(), StoreError>;

    /// Deletes statistics whose fact key is in `range`, then inserts `stats`.
    async fn replace_statistics(
        &mut self,
        target: &StatisticsTable,
        range: KeyRange,
        stats: &[AggregatedStatistic],
    ) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Splits a stored row into the columns the classifier needs.
pub fn decode_row(target: &TargetTable, fields: FieldMap) -> Result<DownstreamRow, StoreError> {
    let key = fields
        .get(&target.key_field)
        .and_then(Key::from_value)
        .ok_or_else(|| {
            StoreError::Decode(format!(
                "{}: row without usable `{}`",
                target.table, target.key_field
            ))
        })?;
    let last_modified = match fields.get(&target.last_modified_field) {
        Some(Value::DateTime(dt)) => Some(*dt),
        Some(Value::Text(raw)) => Some(parse_datetime(raw).ok_or_else(|| {
            StoreError::Decode(format!(
                "{}: `{}` is not a timestamp: {raw}",
                target.table, target.last_modified_field
            ))
        })?),
        _ => None,
    };
    let soft_deleted = matches!(fields.get(&target.deleted_field), Some(Value::Bool(true)));
    Ok(DownstreamRow {
        key,
        last_modified,
        soft_deleted,
        fields,
    })
}

pub fn decode_record(source: &SourceTable, fields: FieldMap) -> Result<UpstreamRecord, StoreError> {
    let key = fields
        .get(&source.key_field)
        .and_then(Key::from_value)
        .ok_or_else(|| {
            StoreError::Decode(format!(
                "{}: record without usable `{}`",
                source.table, source.key_field
            ))
        })?;
    Ok(UpstreamRecord { key, fields })
}

/// Folds integer keys into aligned windows of `bucket_size`.
pub fn window_stats_for<'a>(keys: impl IntoIterator<Item = &'a Key>, bucket_size: i64) -> Vec<WindowStats> {
    let mut windows: BTreeMap<i64, WindowStats> = BTreeMap::new();
    for key in keys {
        let Some(value) = key.as_int() else { continue };
        let window = value.div_euclid(bucket_size);
        windows
            .entry(window)
            .and_modify(|stats| {
                stats.min_key = stats.min_key.min(value);
                stats.max_key = stats.max_key.max(value);
                stats.rows += 1;
            })
            .or_insert(WindowStats {
                window,
                min_key: value,
                max_key: value,
                rows: 1,
            });
    }
    windows.into_values().collect()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
