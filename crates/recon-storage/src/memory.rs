//! In-memory stores for tests and dry runs. Transactions stage a snapshot and swap it in on commit,
//! so they assume a single writer.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{
    AggregatedStatistic, DownstreamRow, FieldMap, Key, KeyRange, RelationTable, SourceTable,
    StatisticsTable, StoreError, TargetTable, UpstreamRecord, Value, WindowStats,
};
use tokio::sync::Mutex;

use crate::{
    decode_record, decode_row, window_stats_for, DownstreamStore, DownstreamTx, RecordPredicate,
    UpstreamReader,
};

#[derive(Debug, Default)]
struct UpstreamState {
    tables: BTreeMap<String, Vec<FieldMap>>,
    unsorted: BTreeSet<String>,
    read_failures: VecDeque<StoreError>,
    reads: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryUpstream {
    state: Arc<Mutex<UpstreamState>>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record with the same key.
    pub async fn upsert(&self, source: &SourceTable, fields: FieldMap) {
        let mut state = self.state.lock().await;
        let rows = state.tables.entry(source.table.clone()).or_default();
        let key = fields.get(&source.key_field).cloned();
        match rows
            .iter_mut()
            .find(|row| key.is_some() && row.get(&source.key_field) == key.as_ref())
        {
            Some(existing) => *existing = fields,
            None => rows.push(fields),
        }
    }

    pub async fn remove(&self, source: &SourceTable, key: &Key) {
        let mut state = self.state.lock().await;
        if let Some(rows) = state.tables.get_mut(&source.table) {
            let key = key.to_value();
            rows.retain(|row| row.get(&source.key_field) != Some(&key));
        }
    }

    /// Registers an empty table so reads succeed.
    pub async fn create_table(&self, table: &str) {
        self.state
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default();
    }

    /// Serves `table` in insertion order instead of key order.
    pub async fn serve_unsorted(&self, table: &str) {
        self.state.lock().await.unsorted.insert(table.to_string());
    }

    pub async fn fail_next_read(&self, err: StoreError) {
        self.state.lock().await.read_failures.push_back(err);
    }

    pub async fn read_count(&self) -> u64 {
        self.state.lock().await.reads
    }

    async fn records(&self, source: &SourceTable) -> Result<Vec<UpstreamRecord>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        state.reads += 1;
        let rows = state
            .tables
            .get(&source.table)
            .ok_or_else(|| StoreError::UnknownTable(source.table.clone()))?;
        let mut records = rows
            .iter()
            .cloned()
            .map(|fields| decode_record(source, fields))
            .collect::<Result<Vec<_>, _>>()?;
        if !state.unsorted.contains(&source.table) {
            records.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Ok(records)
    }
}

#[async_trait]
impl UpstreamReader for MemoryUpstream {
    async fn read(
        &self,
        source: &SourceTable,
        range: KeyRange,
        predicate: RecordPredicate<'_>,
    ) -> Result<Vec<UpstreamRecord>, StoreError> {
        Ok(self
            .records(source)
            .await?
            .into_iter()
            .filter(|record| range.contains(&record.key) && predicate(&record.fields))
            .collect())
    }

    async fn read_related(
        &self,
        source: &SourceTable,
        field: &str,
        range: KeyRange,
    ) -> Result<Vec<UpstreamRecord>, StoreError> {
        let mut related: Vec<(Key, UpstreamRecord)> = self
            .records(source)
            .await?
            .into_iter()
            .filter_map(|record| {
                let owner = record.fields.get(field).and_then(Key::from_value)?;
                range.contains(&owner).then_some((owner, record))
            })
            .collect();
        related.sort_by(|(a_owner, a), (b_owner, b)| (a_owner, &a.key).cmp(&(b_owner, &b.key)));
        Ok(related.into_iter().map(|(_, record)| record).collect())
    }

    async fn window_stats(
        &self,
        source: &SourceTable,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, StoreError> {
        let records = self.records(source).await?;
        Ok(window_stats_for(records.iter().map(|r| &r.key), bucket_size))
    }
}

#[derive(Debug, Clone, Default)]
struct DownstreamState {
    tables: BTreeMap<String, BTreeMap<Key, FieldMap>>,
    relations: BTreeMap<String, BTreeMap<Key, BTreeSet<Key>>>,
    statistics: BTreeMap<String, Vec<AggregatedStatistic>>,
}

#[derive(Debug, Default)]
struct Faults {
    insert_failures: VecDeque<StoreError>,
    commit_failures: VecDeque<StoreError>,
    commits: u64,
    rollbacks: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDownstream {
    committed: Arc<Mutex<DownstreamState>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a committed row directly, bypassing transactions.
    pub async fn put_row(&self, target: &TargetTable, mut fields: FieldMap) {
        let Some(key) = fields.get(&target.key_field).and_then(Key::from_value) else {
            return;
        };
        fields
            .entry(target.deleted_field.clone())
            .or_insert(Value::Bool(false));
        self.committed
            .lock()
            .await
            .tables
            .entry(target.table.clone())
            .or_default()
            .insert(key, fields);
    }

    pub async fn row(&self, table: &str, key: &Key) -> Option<FieldMap> {
        self.committed
            .lock()
            .await
            .tables
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    pub async fn rows(&self, table: &str) -> Vec<FieldMap> {
        self.committed
            .lock()
            .await
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn memberships(&self, relation: &str) -> BTreeMap<Key, BTreeSet<Key>> {
        self.committed
            .lock()
            .await
            .relations
            .get(relation)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn statistics(&self, table: &str) -> Vec<AggregatedStatistic> {
        self.committed
            .lock()
            .await
            .statistics
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn fail_next_insert(&self, err: StoreError) {
        self.faults.lock().await.insert_failures.push_back(err);
    }

    pub async fn fail_next_commit(&self, err: StoreError) {
        self.faults.lock().await.commit_failures.push_back(err);
    }

    pub async fn commit_count(&self) -> u64 {
        self.faults.lock().await.commits
    }

    pub async fn rollback_count(&self) -> u64 {
        self.faults.lock().await.rollbacks
    }
}

fn rows_in_range(
    state: &DownstreamState,
    target: &TargetTable,
    range: KeyRange,
) -> Result<Vec<DownstreamRow>, StoreError> {
    let Some(rows) = state.tables.get(&target.table) else {
        return Ok(Vec::new());
    };
    rows.iter()
        .filter(|(key, _)| range.contains(key))
        .map(|(_, fields)| decode_row(target, fields.clone()))
        .collect()
}

#[async_trait]
impl DownstreamStore for MemoryDownstream {
    async fn begin(&self) -> Result<Box<dyn DownstreamTx>, StoreError> {
        let staged = self.committed.lock().await.clone();
        Ok(Box::new(MemoryTx {
            committed: Arc::clone(&self.committed),
            faults: Arc::clone(&self.faults),
            staged,
        }))
    }

    async fn read_range(
        &self,
        target: &TargetTable,
        range: KeyRange,
    ) -> Result<Vec<DownstreamRow>, StoreError> {
        rows_in_range(&*self.committed.lock().await, target, range)
    }

    async fn window_stats(
        &self,
        target: &TargetTable,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, StoreError> {
        let state = self.committed.lock().await;
        Ok(state
            .tables
            .get(&target.table)
            .map(|rows| window_stats_for(rows.keys(), bucket_size))
            .unwrap_or_default())
    }
}

struct MemoryTx {
    committed: Arc<Mutex<DownstreamState>>,
    faults: Arc<Mutex<Faults>>,
    staged: DownstreamState,
}

fn row_key(target: &TargetTable, row: &FieldMap) -> Result<Key, StoreError> {
    row.get(&target.key_field)
        .and_then(Key::from_value)
        .ok_or_else(|| {
            StoreError::Decode(format!(
                "{}: write without usable `{}`",
                target.table, target.key_field
            ))
        })
}

#[async_trait]
impl DownstreamTx for MemoryTx {
    async fn read_range(
        &mut self,
        target: &TargetTable,
        range: KeyRange,
    ) -> Result<Vec<DownstreamRow>, StoreError> {
        rows_in_range(&self.staged, target, range)
    }

    async fn insert_rows(
        &mut self,
        target: &TargetTable,
        rows: &[FieldMap],
    ) -> Result<u64, StoreError> {
        if let Some(err) = self.faults.lock().await.insert_failures.pop_front() {
            return Err(err);
        }
        let table = self.staged.tables.entry(target.table.clone()).or_default();
        for row in rows {
            let key = row_key(target, row)?;
            if table.contains_key(&key) {
                return Err(StoreError::Backend(format!(
                    "{}: duplicate key {key}",
                    target.table
                )));
            }
            let mut stored = row.clone();
            stored.insert(target.deleted_field.clone(), Value::Bool(false));
            table.insert(key, stored);
        }
        Ok(rows.len() as u64)
    }

    async fn update_fields(
        &mut self,
        target: &TargetTable,
        rows: &[FieldMap],
        fields: &[String],
    ) -> Result<u64, StoreError> {
        let table = self.staged.tables.entry(target.table.clone()).or_default();
        let mut updated = 0;
        for row in rows {
            let key = row_key(target, row)?;
            let Some(stored) = table.get_mut(&key) else {
                continue;
            };
            for field in fields {
                stored.insert(field.clone(), row.get(field).cloned().unwrap_or(Value::Null));
            }
            stored.insert(target.deleted_field.clone(), Value::Bool(false));
            updated += 1;
        }
        Ok(updated)
    }

    async fn set_soft_deleted(
        &mut self,
        target: &TargetTable,
        keys: &[Key],
        deleted: bool,
    ) -> Result<u64, StoreError> {
        let table = self.staged.tables.entry(target.table.clone()).or_default();
        let mut changed = 0;
        for key in keys {
            if let Some(stored) = table.get_mut(key) {
                stored.insert(target.deleted_field.clone(), Value::Bool(deleted));
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn read_memberships(
        &mut self,
        relation: &RelationTable,
        owners: &[Key],
    ) -> Result<BTreeMap<Key, BTreeSet<Key>>, StoreError> {
        let Some(links) = self.staged.relations.get(&relation.table) else {
            return Ok(BTreeMap::new());
        };
        Ok(owners
            .iter()
            .filter_map(|owner| links.get(owner).map(|members| (owner.clone(), members.clone())))
            .collect())
    }

    async fn replace_memberships(
        &mut self,
        relation: &RelationTable,
        memberships: &BTreeMap<Key, BTreeSet<Key>>,
    ) -> Result<(), StoreError> {
        let links = self
            .staged
            .relations
            .entry(relation.table.clone())
            .or_default();
        for (owner, members) in memberships {
            if members.is_empty() {
                links.remove(owner);
            } else {
                links.insert(owner.clone(), members.clone());
            }
        }
        Ok(())
    }

    async fn replace_statistics(
        &mut self,
        target: &StatisticsTable,
        range: KeyRange,
        stats: &[AggregatedStatistic],
    ) -> Result<u64, StoreError> {
        let rows = self.staged.statistics.entry(target.table.clone()).or_default();
        rows.retain(|stat| !range.contains(&Key::Int(stat.fact_key)));
        rows.extend(stats.iter().cloned());
        rows.sort_by(|a, b| {
            (a.fact_key, &a.characteristic, a.object_key).cmp(&(
                b.fact_key,
                &b.characteristic,
                b.object_key,
            ))
        });
        Ok(stats.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            committed,
            faults,
            staged,
        } = *self;
        let mut faults = faults.lock().await;
        if let Some(err) = faults.commit_failures.pop_front() {
            faults.rollbacks += 1;
            return Err(err);
        }
        *committed.lock().await = staged;
        faults.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.faults.lock().await.rollbacks += 1;
        Ok(())
    }
}
