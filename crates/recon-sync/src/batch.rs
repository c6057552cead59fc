//! One bucket of one entity type: read both sides, classify, transform what gets written and
//! write it in a single downstream transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{
    BucketCounts, DownstreamRow, EntityType, FieldMap, FieldTransformSpec, Key, KeyRange, Keyed,
    SyncError, TransformRegistry, UpstreamRecord, Value,
};
use recon_entities::{EntityCatalogue, EntityDefinition, RecordOrigin};
use recon_storage::{DownstreamStore, DownstreamTx, UpstreamReader};
use tracing::{debug, info, warn};

use crate::diff::{DiffEntry, DiffFilter, RowDiff};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Only insert rows missing downstream; used for first deployments.
    pub create_only: bool,
}

/// A created or updated row, as read upstream and as written downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedRow {
    pub key: Key,
    pub raw: FieldMap,
    pub transformed: FieldMap,
}

/// An upstream row whose downstream copy was already current.
#[derive(Debug, Clone, PartialEq)]
pub struct UnchangedRow {
    pub key: Key,
    pub raw: FieldMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketOutcome {
    pub entity: EntityType,
    pub range: KeyRange,
    pub counts: BucketCounts,
    pub created: Vec<SyncedRow>,
    pub updated: Vec<SyncedRow>,
    /// Only collected for entities that own groupings.
    pub unchanged: Vec<UnchangedRow>,
}

impl BucketOutcome {
    pub fn changed_rows(&self) -> impl Iterator<Item = &SyncedRow> {
        self.created.iter().chain(self.updated.iter())
    }

    /// Key and raw upstream fields of every row the bucket left live downstream.
    pub fn live_rows(&self) -> impl Iterator<Item = (&Key, &FieldMap)> {
        self.changed_rows()
            .map(|row| (&row.key, &row.raw))
            .chain(self.unchanged.iter().map(|row| (&row.key, &row.raw)))
    }
}

/// Upstream record with just enough coerced to classify it.
#[derive(Debug, Clone)]
struct StagedRecord {
    key: Key,
    last_modified: Option<DateTime<Utc>>,
    raw: FieldMap,
}

impl Keyed for StagedRecord {
    fn key(&self) -> &Key {
        &self.key
    }
}

impl StagedRecord {
    fn stage(spec: &FieldTransformSpec, record: UpstreamRecord) -> Self {
        let key = spec
            .coerce_field(&spec.key_field, &record.fields)
            .as_ref()
            .and_then(Key::from_value)
            .unwrap_or(record.key);
        let last_modified = spec
            .coerce_field(&spec.last_modified_field, &record.fields)
            .as_ref()
            .and_then(Value::as_datetime);
        Self {
            key,
            last_modified,
            raw: record.fields,
        }
    }

    fn into_synced(
        self,
        entity: EntityType,
        spec: &FieldTransformSpec,
    ) -> Result<SyncedRow, SyncError> {
        let transformed = spec.apply(&self.raw).map_err(|error| SyncError::Transform {
            entity,
            key: self.key.clone(),
            error,
        })?;
        Ok(SyncedRow {
            key: self.key,
            raw: self.raw,
            transformed,
        })
    }
}

/// UPDATE when upstream is strictly newer, or the downstream copy was soft-deleted.
pub fn requires_update(upstream_modified: Option<DateTime<Utc>>, downstream: &DownstreamRow) -> bool {
    if downstream.soft_deleted {
        return true;
    }
    match (upstream_modified, downstream.last_modified) {
        (Some(up), Some(down)) => up > down,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

pub struct BatchSynchronizer {
    catalogue: Arc<EntityCatalogue>,
    registry: Arc<TransformRegistry>,
    upstream: Arc<dyn UpstreamReader>,
    downstream: Arc<dyn DownstreamStore>,
    options: SyncOptions,
}

impl BatchSynchronizer {
    pub fn new(
        catalogue: Arc<EntityCatalogue>,
        registry: Arc<TransformRegistry>,
        upstream: Arc<dyn UpstreamReader>,
        downstream: Arc<dyn DownstreamStore>,
    ) -> Self {
        Self {
            catalogue,
            registry,
            upstream,
            downstream,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    fn definition(&self, entity: EntityType) -> Result<&Arc<dyn EntityDefinition>, SyncError> {
        self.catalogue
            .get_type(entity)
            .ok_or_else(|| SyncError::UnknownEntity(entity.to_string()))
    }

    /// Upstream rows for `entity` in `range` that pass its validity predicate.
    async fn read_origin(
        &self,
        definition: &dyn EntityDefinition,
        range: KeyRange,
    ) -> Result<Vec<UpstreamRecord>, SyncError> {
        let predicate = |fields: &FieldMap| definition.is_valid_for_ingest(fields);
        match definition.origin() {
            RecordOrigin::Upstream(source) => {
                Ok(self.upstream.read(&source, range, &predicate).await?)
            }
            RecordOrigin::Downstream(group) => {
                let target = self.definition(group)?.target();
                Ok(self
                    .downstream
                    .read_range(&target, range)
                    .await?
                    .into_iter()
                    .filter(|row| !row.soft_deleted && predicate(&row.fields))
                    .map(|row| UpstreamRecord {
                        key: row.key,
                        fields: row.fields,
                    })
                    .collect())
            }
        }
    }

    /// Reconciles one key range of `entity`. The bucket either commits as a whole or not at all,
    /// so a failed bucket can simply be run again.
    pub async fn sync_bucket(
        &self,
        entity: EntityType,
        range: KeyRange,
    ) -> Result<BucketOutcome, SyncError> {
        let definition = self.definition(entity)?;
        let spec = self
            .registry
            .get(entity)
            .map_err(|_| SyncError::UnknownEntity(entity.to_string()))?;
        let records = self.read_origin(definition.as_ref(), range).await?;
        debug!(%entity, %range, upstream_rows = records.len(), "read upstream bucket");

        let mut tx = self.downstream.begin().await?;
        match self
            .apply(tx.as_mut(), definition.as_ref(), &spec, range, records)
            .await
        {
            Ok(outcome) => {
                tx.commit().await?;
                info!(
                    %entity,
                    %range,
                    created = outcome.counts.created,
                    updated = outcome.counts.updated,
                    deleted = outcome.counts.deleted,
                    undeleted = outcome.counts.undeleted,
                    "bucket committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(%entity, %range, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn DownstreamTx,
        definition: &dyn EntityDefinition,
        spec: &FieldTransformSpec,
        range: KeyRange,
        records: Vec<UpstreamRecord>,
    ) -> Result<BucketOutcome, SyncError> {
        let entity = definition.entity_type();
        let target = definition.target();

        let staged: Vec<StagedRecord> = records
            .into_iter()
            .map(|record| StagedRecord::stage(spec, record))
            .collect();
        let existing = tx.read_range(&target, range).await?;

        let mut filter = if self.options.create_only {
            DiffFilter::create_only()
        } else {
            DiffFilter::default()
        };
        // memberships of unchanged rows are rebuilt too, so a failed hook heals on rerun
        filter.read = self.catalogue.groupings_for_owner(entity).next().is_some();

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut undeletes = Vec::new();
        let mut deletes = Vec::new();
        let mut unchanged = Vec::new();
        let diff = RowDiff::new(staged, existing, filter, |up: &StagedRecord, down: &DownstreamRow| {
            requires_update(up.last_modified, down)
        });
        for entry in diff {
            match entry? {
                DiffEntry::Create(up) => creates.push(up.into_synced(entity, spec)?),
                DiffEntry::Update(up, down) => {
                    if down.soft_deleted {
                        undeletes.push(up.into_synced(entity, spec)?);
                    } else {
                        updates.push(up.into_synced(entity, spec)?);
                    }
                }
                DiffEntry::Read(up, _) => unchanged.push(UnchangedRow {
                    key: up.key,
                    raw: up.raw,
                }),
                DiffEntry::Delete(down) if !down.soft_deleted => deletes.push(down.key),
                DiffEntry::Delete(_) => {}
            }
        }

        let mut counts = BucketCounts::default();
        if !creates.is_empty() {
            let rows: Vec<FieldMap> = creates.iter().map(|r| r.transformed.clone()).collect();
            counts.created = tx.insert_rows(&target, &rows).await?;
        }
        let refreshed: Vec<FieldMap> = updates
            .iter()
            .chain(undeletes.iter())
            .map(|r| r.transformed.clone())
            .collect();
        if !refreshed.is_empty() {
            tx.update_fields(&target, &refreshed, &spec.update_fields())
                .await?;
            counts.updated = updates.len() as u64;
        }
        if !undeletes.is_empty() {
            let keys: Vec<Key> = undeletes.iter().map(|r| r.key.clone()).collect();
            counts.undeleted = tx.set_soft_deleted(&target, &keys, false).await?;
        }
        if !deletes.is_empty() {
            counts.deleted = tx.set_soft_deleted(&target, &deletes, true).await?;
        }

        Ok(BucketOutcome {
            entity,
            range,
            counts,
            created: creates,
            updated: updates.into_iter().chain(undeletes).collect(),
            unchanged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn down(soft_deleted: bool, modified: Option<DateTime<Utc>>) -> DownstreamRow {
        DownstreamRow {
            key: Key::Int(1),
            last_modified: modified,
            soft_deleted,
            fields: FieldMap::new(),
        }
    }

    #[test]
    fn update_needs_a_strictly_newer_upstream_or_a_deleted_copy() {
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(requires_update(Some(new), &down(false, Some(old))));
        assert!(!requires_update(Some(old), &down(false, Some(old))));
        assert!(!requires_update(Some(old), &down(false, Some(new))));
        assert!(requires_update(Some(old), &down(true, Some(old))));
        assert!(requires_update(Some(old), &down(false, None)));
    }
}
