use std::sync::Arc;

use chrono::Utc;
use recon_core::{
    Coercion, EntityType, KeyRange, SyncError, SyncMode, SyncSummary, TransformRegistry,
    WindowStats,
};
use recon_entities::{EntityCatalogue, EntityDefinition, RecordOrigin};
use recon_storage::{Checkpoint, CheckpointStore, DownstreamStore, UpstreamReader};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchSynchronizer, BucketOutcome, SyncOptions};
use crate::bucket::{key_bounds, plan_buckets, Bucket};
use crate::config::EntityOverrides;
use crate::groups::GroupMembershipCache;
use crate::hooks::{HookContext, HookKey, HookRegistry};

/// A `sync_all` run that stopped part-way.
#[derive(Debug, Error)]
#[error("sync of {entity} failed (last committed key: {last_committed:?}): {error}")]
pub struct SyncRunError {
    pub completed: Vec<(EntityType, SyncSummary)>,
    pub entity: EntityType,
    pub last_committed: Option<i64>,
    #[source]
    pub error: SyncError,
}

impl SyncRunError {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

pub struct Orchestrator {
    run_id: Uuid,
    catalogue: Arc<EntityCatalogue>,
    batch: BatchSynchronizer,
    upstream: Arc<dyn UpstreamReader>,
    downstream: Arc<dyn DownstreamStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    hooks: HookRegistry,
    cache: GroupMembershipCache,
    overrides: EntityOverrides,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        catalogue: Arc<EntityCatalogue>,
        upstream: Arc<dyn UpstreamReader>,
        downstream: Arc<dyn DownstreamStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, SyncError> {
        let registry: Arc<TransformRegistry> = Arc::new(catalogue.transform_registry()?);
        let batch = BatchSynchronizer::new(
            Arc::clone(&catalogue),
            registry,
            Arc::clone(&upstream),
            Arc::clone(&downstream),
        );
        Ok(Self {
            run_id: Uuid::new_v4(),
            hooks: HookRegistry::standard(&catalogue),
            catalogue,
            batch,
            upstream,
            downstream,
            checkpoints,
            cache: GroupMembershipCache::new(),
            overrides: EntityOverrides::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.batch = self.batch.with_options(options);
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_overrides(mut self, overrides: EntityOverrides) -> Result<Self, SyncError> {
        overrides.validate(&self.catalogue)?;
        self.overrides = overrides;
        Ok(self)
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn catalogue(&self) -> &EntityCatalogue {
        &self.catalogue
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &GroupMembershipCache {
        &self.cache
    }

    fn definition(&self, entity: EntityType) -> Result<Arc<dyn EntityDefinition>, SyncError> {
        self.catalogue
            .get_type(entity)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntity(entity.to_string()))
    }

    pub fn resolve(&self, name: &str) -> Result<EntityType, SyncError> {
        self.catalogue
            .get(name)
            .map(|definition| definition.entity_type())
            .ok_or_else(|| SyncError::UnknownEntity(name.to_string()))
    }

    async fn dispatch_hooks(
        &mut self,
        definition: &dyn EntityDefinition,
        outcome: &BucketOutcome,
    ) -> Result<(), SyncError> {
        let key = HookKey::new(definition.source_name(), definition.entity_type());
        let hooks = self.hooks.resolve(&key).to_vec();
        let mut ctx = HookContext {
            catalogue: &self.catalogue,
            batch: &self.batch,
            downstream: self.downstream.as_ref(),
            cache: &mut self.cache,
        };
        for hook in hooks {
            hook.after_bucket(&mut ctx, outcome).await?;
        }
        Ok(())
    }

    /// Reconciles `entity` as one unbounded bucket. No checkpoint is kept.
    pub async fn sync_entity_direct(&mut self, entity: EntityType) -> Result<SyncSummary, SyncError> {
        let span = info_span!("sync_entity_direct", run_id = %self.run_id, %entity);
        self.run_direct(entity).instrument(span).await
    }

    async fn run_direct(&mut self, entity: EntityType) -> Result<SyncSummary, SyncError> {
        let definition = self.definition(entity)?;
        let outcome = self.batch.sync_bucket(entity, KeyRange::unbounded()).await?;
        self.dispatch_hooks(definition.as_ref(), &outcome).await?;
        let mut summary = SyncSummary::default();
        summary.absorb(&outcome.counts);
        info!(%summary, "entity synced");
        Ok(summary)
    }

    /// Reconciles `entity` bucket by bucket in ascending key order, checkpointing after each
    /// committed bucket. Without `resume_from_key` a matching stored checkpoint is resumed.
    pub async fn sync_entity(
        &mut self,
        entity: EntityType,
        bucket_size: i64,
        resume_from_key: Option<i64>,
    ) -> Result<SyncSummary, SyncError> {
        let mut last_committed = None;
        self.sync_entity_tracked(entity, bucket_size, resume_from_key, &mut last_committed)
            .await
    }

    async fn source_stats(
        &self,
        definition: &dyn EntityDefinition,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, SyncError> {
        Ok(match definition.origin() {
            RecordOrigin::Upstream(source) => self.upstream.window_stats(&source, bucket_size).await?,
            RecordOrigin::Downstream(group) => {
                let target = self.definition(group)?.target();
                self.downstream.window_stats(&target, bucket_size).await?
            }
        })
    }

    /// Window statistics from both sides; a window holding rows on either side is planned.
    async fn observed_windows(
        &self,
        definition: &dyn EntityDefinition,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, SyncError> {
        let mut observed = self.source_stats(definition, bucket_size).await?;
        observed.extend(
            self.downstream
                .window_stats(&definition.target(), bucket_size)
                .await?,
        );
        Ok(observed)
    }

    /// Buckets a bucketed sync of `entity` would visit, starting at `from` if given.
    pub async fn plan(
        &self,
        entity: EntityType,
        bucket_size: i64,
        from: Option<i64>,
    ) -> Result<Vec<Bucket>, SyncError> {
        if bucket_size <= 0 {
            return Err(SyncError::Config(format!(
                "bucket size must be positive, got {bucket_size}"
            )));
        }
        let definition = self.definition(entity)?;
        let observed = self.observed_windows(definition.as_ref(), bucket_size).await?;
        let Some((min_key, max_key)) = key_bounds(&observed) else {
            return Ok(Vec::new());
        };
        let start = from.map_or(min_key, |from| from.max(min_key));
        plan_buckets(start, max_key, bucket_size, &observed)
    }

    async fn resume_point(
        &self,
        entity: EntityType,
        bucket_size: i64,
        fingerprint: &str,
        requested: Option<i64>,
    ) -> Result<Option<i64>, SyncError> {
        if requested.is_some() {
            return Ok(requested);
        }
        let Some(checkpoint) = self.checkpoints.load(entity).await? else {
            return Ok(None);
        };
        if !checkpoint.matches(bucket_size, fingerprint) {
            warn!(
                %entity,
                stored_bucket_size = checkpoint.bucket_size,
                bucket_size,
                "checkpoint written under a different bucket size or transform; starting over"
            );
            return Ok(None);
        }
        match checkpoint.last_completed_key.checked_add(1) {
            Some(next) => Ok(Some(next)),
            None => Ok(Some(i64::MAX)),
        }
    }

    async fn sync_entity_tracked(
        &mut self,
        entity: EntityType,
        bucket_size: i64,
        resume_from_key: Option<i64>,
        last_committed: &mut Option<i64>,
    ) -> Result<SyncSummary, SyncError> {
        if bucket_size <= 0 {
            return Err(SyncError::Config(format!(
                "bucket size must be positive, got {bucket_size}"
            )));
        }
        let definition = self.definition(entity)?;
        let spec = self
            .batch
            .registry()
            .get(entity)
            .map_err(|_| SyncError::UnknownEntity(entity.to_string()))?;
        if spec.mapping(&spec.key_field).map(|m| m.coercion) != Some(Coercion::Integer) {
            return Err(SyncError::NonNumericKey {
                entity,
                field: spec.key_field.clone(),
            });
        }
        let fingerprint = spec.fingerprint();
        let span = info_span!("sync_entity", run_id = %self.run_id, %entity, bucket_size);
        self.run_buckets(
            definition.as_ref(),
            bucket_size,
            &fingerprint,
            resume_from_key,
            last_committed,
        )
        .instrument(span)
        .await
    }

    async fn run_buckets(
        &mut self,
        definition: &dyn EntityDefinition,
        bucket_size: i64,
        fingerprint: &str,
        resume_from_key: Option<i64>,
        last_committed: &mut Option<i64>,
    ) -> Result<SyncSummary, SyncError> {
        let entity = definition.entity_type();
        let resume = self
            .resume_point(entity, bucket_size, fingerprint, resume_from_key)
            .await?;

        let observed = self.observed_windows(definition, bucket_size).await?;

        let mut summary = SyncSummary::default();
        let Some((min_key, max_key)) = key_bounds(&observed) else {
            info!("no rows on either side");
            self.checkpoints.clear(entity).await?;
            return Ok(summary);
        };
        let start = resume.map_or(min_key, |from| from.max(min_key));
        let plan = plan_buckets(start, max_key, bucket_size, &observed)?;
        info!(buckets = plan.len(), start, max_key, resumed = resume.is_some(), "planned");

        for bucket in plan {
            if self.cancel.is_cancelled() {
                warn!(last_committed = ?*last_committed, "cancelled between buckets");
                return Err(SyncError::Cancelled {
                    entity,
                    last_committed: *last_committed,
                });
            }
            let range = bucket.range_from(start);
            let outcome = self
                .batch
                .sync_bucket(entity, range)
                .instrument(info_span!("bucket", %range))
                .await?;
            self.dispatch_hooks(definition, &outcome).await?;
            summary.absorb(&outcome.counts);

            self.checkpoints
                .save(&Checkpoint {
                    entity: entity.to_string(),
                    last_completed_key: bucket.end,
                    bucket_size,
                    transform_fingerprint: fingerprint.to_string(),
                    updated_at: Utc::now(),
                })
                .await?;
            *last_committed = Some(bucket.end);
        }

        self.checkpoints.clear(entity).await?;
        info!(%summary, "entity synced");
        Ok(summary)
    }

    /// Every enabled entity in dependency order. Stops at the first failure.
    pub async fn sync_all(
        &mut self,
        bucket_size: i64,
    ) -> Result<Vec<(EntityType, SyncSummary)>, SyncRunError> {
        let plan: Vec<(EntityType, SyncMode)> = self
            .catalogue
            .definitions()
            .iter()
            .map(|definition| {
                let entity = definition.entity_type();
                (entity, self.overrides.mode(entity, definition.mode()))
            })
            .filter(|(entity, _)| self.overrides.is_enabled(*entity))
            .collect();
        info!(run_id = %self.run_id, entities = plan.len(), "sync run started");
        self.cache.invalidate_all();

        let mut completed = Vec::with_capacity(plan.len());
        for (entity, mode) in plan {
            let mut last_committed = None;
            let result = match mode {
                SyncMode::Direct => self.sync_entity_direct(entity).await,
                SyncMode::Bucketed => {
                    let size = self.overrides.bucket_size(entity, bucket_size);
                    self.sync_entity_tracked(entity, size, None, &mut last_committed)
                        .await
                }
            };
            match result {
                Ok(summary) => completed.push((entity, summary)),
                Err(error) => {
                    warn!(%entity, %error, "sync run stopped");
                    return Err(SyncRunError {
                        completed,
                        entity,
                        last_committed,
                        error,
                    });
                }
            }
        }
        Ok(completed)
    }
}
