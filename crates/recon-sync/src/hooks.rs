//! Post-sync hooks dispatched after every committed bucket, keyed by (source, destination).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{EntityTier, EntityType, Key, KeyRange, SyncError};
use recon_entities::{EntityCatalogue, Grouping};
use recon_storage::DownstreamStore;
use tracing::{debug, warn};

use crate::batch::{BatchSynchronizer, BucketOutcome};
use crate::groups::{discriminator, GroupMembershipCache};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookKey {
    pub source: String,
    pub destination: EntityType,
}

impl HookKey {
    pub fn new(source: impl Into<String>, destination: EntityType) -> Self {
        Self {
            source: source.into(),
            destination,
        }
    }
}

/// What a hook may touch while it runs.
pub struct HookContext<'a> {
    pub catalogue: &'a EntityCatalogue,
    pub batch: &'a BatchSynchronizer,
    pub downstream: &'a dyn DownstreamStore,
    pub cache: &'a mut GroupMembershipCache,
}

#[async_trait]
pub trait PostSyncHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn after_bucket(
        &self,
        ctx: &mut HookContext<'_>,
        outcome: &BucketOutcome,
    ) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
pub struct NoopHook;

#[async_trait]
impl PostSyncHook for NoopHook {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn after_bucket(
        &self,
        _ctx: &mut HookContext<'_>,
        _outcome: &BucketOutcome,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}

pub struct HookRegistry {
    hooks: HashMap<HookKey, Vec<Arc<dyn PostSyncHook>>>,
    fallback: Arc<dyn PostSyncHook>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self {
            hooks: HashMap::new(),
            fallback: Arc::new(NoopHook),
        }
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache invalidation for everything feeding a relation, membership rebuilds for fact owners.
    pub fn standard(catalogue: &EntityCatalogue) -> Self {
        let mut registry = Self::new();
        for definition in catalogue.definitions() {
            let entity = definition.entity_type();
            let key = HookKey::new(definition.source_name(), entity);

            let fed: Vec<String> = catalogue
                .relations_fed_by(entity)
                .map(|g| g.name.to_string())
                .collect();
            if !fed.is_empty() {
                registry.register(key.clone(), Arc::new(CacheInvalidationHook::new(fed)));
            }

            if definition.tier() == EntityTier::Fact {
                let owned: Vec<Grouping> = catalogue.groupings_for_owner(entity).cloned().collect();
                if !owned.is_empty() {
                    registry.register(key, Arc::new(MembershipHook::new(owned)));
                }
            }
        }
        registry
    }

    pub fn register(&mut self, key: HookKey, hook: Arc<dyn PostSyncHook>) {
        self.hooks.entry(key).or_default().push(hook);
    }

    /// Hooks for `key` in registration order; unknown keys resolve to a no-op.
    pub fn resolve(&self, key: &HookKey) -> &[Arc<dyn PostSyncHook>] {
        match self.hooks.get(key) {
            Some(hooks) => hooks,
            None => std::slice::from_ref(&self.fallback),
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Drops cached memberships when grouping lists or their members change.
#[derive(Debug)]
pub struct CacheInvalidationHook {
    relations: Vec<String>,
}

impl CacheInvalidationHook {
    pub fn new(relations: Vec<String>) -> Self {
        Self { relations }
    }
}

#[async_trait]
impl PostSyncHook for CacheInvalidationHook {
    fn name(&self) -> &'static str {
        "cache_invalidation"
    }

    async fn after_bucket(
        &self,
        ctx: &mut HookContext<'_>,
        outcome: &BucketOutcome,
    ) -> Result<(), SyncError> {
        if outcome.counts.is_empty() {
            return Ok(());
        }
        for relation in &self.relations {
            if ctx.cache.invalidate(relation) {
                debug!(relation = relation.as_str(), entity = %outcome.entity, "membership cache invalidated");
            }
        }
        Ok(())
    }
}

/// Rewrites many-to-many rows for every live fact row of the bucket, unchanged rows included,
/// writing only owners whose member set differs from what is stored.
///
/// A discriminator missing from the cache re-syncs the grouping entities once per bucket and
/// relation, then retries; a second miss fails the bucket.
#[derive(Debug)]
pub struct MembershipHook {
    groupings: Vec<Grouping>,
    resyncs: AtomicU64,
}

impl MembershipHook {
    pub fn new(groupings: Vec<Grouping>) -> Self {
        Self {
            groupings,
            resyncs: AtomicU64::new(0),
        }
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    async fn resync(&self, ctx: &mut HookContext<'_>, grouping: &Grouping) -> Result<(), SyncError> {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        for entity in grouping.resync_entities() {
            ctx.batch.sync_bucket(entity, KeyRange::unbounded()).await?;
        }
        ctx.cache.invalidate(grouping.name);
        Ok(())
    }

    async fn members_for(
        &self,
        ctx: &mut HookContext<'_>,
        grouping: &Grouping,
        value: &Key,
        resynced: &mut bool,
    ) -> Result<BTreeSet<Key>, SyncError> {
        let found = ctx
            .cache
            .lookup(ctx.downstream, ctx.catalogue, grouping, value)
            .await?;
        if let Some(members) = found {
            return Ok(members);
        }
        if *resynced {
            return Err(SyncError::CacheMissAfterInvalidation {
                relation: grouping.name.to_string(),
                discriminator: value.clone(),
            });
        }
        warn!(
            relation = grouping.name,
            discriminator = %value,
            "unknown grouping; re-syncing {} and {}",
            grouping.group_entity,
            grouping.member_entity
        );
        self.resync(ctx, grouping).await?;
        *resynced = true;
        ctx.cache
            .lookup(ctx.downstream, ctx.catalogue, grouping, value)
            .await?
            .ok_or_else(|| SyncError::CacheMissAfterInvalidation {
                relation: grouping.name.to_string(),
                discriminator: value.clone(),
            })
    }

    async fn sync_relation(
        &self,
        ctx: &mut HookContext<'_>,
        grouping: &Grouping,
        outcome: &BucketOutcome,
    ) -> Result<(), SyncError> {
        let mut desired: BTreeMap<Key, BTreeSet<Key>> = BTreeMap::new();
        let mut resynced = false;
        for (owner, raw) in outcome.live_rows() {
            let members = match discriminator(raw, grouping.discriminator_field) {
                Some(value) => self.members_for(ctx, grouping, &value, &mut resynced).await?,
                None => BTreeSet::new(),
            };
            desired.insert(owner.clone(), members);
        }
        if desired.is_empty() {
            return Ok(());
        }

        let owners: Vec<Key> = desired.keys().cloned().collect();
        let mut tx = ctx.downstream.begin().await?;
        let result = async {
            let stored = tx.read_memberships(&grouping.relation, &owners).await?;
            let empty = BTreeSet::new();
            let changed: BTreeMap<Key, BTreeSet<Key>> = desired
                .into_iter()
                .filter(|(owner, members)| stored.get(owner).unwrap_or(&empty) != members)
                .collect();
            if !changed.is_empty() {
                tx.replace_memberships(&grouping.relation, &changed).await?;
            }
            Ok::<usize, SyncError>(changed.len())
        }
        .await;
        match result {
            Ok(changed) => {
                tx.commit().await?;
                debug!(relation = grouping.name, owners = owners.len(), changed, "memberships synced");
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(relation = grouping.name, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl PostSyncHook for MembershipHook {
    fn name(&self) -> &'static str {
        "membership"
    }

    async fn after_bucket(
        &self,
        ctx: &mut HookContext<'_>,
        outcome: &BucketOutcome,
    ) -> Result<(), SyncError> {
        for grouping in &self.groupings {
            self.sync_relation(ctx, grouping, outcome).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_entities::{GRADE, JOB_GRADE_GROUP, VACANCY};

    #[test]
    fn standard_registry_wires_invalidation_and_membership() {
        let catalogue = EntityCatalogue::standard().expect("catalogue");
        let registry = HookRegistry::standard(&catalogue);

        let names = |entity: EntityType| {
            let definition = catalogue.get_type(entity).expect("definition");
            registry
                .resolve(&HookKey::new(definition.source_name(), entity))
                .iter()
                .map(|hook| hook.name())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(JOB_GRADE_GROUP), vec!["cache_invalidation"]);
        assert_eq!(names(GRADE), vec!["cache_invalidation"]);
        assert_eq!(names(VACANCY), vec!["membership"]);
        // four feeders plus the fact owner
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn unknown_keys_resolve_to_noop() {
        let registry = HookRegistry::new();
        let hooks = registry.resolve(&HookKey::new("nowhere", VACANCY));
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name(), "noop");
        assert!(registry.is_empty());
    }
}
