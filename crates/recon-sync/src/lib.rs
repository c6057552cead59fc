//! Reconciliation pipeline: bucketing, classification, batch writes, orchestration and
//! statistics aggregation over the store traits from `recon-storage`.

use std::sync::Arc;

use anyhow::{Context, Result};
use recon_entities::EntityCatalogue;
use recon_storage::{
    connect_pool, FileCheckpointStore, PgDownstreamStore, PgUpstreamReader,
};

pub mod batch;
pub mod bucket;
pub mod config;
pub mod diff;
pub mod groups;
pub mod hooks;
pub mod orchestrator;
pub mod stats;

pub use batch::{
    requires_update, BatchSynchronizer, BucketOutcome, SyncOptions, SyncedRow, UnchangedRow,
};
pub use bucket::{buckets, plan_buckets, Bucket};
pub use config::{EntityOverride, EntityOverrides, SyncConfig};
pub use diff::{DiffEntry, DiffFilter, RowDiff};
pub use groups::GroupMembershipCache;
pub use hooks::{
    CacheInvalidationHook, HookContext, HookKey, HookRegistry, MembershipHook, NoopHook,
    PostSyncHook,
};
pub use orchestrator::{Orchestrator, SyncRunError};
pub use stats::{AggregationSummary, StatisticsAggregator};

pub const CRATE_NAME: &str = "recon-sync";

/// Postgres-backed stores for both sides, as configured.
pub struct Stores {
    pub upstream: PgUpstreamReader,
    pub downstream: PgDownstreamStore,
}

pub async fn connect_stores(config: &SyncConfig) -> Result<Stores> {
    let downstream_pool = connect_pool(&config.database_url, config.max_connections)
        .await
        .context("connecting to the downstream database")?;
    let upstream_pool = connect_pool(&config.upstream_database_url, config.max_connections)
        .await
        .context("connecting to the upstream database")?;
    Ok(Stores {
        upstream: PgUpstreamReader::new(upstream_pool),
        downstream: PgDownstreamStore::new(downstream_pool),
    })
}

/// Orchestrator over Postgres stores, file checkpoints and `recon.yaml` overrides.
pub async fn orchestrator_from_config(config: &SyncConfig) -> Result<Orchestrator> {
    let catalogue = Arc::new(EntityCatalogue::standard().context("building entity catalogue")?);
    let overrides = EntityOverrides::load(&config.overrides_path()).await?;
    let stores = connect_stores(config).await?;
    let orchestrator = Orchestrator::new(
        catalogue,
        Arc::new(stores.upstream),
        Arc::new(stores.downstream),
        Arc::new(FileCheckpointStore::new(&config.checkpoint_dir)),
    )?
    .with_options(SyncOptions {
        create_only: config.create_only,
    })
    .with_overrides(overrides)?;
    Ok(orchestrator)
}

pub async fn aggregator_from_config(config: &SyncConfig) -> Result<StatisticsAggregator> {
    let catalogue = Arc::new(EntityCatalogue::standard().context("building entity catalogue")?);
    let stores = connect_stores(config).await?;
    Ok(StatisticsAggregator::new(
        catalogue,
        Arc::new(stores.upstream),
        Arc::new(stores.downstream),
    ))
}
