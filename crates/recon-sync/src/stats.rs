//! Per-vacancy applicant statistics, recomputed window by window from upstream applications.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{
    parse_datetime, AggregatedStatistic, EntityType, Key, KeyRange, SyncError, TargetTable,
    UpstreamRecord, Value,
};
use recon_entities::{ApplicationEntity, EntityCatalogue};
use recon_storage::{DownstreamStore, UpstreamReader};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bucket::{key_bounds, plan_buckets};

/// Decimal places kept in `ratio`.
pub const RATIO_SCALE: u32 = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub windows: u64,
    pub facts: u64,
    pub statistics: u64,
}

pub struct StatisticsAggregator {
    catalogue: Arc<EntityCatalogue>,
    upstream: Arc<dyn UpstreamReader>,
    downstream: Arc<dyn DownstreamStore>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Tally {
    count: u64,
    updated_at: Option<DateTime<Utc>>,
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::DateTime(dt) => Some(*dt),
        Value::Text(raw) => parse_datetime(raw),
        _ => None,
    }
}

fn int_field(record: &UpstreamRecord, field: &str) -> Option<i64> {
    match record.fields.get(field)? {
        Value::Text(raw) => raw.trim().parse().ok(),
        other => Key::from_value(other).and_then(|key| key.as_int()),
    }
}

/// Statistics for the live fact rows among `applications`.
///
/// `total` counts distinct applications per fact row; `count` those carrying a given
/// characteristic value, and `updated_at` is the newest contributing application.
pub fn compute_statistics(
    definition: &ApplicationEntity,
    live_facts: &HashSet<i64>,
    applications: &[UpstreamRecord],
) -> Vec<AggregatedStatistic> {
    let mut totals: BTreeMap<i64, BTreeSet<&Key>> = BTreeMap::new();
    let mut tallies: BTreeMap<(i64, EntityType, i64), Tally> = BTreeMap::new();

    for application in applications {
        let Some(fact) = int_field(application, definition.fact_field) else {
            continue;
        };
        if !live_facts.contains(&fact) {
            continue;
        }
        totals.entry(fact).or_default().insert(&application.key);
        let modified = timestamp(application.fields.get(definition.last_modified_field));
        for (field, characteristic) in &definition.characteristics {
            let Some(object) = int_field(application, field) else {
                continue;
            };
            let tally = tallies.entry((fact, *characteristic, object)).or_default();
            tally.count += 1;
            tally.updated_at = tally.updated_at.max(modified);
        }
    }

    tallies
        .into_iter()
        .filter_map(|((fact, characteristic, object), tally)| {
            let total = totals.get(&fact)?.len() as u64;
            let ratio = (Decimal::from(tally.count) / Decimal::from(total)).round_dp(RATIO_SCALE);
            Some(AggregatedStatistic {
                fact_key: fact,
                characteristic: characteristic.to_string(),
                object_key: object,
                count: tally.count,
                total,
                ratio,
                updated_at: tally.updated_at,
            })
        })
        .collect()
}

impl StatisticsAggregator {
    pub fn new(
        catalogue: Arc<EntityCatalogue>,
        upstream: Arc<dyn UpstreamReader>,
        downstream: Arc<dyn DownstreamStore>,
    ) -> Self {
        Self {
            catalogue,
            upstream,
            downstream,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the statistics of every fact window from `initial_key` upwards, one transaction
    /// per window.
    pub async fn aggregate(
        &self,
        bucket_size: i64,
        initial_key: Option<i64>,
    ) -> Result<AggregationSummary, SyncError> {
        let span = info_span!("aggregate", bucket_size);
        self.run(bucket_size, initial_key).instrument(span).await
    }

    async fn run(
        &self,
        bucket_size: i64,
        initial_key: Option<i64>,
    ) -> Result<AggregationSummary, SyncError> {
        let definition = self.catalogue.statistics();
        let fact_target = self
            .catalogue
            .get_type(definition.fact_entity)
            .map(|fact| fact.target())
            .ok_or_else(|| SyncError::UnknownEntity(definition.fact_entity.to_string()))?;

        let observed = self.downstream.window_stats(&fact_target, bucket_size).await?;
        let mut summary = AggregationSummary::default();
        let Some((min_key, max_key)) = key_bounds(&observed) else {
            info!("no fact rows to aggregate");
            return Ok(summary);
        };
        let start = initial_key.map_or(min_key, |from| from.max(min_key));
        let plan = plan_buckets(start, max_key, bucket_size, &observed)?;

        let mut last_committed = None;
        for bucket in plan {
            if self.cancel.is_cancelled() {
                warn!(?last_committed, "aggregation cancelled between windows");
                return Err(SyncError::Cancelled {
                    entity: definition.fact_entity,
                    last_committed,
                });
            }
            let range = bucket.range_from(start);
            let written = self.aggregate_window(definition, &fact_target, range).await?;
            summary.windows += 1;
            summary.facts += written.0;
            summary.statistics += written.1;
            last_committed = Some(bucket.end);
        }
        info!(
            windows = summary.windows,
            facts = summary.facts,
            statistics = summary.statistics,
            "aggregation finished"
        );
        Ok(summary)
    }

    /// Returns `(live facts, statistics written)`.
    async fn aggregate_window(
        &self,
        definition: &ApplicationEntity,
        fact_target: &TargetTable,
        range: KeyRange,
    ) -> Result<(u64, u64), SyncError> {
        let applications = self
            .upstream
            .read_related(&definition.source, definition.fact_field, range)
            .await?;

        let mut tx = self.downstream.begin().await?;
        let result = async {
            let live: HashSet<i64> = tx
                .read_range(fact_target, range)
                .await?
                .into_iter()
                .filter(|row| !row.soft_deleted)
                .filter_map(|row| row.key.as_int())
                .collect();
            let stats = compute_statistics(definition, &live, &applications);
            let written = tx.replace_statistics(&definition.target, range, &stats).await?;
            Ok::<(u64, u64), SyncError>((live.len() as u64, written))
        }
        .await;

        match result {
            Ok(counts) => {
                tx.commit().await?;
                debug!(%range, facts = counts.0, statistics = counts.1, "window aggregated");
                Ok(counts)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(%range, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
