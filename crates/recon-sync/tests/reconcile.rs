use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{
    DiffSide, EntityType, FieldMap, Key, SourceTable, StoreError, SyncError, SyncSummary, Value,
};
use recon_entities::{EntityCatalogue, GRADE, VACANCY};
use recon_storage::{CheckpointStore, MemoryCheckpointStore, MemoryDownstream, MemoryUpstream};
use recon_sync::{
    BucketOutcome, HookContext, HookKey, HookRegistry, MembershipHook, Orchestrator,
    PostSyncHook, StatisticsAggregator, SyncOptions,
};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

const REFERENCE_TABLES: [&str; 7] = [
    "list_age_group",
    "list_disability",
    "list_ethnic_group",
    "list_ethnicity",
    "list_gender",
    "list_religion",
    "list_sexual_orientation",
];

struct Harness {
    catalogue: Arc<EntityCatalogue>,
    upstream: MemoryUpstream,
    downstream: MemoryDownstream,
    checkpoints: MemoryCheckpointStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            catalogue: Arc::new(EntityCatalogue::standard().expect("catalogue")),
            upstream: MemoryUpstream::new(),
            downstream: MemoryDownstream::new(),
            checkpoints: MemoryCheckpointStore::new(),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.catalogue),
            Arc::new(self.upstream.clone()),
            Arc::new(self.downstream.clone()),
            Arc::new(self.checkpoints.clone()),
        )
        .expect("orchestrator")
    }

    async fn add_vacancy(&self, fields: FieldMap) {
        self.upstream.upsert(&vacancies(), fields).await;
    }

    async fn vacancy_keys(&self) -> Vec<i64> {
        self.downstream
            .rows("vacancy")
            .await
            .iter()
            .filter_map(|row| row.get("id").and_then(Key::from_value))
            .filter_map(|key| key.as_int())
            .collect()
    }

    async fn is_deleted(&self, id: i64) -> bool {
        self.downstream
            .row("vacancy", &Key::Int(id))
            .await
            .and_then(|row| row.get("is_deleted").cloned())
            == Some(Value::Bool(true))
    }
}

fn vacancies() -> SourceTable {
    SourceTable::new("vacancies", "vacancy_id")
}

fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn vacancy(id: i64, updated: &str) -> FieldMap {
    fields(&[
        ("vacancy_id", Value::Int(id)),
        ("row_last_updated", Value::from(updated)),
        ("vacancy_title", Value::from(format!("Vacancy {id}"))),
        ("salary_minimum", Value::from("32000.00")),
        ("salary_maximum_optional", Value::from("")),
        ("live_date", Value::from("2024-01-01")),
        ("closing_date", Value::from("2024-02-01")),
    ])
}

fn graded_vacancy(id: i64, grade_group: i64) -> FieldMap {
    let mut row = vacancy(id, "2024-01-01 09:00:00");
    row.insert("job_grade_id".into(), Value::Int(grade_group));
    row
}

fn grade_group(id: i64, desc: &str, shorthand: &str) -> FieldMap {
    fields(&[
        ("job_grade_id", Value::Int(id)),
        ("job_grade_desc", Value::from(desc)),
        ("job_grade_shorthand", Value::from(shorthand)),
        ("row_last_updated", Value::from("2024-01-01 00:00:00")),
    ])
}

fn application(id: i64, vacancy: i64, age: i64, gender: Option<i64>) -> FieldMap {
    fields(&[
        ("application_id", Value::Int(id)),
        ("vacancy_id", Value::Int(vacancy)),
        ("age_group_id", Value::Int(age)),
        ("gender_id", Value::from(gender)),
        ("row_last_updated", Value::from("2024-03-01 12:00:00")),
    ])
}

async fn seed_reference_tables(harness: &Harness) {
    for table in REFERENCE_TABLES {
        harness.upstream.create_table(table).await;
    }
    harness.upstream.create_table("list_type_of_role").await;
    let groups = SourceTable::new("list_job_grade", "job_grade_id");
    for row in [
        grade_group(1, "Grade 6", "G6"),
        grade_group(2, "Grade 7", "G7"),
    ] {
        harness.upstream.upsert(&groups, row).await;
    }
}

#[tokio::test]
async fn eleven_rows_in_buckets_of_five_take_three_buckets() {
    let harness = Harness::new();
    for id in 1..=11 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }

    let summary = harness
        .orchestrator()
        .sync_entity(VACANCY, 5, None)
        .await
        .expect("sync");
    assert_eq!(summary.created, 11);
    assert_eq!(summary.buckets, 3);
    assert_eq!(harness.vacancy_keys().await, (1..=11).collect::<Vec<_>>());

    let checkpoints: Vec<i64> = harness
        .checkpoints
        .history()
        .await
        .iter()
        .map(|c| c.last_completed_key)
        .collect();
    assert_eq!(checkpoints, vec![4, 9, 14]);
    assert!(harness.checkpoints.load(VACANCY).await.expect("load").is_none());
}

#[tokio::test]
async fn second_run_without_changes_writes_nothing() {
    let harness = Harness::new();
    for id in 1..=6 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut orchestrator = harness.orchestrator();
    orchestrator.sync_entity(VACANCY, 4, None).await.expect("first");

    let again = orchestrator.sync_entity(VACANCY, 4, None).await.expect("second");
    assert!(again.is_noop());
    assert_eq!(
        again,
        SyncSummary {
            buckets: 2,
            ..SyncSummary::default()
        }
    );
}

#[tokio::test]
async fn newer_upstream_rows_are_updated_and_older_ones_ignored() {
    let harness = Harness::new();
    for id in 1..=3 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut orchestrator = harness.orchestrator();
    orchestrator.sync_entity(VACANCY, 10, None).await.expect("seed");

    let mut renamed = vacancy(2, "2024-01-02 09:00:00");
    renamed.insert("vacancy_title".into(), Value::from("Senior analyst"));
    harness.add_vacancy(renamed).await;
    let mut stale = vacancy(3, "2023-12-31 09:00:00");
    stale.insert("vacancy_title".into(), Value::from("Old title"));
    harness.add_vacancy(stale).await;

    let summary = orchestrator.sync_entity(VACANCY, 10, None).await.expect("sync");
    assert_eq!((summary.created, summary.updated), (0, 1));
    let row = harness.downstream.row("vacancy", &Key::Int(2)).await.expect("row");
    assert_eq!(row["title"], Value::from("Senior analyst"));
    let row = harness.downstream.row("vacancy", &Key::Int(3)).await.expect("row");
    assert_eq!(row["title"], Value::from("Vacancy 3"));
}

#[tokio::test]
async fn removed_rows_are_soft_deleted_once_and_restored_on_return() {
    let harness = Harness::new();
    for id in 1..=4 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut orchestrator = harness.orchestrator();
    orchestrator.sync_entity(VACANCY, 10, None).await.expect("seed");

    harness.upstream.remove(&vacancies(), &Key::Int(3)).await;
    let summary = orchestrator.sync_entity(VACANCY, 10, None).await.expect("delete");
    assert_eq!(summary.deleted, 1);
    assert!(harness.is_deleted(3).await);
    assert_eq!(harness.vacancy_keys().await.len(), 4);

    let summary = orchestrator.sync_entity(VACANCY, 10, None).await.expect("repeat");
    assert_eq!(summary.deleted, 0);

    harness.add_vacancy(vacancy(3, "2024-01-01 09:00:00")).await;
    let summary = orchestrator.sync_entity(VACANCY, 10, None).await.expect("restore");
    assert_eq!((summary.undeleted, summary.updated), (1, 0));
    assert!(!harness.is_deleted(3).await);
}

#[tokio::test]
async fn rows_failing_ingest_validation_are_not_created() {
    let harness = Harness::new();
    harness.add_vacancy(vacancy(1, "2024-01-01 09:00:00")).await;
    let mut no_salary = vacancy(2, "2024-01-01 09:00:00");
    no_salary.insert("salary_minimum".into(), Value::from("competitive"));
    harness.add_vacancy(no_salary).await;

    let summary = harness
        .orchestrator()
        .sync_entity(VACANCY, 10, None)
        .await
        .expect("sync");
    assert_eq!(summary.created, 1);
    assert_eq!(harness.vacancy_keys().await, vec![1]);
}

#[tokio::test]
async fn unsorted_upstream_fails_the_bucket() {
    let harness = Harness::new();
    harness.upstream.serve_unsorted("vacancies").await;
    for id in [3, 1, 2] {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }

    let err = harness
        .orchestrator()
        .sync_entity(VACANCY, 10, None)
        .await
        .expect_err("ordering");
    assert!(matches!(
        err,
        SyncError::OrderingViolation {
            side: DiffSide::Upstream,
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert!(harness.vacancy_keys().await.is_empty());
}

#[tokio::test]
async fn transform_failure_rolls_back_its_bucket_and_the_rerun_resumes() {
    let harness = Harness::new();
    for id in 1..=4 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut broken = vacancy(3, "2024-01-01 09:00:00");
    broken.remove("vacancy_title");
    harness.add_vacancy(broken).await;

    let err = harness
        .orchestrator()
        .sync_entity(VACANCY, 2, None)
        .await
        .expect_err("transform");
    match err {
        SyncError::Transform { entity, key, .. } => {
            assert_eq!(entity, VACANCY);
            assert_eq!(key, Key::Int(3));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.vacancy_keys().await, vec![1]);
    assert_eq!(harness.downstream.rollback_count().await, 1);
    let stored = harness.checkpoints.load(VACANCY).await.expect("load");
    assert_eq!(stored.map(|c| c.last_completed_key), Some(1));

    harness.add_vacancy(vacancy(3, "2024-01-01 09:00:00")).await;
    let summary = harness
        .orchestrator()
        .sync_entity(VACANCY, 2, None)
        .await
        .expect("resume");
    assert_eq!((summary.created, summary.buckets), (3, 2));
    assert_eq!(harness.vacancy_keys().await, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn malformed_rows_that_need_no_write_do_not_fail_the_bucket() {
    let harness = Harness::new();
    for id in 1..=2 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut orchestrator = harness.orchestrator();
    orchestrator.sync_entity(VACANCY, 10, None).await.expect("seed");

    // same timestamp, so the row classifies as unchanged and is never transformed
    let mut garbled = vacancy(1, "2024-01-01 09:00:00");
    garbled.insert("vacancy_title".into(), Value::Null);
    harness.add_vacancy(garbled).await;
    let summary = orchestrator.sync_entity(VACANCY, 10, None).await.expect("resync");
    assert!(summary.is_noop());

    let summary = harness
        .orchestrator()
        .with_options(SyncOptions { create_only: true })
        .sync_entity(VACANCY, 10, None)
        .await
        .expect("create only");
    assert!(summary.is_noop());

    let mut newer = vacancy(1, "2024-05-01 09:00:00");
    newer.insert("vacancy_title".into(), Value::Null);
    harness.add_vacancy(newer).await;
    let err = orchestrator
        .sync_entity(VACANCY, 10, None)
        .await
        .expect_err("update needs the transform");
    assert!(matches!(err, SyncError::Transform { .. }));
}

#[tokio::test]
async fn checkpoint_from_another_bucket_size_is_ignored() {
    let harness = Harness::new();
    for id in 1..=4 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut broken = vacancy(4, "2024-01-01 09:00:00");
    broken.insert("live_date".into(), Value::from("soon"));
    harness.add_vacancy(broken).await;
    harness
        .orchestrator()
        .sync_entity(VACANCY, 2, None)
        .await
        .expect_err("bad date");
    assert_eq!(harness.vacancy_keys().await, vec![1, 2, 3]);

    harness.add_vacancy(vacancy(4, "2024-01-01 09:00:00")).await;
    let summary = harness
        .orchestrator()
        .sync_entity(VACANCY, 10, None)
        .await
        .expect("restart");
    assert_eq!((summary.created, summary.buckets), (1, 1));
}

#[tokio::test]
async fn transient_commit_failure_is_retryable_and_leaves_nothing_behind() {
    let harness = Harness::new();
    for id in 1..=3 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    harness
        .downstream
        .fail_next_commit(StoreError::Unavailable("connection reset".into()))
        .await;

    let mut orchestrator = harness.orchestrator();
    let err = orchestrator
        .sync_entity(VACANCY, 10, None)
        .await
        .expect_err("commit");
    assert!(err.is_retryable());
    assert!(harness.vacancy_keys().await.is_empty());

    let summary = orchestrator.sync_entity(VACANCY, 10, None).await.expect("retry");
    assert_eq!(summary.created, 3);
}

struct CancelAfterBucket(CancellationToken);

#[async_trait]
impl PostSyncHook for CancelAfterBucket {
    fn name(&self) -> &'static str {
        "cancel_after_bucket"
    }

    async fn after_bucket(
        &self,
        _ctx: &mut HookContext<'_>,
        _outcome: &BucketOutcome,
    ) -> Result<(), SyncError> {
        self.0.cancel();
        Ok(())
    }
}

#[tokio::test]
async fn cancellation_stops_between_buckets() {
    let harness = Harness::new();
    for id in 1..=11 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let token = CancellationToken::new();
    let mut hooks = HookRegistry::new();
    hooks.register(
        HookKey::new("vacancies", VACANCY),
        Arc::new(CancelAfterBucket(token.clone())),
    );

    let err = harness
        .orchestrator()
        .with_hooks(hooks)
        .with_cancellation(token)
        .sync_entity(VACANCY, 5, None)
        .await
        .expect_err("cancelled");
    match err {
        SyncError::Cancelled {
            entity,
            last_committed,
        } => {
            assert_eq!(entity, VACANCY);
            assert_eq!(last_committed, Some(4));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.vacancy_keys().await, vec![1, 2, 3, 4]);
    let stored = harness.checkpoints.load(VACANCY).await.expect("load");
    assert_eq!(stored.map(|c| c.last_completed_key), Some(4));
}

#[tokio::test]
async fn create_only_leaves_existing_rows_alone() {
    let harness = Harness::new();
    for id in 1..=3 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    harness
        .orchestrator()
        .sync_entity(VACANCY, 10, None)
        .await
        .expect("seed");

    harness.upstream.remove(&vacancies(), &Key::Int(1)).await;
    let mut renamed = vacancy(2, "2024-06-01 09:00:00");
    renamed.insert("vacancy_title".into(), Value::from("Renamed"));
    harness.add_vacancy(renamed).await;
    harness.add_vacancy(vacancy(4, "2024-01-01 09:00:00")).await;

    let summary = harness
        .orchestrator()
        .with_options(SyncOptions { create_only: true })
        .sync_entity(VACANCY, 10, None)
        .await
        .expect("create only");
    assert_eq!(
        (summary.created, summary.updated, summary.deleted),
        (1, 0, 0)
    );
    assert!(!harness.is_deleted(1).await);
    let row = harness.downstream.row("vacancy", &Key::Int(2)).await.expect("row");
    assert_eq!(row["title"], Value::from("Vacancy 2"));
}

#[tokio::test]
async fn full_run_builds_grades_and_vacancy_memberships() {
    let harness = Harness::new();
    seed_reference_tables(&harness).await;
    harness
        .upstream
        .upsert(
            &SourceTable::new("list_job_grade", "job_grade_id"),
            grade_group(3, "Grade 6, Grade 7", "G6,G7"),
        )
        .await;
    harness.add_vacancy(graded_vacancy(1, 1)).await;
    harness.add_vacancy(graded_vacancy(2, 3)).await;
    harness.add_vacancy(vacancy(3, "2024-01-01 09:00:00")).await;

    let completed = harness.orchestrator().sync_all(100).await.expect("sync all");
    let order: Vec<EntityType> = completed.iter().map(|(entity, _)| *entity).collect();
    assert_eq!(order.len(), harness.catalogue.definitions().len());
    assert_eq!(order.last(), Some(&VACANCY));

    // only the single-valued groups become grades
    let grades = harness.downstream.rows(GRADE.as_str()).await;
    assert_eq!(grades.len(), 2);

    let links = harness.downstream.memberships("vacancy_grade").await;
    assert_eq!(links.get(&Key::Int(1)), Some(&BTreeSet::from([Key::Int(1)])));
    assert_eq!(
        links.get(&Key::Int(2)),
        Some(&BTreeSet::from([Key::Int(1), Key::Int(2)]))
    );
    assert!(!links.contains_key(&Key::Int(3)));
}

fn membership_hooks(catalogue: &EntityCatalogue) -> (HookRegistry, Arc<MembershipHook>) {
    let hook = Arc::new(MembershipHook::new(
        catalogue.groupings_for_owner(VACANCY).cloned().collect(),
    ));
    let mut hooks = HookRegistry::new();
    hooks.register(HookKey::new("vacancies", VACANCY), hook.clone());
    (hooks, hook)
}

#[tokio::test]
async fn novel_grade_combination_triggers_exactly_one_resync() {
    let harness = Harness::new();
    seed_reference_tables(&harness).await;
    harness.add_vacancy(graded_vacancy(1, 1)).await;

    let (hooks, membership) = membership_hooks(&harness.catalogue);
    let mut orchestrator = harness.orchestrator().with_hooks(hooks);
    orchestrator.sync_all(100).await.expect("seed");
    assert_eq!(membership.resync_count(), 0);

    harness
        .upstream
        .upsert(
            &SourceTable::new("list_job_grade", "job_grade_id"),
            grade_group(3, "Grade 6, Grade 7", "G6,G7"),
        )
        .await;
    harness.add_vacancy(graded_vacancy(2, 3)).await;
    harness.add_vacancy(graded_vacancy(3, 3)).await;

    let summary = orchestrator.sync_entity(VACANCY, 100, None).await.expect("sync");
    assert_eq!(summary.created, 2);
    assert_eq!(membership.resync_count(), 1);

    let links = harness.downstream.memberships("vacancy_grade").await;
    let both = BTreeSet::from([Key::Int(1), Key::Int(2)]);
    assert_eq!(links.get(&Key::Int(2)), Some(&both));
    assert_eq!(links.get(&Key::Int(3)), Some(&both));
}

#[tokio::test]
async fn grouping_missing_after_resync_fails_the_run() {
    let harness = Harness::new();
    seed_reference_tables(&harness).await;
    harness.add_vacancy(graded_vacancy(1, 99)).await;

    let (hooks, membership) = membership_hooks(&harness.catalogue);
    let err = harness
        .orchestrator()
        .with_hooks(hooks)
        .sync_all(100)
        .await
        .expect_err("missing grouping");
    assert_eq!(err.entity, VACANCY);
    assert!(matches!(
        err.error,
        SyncError::CacheMissAfterInvalidation { .. }
    ));
    assert!(!err.is_retryable());
    assert_eq!(membership.resync_count(), 1);
}

#[tokio::test]
async fn memberships_are_rebuilt_for_unchanged_rows_after_a_failed_run() {
    let harness = Harness::new();
    seed_reference_tables(&harness).await;
    harness.add_vacancy(graded_vacancy(1, 99)).await;

    let err = harness
        .orchestrator()
        .sync_all(100)
        .await
        .expect_err("grade group 99 is unknown");
    assert_eq!(err.entity, VACANCY);
    assert!(matches!(
        err.error,
        SyncError::CacheMissAfterInvalidation { .. }
    ));
    // the fact bucket committed before its memberships failed
    assert_eq!(harness.vacancy_keys().await, vec![1]);
    assert!(harness.downstream.memberships("vacancy_grade").await.is_empty());

    harness
        .upstream
        .upsert(
            &SourceTable::new("list_job_grade", "job_grade_id"),
            grade_group(99, "Grade 8", "G8"),
        )
        .await;
    let completed = harness.orchestrator().sync_all(100).await.expect("rerun");
    let (_, summary) = completed
        .iter()
        .find(|(entity, _)| *entity == VACANCY)
        .expect("vacancy summary");
    assert_eq!((summary.created, summary.updated), (0, 0));

    let links = harness.downstream.memberships("vacancy_grade").await;
    assert_eq!(links.get(&Key::Int(1)), Some(&BTreeSet::from([Key::Int(99)])));
}

#[tokio::test]
async fn run_stops_at_the_first_failing_entity() {
    let harness = Harness::new();
    seed_reference_tables(&harness).await;

    let err = harness
        .orchestrator()
        .sync_all(100)
        .await
        .expect_err("vacancies table is missing");
    assert_eq!(err.entity, VACANCY);
    assert_eq!(err.last_committed, None);
    assert_eq!(
        err.completed.len(),
        harness.catalogue.definitions().len() - 1
    );
    assert!(matches!(
        err.error,
        SyncError::Store(StoreError::UnknownTable(_))
    ));
}

#[tokio::test]
async fn statistics_cover_live_vacancies_only() {
    let harness = Harness::new();
    for id in 1..=3 {
        harness.add_vacancy(vacancy(id, "2024-01-01 09:00:00")).await;
    }
    let mut orchestrator = harness.orchestrator();
    orchestrator.sync_entity(VACANCY, 100, None).await.expect("seed");
    harness.upstream.remove(&vacancies(), &Key::Int(3)).await;
    orchestrator.sync_entity(VACANCY, 100, None).await.expect("delete");

    let applications = SourceTable::new("application_characteristics", "application_id");
    for row in [
        application(10, 1, 1, Some(2)),
        application(11, 1, 1, None),
        application(12, 2, 2, None),
        application(13, 3, 1, Some(2)),
    ] {
        harness.upstream.upsert(&applications, row).await;
    }

    let aggregator = StatisticsAggregator::new(
        Arc::clone(&harness.catalogue),
        Arc::new(harness.upstream.clone()),
        Arc::new(harness.downstream.clone()),
    );
    let summary = aggregator.aggregate(100, None).await.expect("aggregate");
    assert_eq!((summary.windows, summary.facts, summary.statistics), (1, 2, 3));

    let stats = harness.downstream.statistics("applicant_statistics").await;
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|s| s.fact_key != 3));
    let gender = stats
        .iter()
        .find(|s| s.fact_key == 1 && s.characteristic == "gender")
        .expect("gender statistic");
    assert_eq!((gender.count, gender.total), (1, 2));
    assert_eq!(gender.ratio, Decimal::new(5, 1));

    aggregator.aggregate(100, None).await.expect("rerun");
    assert_eq!(
        harness.downstream.statistics("applicant_statistics").await,
        stats
    );
}
