//! Entity definitions for the recruitment data model: reference lists, grouping lists, the members
//! exploded from them, and the vacancy fact table with its many-to-many relations.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use recon_core::{
    Coercion, EntityTier, EntityType, FieldMap, FieldTransformSpec, RegistryError, RelationTable,
    SourceTable, StatisticsTable, SyncMode, TargetTable, TransformRegistry, Value,
};
use regex::Regex;
use rust_decimal::Decimal;

pub const CRATE_NAME: &str = "recon-entities";

pub const AGE_GROUP: EntityType = EntityType::new("age_group");
pub const DISABILITY: EntityType = EntityType::new("disability");
pub const ETHNIC_GROUP: EntityType = EntityType::new("ethnic_group");
pub const ETHNICITY: EntityType = EntityType::new("ethnicity");
pub const GENDER: EntityType = EntityType::new("gender");
pub const RELIGION: EntityType = EntityType::new("religion");
pub const SEXUAL_ORIENTATION: EntityType = EntityType::new("sexual_orientation");
pub const JOB_GRADE_GROUP: EntityType = EntityType::new("job_grade_group");
pub const ROLE_TYPE_GROUP: EntityType = EntityType::new("role_type_group");
pub const GRADE: EntityType = EntityType::new("grade");
pub const ROLE_TYPE: EntityType = EntityType::new("role_type");
pub const VACANCY: EntityType = EntityType::new("vacancy");

const LAST_UPDATED: &str = "last_updated";
const ROW_LAST_UPDATED: &str = "row_last_updated";

/// Where an entity's input rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOrigin {
    /// A read-only upstream table.
    Upstream(SourceTable),
    /// The non-deleted downstream rows of another entity type.
    Downstream(EntityType),
}

pub trait EntityDefinition: Send + Sync + fmt::Debug {
    fn entity_type(&self) -> EntityType;
    fn tier(&self) -> EntityTier;
    fn mode(&self) -> SyncMode;
    fn origin(&self) -> RecordOrigin;
    fn target(&self) -> TargetTable;
    fn transform_spec(&self) -> FieldTransformSpec;

    /// Rows failing this check are invisible to the diff, so their downstream copies get soft-deleted.
    fn is_valid_for_ingest(&self, _raw: &FieldMap) -> bool {
        true
    }

    fn source_name(&self) -> String {
        match self.origin() {
            RecordOrigin::Upstream(source) => source.table,
            RecordOrigin::Downstream(entity) => entity.to_string(),
        }
    }
}

fn entity_target(entity: EntityType) -> TargetTable {
    TargetTable::new(entity.as_str(), "id", LAST_UPDATED)
}

/// Plain `{prefix}id` / `{prefix}desc` upstream list.
#[derive(Debug, Clone)]
pub struct ReferenceList {
    pub entity: EntityType,
    pub table: &'static str,
    pub prefix: &'static str,
}

impl ReferenceList {
    pub const fn new(entity: EntityType, table: &'static str, prefix: &'static str) -> Self {
        Self {
            entity,
            table,
            prefix,
        }
    }

    fn key_field(&self) -> String {
        format!("{}id", self.prefix)
    }
}

impl EntityDefinition for ReferenceList {
    fn entity_type(&self) -> EntityType {
        self.entity
    }

    fn tier(&self) -> EntityTier {
        EntityTier::Reference
    }

    fn mode(&self) -> SyncMode {
        SyncMode::Direct
    }

    fn origin(&self) -> RecordOrigin {
        RecordOrigin::Upstream(SourceTable::new(self.table, self.key_field()))
    }

    fn target(&self) -> TargetTable {
        entity_target(self.entity)
    }

    fn transform_spec(&self) -> FieldTransformSpec {
        FieldTransformSpec::new(self.entity, 1)
            .key("id", &self.key_field())
            .last_modified(LAST_UPDATED, ROW_LAST_UPDATED)
            .required("description", &format!("{}desc", self.prefix), Coercion::Text)
    }
}

/// Upstream list whose descriptive columns hold comma-separated combinations of members.
#[derive(Debug, Clone)]
pub struct GroupList {
    pub entity: EntityType,
    pub table: &'static str,
    pub key_source: &'static str,
    /// `(downstream list field, upstream comma-separated field)`
    pub lists: Vec<(&'static str, &'static str)>,
}

impl EntityDefinition for GroupList {
    fn entity_type(&self) -> EntityType {
        self.entity
    }

    fn tier(&self) -> EntityTier {
        EntityTier::Reference
    }

    fn mode(&self) -> SyncMode {
        SyncMode::Direct
    }

    fn origin(&self) -> RecordOrigin {
        RecordOrigin::Upstream(SourceTable::new(self.table, self.key_source))
    }

    fn target(&self) -> TargetTable {
        entity_target(self.entity)
    }

    fn transform_spec(&self) -> FieldTransformSpec {
        self.lists.iter().fold(
            FieldTransformSpec::new(self.entity, 1)
                .key("id", self.key_source)
                .last_modified(LAST_UPDATED, ROW_LAST_UPDATED),
            |spec, (target, source)| {
                spec.required(target, source, Coercion::SplitList { separator: ',' })
            },
        )
    }
}

/// Member entity exploded from the single-valued rows of a grouping list.
///
/// A group row contributes a member only when its `discriminator_list` has exactly one element;
/// multi-valued rows are combinations of members that already exist on their own.
#[derive(Debug, Clone)]
pub struct ExplodedMember {
    pub entity: EntityType,
    pub group: EntityType,
    pub discriminator_list: &'static str,
    /// `(downstream field, group list field, required)`
    pub fields: Vec<(&'static str, &'static str, bool)>,
}

impl EntityDefinition for ExplodedMember {
    fn entity_type(&self) -> EntityType {
        self.entity
    }

    fn tier(&self) -> EntityTier {
        EntityTier::DerivedGroup
    }

    fn mode(&self) -> SyncMode {
        SyncMode::Direct
    }

    fn origin(&self) -> RecordOrigin {
        RecordOrigin::Downstream(self.group)
    }

    fn target(&self) -> TargetTable {
        entity_target(self.entity)
    }

    fn transform_spec(&self) -> FieldTransformSpec {
        self.fields.iter().fold(
            FieldTransformSpec::new(self.entity, 1)
                .key("id", "id")
                .last_modified(LAST_UPDATED, LAST_UPDATED),
            |spec, (target, source, required)| {
                if *required {
                    spec.required(target, source, Coercion::FirstOfList)
                } else {
                    spec.optional(target, source, Coercion::FirstOfList)
                }
            },
        )
    }

    fn is_valid_for_ingest(&self, raw: &FieldMap) -> bool {
        raw.get(self.discriminator_list)
            .and_then(Value::as_list)
            .is_some_and(|items| items.len() == 1)
    }
}

fn salary_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[+-]?\d{0,8}(\.\d{0,2})?$").ok())
        .as_ref()
}

fn is_salary(value: &Value) -> bool {
    match value {
        Value::Int(v) => v.unsigned_abs() < 100_000_000,
        Value::Decimal(d) => {
            d.normalize().scale() <= 2 && d.trunc().abs() < Decimal::from(100_000_000i64)
        }
        Value::Text(raw) => {
            let raw = raw.trim();
            raw.chars().any(|c| c.is_ascii_digit())
                && salary_pattern().is_some_and(|re| re.is_match(raw))
        }
        _ => false,
    }
}

/// Fact table of published vacancies.
#[derive(Debug, Clone)]
pub struct VacancyEntity;

impl EntityDefinition for VacancyEntity {
    fn entity_type(&self) -> EntityType {
        VACANCY
    }

    fn tier(&self) -> EntityTier {
        EntityTier::Fact
    }

    fn mode(&self) -> SyncMode {
        SyncMode::Bucketed
    }

    fn origin(&self) -> RecordOrigin {
        RecordOrigin::Upstream(SourceTable::new("vacancies", "vacancy_id"))
    }

    fn target(&self) -> TargetTable {
        entity_target(VACANCY)
    }

    fn transform_spec(&self) -> FieldTransformSpec {
        FieldTransformSpec::new(VACANCY, 1)
            .key("id", "vacancy_id")
            .last_modified(LAST_UPDATED, ROW_LAST_UPDATED)
            .required("title", "vacancy_title", Coercion::Text)
            .optional("description", "job_description", Coercion::Text)
            .optional("summary", "job_summary", Coercion::Text)
            .required("min_salary", "salary_minimum", Coercion::Decimal)
            .optional("max_salary", "salary_maximum_optional", Coercion::Decimal)
            .required("live_date", "live_date", Coercion::DateTime)
            .required("closing_date", "closing_date", Coercion::DateTime)
    }

    /// Minimum salary must be a decimal with at most 8 integer digits and 2 places; the maximum
    /// may be blank. Both dates are mandatory.
    fn is_valid_for_ingest(&self, raw: &FieldMap) -> bool {
        let present = |field: &str| {
            raw.get(field).is_some_and(|value| match value {
                Value::Null => false,
                Value::Text(s) => !s.trim().is_empty(),
                _ => true,
            })
        };
        let min_ok = raw.get("salary_minimum").is_some_and(is_salary);
        let max_ok = match raw.get("salary_maximum_optional") {
            None | Some(Value::Null) => true,
            Some(Value::Text(s)) if s.trim().is_empty() => true,
            Some(value) => is_salary(value),
        };
        min_ok && max_ok && present("live_date") && present("closing_date")
    }
}

/// Many-to-many relation between a fact entity and members, discovered through a grouping list.
///
/// The fact row names a group by `discriminator_field`; the group lists member values in
/// `group_list_field`; members whose `member_match_field` appears in that list belong.
#[derive(Debug, Clone)]
pub struct Grouping {
    pub name: &'static str,
    pub owner: EntityType,
    pub relation: RelationTable,
    pub discriminator_field: &'static str,
    pub group_entity: EntityType,
    pub group_list_field: &'static str,
    pub member_entity: EntityType,
    pub member_match_field: &'static str,
}

impl Grouping {
    /// Entity types re-synced when a discriminator is missing from the cache.
    pub fn resync_entities(&self) -> [EntityType; 2] {
        [self.group_entity, self.member_entity]
    }

    pub fn is_fed_by(&self, entity: EntityType) -> bool {
        self.group_entity == entity || self.member_entity == entity
    }
}

/// Upstream applications carrying one characteristic id per reference list, used for statistics.
#[derive(Debug, Clone)]
pub struct ApplicationEntity {
    pub source: SourceTable,
    /// Field naming the fact row an application belongs to.
    pub fact_field: &'static str,
    pub fact_entity: EntityType,
    pub last_modified_field: &'static str,
    /// `(upstream id field, characteristic name)`
    pub characteristics: Vec<(&'static str, EntityType)>,
    pub target: StatisticsTable,
}

impl ApplicationEntity {
    pub fn standard() -> Self {
        Self {
            source: SourceTable::new("application_characteristics", "application_id"),
            fact_field: "vacancy_id",
            fact_entity: VACANCY,
            last_modified_field: ROW_LAST_UPDATED,
            characteristics: vec![
                ("age_group_id", AGE_GROUP),
                ("disability_id", DISABILITY),
                ("ethnic_group_id", ETHNIC_GROUP),
                ("ethnicity_id", ETHNICITY),
                ("gender_id", GENDER),
                ("religion_id", RELIGION),
                ("sexual_orientation_id", SEXUAL_ORIENTATION),
            ],
            target: StatisticsTable::new("applicant_statistics", "vacancy_id", "object_id"),
        }
    }
}

/// Every entity type the engine knows, with the relations between them.
#[derive(Debug, Clone)]
pub struct EntityCatalogue {
    definitions: Vec<Arc<dyn EntityDefinition>>,
    groupings: Vec<Grouping>,
    statistics: ApplicationEntity,
}

impl EntityCatalogue {
    pub fn new(
        definitions: Vec<Arc<dyn EntityDefinition>>,
        groupings: Vec<Grouping>,
        statistics: ApplicationEntity,
    ) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for definition in &definitions {
            if !seen.insert(definition.entity_type()) {
                return Err(RegistryError::DuplicateEntity(definition.entity_type()));
            }
        }
        let mut definitions = definitions;
        // stable: registration order survives within a tier
        definitions.sort_by_key(|definition| definition.tier());
        Ok(Self {
            definitions,
            groupings,
            statistics,
        })
    }

    pub fn standard() -> Result<Self, RegistryError> {
        let lists = [
            (AGE_GROUP, "list_age_group", "age_group_"),
            (DISABILITY, "list_disability", "disability_"),
            (ETHNIC_GROUP, "list_ethnic_group", "ethnic_group_"),
            (ETHNICITY, "list_ethnicity", "ethnicity_"),
            (GENDER, "list_gender", "gender_"),
            (RELIGION, "list_religion", "religion_"),
            (SEXUAL_ORIENTATION, "list_sexual_orientation", "sexual_orientation_"),
        ];
        let mut definitions: Vec<Arc<dyn EntityDefinition>> = lists
            .into_iter()
            .map(|(entity, table, prefix)| {
                Arc::new(ReferenceList::new(entity, table, prefix)) as Arc<dyn EntityDefinition>
            })
            .collect();

        definitions.push(Arc::new(GroupList {
            entity: JOB_GRADE_GROUP,
            table: "list_job_grade",
            key_source: "job_grade_id",
            lists: vec![
                ("description", "job_grade_desc"),
                ("shorthand", "job_grade_shorthand"),
            ],
        }));
        definitions.push(Arc::new(GroupList {
            entity: ROLE_TYPE_GROUP,
            table: "list_type_of_role",
            key_source: "type_of_role_id",
            lists: vec![("description", "type_of_role_desc")],
        }));
        definitions.push(Arc::new(ExplodedMember {
            entity: GRADE,
            group: JOB_GRADE_GROUP,
            discriminator_list: "shorthand",
            fields: vec![
                ("shorthand_name", "shorthand", true),
                ("description", "description", false),
            ],
        }));
        definitions.push(Arc::new(ExplodedMember {
            entity: ROLE_TYPE,
            group: ROLE_TYPE_GROUP,
            discriminator_list: "description",
            fields: vec![("description", "description", true)],
        }));
        definitions.push(Arc::new(VacancyEntity));

        let groupings = vec![
            Grouping {
                name: "vacancy_grade",
                owner: VACANCY,
                relation: RelationTable::new("vacancy_grade", "vacancy_id", "grade_id"),
                discriminator_field: "job_grade_id",
                group_entity: JOB_GRADE_GROUP,
                group_list_field: "shorthand",
                member_entity: GRADE,
                member_match_field: "shorthand_name",
            },
            Grouping {
                name: "vacancy_role_type",
                owner: VACANCY,
                relation: RelationTable::new("vacancy_role_type", "vacancy_id", "role_type_id"),
                discriminator_field: "type_of_role_id",
                group_entity: ROLE_TYPE_GROUP,
                group_list_field: "description",
                member_entity: ROLE_TYPE,
                member_match_field: "description",
            },
        ];

        Self::new(definitions, groupings, ApplicationEntity::standard())
    }

    /// Definitions in dependency order.
    pub fn definitions(&self) -> &[Arc<dyn EntityDefinition>] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn EntityDefinition>> {
        self.definitions
            .iter()
            .find(|definition| definition.entity_type().as_str() == name)
    }

    pub fn get_type(&self, entity: EntityType) -> Option<&Arc<dyn EntityDefinition>> {
        self.definitions
            .iter()
            .find(|definition| definition.entity_type() == entity)
    }

    pub fn groupings(&self) -> &[Grouping] {
        &self.groupings
    }

    pub fn groupings_for_owner(&self, owner: EntityType) -> impl Iterator<Item = &Grouping> {
        self.groupings.iter().filter(move |g| g.owner == owner)
    }

    /// Relations whose membership cache goes stale when `entity` changes.
    pub fn relations_fed_by(&self, entity: EntityType) -> impl Iterator<Item = &Grouping> {
        self.groupings.iter().filter(move |g| g.is_fed_by(entity))
    }

    pub fn statistics(&self) -> &ApplicationEntity {
        &self.statistics
    }

    pub fn transform_registry(&self) -> Result<TransformRegistry, RegistryError> {
        let mut registry = TransformRegistry::new();
        for definition in &self.definitions {
            registry.register(definition.transform_spec())?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn vacancy(min: &str, max: Value) -> FieldMap {
        raw(&[
            ("vacancy_id", Value::Int(1)),
            ("salary_minimum", Value::from(min)),
            ("salary_maximum_optional", max),
            ("live_date", Value::from("2024-01-01")),
            ("closing_date", Value::from("2024-02-01")),
        ])
    }

    #[test]
    fn catalogue_orders_entities_by_tier() {
        let catalogue = EntityCatalogue::standard().expect("catalogue");
        let tiers: Vec<EntityTier> = catalogue.definitions().iter().map(|d| d.tier()).collect();
        let mut sorted = tiers.clone();
        sorted.sort();
        assert_eq!(tiers, sorted);

        let names: Vec<&str> = catalogue
            .definitions()
            .iter()
            .map(|d| d.entity_type().as_str())
            .collect();
        assert_eq!(names.first(), Some(&"age_group"));
        assert_eq!(names.last(), Some(&"vacancy"));
        let position = |name: &str| names.iter().position(|n| *n == name);
        assert!(position("job_grade_group") < position("grade"));
    }

    #[test]
    fn every_transform_registers() {
        let catalogue = EntityCatalogue::standard().expect("catalogue");
        let registry = catalogue.transform_registry().expect("registry");
        assert_eq!(registry.len(), catalogue.definitions().len());
    }

    #[test]
    fn duplicate_entities_are_rejected() {
        let definitions: Vec<Arc<dyn EntityDefinition>> = vec![
            Arc::new(ReferenceList::new(GENDER, "list_gender", "gender_")),
            Arc::new(ReferenceList::new(GENDER, "list_gender", "gender_")),
        ];
        let err = EntityCatalogue::new(definitions, Vec::new(), ApplicationEntity::standard())
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateEntity(GENDER));
    }

    #[test]
    fn vacancy_salary_predicate() {
        let entity = VacancyEntity;
        assert!(entity.is_valid_for_ingest(&vacancy("32000.50", Value::Null)));
        assert!(entity.is_valid_for_ingest(&vacancy("32000", Value::from(""))));
        assert!(entity.is_valid_for_ingest(&vacancy("32000", Value::from("41000.5"))));
        assert!(!entity.is_valid_for_ingest(&vacancy("32,000", Value::Null)));
        assert!(!entity.is_valid_for_ingest(&vacancy("", Value::Null)));
        assert!(!entity.is_valid_for_ingest(&vacancy("123456789", Value::Null)));
        assert!(!entity.is_valid_for_ingest(&vacancy("32000.505", Value::Null)));
        assert!(!entity.is_valid_for_ingest(&vacancy("32000", Value::from("lots"))));

        let mut undated = vacancy("32000", Value::Null);
        undated.insert("closing_date".into(), Value::Null);
        assert!(!entity.is_valid_for_ingest(&undated));
    }

    #[test]
    fn exploded_members_need_single_valued_groups() {
        let catalogue = EntityCatalogue::standard().expect("catalogue");
        let grade = catalogue.get_type(GRADE).expect("grade");
        let single = raw(&[("shorthand", Value::TextList(vec!["G7".into()]))]);
        let combo = raw(&[("shorthand", Value::TextList(vec!["G6".into(), "G7".into()]))]);
        assert!(grade.is_valid_for_ingest(&single));
        assert!(!grade.is_valid_for_ingest(&combo));
        assert!(!grade.is_valid_for_ingest(&FieldMap::new()));
        assert_eq!(grade.origin(), RecordOrigin::Downstream(JOB_GRADE_GROUP));
    }

    #[test]
    fn group_lists_split_combinations() {
        let catalogue = EntityCatalogue::standard().expect("catalogue");
        let registry = catalogue.transform_registry().expect("registry");
        let out = registry
            .transform(
                JOB_GRADE_GROUP,
                &raw(&[
                    ("job_grade_id", Value::Int(12)),
                    ("job_grade_desc", Value::from("Grade 6, Grade 7")),
                    ("job_grade_shorthand", Value::from("G6,G7")),
                    ("row_last_updated", Value::from("2024-01-01 00:00:00")),
                ]),
            )
            .expect("transform");
        assert_eq!(
            out["shorthand"],
            Value::TextList(vec!["G6".into(), "G7".into()])
        );
        assert_eq!(out["id"], Value::Int(12));
    }

    #[test]
    fn relations_are_fed_by_group_and_member() {
        let catalogue = EntityCatalogue::standard().expect("catalogue");
        let fed: Vec<&str> = catalogue.relations_fed_by(GRADE).map(|g| g.name).collect();
        assert_eq!(fed, vec!["vacancy_grade"]);
        assert_eq!(catalogue.relations_fed_by(VACANCY).count(), 0);
        assert_eq!(catalogue.groupings_for_owner(VACANCY).count(), 2);
    }
}
