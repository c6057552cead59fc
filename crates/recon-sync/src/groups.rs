//! Process-local cache of discriminator → member keys, one map per relation.

use std::collections::{BTreeSet, HashMap};

use recon_core::{EntityType, FieldMap, Key, KeyRange, SyncError, Value};
use recon_entities::{EntityCatalogue, Grouping};
use recon_storage::DownstreamStore;
use tracing::debug;

type Memberships = HashMap<Key, BTreeSet<Key>>;

#[derive(Debug, Default)]
pub struct GroupMembershipCache {
    relations: HashMap<String, Memberships>,
    builds: u64,
}

impl GroupMembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the cached map for `relation`; returns whether one was cached.
    pub fn invalidate(&mut self, relation: &str) -> bool {
        self.relations.remove(relation).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.relations.clear();
    }

    pub fn is_cached(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    /// How many times a relation map has been built from the store.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    /// Members for `discriminator`, building the relation's map on first use.
    /// `None` means the discriminator names no known group.
    pub async fn lookup(
        &mut self,
        store: &dyn DownstreamStore,
        catalogue: &EntityCatalogue,
        grouping: &Grouping,
        discriminator: &Key,
    ) -> Result<Option<BTreeSet<Key>>, SyncError> {
        if !self.relations.contains_key(grouping.name) {
            let built = build(store, catalogue, grouping).await?;
            debug!(relation = grouping.name, groups = built.len(), "membership cache built");
            self.builds += 1;
            self.relations.insert(grouping.name.to_string(), built);
        }
        Ok(self
            .relations
            .get(grouping.name)
            .and_then(|memberships| memberships.get(discriminator))
            .cloned())
    }
}

fn list_items(value: Option<&Value>) -> Vec<&str> {
    match value {
        Some(Value::TextList(items)) => items.iter().map(String::as_str).collect(),
        Some(Value::Text(item)) => vec![item.as_str()],
        _ => Vec::new(),
    }
}

async fn build(
    store: &dyn DownstreamStore,
    catalogue: &EntityCatalogue,
    grouping: &Grouping,
) -> Result<Memberships, SyncError> {
    let target_of = |entity: EntityType| {
        catalogue
            .get_type(entity)
            .map(|definition| definition.target())
            .ok_or_else(|| SyncError::UnknownEntity(entity.to_string()))
    };
    let group_target = target_of(grouping.group_entity)?;
    let member_target = target_of(grouping.member_entity)?;

    let mut members_by_value: HashMap<String, Vec<Key>> = HashMap::new();
    for member in store.read_range(&member_target, KeyRange::unbounded()).await? {
        if member.soft_deleted {
            continue;
        }
        if let Some(value) = member.fields.get(grouping.member_match_field).and_then(Value::as_str) {
            members_by_value
                .entry(value.to_string())
                .or_default()
                .push(member.key);
        }
    }

    let mut memberships = Memberships::new();
    for group in store.read_range(&group_target, KeyRange::unbounded()).await? {
        if group.soft_deleted {
            continue;
        }
        let members = list_items(group.fields.get(grouping.group_list_field))
            .into_iter()
            .filter_map(|item| members_by_value.get(item))
            .flatten()
            .cloned()
            .collect();
        memberships.insert(group.key, members);
    }
    Ok(memberships)
}

/// The group a fact row points at. Blank or null means no membership.
pub fn discriminator(raw: &FieldMap, field: &str) -> Option<Key> {
    match raw.get(field)? {
        Value::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(text.parse::<i64>().map(Key::Int).unwrap_or_else(|_| Key::from(text)))
            }
        }
        other => Key::from_value(other),
    }
}
