use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{EntityType, Key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("{entity}: required field `{field}` (from `{source_field}`) is missing")]
    MissingField {
        entity: EntityType,
        field: String,
        source_field: String,
    },
    #[error("{entity}: cannot coerce `{source_field}` to {coercion} for `{field}`: {reason}")]
    Coercion {
        entity: EntityType,
        field: String,
        source_field: String,
        coercion: &'static str,
        reason: String,
    },
    #[error("no transform registered for {0}")]
    Unregistered(EntityType),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("transform for {0} is already registered")]
    Duplicate(EntityType),
    #[error("{entity}: downstream field `{field}` is mapped more than once")]
    DuplicateTarget { entity: EntityType, field: String },
    #[error("{entity}: `{field}` has no required mapping")]
    MissingRequired { entity: EntityType, field: String },
    #[error("entity {0} is defined more than once")]
    DuplicateEntity(EntityType),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("could not decode row: {0}")]
    Decode(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) | StoreError::Conflict(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSide {
    Upstream,
    Downstream,
}

impl fmt::Display for DiffSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffSide::Upstream => f.write_str("upstream"),
            DiffSide::Downstream => f.write_str("downstream"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transform failed for {entity} key {key}: {error}")]
    Transform {
        entity: EntityType,
        key: Key,
        #[source]
        error: TransformError,
    },
    #[error("{side} rows are not strictly ascending: {previous} then {next}")]
    OrderingViolation {
        side: DiffSide,
        previous: Key,
        next: Key,
    },
    #[error("{relation}: no grouping for discriminator {discriminator} even after re-sync")]
    CacheMissAfterInvalidation { relation: String, discriminator: Key },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("unknown entity type `{0}`")]
    UnknownEntity(String),
    #[error("{entity} key `{field}` is not numeric; it can only be synced directly")]
    NonNumericKey { entity: EntityType, field: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("sync of {entity} cancelled (last committed key: {last_committed:?})")]
    Cancelled {
        entity: EntityType,
        last_committed: Option<i64>,
    },
}

impl SyncError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SyncError::Store(err) => err.disposition(),
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}
