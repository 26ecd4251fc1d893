use thiserror::Error;

use crate::types::{SnapshotDate, Timestamp};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entity '{key}' not found")]
    EntityNotFound { key: String },

    #[error("Batch {batch_id} has no resolvable records ({rejected} rejected)")]
    NoResolvableRecords { batch_id: String, rejected: usize },

    #[error("Leakage: provider {provider_id} at {snapshot_date} read a fact from {max_included}")]
    Leakage {
        provider_id:   String,
        snapshot_date: SnapshotDate,
        max_included:  Timestamp,
    },

    #[error("Version chain for '{payment_key}' is broken: {detail}")]
    BrokenChain { payment_key: String, detail: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
