//! Relational store collaborators for filelink: domain lookups, artifact and
//! association persistence.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use filelink_core::{
    ArtifactRef, DomainItemRef, DomainRef, InsertedAssociation, NewArtifact, NewAssociation,
    RecordId,
};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::{MemoryStore, StoreCalls};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "filelink-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("refusing to write an empty {0} batch")]
    EmptyBatch(&'static str),
    #[error("{0}")]
    Backend(String),
}

/// Read-only access to domain records and their item hierarchy.
#[async_trait]
pub trait DomainLookup: Send + Sync {
    async fn all_identifiers(&self) -> Result<HashSet<String>, StoreError>;

    async fn resolve(&self, identifiers: &BTreeSet<String>) -> Result<Vec<DomainRef>, StoreError>;

    async fn resolve_with_item(
        &self,
        identifiers: &BTreeSet<String>,
    ) -> Result<Vec<DomainItemRef>, StoreError>;
}

/// Batch artifact writer. A batch is all-or-nothing and must not be empty.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn store_all(&self, items: &[NewArtifact]) -> Result<Vec<ArtifactRef>, StoreError>;
}

#[async_trait]
pub trait AssociationStore: Send + Sync {
    /// Source ids among `candidate_ids` that already have an association of `source_type`.
    async fn existing_source_ids(
        &self,
        candidate_ids: &BTreeSet<RecordId>,
        source_type: &str,
    ) -> Result<HashSet<RecordId>, StoreError>;

    /// Insert all records in one transaction.
    ///
    /// Rows whose `(source_id, source_type)` is already taken are skipped, so
    /// the result may be shorter than the input.
    async fn insert_all(
        &self,
        records: &[NewAssociation],
    ) -> Result<Vec<InsertedAssociation>, StoreError>;
}
