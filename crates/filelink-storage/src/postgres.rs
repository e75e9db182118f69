use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use filelink_core::{
    ArtifactRef, DomainItemRef, DomainRef, InsertedAssociation, NewArtifact, NewAssociation,
    RecordId,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info_span, Instrument};

use crate::{AssociationStore, DomainLookup, FileStore, StoreError};

// Artifact rows carry whole files, keep statements small.
const ARTIFACT_ROWS_PER_STATEMENT: usize = 100;
const ASSOCIATION_ROWS_PER_STATEMENT: usize = 1000;

/// Postgres implementation of every store collaborator.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(options: PgConnectOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DomainLookup for PgStore {
    async fn all_identifiers(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT number FROM domain_records")
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("number")?);
        }
        Ok(out)
    }

    async fn resolve(&self, identifiers: &BTreeSet<String>) -> Result<Vec<DomainRef>, StoreError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let numbers: Vec<String> = identifiers.iter().cloned().collect();
        let rows = sqlx::query(
            r#"
            SELECT id, number
              FROM domain_records
             WHERE number = ANY($1)
             ORDER BY id
            "#,
        )
        .bind(&numbers)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DomainRef {
                internal_id: row.try_get("id")?,
                identifier: row.try_get("number")?,
            });
        }
        Ok(out)
    }

    async fn resolve_with_item(
        &self,
        identifiers: &BTreeSet<String>,
    ) -> Result<Vec<DomainItemRef>, StoreError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let numbers: Vec<String> = identifiers.iter().cloned().collect();
        let rows = sqlx::query(
            r#"
            SELECT d.number, d.id, i.number AS item_number
              FROM domain_records d
              JOIN items i ON i.id = d.item_id
             WHERE d.number = ANY($1)
             ORDER BY d.id
            "#,
        )
        .bind(&numbers)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DomainItemRef {
                identifier: row.try_get("number")?,
                internal_id: row.try_get("id")?,
                item_number: row.try_get("item_number")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FileStore for PgStore {
    async fn store_all(&self, items: &[NewArtifact]) -> Result<Vec<ArtifactRef>, StoreError> {
        if items.is_empty() {
            return Err(StoreError::EmptyBatch("artifact"));
        }

        let span = info_span!("store_artifacts", rows = items.len());
        async {
            let mut tx = self.pool.begin().await?;
            let mut stored = Vec::with_capacity(items.len());

            for chunk in items.chunks(ARTIFACT_ROWS_PER_STATEMENT) {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new("INSERT INTO artifacts (title, description, content) ");
                builder.push_values(chunk, |mut row, item| {
                    row.push_bind(&item.title)
                        .push_bind(&item.description)
                        .push_bind(&item.content);
                });
                builder.push(" RETURNING id, title");

                let rows = builder.build().fetch_all(&mut *tx).await?;
                for row in rows {
                    stored.push(ArtifactRef {
                        id: row.try_get("id")?,
                        title: row.try_get("title")?,
                    });
                }
            }

            tx.commit().await?;
            debug!(stored = stored.len(), "artifact batch committed");
            Ok::<_, StoreError>(stored)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl AssociationStore for PgStore {
    async fn existing_source_ids(
        &self,
        candidate_ids: &BTreeSet<RecordId>,
        source_type: &str,
    ) -> Result<HashSet<RecordId>, StoreError> {
        if candidate_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<RecordId> = candidate_ids.iter().copied().collect();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT source_id
              FROM associations
             WHERE source_type = $1
               AND source_id = ANY($2)
            "#,
        )
        .bind(source_type)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<RecordId, _>("source_id")?);
        }
        Ok(out)
    }

    async fn insert_all(
        &self,
        records: &[NewAssociation],
    ) -> Result<Vec<InsertedAssociation>, StoreError> {
        if records.is_empty() {
            return Err(StoreError::EmptyBatch("association"));
        }

        let span = info_span!("insert_associations", rows = records.len());
        async {
            let mut tx = self.pool.begin().await?;
            let mut inserted = Vec::with_capacity(records.len());

            for chunk in records.chunks(ASSOCIATION_ROWS_PER_STATEMENT) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO associations (source_id, source_type, target_id, target_type, purpose) ",
                );
                builder.push_values(chunk, |mut row, record| {
                    row.push_bind(record.source_id)
                        .push_bind(&record.source_type)
                        .push_bind(record.target_id)
                        .push_bind(&record.target_type)
                        .push_bind(&record.purpose);
                });
                builder.push(" ON CONFLICT (source_id, source_type) DO NOTHING RETURNING id, source_id");

                let rows = builder.build().fetch_all(&mut *tx).await?;
                for row in rows {
                    inserted.push(InsertedAssociation {
                        id: row.try_get("id")?,
                        source_id: row.try_get("source_id")?,
                    });
                }
            }

            tx.commit().await?;
            debug!(inserted = inserted.len(), "association batch committed");
            Ok::<_, StoreError>(inserted)
        }
        .instrument(span)
        .await
    }
}
