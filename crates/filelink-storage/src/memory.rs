use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use filelink_core::{
    ArtifactRef, AssociationRecord, DomainItemRef, DomainRef, InsertedAssociation, ItemRecord,
    NewArtifact, NewAssociation, RecordId, StoredArtifact,
};
use tokio::sync::Mutex;

use crate::{AssociationStore, DomainLookup, FileStore, StoreError};

/// Number of calls made against each store operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub all_identifiers: usize,
    pub resolve: usize,
    pub resolve_with_item: usize,
    pub existing_source_ids: usize,
    pub store_all: usize,
    pub insert_all: usize,
}

#[derive(Debug, Clone)]
struct DomainRow {
    id: RecordId,
    number: String,
    item_id: RecordId,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: RecordId,
    items: Vec<ItemRecord>,
    domain_records: Vec<DomainRow>,
    artifacts: Vec<StoredArtifact>,
    associations: Vec<AssociationRecord>,
    calls: StoreCalls,
    fail_artifact_writes: bool,
    fail_association_writes: bool,
}

impl MemoryState {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn item_number(&self, item_id: RecordId) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.id == item_id)
            .map(|item| item.number.as_str())
    }
}

/// In-process store with the same batch and uniqueness semantics as Postgres.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_item(&self, number: &str) -> RecordId {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.items.push(ItemRecord {
            id,
            number: number.to_string(),
        });
        id
    }

    pub async fn add_domain_record(&self, number: &str, item_id: RecordId) -> RecordId {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.domain_records.push(DomainRow {
            id,
            number: number.to_string(),
            item_id,
        });
        id
    }

    /// Insert an association directly, bypassing the uniqueness check.
    pub async fn seed_association(&self, record: NewAssociation) -> RecordId {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.associations.push(AssociationRecord {
            id,
            source_id: record.source_id,
            source_type: record.source_type,
            target_id: record.target_id,
            target_type: record.target_type,
            purpose: record.purpose,
            created_at: Utc::now(),
        });
        id
    }

    pub async fn fail_artifact_writes(&self, fail: bool) {
        self.state.lock().await.fail_artifact_writes = fail;
    }

    pub async fn fail_association_writes(&self, fail: bool) {
        self.state.lock().await.fail_association_writes = fail;
    }

    pub async fn artifacts(&self) -> Vec<StoredArtifact> {
        self.state.lock().await.artifacts.clone()
    }

    pub async fn associations(&self) -> Vec<AssociationRecord> {
        self.state.lock().await.associations.clone()
    }

    pub async fn calls(&self) -> StoreCalls {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl DomainLookup for MemoryStore {
    async fn all_identifiers(&self) -> Result<HashSet<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.all_identifiers += 1;
        Ok(state
            .domain_records
            .iter()
            .map(|row| row.number.clone())
            .collect())
    }

    async fn resolve(&self, identifiers: &BTreeSet<String>) -> Result<Vec<DomainRef>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.resolve += 1;
        Ok(state
            .domain_records
            .iter()
            .filter(|row| identifiers.contains(&row.number))
            .map(|row| DomainRef {
                internal_id: row.id,
                identifier: row.number.clone(),
            })
            .collect())
    }

    async fn resolve_with_item(
        &self,
        identifiers: &BTreeSet<String>,
    ) -> Result<Vec<DomainItemRef>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.resolve_with_item += 1;
        Ok(state
            .domain_records
            .iter()
            .filter(|row| identifiers.contains(&row.number))
            .filter_map(|row| {
                state.item_number(row.item_id).map(|item_number| DomainItemRef {
                    identifier: row.number.clone(),
                    internal_id: row.id,
                    item_number: item_number.to_string(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn store_all(&self, items: &[NewArtifact]) -> Result<Vec<ArtifactRef>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.store_all += 1;
        if items.is_empty() {
            return Err(StoreError::EmptyBatch("artifact"));
        }
        if state.fail_artifact_writes {
            return Err(StoreError::Backend("artifact write rejected".to_string()));
        }

        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            let id = state.allocate_id();
            state.artifacts.push(StoredArtifact {
                id,
                title: item.title.clone(),
                description: item.description.clone(),
                content: item.content.clone(),
            });
            stored.push(ArtifactRef {
                id,
                title: item.title.clone(),
            });
        }
        Ok(stored)
    }
}

#[async_trait]
impl AssociationStore for MemoryStore {
    async fn existing_source_ids(
        &self,
        candidate_ids: &BTreeSet<RecordId>,
        source_type: &str,
    ) -> Result<HashSet<RecordId>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.existing_source_ids += 1;
        Ok(state
            .associations
            .iter()
            .filter(|a| a.source_type == source_type && candidate_ids.contains(&a.source_id))
            .map(|a| a.source_id)
            .collect())
    }

    async fn insert_all(
        &self,
        records: &[NewAssociation],
    ) -> Result<Vec<InsertedAssociation>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.insert_all += 1;
        if records.is_empty() {
            return Err(StoreError::EmptyBatch("association"));
        }
        if state.fail_association_writes {
            return Err(StoreError::Backend("association write rejected".to_string()));
        }

        let created_at = Utc::now();
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            let taken = state
                .associations
                .iter()
                .any(|a| a.source_id == record.source_id && a.source_type == record.source_type);
            if taken {
                continue;
            }
            let id = state.allocate_id();
            state.associations.push(AssociationRecord {
                id,
                source_id: record.source_id,
                source_type: record.source_type.clone(),
                target_id: record.target_id,
                target_type: record.target_type.clone(),
                purpose: record.purpose.clone(),
                created_at,
            });
            inserted.push(InsertedAssociation {
                id,
                source_id: record.source_id,
            });
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn association(source_id: RecordId, target_id: RecordId) -> NewAssociation {
        NewAssociation {
            source_id,
            source_type: "DOMAIN".into(),
            target_id,
            target_type: "ARTIFACT".into(),
            purpose: "S".into(),
        }
    }

    #[tokio::test]
    async fn resolves_domain_records_with_items() {
        let store = MemoryStore::new();
        let item = store.add_item("ITEM-A").await;
        let record = store.add_domain_record("1001", item).await;
        store.add_domain_record("1002", item).await;

        let wanted: BTreeSet<String> = ["1001".to_string()].into_iter().collect();
        let refs = store.resolve(&wanted).await.expect("resolve");
        assert_eq!(
            refs,
            vec![DomainRef {
                internal_id: record,
                identifier: "1001".into()
            }]
        );

        let rows = store.resolve_with_item(&wanted).await.expect("hierarchy");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_number, "ITEM-A");
        assert_eq!(store.all_identifiers().await.expect("all").len(), 2);
    }

    #[tokio::test]
    async fn association_uniqueness_skips_taken_sources() {
        let store = MemoryStore::new();
        store.seed_association(association(7, 100)).await;

        let inserted = store
            .insert_all(&[association(7, 101), association(8, 102), association(8, 103)])
            .await
            .expect("insert");
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].source_id, 8);
        assert_eq!(store.associations().await.len(), 2);

        let candidates: BTreeSet<RecordId> = [7, 8, 9].into_iter().collect();
        let existing = store
            .existing_source_ids(&candidates, "DOMAIN")
            .await
            .expect("existing");
        assert_eq!(existing, HashSet::from([7, 8]));
        assert!(store
            .existing_source_ids(&candidates, "OTHER")
            .await
            .expect("existing")
            .is_empty());
    }

    #[tokio::test]
    async fn failed_or_empty_batches_write_nothing() {
        let store = MemoryStore::new();
        store.fail_artifact_writes(true).await;
        let item = NewArtifact {
            title: "1001".into(),
            description: "1001.pdf".into(),
            content: b"%PDF".to_vec(),
        };
        assert!(store.store_all(&[item]).await.is_err());
        assert!(store.artifacts().await.is_empty());

        assert!(matches!(
            store.store_all(&[]).await,
            Err(StoreError::EmptyBatch("artifact"))
        ));
        assert!(matches!(
            store.insert_all(&[]).await,
            Err(StoreError::EmptyBatch("association"))
        ));
    }
}
