use std::sync::RwLock;

use cask_types::{BlobId, LifecycleState};

use crate::attributes::BlobAttributes;
use crate::error::{MetadataError, MetadataResult};
use crate::index::MetadataTable;
use crate::traits::{BlobMetadataStore, CompactStats, StateIter};

/// In-memory metadata store.
///
/// Intended for tests and embedding. Nothing is persisted; `compact` is a
/// no-op that reports the live record count.
pub struct InMemoryMetadataStore {
    table: RwLock<MetadataTable>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(MetadataTable::new()),
        }
    }

    /// Remove all records.
    pub fn clear(&self) {
        self.table.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobMetadataStore for InMemoryMetadataStore {
    fn add(&self, mut attributes: BlobAttributes) -> MetadataResult<BlobId> {
        attributes.state = LifecycleState::Creating;
        let temporary = attributes.headers.is_temporary();
        let mut table = self.table.write().expect("lock poisoned");
        let mut id = BlobId::generate(temporary);
        while table.contains(&id) {
            id = BlobId::generate(temporary);
        }
        table.put(id.clone(), attributes);
        Ok(id)
    }

    fn add_with_id(&self, id: &BlobId, attributes: BlobAttributes) -> MetadataResult<()> {
        let mut table = self.table.write().expect("lock poisoned");
        if table.contains(id) {
            return Err(MetadataError::AlreadyExists(id.clone()));
        }
        table.put(id.clone(), attributes);
        Ok(())
    }

    fn update(&self, id: &BlobId, attributes: BlobAttributes) -> MetadataResult<()> {
        let mut table = self.table.write().expect("lock poisoned");
        if !table.contains(id) {
            return Err(MetadataError::NotFound(id.clone()));
        }
        table.put(id.clone(), attributes);
        Ok(())
    }

    fn get(&self, id: &BlobId) -> MetadataResult<Option<BlobAttributes>> {
        Ok(self.table.read().expect("lock poisoned").get(id).cloned())
    }

    fn delete(&self, id: &BlobId) -> MetadataResult<bool> {
        Ok(self.table.write().expect("lock poisoned").remove(id).is_some())
    }

    fn page_with_state(
        &self,
        state: LifecycleState,
        after: Option<&BlobId>,
        limit: usize,
    ) -> Vec<BlobId> {
        self.table
            .read()
            .expect("lock poisoned")
            .index()
            .page(state, after, limit)
    }

    fn find_with_state(&self, state: LifecycleState) -> StateIter<'_> {
        StateIter::new(self, state)
    }

    fn count_with_state(&self, state: LifecycleState) -> usize {
        self.table.read().expect("lock poisoned").index().count(state)
    }

    fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").len()
    }

    fn compact(&self) -> MetadataResult<CompactStats> {
        Ok(CompactStats {
            live: self.len(),
            reclaimed: 0,
        })
    }
}

impl std::fmt::Debug for InMemoryMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetadataStore")
            .field("record_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_types::{BlobMetrics, Headers, TEMPORARY_BLOB_HEADER};
    use std::collections::HashSet;

    fn attrs() -> BlobAttributes {
        BlobAttributes::new(Headers::new(), BlobMetrics::default())
    }

    #[test]
    fn add_assigns_creating_state() {
        let store = InMemoryMetadataStore::new();
        let id = store.add(attrs().with_state(LifecycleState::Alive)).unwrap();
        assert!(!id.is_temporary());
        assert_eq!(store.get(&id).unwrap().unwrap().state, LifecycleState::Creating);
    }

    #[test]
    fn add_temporary_prefixes_id() {
        let store = InMemoryMetadataStore::new();
        let mut headers = Headers::new();
        headers.insert_null(TEMPORARY_BLOB_HEADER);
        let id = store
            .add(BlobAttributes::new(headers, BlobMetrics::default()))
            .unwrap();
        assert!(id.is_temporary());
    }

    #[test]
    fn state_isolation() {
        let store = InMemoryMetadataStore::new();
        let ids: Vec<_> = (0..10).map(|_| store.add(attrs()).unwrap()).collect();
        for id in &ids[..6] {
            store
                .update(id, attrs().with_state(LifecycleState::Alive))
                .unwrap();
        }
        for id in &ids[..2] {
            store
                .update(id, attrs().with_state(LifecycleState::MarkedForDeletion))
                .unwrap();
        }

        let alive: HashSet<_> = store.find_with_state(LifecycleState::Alive).collect();
        let marked: HashSet<_> = store
            .find_with_state(LifecycleState::MarkedForDeletion)
            .collect();
        let creating: HashSet<_> = store.find_with_state(LifecycleState::Creating).collect();

        assert_eq!(alive, ids[2..6].iter().cloned().collect());
        assert_eq!(marked, ids[..2].iter().cloned().collect());
        assert_eq!(creating, ids[6..].iter().cloned().collect());
    }

    #[test]
    fn find_with_state_pages_through_large_sets() {
        let store = InMemoryMetadataStore::new();
        let total = crate::traits::STATE_PAGE_SIZE * 2 + 7;
        for _ in 0..total {
            store.add(attrs()).unwrap();
        }
        assert_eq!(store.find_with_state(LifecycleState::Creating).count(), total);
        assert_eq!(store.count_with_state(LifecycleState::Creating), total);
    }

    #[test]
    fn iterator_resumes_from_cursor() {
        let store = InMemoryMetadataStore::new();
        for _ in 0..5 {
            store.add(attrs()).unwrap();
        }
        let mut iter = store.find_with_state(LifecycleState::Creating);
        let first: Vec<_> = iter.by_ref().take(2).collect();
        let cursor = iter.cursor().cloned();
        let rest: Vec<_> = StateIter::resume(&store, LifecycleState::Creating, cursor).collect();
        assert_eq!(first.len() + rest.len(), 5);
        assert!(rest.iter().all(|id| !first.contains(id)));
    }

    #[test]
    fn update_and_delete_unknown() {
        let store = InMemoryMetadataStore::new();
        let id = BlobId::new();
        assert!(store.get(&id).unwrap().is_none());
        assert!(matches!(
            store.update(&id, attrs()),
            Err(MetadataError::NotFound(_))
        ));
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn add_with_id_rejects_duplicates() {
        let store = InMemoryMetadataStore::new();
        let id = BlobId::new();
        store.add_with_id(&id, attrs()).unwrap();
        assert!(matches!(
            store.add_with_id(&id, attrs()),
            Err(MetadataError::AlreadyExists(_))
        ));
    }
}
