use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use cask_types::{BlobId, LifecycleState};

use crate::attributes::BlobAttributes;

/// Secondary index: lifecycle state → ordered set of blob ids.
///
/// Ordered sets make paging by cursor stable while the index changes.
#[derive(Debug, Default)]
pub struct StateIndex {
    by_state: HashMap<LifecycleState, BTreeSet<BlobId>>,
}

impl StateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &BlobId, state: LifecycleState) {
        self.by_state.entry(state).or_default().insert(id.clone());
    }

    pub fn remove(&mut self, id: &BlobId, state: LifecycleState) {
        if let Some(ids) = self.by_state.get_mut(&state) {
            ids.remove(id);
        }
    }

    pub fn count(&self, state: LifecycleState) -> usize {
        self.by_state.get(&state).map_or(0, BTreeSet::len)
    }

    /// Up to `limit` ids in `state`, strictly after `after`.
    pub fn page(&self, state: LifecycleState, after: Option<&BlobId>, limit: usize) -> Vec<BlobId> {
        let Some(ids) = self.by_state.get(&state) else {
            return Vec::new();
        };
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Unbounded,
        };
        ids.range::<BlobId, _>((lower, Bound::Unbounded))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Records keyed by id plus the state index, kept in lockstep.
#[derive(Debug, Default)]
pub struct MetadataTable {
    records: HashMap<BlobId, BlobAttributes>,
    index: StateIndex,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous record.
    pub fn put(&mut self, id: BlobId, attributes: BlobAttributes) -> Option<BlobAttributes> {
        let state = attributes.state;
        self.index.insert(&id, state);
        let previous = self.records.insert(id.clone(), attributes);
        if let Some(prev) = &previous {
            if prev.state != state {
                self.index.remove(&id, prev.state);
            }
        }
        previous
    }

    pub fn remove(&mut self, id: &BlobId) -> Option<BlobAttributes> {
        let removed = self.records.remove(id)?;
        self.index.remove(id, removed.state);
        Some(removed)
    }

    pub fn get(&self, id: &BlobId) -> Option<&BlobAttributes> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &BlobId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlobId, &BlobAttributes)> {
        self.records.iter()
    }

    pub fn index(&self) -> &StateIndex {
        &self.index
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index = StateIndex::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_types::{BlobMetrics, Headers};

    fn attrs(state: LifecycleState) -> BlobAttributes {
        BlobAttributes::new(Headers::new(), BlobMetrics::default()).with_state(state)
    }

    #[test]
    fn put_moves_between_states() {
        let mut table = MetadataTable::new();
        let id = BlobId::new();
        table.put(id.clone(), attrs(LifecycleState::Creating));
        assert_eq!(table.index().count(LifecycleState::Creating), 1);

        table.put(id.clone(), attrs(LifecycleState::Alive));
        assert_eq!(table.index().count(LifecycleState::Creating), 0);
        assert_eq!(table.index().count(LifecycleState::Alive), 1);

        // Same-state replace keeps the id indexed.
        table.put(id.clone(), attrs(LifecycleState::Alive));
        assert_eq!(table.index().count(LifecycleState::Alive), 1);

        table.remove(&id);
        assert_eq!(table.index().count(LifecycleState::Alive), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn paging_by_cursor() {
        let mut index = StateIndex::new();
        let mut ids: Vec<BlobId> = (0..5).map(|_| BlobId::new()).collect();
        ids.sort();
        for id in &ids {
            index.insert(id, LifecycleState::Alive);
        }
        let first = index.page(LifecycleState::Alive, None, 2);
        assert_eq!(first, ids[..2]);
        let second = index.page(LifecycleState::Alive, first.last(), 2);
        assert_eq!(second, ids[2..4]);
        let third = index.page(LifecycleState::Alive, second.last(), 2);
        assert_eq!(third, ids[4..]);
        assert!(index.page(LifecycleState::Creating, None, 2).is_empty());
    }
}
