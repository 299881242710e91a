use std::collections::VecDeque;

use cask_types::{BlobId, LifecycleState};

use crate::attributes::BlobAttributes;
use crate::error::MetadataResult;

/// Number of ids fetched from the index per page by [`StateIter`].
pub const STATE_PAGE_SIZE: usize = 256;

/// Outcome of a metadata compaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactStats {
    /// Records still live after compaction.
    pub live: usize,
    /// Superseded or tombstoned entries dropped.
    pub reclaimed: usize,
}

/// Persistent per-blob lifecycle metadata.
///
/// Implementations must satisfy these invariants:
/// - `find_with_state(S)` yields exactly the ids whose current record is in
///   state `S`, answered from an index rather than a scan of all records.
/// - A state change moves the id from the old state's result set to the new one.
/// - `get` of an unknown id is `Ok(None)`, never an error.
pub trait BlobMetadataStore: Send + Sync {
    /// Assign a fresh id and persist the attributes in state `Creating`.
    ///
    /// The id is temporary-prefixed when the headers carry the temporary marker.
    fn add(&self, attributes: BlobAttributes) -> MetadataResult<BlobId>;

    /// Persist a record under a caller-chosen id. Fails if one exists.
    fn add_with_id(&self, id: &BlobId, attributes: BlobAttributes) -> MetadataResult<()>;

    /// Replace the record for an existing id.
    fn update(&self, id: &BlobId, attributes: BlobAttributes) -> MetadataResult<()>;

    fn get(&self, id: &BlobId) -> MetadataResult<Option<BlobAttributes>>;

    /// Remove the record entirely. Returns `true` if it existed.
    fn delete(&self, id: &BlobId) -> MetadataResult<bool>;

    /// One page of ids in `state`, ordered, strictly after `after`.
    fn page_with_state(
        &self,
        state: LifecycleState,
        after: Option<&BlobId>,
        limit: usize,
    ) -> Vec<BlobId>;

    /// Lazy, finite iterator over the ids currently in `state`.
    fn find_with_state(&self, state: LifecycleState) -> StateIter<'_>;

    /// Number of records in `state`.
    fn count_with_state(&self, state: LifecycleState) -> usize;

    /// Total number of records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reclaim space held by superseded and deleted records.
    fn compact(&self) -> MetadataResult<CompactStats>;
}

/// Paging iterator over the state index.
///
/// Holds only a cursor and one page of ids, so records may change while
/// iterating. Callers re-check state before acting on a yielded id. Restart
/// with [`StateIter::resume`].
pub struct StateIter<'a> {
    store: &'a dyn BlobMetadataStore,
    state: LifecycleState,
    cursor: Option<BlobId>,
    buffer: VecDeque<BlobId>,
    exhausted: bool,
}

impl<'a> StateIter<'a> {
    pub fn new(store: &'a dyn BlobMetadataStore, state: LifecycleState) -> Self {
        Self::resume(store, state, None)
    }

    /// Continue an earlier iteration after `cursor`.
    pub fn resume(
        store: &'a dyn BlobMetadataStore,
        state: LifecycleState,
        cursor: Option<BlobId>,
    ) -> Self {
        Self {
            store,
            state,
            cursor,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Last id handed out, usable with [`StateIter::resume`].
    pub fn cursor(&self) -> Option<&BlobId> {
        self.cursor.as_ref()
    }
}

impl Iterator for StateIter<'_> {
    type Item = BlobId;

    fn next(&mut self) -> Option<BlobId> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .page_with_state(self.state, self.cursor.as_ref(), STATE_PAGE_SIZE);
            if page.len() < STATE_PAGE_SIZE {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }
        let id = self.buffer.pop_front()?;
        self.cursor = Some(id.clone());
        Some(id)
    }
}

impl std::fmt::Debug for StateIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateIter")
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
