use std::time::{SystemTime, UNIX_EPOCH};

use cask_types::{BlobMetrics, Headers, LifecycleState};

/// Headers, lifecycle state and metrics of one blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobAttributes {
    pub headers: Headers,
    pub state: LifecycleState,
    pub metrics: BlobMetrics,
    /// Why the blob was soft-deleted.
    pub deleted_reason: Option<String>,
    /// When the blob was soft-deleted (ms since epoch).
    pub deleted_at_ms: Option<i64>,
}

impl BlobAttributes {
    /// Fresh attributes in state `Creating`.
    pub fn new(headers: Headers, metrics: BlobMetrics) -> Self {
        Self {
            headers,
            state: LifecycleState::Creating,
            metrics,
            deleted_reason: None,
            deleted_at_ms: None,
        }
    }

    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.state = state;
        self
    }

    pub fn is_alive(&self) -> bool {
        self.state == LifecycleState::Alive
    }

    pub fn is_deleted(&self) -> bool {
        self.state == LifecycleState::MarkedForDeletion
    }

    /// Transition to `MarkedForDeletion`, recording reason and time.
    pub fn mark_deleted(&mut self, reason: impl Into<String>) {
        self.state = LifecycleState::MarkedForDeletion;
        self.deleted_reason = Some(reason.into());
        self.deleted_at_ms = Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
        );
    }

    /// Back to `Alive`, forgetting the deletion reason and time.
    pub fn restore(&mut self) {
        self.state = LifecycleState::Alive;
        self.deleted_reason = None;
        self.deleted_at_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_attributes_start_creating() {
        let attrs = BlobAttributes::new(Headers::new(), BlobMetrics::default());
        assert_eq!(attrs.state, LifecycleState::Creating);
        assert!(!attrs.is_alive());
    }

    #[test]
    fn mark_deleted_records_reason() {
        let mut attrs = BlobAttributes::new(Headers::new(), BlobMetrics::default())
            .with_state(LifecycleState::Alive);
        attrs.mark_deleted("cleanup");
        assert!(attrs.is_deleted());
        assert_eq!(attrs.deleted_reason.as_deref(), Some("cleanup"));
        assert!(attrs.deleted_at_ms.unwrap() > 0);

        attrs.restore();
        assert!(attrs.is_alive());
        assert_eq!((attrs.deleted_reason, attrs.deleted_at_ms), (None, None));
    }
}
