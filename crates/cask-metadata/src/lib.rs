//! Blob lifecycle metadata for the Cask blob store.
//!
//! Every blob owned by the storage engine has one [`BlobAttributes`] record:
//! its headers, its [`LifecycleState`](cask_types::LifecycleState) and its
//! [`BlobMetrics`](cask_types::BlobMetrics). The same record is written twice:
//! as a sidecar file next to the content (see [`record`]) and into a
//! [`BlobMetadataStore`], which keeps an index by state so "which blobs are
//! marked for deletion" never needs a directory scan.
//!
//! # Backends
//!
//! - [`JournalMetadataStore`] -- append-only, CRC-framed journal replayed on open
//! - [`InMemoryMetadataStore`] -- `HashMap`-based store for tests and embedding

pub mod attributes;
pub mod error;
pub mod index;
pub mod journal;
pub mod memory;
pub mod record;
pub mod traits;

pub use attributes::BlobAttributes;
pub use error::{MetadataError, MetadataResult};
pub use index::{MetadataTable, StateIndex};
pub use journal::{JournalMetadataStore, JournalSync, JOURNAL_FILE_NAME};
pub use memory::InMemoryMetadataStore;
pub use traits::{BlobMetadataStore, CompactStats, StateIter};
