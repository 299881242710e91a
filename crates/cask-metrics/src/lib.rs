//! Store-level metrics for the Cask blob store.
//!
//! The storage engine records every addition and deletion against a
//! [`FileMetricsStore`]. Those calls only touch atomic counters; a periodic
//! job (see [`PeriodicJobService`]) persists the accumulated deltas into a
//! small per-node properties file and then asks the [`QuotaService`] whether
//! the store has crossed its soft quota.
//!
//! Several nodes may share one storage root. Each writes its own
//! `<node-id>-metrics.properties`; readers sum all of them.

pub mod disk;
pub mod error;
pub mod node;
pub mod properties;
pub mod quota;
pub mod scheduler;
pub mod store;

pub use disk::available_space;
pub use error::{MetricsError, MetricsResult};
pub use node::{NodeAccess, StaticNodeAccess};
pub use properties::Properties;
pub use quota::{QuotaResult, QuotaService, QuotaType, SoftQuotaConfig, SoftQuotaService};
pub use scheduler::{JobHandle, PeriodicJobService, TokioJobService};
pub use store::{
    FileMetricsStore, BLOB_COUNT_KEY, METRICS_FILE_SUFFIX, TOTAL_SIZE_KEY,
};
