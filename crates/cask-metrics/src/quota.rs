use serde::{Deserialize, Serialize};
use tracing::warn;

use cask_types::StoreMetrics;

use crate::error::{MetricsError, MetricsResult};

/// What a soft quota measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaType {
    /// Violated when the store's total size exceeds the limit.
    SpaceUsed,
    /// Violated when free space on the volume drops below the limit.
    SpaceRemaining,
}

/// Soft quota attached to a store; checked on every metrics flush.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftQuotaConfig {
    #[serde(rename = "type")]
    pub quota_type: QuotaType,
    /// Limit in bytes.
    pub limit: u64,
}

/// Outcome of a quota check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaResult {
    pub violation: bool,
    pub message: String,
    pub store_name: String,
}

/// Evaluates soft quotas.
pub trait QuotaService: Send + Sync {
    fn check_quota(
        &self,
        store_name: &str,
        config: &SoftQuotaConfig,
        metrics: &StoreMetrics,
    ) -> QuotaResult;

    /// Reject configurations that can never be evaluated meaningfully.
    fn validate_soft_quota_config(&self, config: &SoftQuotaConfig) -> MetricsResult<()>;
}

/// Default quota service covering both [`QuotaType`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftQuotaService;

impl QuotaService for SoftQuotaService {
    fn check_quota(
        &self,
        store_name: &str,
        config: &SoftQuotaConfig,
        metrics: &StoreMetrics,
    ) -> QuotaResult {
        let (violation, message) = match config.quota_type {
            QuotaType::SpaceUsed => (
                metrics.total_size > config.limit,
                format!(
                    "Blob store {store_name} is using {} bytes and has a limit of {} bytes",
                    metrics.total_size, config.limit
                ),
            ),
            QuotaType::SpaceRemaining => (
                metrics.available_space < config.limit,
                format!(
                    "Blob store {store_name} has {} bytes remaining and a lower limit of {} bytes",
                    metrics.available_space, config.limit
                ),
            ),
        };
        if violation {
            warn!(store = store_name, "{message}");
        }
        QuotaResult {
            violation,
            message,
            store_name: store_name.to_string(),
        }
    }

    fn validate_soft_quota_config(&self, config: &SoftQuotaConfig) -> MetricsResult<()> {
        if config.limit == 0 {
            return Err(MetricsError::InvalidQuota(
                "limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
