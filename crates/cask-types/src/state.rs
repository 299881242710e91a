use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Stage of a blob's existence.
///
/// `Creating → Alive → MarkedForDeletion → (purged)`. Only `Alive` blobs are
/// visible to lookup by id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum LifecycleState {
    /// Content is being ingested; exists only transiently.
    #[default]
    Creating,
    /// Durably written and visible.
    Alive,
    /// Soft-deleted; files remain until compaction reclaims them.
    MarkedForDeletion,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 3] = [Self::Creating, Self::Alive, Self::MarkedForDeletion];

    /// Stable tag used in the binary record format.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Creating => 0,
            Self::Alive => 1,
            Self::MarkedForDeletion => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self, TypeError> {
        match tag {
            0 => Ok(Self::Creating),
            1 => Ok(Self::Alive),
            2 => Ok(Self::MarkedForDeletion),
            other => Err(TypeError::UnknownState(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Alive => "alive",
            Self::MarkedForDeletion => "marked-for-deletion",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TypeError::UnknownStateName(s.to_string()))
    }
}
