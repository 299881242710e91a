use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// Reserved prefix carried by every temporary blob id.
pub const TEMPORARY_BLOB_ID_PREFIX: &str = "tmp$";
/// Reserved prefix of ids derived from a blob name (`path$<name>`).
pub const DIRECT_PATH_BLOB_ID_PREFIX: &str = "path$";

const MAX_ID_LEN: usize = 255;

/// Opaque, unique blob identifier.
///
/// Generated ids are UUID v7 strings, so the creation time is recoverable
/// from the id itself (see [`BlobId::created_at`]). Temporary blobs carry the
/// [`TEMPORARY_BLOB_ID_PREFIX`]. Ids supplied from outside are accepted as
/// long as they are safe to use as a single path component.
///
/// Direct-path ids (`path$a/b/c`) are the exception: they name a relative
/// path, checked segment by segment so it can never leave its directory.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    /// Generate a new permanent, time-ordered blob id.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Generate a new temporary blob id (`tmp$<uuid-v7>`).
    pub fn new_temporary() -> Self {
        Self(format!("{TEMPORARY_BLOB_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Generate a permanent or temporary id.
    pub fn generate(temporary: bool) -> Self {
        if temporary {
            Self::new_temporary()
        } else {
            Self::new()
        }
    }

    /// Id of the direct-path blob named `name`, e.g. `health/repo/file.txt`.
    pub fn direct_path(name: &str) -> Result<Self, TypeError> {
        Self::parse(format!("{DIRECT_PATH_BLOB_ID_PREFIX}{name}"))
    }

    /// Validate and wrap an externally supplied id.
    pub fn parse(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("empty")
        } else if value.len() > MAX_ID_LEN {
            Some("too long")
        } else if value.chars().any(char::is_control) {
            Some("contains control characters")
        } else if let Some(path) = value.strip_prefix(DIRECT_PATH_BLOB_ID_PREFIX) {
            check_relative_path(path)
        } else if value.contains(['/', '\\']) {
            Some("contains a path separator")
        } else if value == "." || value == ".." || value.contains("..") {
            Some("contains a relative path segment")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TypeError::InvalidBlobId { id: value, reason }),
            None => Ok(Self(value)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for ids carrying the temporary prefix.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_BLOB_ID_PREFIX)
    }

    pub fn is_direct_path(&self) -> bool {
        self.0.starts_with(DIRECT_PATH_BLOB_ID_PREFIX)
    }

    /// The relative path of a direct-path id.
    pub fn direct_path_name(&self) -> Option<&str> {
        self.0.strip_prefix(DIRECT_PATH_BLOB_ID_PREFIX)
    }

    /// Creation time embedded in a generated id.
    ///
    /// Returns `None` for ids that are not UUID v7 (externally supplied ids).
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.0.strip_prefix(TEMPORARY_BLOB_ID_PREFIX).unwrap_or(&self.0);
        let uuid = Uuid::parse_str(raw).ok()?;
        if uuid.get_version_num() != 7 {
            return None;
        }
        let (secs, nanos) = uuid.get_timestamp()?.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

/// `/`-separated, relative, and free of empty, `.` and `..` segments.
fn check_relative_path(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        Some("empty direct path")
    } else if path.contains('\\') {
        Some("direct path contains a backslash")
    } else if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        Some("direct path must be relative without empty, '.' or '..' segments")
    } else {
        None
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlobId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = BlobId::new();
        let b = BlobId::new();
        assert_ne!(a, b);
        assert!(!a.is_temporary());
    }

    #[test]
    fn temporary_ids_carry_prefix() {
        let id = BlobId::new_temporary();
        assert!(id.is_temporary());
        assert!(id.as_str().starts_with("tmp$"));
    }

    #[test]
    fn created_at_recovers_embedded_time() {
        let before = Utc::now().timestamp_millis();
        let id = BlobId::new_temporary();
        let after = Utc::now().timestamp_millis();
        let created = id.created_at().unwrap().timestamp_millis();
        assert!(created >= before && created <= after);
    }

    #[test]
    fn created_at_is_none_for_foreign_ids() {
        let id = BlobId::parse("external-blob").unwrap();
        assert!(id.created_at().is_none());
        let v4 = BlobId::parse(Uuid::new_v4().to_string()).unwrap();
        assert!(v4.created_at().is_none());
    }

    #[test]
    fn parse_rejects_unsafe_ids() {
        assert!(BlobId::parse("").is_err());
        assert!(BlobId::parse("a/b").is_err());
        assert!(BlobId::parse("a\\b").is_err());
        assert!(BlobId::parse("..").is_err());
        assert!(BlobId::parse("x..y").is_err());
        assert!(BlobId::parse("bad\nid").is_err());
        assert!(BlobId::parse("x".repeat(256)).is_err());
        assert!(BlobId::parse("fine-id_1").is_ok());
    }

    #[test]
    fn serde_roundtrip_validates() {
        let id = BlobId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: BlobId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert!(serde_json::from_str::<BlobId>("\"../etc\"").is_err());
    }

    #[test]
    fn direct_path_ids_keep_their_path() {
        let id = BlobId::direct_path("health-check/repo/file.txt").unwrap();
        assert_eq!(id.as_str(), "path$health-check/repo/file.txt");
        assert!(id.is_direct_path());
        assert!(!id.is_temporary());
        assert_eq!(id.direct_path_name(), Some("health-check/repo/file.txt"));
        assert!(id.created_at().is_none());
        assert_eq!(BlobId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn direct_path_ids_cannot_escape() {
        for bad in ["", "/abs", "a//b", "a/../b", "..", "./a", "a/", "a\\b"] {
            assert!(BlobId::direct_path(bad).is_err(), "{bad:?} accepted");
        }
        assert!(BlobId::parse("a/b").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parsed_ids_never_escape_their_directory(value in ".{0,64}") {
                if let Ok(id) = BlobId::parse(value.clone()) {
                    match id.direct_path_name() {
                        Some(path) => {
                            prop_assert!(!path.starts_with('/'));
                            prop_assert!(path.split('/').all(|seg| seg != ".."));
                        }
                        None => {
                            prop_assert!(!id.as_str().contains('/'));
                            prop_assert!(!id.as_str().contains(".."));
                        }
                    }
                    prop_assert_eq!(id.as_str(), value.as_str());
                }
            }

            #[test]
            fn generated_ids_parse_back(temporary in any::<bool>()) {
                let id = BlobId::generate(temporary);
                let back: BlobId = id.as_str().parse().unwrap();
                prop_assert_eq!(back.is_temporary(), temporary);
                prop_assert_eq!(back, id);
            }
        }
    }
}
