use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical name of the blob, e.g. the repository path of an asset.
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";
/// Principal that created the blob.
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";
/// Remote address of the creating principal.
pub const CREATED_BY_IP_HEADER: &str = "BlobStore.created-by-ip";
/// MIME type of the content.
pub const CONTENT_TYPE_HEADER: &str = "BlobStore.content-type";
/// Marks a blob as temporary; any value (including null) counts.
pub const TEMPORARY_BLOB_HEADER: &str = "BlobStore.temporary-blob";
/// With value `true`, the blob is stored under `directpath/<blob-name>`.
pub const DIRECT_PATH_BLOB_HEADER: &str = "BlobStore.direct-path";

/// Ordered header map attached to every blob.
///
/// Values may be null: a key can be present without a value, and that is
/// preserved through persistence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, Option<String>>);

impl Headers {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Some(value.into()));
    }

    /// Insert a key with a null value.
    pub fn insert_null(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), None);
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        self.0.remove(key)
    }

    /// Value for `key`; `None` when the key is absent or its value is null.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns `true` when the temporary marker is present.
    pub fn is_temporary(&self) -> bool {
        self.contains_key(TEMPORARY_BLOB_HEADER)
    }

    /// Returns `true` when the direct-path header is `true`.
    pub fn is_direct_path(&self) -> bool {
        self.get(DIRECT_PATH_BLOB_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn blob_name(&self) -> Option<&str> {
        self.get(BLOB_NAME_HEADER)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }
}

impl Extend<(String, Option<String>)> for Headers {
    fn extend<I: IntoIterator<Item = (String, Option<String>)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Headers {
    type Item = (String, Option<String>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Option<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_values_are_present_but_empty() {
        let mut headers = Headers::new();
        headers.insert_null("foo");
        assert!(headers.contains_key("foo"));
        assert_eq!(headers.get("foo"), None);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn temporary_marker_detected_with_null_value() {
        let mut headers = Headers::new().with(BLOB_NAME_HEADER, "a/b.bin");
        assert!(!headers.is_temporary());
        headers.insert_null(TEMPORARY_BLOB_HEADER);
        assert!(headers.is_temporary());
        assert_eq!(headers.blob_name(), Some("a/b.bin"));
    }

    #[test]
    fn direct_path_needs_a_true_value() {
        let mut headers = Headers::new();
        headers.insert_null(DIRECT_PATH_BLOB_HEADER);
        assert!(!headers.is_direct_path());
        headers.insert(DIRECT_PATH_BLOB_HEADER, "false");
        assert!(!headers.is_direct_path());
        headers.insert(DIRECT_PATH_BLOB_HEADER, "true");
        assert!(headers.is_direct_path());
    }

    #[test]
    fn iteration_is_ordered() {
        let headers: Headers = [("b", "2"), ("a", "1")].into_iter().collect();
        let keys: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
