/// Supplies the identity of the local node.
///
/// The id namespaces this node's metrics file, so it must be stable across
/// restarts of the same node and distinct between nodes sharing a root.
pub trait NodeAccess: Send + Sync {
    fn id(&self) -> &str;
}

/// Fixed node id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticNodeAccess {
    id: String,
}

impl StaticNodeAccess {
    /// Characters unsafe in a file name are replaced with `_`.
    pub fn new(id: impl AsRef<str>) -> Self {
        let id: String = id
            .as_ref()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let id = if id.is_empty() || id.chars().all(|c| c == '.') {
            "node".to_string()
        } else {
            id
        };
        Self { id }
    }
}

impl NodeAccess for StaticNodeAccess {
    fn id(&self) -> &str {
        &self.id
    }
}
