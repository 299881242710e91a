use std::path::PathBuf;

/// Subdirectory of the work directory that holds relative store paths.
pub const BLOBS_DIRECTORY: &str = "blobs";

/// Resolves named working directories for the application.
pub trait ApplicationDirectories: Send + Sync {
    fn work_directory(&self, name: &str) -> PathBuf;
}

/// All work directories live directly under one base directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedDirectories {
    base: PathBuf,
}

impl FixedDirectories {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &std::path::Path {
        &self.base
    }
}

impl ApplicationDirectories for FixedDirectories {
    fn work_directory(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_under_base() {
        let dirs = FixedDirectories::new("/var/cask");
        assert_eq!(dirs.work_directory(BLOBS_DIRECTORY), PathBuf::from("/var/cask/blobs"));
    }
}
