//! Resource retrieval by URI.
//!
//! Supports bare filesystem paths, `file://` URIs, and `package://`
//! identifiers resolved against a configured package root (falling back
//! to the `MODELTRACK_PACKAGE_PATH` environment variable).

use std::path::{Path, PathBuf};

use crate::error::ResourceFetchError;

pub const PACKAGE_PATH_ENV: &str = "MODELTRACK_PACKAGE_PATH";

#[derive(Debug, Default)]
pub struct ResourceRetriever {
    package_root: Option<PathBuf>,
}

impl ResourceRetriever {
    pub fn new() -> Self {
        Self {
            package_root: std::env::var_os(PACKAGE_PATH_ENV).map(PathBuf::from),
        }
    }

    pub fn with_package_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            package_root: Some(root.as_ref().to_path_buf()),
        }
    }

    /// Resolve a URI to a local path without reading it.
    pub fn resolve(&self, uri: &str) -> Result<PathBuf, ResourceFetchError> {
        if let Some(rest) = uri.strip_prefix("file://") {
            return Ok(PathBuf::from(rest));
        }
        if let Some(rest) = uri.strip_prefix("package://") {
            let root = self
                .package_root
                .as_ref()
                .ok_or_else(|| ResourceFetchError::NoPackageRoot(uri.to_string()))?;
            return Ok(root.join(rest));
        }
        if uri.contains("://") {
            return Err(ResourceFetchError::UnsupportedScheme(uri.to_string()));
        }
        Ok(PathBuf::from(uri))
    }

    /// Fetch the resource bytes behind a URI.
    pub fn fetch(&self, uri: &str) -> Result<Vec<u8>, ResourceFetchError> {
        let path = self.resolve(uri)?;
        std::fs::read(&path).map_err(|source| ResourceFetchError::Read { path, source })
    }
}
