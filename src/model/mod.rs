//! Model resource loading.
//!
//! `ModelLoader` resolves the model mesh and initialization-points files
//! through the resource retriever and materializes them under a
//! deterministic cache directory, so the tracking engine and the pose
//! initializer can consume plain local paths. Fetch failures are fatal
//! at startup and never retried.

pub mod init_points;
pub mod retriever;

use std::path::PathBuf;

use nalgebra::Vector3;
use tracing::info;

use crate::error::{ClientError, ResourceFetchError};
pub use init_points::parse_init_points;
pub use retriever::ResourceRetriever;

/// Extension of the model mesh file.
const MODEL_EXT: &str = "wrl";
/// Extension of the initialization-points file.
const INIT_EXT: &str = "init";

/// Resolved local model resources. Created once at startup, immutable
/// thereafter.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub mesh_path: PathBuf,
    pub init_points_path: PathBuf,
    pub init_points: Vec<Vector3<f64>>,
}

pub struct ModelLoader {
    retriever: ResourceRetriever,
    cache_root: PathBuf,
}

impl ModelLoader {
    pub fn new(retriever: ResourceRetriever) -> Self {
        Self {
            retriever,
            cache_root: std::env::temp_dir().join("modeltrack"),
        }
    }

    pub fn with_cache_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Fetch `<model_path>/<model_name>.{wrl,init}` and write both under
    /// the cache directory. `model_path` is a URI prefix (bare path,
    /// `file://` or `package://`).
    pub fn load(&self, model_path: &str, model_name: &str) -> Result<ModelDescriptor, ClientError> {
        let dir = self.cache_root.join(model_name);
        std::fs::create_dir_all(&dir).map_err(|source| ResourceFetchError::Write {
            path: dir.clone(),
            source,
        })?;

        let mesh_path = self.materialize(model_path, model_name, MODEL_EXT, &dir)?;
        let init_points_path = self.materialize(model_path, model_name, INIT_EXT, &dir)?;

        let init_bytes =
            std::fs::read(&init_points_path).map_err(|source| ResourceFetchError::Read {
                path: init_points_path.clone(),
                source,
            })?;
        let init_points = parse_init_points(&init_bytes)?;

        info!(
            model = model_name,
            mesh = %mesh_path.display(),
            points = init_points.len(),
            "model resources loaded"
        );
        Ok(ModelDescriptor {
            name: model_name.to_string(),
            mesh_path,
            init_points_path,
            init_points,
        })
    }

    fn materialize(
        &self,
        model_path: &str,
        model_name: &str,
        ext: &str,
        dir: &std::path::Path,
    ) -> Result<PathBuf, ResourceFetchError> {
        let uri = format!("{}/{}.{}", model_path.trim_end_matches('/'), model_name, ext);
        let bytes = self.retriever.fetch(&uri)?;
        let local = dir.join(format!("{model_name}.{ext}"));
        std::fs::write(&local, bytes).map_err(|source| ResourceFetchError::Write {
            path: local.clone(),
            source,
        })?;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_materializes_resources() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("cube.wrl"), b"#VRML V2.0 utf8\n").unwrap();
        fs::write(
            src.path().join("cube.init"),
            b"0,0,0\n0.1,0,0\n0.1,0.1,0\n0,0.1,0\n",
        )
        .unwrap();

        let loader = ModelLoader::new(ResourceRetriever::default()).with_cache_root(cache.path());
        let desc = loader.load(src.path().to_str().unwrap(), "cube").unwrap();

        assert_eq!(desc.name, "cube");
        assert!(desc.mesh_path.exists());
        assert!(desc.init_points_path.exists());
        assert_eq!(desc.init_points.len(), 4);
    }

    #[test]
    fn test_missing_resource_is_fatal() {
        let cache = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(ResourceRetriever::default()).with_cache_root(cache.path());
        assert!(matches!(
            loader.load("/nonexistent", "cube"),
            Err(ClientError::Fetch(_))
        ));
    }
}
