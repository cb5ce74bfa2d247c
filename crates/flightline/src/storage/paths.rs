//! On-disk layout of the persisted artifact tree:
//!
//! `<storage_root>/projects/<project_id>/flights/<flight_id>/{data_products|raw_data}/<artifact_id>/<opaque>.<ext>`
//!
//! Artifact basenames are always fresh opaque ids, never the
//! client-supplied filename. Preview images share the artifact directory
//! with a fixed `.jpg`/`.png` suffix.

use std::path::{Path, PathBuf};

pub const DATA_PRODUCTS_DIR: &str = "data_products";
pub const RAW_DATA_DIR: &str = "raw_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    DataProduct,
    RawData,
}

impl ArtifactKind {
    fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::DataProduct => DATA_PRODUCTS_DIR,
            ArtifactKind::RawData => RAW_DATA_DIR,
        }
    }
}

/// Resolves locations inside the artifact tree from the explicit storage
/// root. Components hold one of these instead of reading ambient state.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id)
    }

    pub fn flight_dir(&self, project_id: &str, flight_id: &str) -> PathBuf {
        self.project_dir(project_id).join("flights").join(flight_id)
    }

    /// The directory exclusively owned by one artifact. Its processing job
    /// is the only writer while the job is in flight.
    pub fn artifact_dir(
        &self,
        project_id: &str,
        flight_id: &str,
        kind: ArtifactKind,
        artifact_id: &str,
    ) -> PathBuf {
        self.flight_dir(project_id, flight_id)
            .join(kind.dir_name())
            .join(artifact_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_dir_layout() {
        let layout = StorageLayout::new("/srv/flightline");
        let dir = layout.artifact_dir("proj-1", "flight-2", ArtifactKind::DataProduct, "art-3");
        assert_eq!(
            dir,
            PathBuf::from("/srv/flightline/projects/proj-1/flights/flight-2/data_products/art-3")
        );
    }

    #[test]
    fn test_raw_data_dir_layout() {
        let layout = StorageLayout::new("/srv/flightline");
        let dir = layout.artifact_dir("p", "f", ArtifactKind::RawData, "r");
        assert!(dir.ends_with("projects/p/flights/f/raw_data/r"));
    }

    #[test]
    fn test_flight_dir_nests_under_project() {
        let layout = StorageLayout::new("/srv/flightline");
        assert!(layout
            .flight_dir("p", "f")
            .starts_with(layout.project_dir("p")));
    }
}
