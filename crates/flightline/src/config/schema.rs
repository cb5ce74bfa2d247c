use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level service configuration.
///
/// All filesystem locations are explicit; nothing is read from ambient
/// global state at call time. Components receive this struct (or a slice
/// of it) at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the persisted artifact tree
    /// (`<storage_root>/projects/<project_id>/flights/<flight_id>/...`).
    pub storage_root: PathBuf,

    /// SQLite database location. `None` falls back to
    /// [`crate::db::default_database_path`].
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Grace period before deactivated artifacts and stale jobs are
    /// physically removed.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default)]
    pub preview: PreviewConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    /// Test mode: ledger state lives in an in-memory database instead of
    /// the configured file.
    #[serde(default)]
    pub is_test_mode: bool,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_retention_days() -> i64 {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Linear scale of raster previews relative to the source.
    #[serde(default = "default_preview_scale")]
    pub scale: f64,

    /// Target point count for down-sampled point-cloud previews.
    #[serde(default = "default_point_limit")]
    pub point_limit: u64,

    /// Points read per chunk while streaming a point cloud.
    #[serde(default = "default_chunk_points")]
    pub chunk_points: u64,
}

fn default_preview_scale() -> f64 {
    0.06
}

fn default_point_limit() -> u64 {
    100_000
}

fn default_chunk_points() -> u64 {
    100_000
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            scale: default_preview_scale(),
            point_limit: default_point_limit(),
            chunk_points: default_chunk_points(),
        }
    }
}

/// Locations of the external geoprocessing binaries. Empty values mean
/// "resolve from PATH".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub gdal_bin_dir: Option<PathBuf>,

    #[serde(default)]
    pub pdal_bin_dir: Option<PathBuf>,
}

impl Config {
    /// Minimal configuration rooted at the given directory. Used by tests
    /// and by CLI invocations that only pass `--storage-root`.
    pub fn with_storage_root<P: Into<PathBuf>>(storage_root: P) -> Self {
        Self {
            storage_root: storage_root.into(),
            database_path: None,
            worker_count: default_worker_count(),
            retention_days: default_retention_days(),
            preview: PreviewConfig::default(),
            tools: ToolsConfig::default(),
            is_test_mode: false,
        }
    }

    /// Degree of parallelism handed to the COG encoder.
    pub fn cog_threads(&self) -> usize {
        (num_cpus::get() / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::with_storage_root("/var/lib/flightline");
        assert_eq!(config.retention_days, 14);
        assert!((config.preview.scale - 0.06).abs() < f64::EPSILON);
        assert_eq!(config.preview.point_limit, 100_000);
        assert!(!config.is_test_mode);
    }

    #[test]
    fn test_cog_threads_at_least_one() {
        let config = Config::with_storage_root("/tmp");
        assert!(config.cog_threads() >= 1);
        assert!(config.cog_threads() <= num_cpus::get());
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: Config =
            serde_json::from_str(r#"{ "storage_root": "/srv/flightline" }"#).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/srv/flightline"));
        assert_eq!(config.worker_count, num_cpus::get());
    }
}
