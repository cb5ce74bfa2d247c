//! Point-Cloud Converter: normalizes an uploaded cloud into a
//! cloud-optimized container and renders a down-sampled scatter preview.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info_span;

use crate::config::Config;
use crate::error::{PointCloudError, ValidationError};
use crate::pointcloud::las::LasReader;
use crate::pointcloud::preview::{render_scatter, PreviewOptions};
use crate::storage::filesystem;
use crate::tools::{PipelineSpec, ToolRunner};

/// Marker written into the artifact directory after an unrecoverable
/// failure so a later maintenance sweep does not retry indefinitely.
pub const FAILED_MARKER: &str = ".failed";

#[derive(Debug, Clone)]
pub struct PointCloudConversion {
    pub out_path: PathBuf,
    pub preview_path: PathBuf,
    pub point_count: u64,
}

pub struct PointCloudConverter {
    tools: Arc<dyn ToolRunner>,
    config: Arc<Config>,
}

fn is_copc(path: &Path) -> bool {
    path.to_string_lossy().to_lowercase().ends_with(".copc.laz")
}

fn is_laz(path: &Path) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    name.ends_with(".laz") && !name.ends_with(".copc.laz")
}

impl PointCloudConverter {
    pub fn new(tools: Arc<dyn ToolRunner>, config: Arc<Config>) -> Self {
        Self { tools, config }
    }

    /// Converts the staged cloud in place.
    ///
    /// Coordinate-system validation runs before any statistic-bearing
    /// operation: a cloud without a spatial reference fails fast. On any
    /// failure the partial outputs and the work directory are removed and
    /// a sentinel marker is written beside the artifact.
    pub fn convert(&self, in_path: &Path) -> Result<PointCloudConversion, PointCloudError> {
        let _span = info_span!("pointcloud_convert", file = %in_path.display()).entered();

        let dir = in_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let work_dir = dir.join("_work");

        let result = self.convert_inner(in_path, &dir, &work_dir);
        let _ = filesystem::remove_dir_if_exists(&work_dir);

        if let Err(ref e) = result {
            log::warn!("Point cloud conversion failed for {}: {}", in_path.display(), e);
            self.cleanup_partial(in_path, &dir);
            let _ = std::fs::write(dir.join(FAILED_MARKER), e.to_string());
        }

        result
    }

    fn convert_inner(
        &self,
        in_path: &Path,
        dir: &Path,
        work_dir: &Path,
    ) -> Result<PointCloudConversion, PointCloudError> {
        let stem = filesystem::file_stem(in_path);

        // Compressed input is decompressed through the pipeline engine
        // first; the streaming reader only handles plain LAS.
        let las_path = if is_laz(in_path) || is_copc(in_path) {
            filesystem::ensure_dir(work_dir)?;
            let las = work_dir.join(format!("{}.las", stem.trim_end_matches(".copc")));
            self.tools
                .run_pipeline(&PipelineSpec::decompress(in_path, &las))?;
            las
        } else {
            in_path.to_path_buf()
        };

        let mut reader = LasReader::open(&las_path)?;
        if !reader.header().has_crs {
            return Err(ValidationError::MissingCrs {
                path: in_path.to_path_buf(),
            }
            .into());
        }

        let out_path = if is_copc(in_path) {
            // Already cloud-optimized; conversion is a no-op.
            in_path.to_path_buf()
        } else {
            let out = dir.join(format!("{}.copc.laz", stem.trim_end_matches(".copc")));
            self.tools
                .run_pipeline(&PipelineSpec::to_copc(in_path, &out))?;
            out
        };

        let preview_path = dir.join(format!("{}.png", stem.trim_end_matches(".copc")));
        let opts = PreviewOptions {
            point_limit: self.config.preview.point_limit,
            chunk_points: self.config.preview.chunk_points,
            ..PreviewOptions::default()
        };
        render_scatter(&mut reader, &preview_path, &opts)?;

        // The original uncompressed upload is superseded by the COPC.
        if out_path != *in_path {
            filesystem::remove_file_if_exists(in_path)?;
        }

        Ok(PointCloudConversion {
            out_path,
            preview_path,
            point_count: reader.header().point_count,
        })
    }

    /// Removes partial conversion outputs, keeping the directory itself
    /// so the failure marker has somewhere to live.
    fn cleanup_partial(&self, in_path: &Path, dir: &Path) {
        let stem = filesystem::file_stem(in_path);
        let stem = stem.trim_end_matches(".copc");
        if !is_copc(in_path) {
            let _ = filesystem::remove_file_if_exists(&dir.join(format!("{}.copc.laz", stem)));
        }
        let _ = filesystem::remove_file_if_exists(&dir.join(format!("{}.png", stem)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeToolRunner;
    use tempfile::TempDir;

    // Format-2 LAS builder shared with the las module tests.
    fn write_las(path: &Path, n: usize, with_crs: bool) {
        let points: Vec<_> = (0..n)
            .map(|i| {
                let f = i as f64;
                (f, f * 0.5, f * 0.25, [(i % 255) as u16, 128u16, 64u16])
            })
            .collect();
        std::fs::write(path, crate::pointcloud::las::testutil::build_las(&points, with_crs))
            .unwrap();
    }

    fn converter(fake: Arc<FakeToolRunner>) -> PointCloudConverter {
        PointCloudConverter::new(fake, Arc::new(Config::with_storage_root("/tmp/unused")))
    }

    #[test]
    fn test_convert_las_to_copc_with_preview() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cloud.las");
        write_las(&path, 50, true);

        let fake = Arc::new(FakeToolRunner::new());
        let result = converter(Arc::clone(&fake)).convert(&path).unwrap();

        assert!(result.out_path.to_string_lossy().ends_with("cloud.copc.laz"));
        assert!(result.out_path.exists());
        assert!(result.preview_path.exists());
        // Original superseded by the COPC output.
        assert!(!path.exists());
        assert_eq!(fake.calls_of("run_pipeline"), 1);
        assert!(!tmp.path().join(FAILED_MARKER).exists());
    }

    #[test]
    fn test_missing_crs_fails_fast_without_preview() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nocrs.las");
        write_las(&path, 10, false);

        let fake = Arc::new(FakeToolRunner::new());
        let err = converter(Arc::clone(&fake)).convert(&path).unwrap_err();

        assert!(matches!(
            err,
            PointCloudError::Validation(ValidationError::MissingCrs { .. })
        ));
        // Failed before any conversion or preview.
        assert_eq!(fake.calls_of("run_pipeline"), 0);
        assert!(!tmp.path().join("nocrs.png").exists());
        assert!(tmp.path().join(FAILED_MARKER).exists());
    }

    #[test]
    fn test_copc_input_skips_conversion() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cloud.copc.laz");
        // The fake pipeline treats laz as plain las content.
        write_las(&path, 20, true);

        let fake = Arc::new(FakeToolRunner::new());
        let result = converter(Arc::clone(&fake)).convert(&path).unwrap();

        assert_eq!(result.out_path, path);
        assert!(path.exists());
        // One pipeline call: the decompress for streaming, no COPC write.
        assert_eq!(fake.calls_of("run_pipeline"), 1);
        assert!(result.preview_path.to_string_lossy().ends_with("cloud.png"));
        assert!(result.preview_path.exists());
    }

    #[test]
    fn test_pipeline_failure_leaves_marker() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cloud.las");
        write_las(&path, 10, true);

        let fake = Arc::new(FakeToolRunner::new());
        fake.fail_tool("run_pipeline");

        let err = converter(Arc::clone(&fake)).convert(&path).unwrap_err();
        assert!(matches!(err, PointCloudError::Tool(_)));
        assert!(tmp.path().join(FAILED_MARKER).exists());
        assert!(!tmp.path().join("cloud.copc.laz").exists());
        assert!(!tmp.path().join("_work").exists());
    }
}
