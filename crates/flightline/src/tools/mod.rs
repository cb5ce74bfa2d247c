//! External geoprocessing tool boundary.
//!
//! Format conversion, metadata probing, and point-cloud pipelines are
//! delegated to external CLI tools (GDAL, PDAL). The boundary is the
//! [`ToolRunner`] trait so converters and the toolbox run against a fake
//! implementation in tests without invoking real binaries. Any nonzero
//! exit code is a hard failure for the calling job.

pub mod fake;

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::config::ToolsConfig;
use crate::error::ToolError;

/// Structured raster metadata returned by `probe` (gdalinfo-style JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RasterInfo {
    pub driver_short_name: String,
    /// `[width, height]` in pixels.
    pub size: Vec<u64>,
    pub bands: Vec<BandInfo>,
    pub metadata: RasterMetadataSections,
    pub coordinate_system: CoordinateSystem,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BandInfo {
    pub band: u32,
    /// Pixel data type name (`Byte`, `UInt16`, `Float32`, ...).
    #[serde(rename = "type")]
    pub data_type: String,
    pub no_data_value: Option<f64>,
    pub color_interpretation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterMetadataSections {
    #[serde(rename = "IMAGE_STRUCTURE")]
    pub image_structure: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateSystem {
    pub wkt: String,
}

impl RasterInfo {
    pub fn parse(json: &str) -> Result<Self, ToolError> {
        serde_json::from_str(json).map_err(|e| ToolError::ParseOutput {
            tool: "probe".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// True when the raster is already in cloud-optimized layout.
    pub fn is_cog(&self) -> bool {
        self.metadata
            .image_structure
            .get("LAYOUT")
            .map(|v| v.eq_ignore_ascii_case("COG"))
            .unwrap_or(false)
    }

    /// Linear unit of the spatial reference, extracted from the WKT.
    /// Unknown/projected-less rasters report "unknown".
    pub fn spatial_unit(&self) -> &'static str {
        let wkt = self.coordinate_system.wkt.to_ascii_lowercase();
        if wkt.contains("\"metre\"") || wkt.contains("\"meter\"") {
            "metre"
        } else if wkt.contains("\"us survey foot\"") || wkt.contains("\"foot\"") {
            "foot"
        } else if wkt.contains("\"degree\"") {
            "degree"
        } else {
            "unknown"
        }
    }

    pub fn has_crs(&self) -> bool {
        !self.coordinate_system.wkt.trim().is_empty()
    }
}

/// An ordered PDAL-style pipeline description: read → filter → write.
/// The executing engine is opaque; stages are raw JSON objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub pipeline: Vec<serde_json::Value>,
}

impl PipelineSpec {
    pub fn new() -> Self {
        Self { pipeline: Vec::new() }
    }

    pub fn stage(mut self, stage: serde_json::Value) -> Self {
        self.pipeline.push(stage);
        self
    }

    /// read LAS/LAZ → write cloud-optimized point cloud.
    pub fn to_copc(input: &Path, output: &Path) -> Self {
        Self::new()
            .stage(serde_json::json!({
                "type": "readers.las",
                "filename": input.to_string_lossy(),
            }))
            .stage(serde_json::json!({
                "type": "writers.copc",
                "filename": output.to_string_lossy(),
            }))
    }

    /// read LAZ → write uncompressed LAS (used before streaming previews).
    pub fn decompress(input: &Path, output: &Path) -> Self {
        Self::new()
            .stage(serde_json::json!({
                "type": "readers.las",
                "filename": input.to_string_lossy(),
            }))
            .stage(serde_json::json!({
                "type": "writers.las",
                "filename": output.to_string_lossy(),
                "compression": false,
            }))
    }

    /// Output path of the final writer stage, if any.
    pub fn output_path(&self) -> Option<PathBuf> {
        self.pipeline
            .iter()
            .rev()
            .find(|s| {
                s.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t.starts_with("writers."))
                    .unwrap_or(false)
            })
            .and_then(|s| s.get("filename"))
            .and_then(|f| f.as_str())
            .map(PathBuf::from)
    }

    /// Input path of the first reader stage, if any.
    pub fn input_path(&self) -> Option<PathBuf> {
        self.pipeline
            .iter()
            .find(|s| {
                s.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t.starts_with("readers."))
                    .unwrap_or(false)
            })
            .and_then(|s| s.get("filename"))
            .and_then(|f| f.as_str())
            .map(PathBuf::from)
    }
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability handed to converters and the toolbox. One implementation
/// shells out to the real binaries; [`fake::FakeToolRunner`] stands in
/// for tests.
pub trait ToolRunner: Send + Sync {
    /// `gdalinfo -json`-style probe of a raster.
    fn probe(&self, path: &Path) -> Result<RasterInfo, ToolError>;

    /// Re-encode a raster into COG layout with deflate compression and
    /// tiling, using the given number of encode threads.
    fn convert_to_cog(&self, input: &Path, output: &Path, threads: usize)
        -> Result<(), ToolError>;

    /// Terrain shading of a single-band elevation raster.
    fn hillshade(&self, input: &Path, output: &Path, z_factor: f64) -> Result<(), ToolError>;

    /// Execute an opaque point-cloud pipeline.
    fn run_pipeline(&self, spec: &PipelineSpec) -> Result<(), ToolError>;
}

/// Production runner: invokes the GDAL/PDAL binaries as subprocesses.
pub struct CommandToolRunner {
    gdal_bin_dir: Option<PathBuf>,
    pdal_bin_dir: Option<PathBuf>,
}

impl CommandToolRunner {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            gdal_bin_dir: tools.gdal_bin_dir.clone(),
            pdal_bin_dir: tools.pdal_bin_dir.clone(),
        }
    }

    fn gdal_tool(&self, name: &str) -> PathBuf {
        match &self.gdal_bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn pdal_tool(&self) -> PathBuf {
        match &self.pdal_bin_dir {
            Some(dir) => dir.join("pdal"),
            None => PathBuf::from("pdal"),
        }
    }

    fn run(&self, tool: &Path, args: &[&str]) -> Result<String, ToolError> {
        let tool_name = tool.to_string_lossy().to_string();
        log::debug!("Invoking {} {:?}", tool_name, args);

        let output = Command::new(tool)
            .args(args)
            .output()
            .map_err(|e| ToolError::Spawn {
                tool: tool_name.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: tool_name,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ToolRunner for CommandToolRunner {
    fn probe(&self, path: &Path) -> Result<RasterInfo, ToolError> {
        let path = path.to_string_lossy().to_string();
        let stdout = self.run(&self.gdal_tool("gdalinfo"), &["-json", &path])?;
        RasterInfo::parse(&stdout)
    }

    fn convert_to_cog(
        &self,
        input: &Path,
        output: &Path,
        threads: usize,
    ) -> Result<(), ToolError> {
        let num_threads = format!("NUM_THREADS={}", threads);
        let input = input.to_string_lossy().to_string();
        let output = output.to_string_lossy().to_string();
        self.run(
            &self.gdal_tool("gdal_translate"),
            &[
                "-of",
                "COG",
                "-co",
                "COMPRESS=DEFLATE",
                "-co",
                "BLOCKSIZE=512",
                "-co",
                &num_threads,
                &input,
                &output,
            ],
        )?;
        Ok(())
    }

    fn hillshade(&self, input: &Path, output: &Path, z_factor: f64) -> Result<(), ToolError> {
        let z = z_factor.to_string();
        let input = input.to_string_lossy().to_string();
        let output = output.to_string_lossy().to_string();
        self.run(
            &self.gdal_tool("gdaldem"),
            &["hillshade", "-z", &z, &input, &output],
        )?;
        Ok(())
    }

    fn run_pipeline(&self, spec: &PipelineSpec) -> Result<(), ToolError> {
        // PDAL reads the pipeline description from a file.
        let json = serde_json::to_string(spec).map_err(|e| ToolError::ParseOutput {
            tool: "pdal".to_string(),
            reason: e.to_string(),
        })?;

        let tmp = std::env::temp_dir().join(format!("flightline-pipeline-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, &json).map_err(|e| ToolError::Spawn {
            tool: "pdal".to_string(),
            source: e,
        })?;

        let tmp_arg = tmp.to_string_lossy().to_string();
        let result = self.run(&self.pdal_tool(), &["pipeline", &tmp_arg]);
        let _ = std::fs::remove_file(&tmp);
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GDALINFO_SAMPLE: &str = r#"{
        "driverShortName": "GTiff",
        "size": [4096, 2048],
        "bands": [
            {"band": 1, "type": "Byte", "colorInterpretation": "Red"},
            {"band": 2, "type": "Byte", "colorInterpretation": "Green"},
            {"band": 3, "type": "Byte", "colorInterpretation": "Blue"},
            {"band": 4, "type": "Byte", "noDataValue": 0.0, "colorInterpretation": "Alpha"}
        ],
        "metadata": {"IMAGE_STRUCTURE": {"LAYOUT": "COG", "COMPRESSION": "DEFLATE"}},
        "coordinateSystem": {"wkt": "PROJCS[\"WGS 84 / UTM zone 10N\",UNIT[\"metre\",1]]"}
    }"#;

    #[test]
    fn test_parse_probe_output() {
        let info = RasterInfo::parse(GDALINFO_SAMPLE).unwrap();
        assert_eq!(info.driver_short_name, "GTiff");
        assert_eq!(info.size, vec![4096, 2048]);
        assert_eq!(info.band_count(), 4);
        assert!(info.is_cog());
        assert_eq!(info.spatial_unit(), "metre");
        assert!(info.has_crs());
        assert_eq!(info.bands[3].no_data_value, Some(0.0));
        assert_eq!(info.bands[0].data_type, "Byte");
    }

    #[test]
    fn test_non_cog_layout() {
        let info = RasterInfo::parse(
            r#"{"driverShortName": "GTiff", "size": [10, 10],
                "bands": [{"band": 1, "type": "Float32"}]}"#,
        )
        .unwrap();
        assert!(!info.is_cog());
        assert_eq!(info.spatial_unit(), "unknown");
        assert!(!info.has_crs());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(matches!(
            RasterInfo::parse("not json"),
            Err(ToolError::ParseOutput { .. })
        ));
    }

    #[test]
    fn test_copc_pipeline_shape() {
        let spec = PipelineSpec::to_copc(Path::new("/in/a.las"), Path::new("/out/a.copc.laz"));
        assert_eq!(spec.pipeline.len(), 2);
        assert_eq!(spec.pipeline[0]["type"], "readers.las");
        assert_eq!(spec.pipeline[1]["type"], "writers.copc");
        assert_eq!(spec.input_path().unwrap(), PathBuf::from("/in/a.las"));
        assert_eq!(spec.output_path().unwrap(), PathBuf::from("/out/a.copc.laz"));
    }

    #[test]
    fn test_decompress_pipeline_shape() {
        let spec = PipelineSpec::decompress(Path::new("/in/a.laz"), Path::new("/tmp/a.las"));
        assert_eq!(spec.pipeline[1]["compression"], false);
        assert_eq!(spec.output_path().unwrap(), PathBuf::from("/tmp/a.las"));
    }

    #[test]
    fn test_spawn_failure_is_tool_error() {
        let runner = CommandToolRunner::new(&crate::config::ToolsConfig {
            gdal_bin_dir: Some(PathBuf::from("/nonexistent/bin")),
            pdal_bin_dir: None,
        });
        let err = runner.probe(Path::new("/tmp/x.tif")).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
