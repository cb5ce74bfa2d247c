//! In-process stand-in for the external geoprocessing tools.
//!
//! Converters and the toolbox are exercised in tests without invoking
//! real binaries. The fake reads real TIFF files for probe metadata and
//! models COG layout as a property of file content (a trailing marker),
//! so conversions survive renames exactly like the real thing.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::ToolError;
use crate::raster::dataset::RasterDataset;
use crate::tools::{BandInfo, PipelineSpec, RasterInfo, ToolRunner};

/// Trailing bytes marking a file as "cloud-optimized". TIFF readers
/// ignore content past the IFD chain, so the marker keeps files valid.
const COG_MARKER: &[u8] = b"FLIGHTLINE-COG";

const METRE_WKT: &str = r#"PROJCS["WGS 84 / UTM zone 10N",UNIT["metre",1]]"#;

pub struct FakeToolRunner {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    crs_wkt: Mutex<String>,
}

impl FakeToolRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            crs_wkt: Mutex::new(METRE_WKT.to_string()),
        }
    }

    /// Makes every subsequent invocation of the named tool operation
    /// (`probe`, `convert_to_cog`, `hillshade`, `run_pipeline`) fail.
    pub fn fail_tool(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Overrides the WKT the fake reports for probed rasters. An empty
    /// string simulates a raster with no spatial reference.
    pub fn set_crs_wkt(&self, wkt: &str) {
        *self.crs_wkt.lock().unwrap() = wkt.to_string();
    }

    /// Number of recorded invocations of the named operation.
    pub fn calls_of(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(name))
            .count()
    }

    fn record(&self, name: &str, detail: &str) -> Result<(), ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", name, detail));
        if self.failing.lock().unwrap().contains(name) {
            return Err(ToolError::Failed {
                tool: name.to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("{} forced to fail", name),
            });
        }
        Ok(())
    }
}

impl Default for FakeToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn has_cog_marker(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return false;
    };
    if len < COG_MARKER.len() as u64 {
        return false;
    }
    if file
        .seek(SeekFrom::End(-(COG_MARKER.len() as i64)))
        .is_err()
    {
        return false;
    }
    let mut tail = vec![0u8; COG_MARKER.len()];
    file.read_exact(&mut tail).is_ok() && tail == COG_MARKER
}

fn copy_file(tool: &str, from: &Path, to: &Path) -> Result<(), ToolError> {
    std::fs::copy(from, to).map_err(|e| ToolError::Failed {
        tool: tool.to_string(),
        status: "exit status: 1".to_string(),
        stderr: format!("copy {} -> {}: {}", from.display(), to.display(), e),
    })?;
    Ok(())
}

impl ToolRunner for FakeToolRunner {
    fn probe(&self, path: &Path) -> Result<RasterInfo, ToolError> {
        self.record("probe", &path.to_string_lossy())?;

        let ds = RasterDataset::open(path).map_err(|e| ToolError::Failed {
            tool: "gdalinfo".to_string(),
            status: "exit status: 1".to_string(),
            stderr: e.to_string(),
        })?;

        let bands = (0..ds.band_count())
            .map(|i| BandInfo {
                band: i as u32 + 1,
                data_type: ds.data_type().to_string(),
                no_data_value: ds.nodata(),
                color_interpretation: None,
            })
            .collect();

        let mut info = RasterInfo {
            driver_short_name: "GTiff".to_string(),
            size: vec![ds.width() as u64, ds.height() as u64],
            bands,
            ..Default::default()
        };
        info.coordinate_system.wkt = self.crs_wkt.lock().unwrap().clone();
        if has_cog_marker(path) {
            info.metadata
                .image_structure
                .insert("LAYOUT".to_string(), "COG".to_string());
        }
        Ok(info)
    }

    fn convert_to_cog(
        &self,
        input: &Path,
        output: &Path,
        threads: usize,
    ) -> Result<(), ToolError> {
        self.record(
            "convert_to_cog",
            &format!("{} threads={}", input.to_string_lossy(), threads),
        )?;
        copy_file("gdal_translate", input, output)?;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(output)
            .map_err(|e| ToolError::Spawn {
                tool: "gdal_translate".to_string(),
                source: e,
            })?;
        file.write_all(COG_MARKER).map_err(|e| ToolError::Spawn {
            tool: "gdal_translate".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn hillshade(&self, input: &Path, output: &Path, z_factor: f64) -> Result<(), ToolError> {
        self.record(
            "hillshade",
            &format!("{} z={}", input.to_string_lossy(), z_factor),
        )?;
        copy_file("gdaldem", input, output)
    }

    fn run_pipeline(&self, spec: &PipelineSpec) -> Result<(), ToolError> {
        let detail = spec
            .pipeline
            .iter()
            .filter_map(|s| s.get("type").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        self.record("run_pipeline", &detail)?;

        let (Some(input), Some(output)) = (spec.input_path(), spec.output_path()) else {
            return Err(ToolError::Failed {
                tool: "pdal".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "pipeline needs a reader and a writer".to_string(),
            });
        };
        copy_file("pdal", &input, &output)
    }
}
