//! Windowed raster operations.
//!
//! Every operation validates its parameters before touching a pixel and
//! streams the source's native block windows into a single-band float32
//! output — the full array is never materialized.

use std::path::Path;

use serde_json::Value;

use crate::error::{RasterError, ValidationError};
use crate::raster::dataset::{write_gray_f32, RasterDataset};
use crate::tools::ToolRunner;

/// A named raster-algebra operation: `(in_raster, out_raster, params)`.
pub trait ToolboxOperation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parameter validation. Runs before any pixel I/O.
    fn validate(&self, params: &Value, band_count: usize) -> Result<(), ValidationError>;

    fn run(
        &self,
        tools: &dyn ToolRunner,
        in_raster: &Path,
        out_raster: &Path,
        params: &Value,
    ) -> Result<(), RasterError>;
}

/// Extracts a required 1-based band index, checking it is an integer and
/// within the source band count. Returns the zero-based index.
fn band_param(
    params: &Value,
    operation: &'static str,
    name: &'static str,
    band_count: usize,
) -> Result<usize, ValidationError> {
    let value = params
        .get(name)
        .ok_or(ValidationError::MissingParameter { operation, name })?;
    let index = value
        .as_i64()
        .ok_or_else(|| ValidationError::InvalidParameter {
            operation,
            name,
            reason: format!("expected an integer, got {}", value),
        })?;
    if index < 1 || index as usize > band_count {
        return Err(ValidationError::BandOutOfRange {
            index: index.max(0) as usize,
            band_count,
        });
    }
    Ok(index as usize - 1)
}

fn string_param(
    params: &Value,
    operation: &'static str,
    name: &'static str,
) -> Result<String, ValidationError> {
    params
        .get(name)
        .ok_or(ValidationError::MissingParameter { operation, name })?
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ValidationError::InvalidParameter {
            operation,
            name,
            reason: "expected a string".to_string(),
        })
}

/// Streams `in_raster` band windows through `formula` into `out_raster`.
fn stream_formula<F>(
    in_raster: &Path,
    out_raster: &Path,
    bands: &[usize],
    formula: F,
) -> Result<(), RasterError>
where
    F: Fn(&[f32]) -> f32,
{
    let mut ds = RasterDataset::open(in_raster)?;
    let (_, block_height) = ds.block_shape();
    let width = ds.width();
    let height = ds.height();

    let mut sample = vec![0f32; bands.len()];
    write_gray_f32(out_raster, width, height, block_height, |window| {
        let buffers = ds.read_window_bands(window, bands)?;
        let mut out = Vec::with_capacity(window.len());
        for i in 0..window.len() {
            for (slot, buffer) in buffers.iter().enumerate() {
                sample[slot] = buffer[i];
            }
            out.push(formula(&sample));
        }
        Ok(out)
    })
}

/// excess-green: with r', g', b' each normalized by (r+g+b),
/// ExG = 2·g' − r' − b'.
pub struct ExcessGreen;

impl ToolboxOperation for ExcessGreen {
    fn name(&self) -> &'static str {
        "exg"
    }

    fn validate(&self, params: &Value, band_count: usize) -> Result<(), ValidationError> {
        band_param(params, "exg", "red_band", band_count)?;
        band_param(params, "exg", "green_band", band_count)?;
        band_param(params, "exg", "blue_band", band_count)?;
        Ok(())
    }

    fn run(
        &self,
        _tools: &dyn ToolRunner,
        in_raster: &Path,
        out_raster: &Path,
        params: &Value,
    ) -> Result<(), RasterError> {
        let ds = RasterDataset::open(in_raster)?;
        let bands = [
            band_param(params, "exg", "red_band", ds.band_count())?,
            band_param(params, "exg", "green_band", ds.band_count())?,
            band_param(params, "exg", "blue_band", ds.band_count())?,
        ];
        drop(ds);

        stream_formula(in_raster, out_raster, &bands, |s| {
            let (r, g, b) = (s[0], s[1], s[2]);
            let sum = r + g + b;
            if sum == 0.0 {
                return 0.0;
            }
            let (rn, gn, bn) = (r / sum, g / sum, b / sum);
            2.0 * gn - rn - bn
        })
    }
}

/// normalized-difference: (nir − red) / (nir + red).
pub struct NormalizedDifference;

impl ToolboxOperation for NormalizedDifference {
    fn name(&self) -> &'static str {
        "ndvi"
    }

    fn validate(&self, params: &Value, band_count: usize) -> Result<(), ValidationError> {
        band_param(params, "ndvi", "red_band", band_count)?;
        band_param(params, "ndvi", "nir_band", band_count)?;
        Ok(())
    }

    fn run(
        &self,
        _tools: &dyn ToolRunner,
        in_raster: &Path,
        out_raster: &Path,
        params: &Value,
    ) -> Result<(), RasterError> {
        let ds = RasterDataset::open(in_raster)?;
        let bands = [
            band_param(params, "ndvi", "red_band", ds.band_count())?,
            band_param(params, "ndvi", "nir_band", ds.band_count())?,
        ];
        drop(ds);

        stream_formula(in_raster, out_raster, &bands, |s| {
            let (red, nir) = (s[0], s[1]);
            let denom = nir + red;
            if denom == 0.0 {
                0.0
            } else {
                (nir - red) / denom
            }
        })
    }
}

/// visible-atmospherically-resistant index:
/// (green − red) / (green + red − blue).
pub struct Vari;

impl ToolboxOperation for Vari {
    fn name(&self) -> &'static str {
        "vari"
    }

    fn validate(&self, params: &Value, band_count: usize) -> Result<(), ValidationError> {
        band_param(params, "vari", "red_band", band_count)?;
        band_param(params, "vari", "green_band", band_count)?;
        band_param(params, "vari", "blue_band", band_count)?;
        Ok(())
    }

    fn run(
        &self,
        _tools: &dyn ToolRunner,
        in_raster: &Path,
        out_raster: &Path,
        params: &Value,
    ) -> Result<(), RasterError> {
        let ds = RasterDataset::open(in_raster)?;
        let bands = [
            band_param(params, "vari", "red_band", ds.band_count())?,
            band_param(params, "vari", "green_band", ds.band_count())?,
            band_param(params, "vari", "blue_band", ds.band_count())?,
        ];
        drop(ds);

        stream_formula(in_raster, out_raster, &bands, |s| {
            let (red, green, blue) = (s[0], s[1], s[2]);
            let denom = green + red - blue;
            if denom == 0.0 {
                0.0
            } else {
                (green - red) / denom
            }
        })
    }
}

/// canopy-height: surface model minus terrain model. Both rasters must
/// share grid dimensions and one block-window shape; a mismatch fails
/// rather than falling back to a slower path.
pub struct CanopyHeight;

impl ToolboxOperation for CanopyHeight {
    fn name(&self) -> &'static str {
        "chm"
    }

    fn validate(&self, params: &Value, _band_count: usize) -> Result<(), ValidationError> {
        string_param(params, "chm", "dtm_path")?;
        Ok(())
    }

    fn run(
        &self,
        _tools: &dyn ToolRunner,
        in_raster: &Path,
        out_raster: &Path,
        params: &Value,
    ) -> Result<(), RasterError> {
        let dtm_path = string_param(params, "chm", "dtm_path")?;

        let mut dsm = RasterDataset::open(in_raster)?;
        let mut dtm = RasterDataset::open(Path::new(&dtm_path))?;

        if dsm.width() != dtm.width() || dsm.height() != dtm.height() {
            return Err(RasterError::WindowMismatch(format!(
                "dsm is {}x{}, dtm is {}x{}",
                dsm.width(),
                dsm.height(),
                dtm.width(),
                dtm.height()
            )));
        }
        if dsm.block_shape() != dtm.block_shape() {
            return Err(RasterError::WindowMismatch(format!(
                "dsm blocks are {:?}, dtm blocks are {:?}",
                dsm.block_shape(),
                dtm.block_shape()
            )));
        }

        let (_, block_height) = dsm.block_shape();
        let width = dsm.width();
        let height = dsm.height();

        write_gray_f32(out_raster, width, height, block_height, |window| {
            let surface = dsm.read_window_band(window, 0)?;
            let terrain = dtm.read_window_band(window, 0)?;
            Ok(surface
                .iter()
                .zip(&terrain)
                .map(|(s, t)| s - t)
                .collect())
        })
    }
}

/// hillshade: delegated to the external terrain tool.
pub struct Hillshade;

impl ToolboxOperation for Hillshade {
    fn name(&self) -> &'static str {
        "hillshade"
    }

    fn validate(&self, params: &Value, _band_count: usize) -> Result<(), ValidationError> {
        if let Some(z) = params.get("z_factor") {
            let value = z.as_f64().ok_or_else(|| ValidationError::InvalidParameter {
                operation: "hillshade",
                name: "z_factor",
                reason: format!("expected a number, got {}", z),
            })?;
            if value <= 0.0 {
                return Err(ValidationError::InvalidParameter {
                    operation: "hillshade",
                    name: "z_factor",
                    reason: format!("must be positive, got {}", value),
                });
            }
        }
        Ok(())
    }

    fn run(
        &self,
        tools: &dyn ToolRunner,
        in_raster: &Path,
        out_raster: &Path,
        params: &Value,
    ) -> Result<(), RasterError> {
        let z_factor = params.get("z_factor").and_then(|z| z.as_f64()).unwrap_or(1.0);
        tools.hillshade(in_raster, out_raster, z_factor)?;
        Ok(())
    }
}
