//! Raster Converter: normalizes an uploaded GeoTIFF into COG layout,
//! derives per-band metadata, and renders a preview.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info_span;

use crate::config::Config;
use crate::error::RasterError;
use crate::raster::dataset::RasterDataset;
use crate::raster::preview::render_preview;
use crate::raster::stats::{compute_stats, BandStats};
use crate::raster::{
    ChannelStretch, DerivedMetadata, EoBand, NodataValue, RasterBandMeta, Symbology,
};
use crate::storage::filesystem;
use crate::tools::{RasterInfo, ToolRunner};

/// Result of a successful conversion.
#[derive(Debug, Clone)]
pub struct RasterConversion {
    pub out_path: PathBuf,
    pub preview_path: PathBuf,
    pub metadata: DerivedMetadata,
}

pub struct RasterConverter {
    tools: Arc<dyn ToolRunner>,
    config: Arc<Config>,
}

impl RasterConverter {
    pub fn new(tools: Arc<dyn ToolRunner>, config: Arc<Config>) -> Self {
        Self { tools, config }
    }

    /// Converts the staged raster in place.
    ///
    /// 1. probe the input and decide whether it is already a COG;
    /// 2. if not, re-encode with deflate compression and tiling, using
    ///    `max(1, cpu_count/2)` encode threads, then replace the staged
    ///    file — converting an already-COG raster is a no-op;
    /// 3. stream per-band statistics and assemble derived metadata;
    /// 4. render the min/max-stretched JPEG preview beside the output.
    ///
    /// On error the caller removes the artifact staging directory so no
    /// partial outputs are left behind.
    pub fn convert(&self, in_path: &Path) -> Result<RasterConversion, RasterError> {
        let _span = info_span!("raster_convert", file = %in_path.display()).entered();

        let probe = self.tools.probe(in_path)?;
        if probe.bands.is_empty() {
            return Err(RasterError::NoBands {
                path: in_path.to_path_buf(),
            });
        }

        if probe.is_cog() {
            log::debug!("{} is already cloud-optimized", in_path.display());
        } else {
            let tmp = in_path.with_extension("cog.tif");
            self.tools
                .convert_to_cog(in_path, &tmp, self.config.cog_threads())?;
            filesystem::replace_file(&tmp, in_path).map_err(|e| RasterError::Write {
                path: in_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let mut ds = RasterDataset::open(in_path)?;
        let stats = compute_stats(&mut ds)?;
        let metadata = assemble_metadata(&probe, &ds, &stats);

        let preview_path = filesystem::sibling_with_extension(in_path, "jpg");
        render_preview(&mut ds, &stats, &preview_path, self.config.preview.scale)?;

        Ok(RasterConversion {
            out_path: in_path.to_path_buf(),
            preview_path,
            metadata,
        })
    }
}

/// Builds the persisted metadata from the probe, the dataset, and the
/// streamed statistics.
fn assemble_metadata(
    probe: &RasterInfo,
    ds: &RasterDataset,
    stats: &[BandStats],
) -> DerivedMetadata {
    let unit = probe.spatial_unit();

    let raster: Vec<RasterBandMeta> = stats
        .iter()
        .enumerate()
        .map(|(i, band_stats)| {
            let probe_band = probe.bands.get(i);
            let data_type = probe_band
                .map(|b| b.data_type.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| ds.data_type().to_string());
            let nodata = probe_band
                .and_then(|b| b.no_data_value)
                .or(ds.nodata())
                .map(NodataValue::from_f64);
            RasterBandMeta {
                stats: band_stats.clone(),
                data_type,
                nodata,
                unit: unit.to_string(),
            }
        })
        .collect();

    let eo: Vec<EoBand> = (1..=stats.len())
        .map(|i| EoBand {
            name: format!("b{}", i),
        })
        .collect();

    // Band count > 2 implies an RGB(A) visual product; a single band is
    // an analytic product with an adjustable ramp.
    let symbology = if stats.len() > 2 {
        Symbology::Rgb {
            red: channel(1, &stats[0]),
            green: channel(2, &stats[1]),
            blue: channel(3, &stats[2]),
        }
    } else {
        Symbology::Ramp {
            ramp: "linear".to_string(),
            minimum: stats[0].minimum,
            maximum: stats[0].maximum,
        }
    };

    DerivedMetadata {
        raster,
        eo,
        symbology,
    }
}

fn channel(band: u32, stats: &BandStats) -> ChannelStretch {
    ChannelStretch {
        band,
        minimum: stats.minimum,
        maximum: stats.maximum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::dataset::{write_gray_f32_pixels, write_rgb8_pixels};
    use crate::tools::fake::FakeToolRunner;
    use tempfile::TempDir;

    fn converter(fake: Arc<FakeToolRunner>) -> RasterConverter {
        let config = Arc::new(Config::with_storage_root("/tmp/unused"));
        RasterConverter::new(fake, config)
    }

    #[test]
    fn test_convert_non_cog_reencodes_and_builds_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dsm.tif");
        let pixels: Vec<f32> = (0..64).map(|i| i as f32).collect();
        write_gray_f32_pixels(&path, 8, 8, &pixels).unwrap();

        let fake = Arc::new(FakeToolRunner::new());
        let result = converter(Arc::clone(&fake)).convert(&path).unwrap();

        assert_eq!(result.out_path, path);
        assert!(result.preview_path.exists());
        assert_eq!(result.metadata.band_count(), 1);
        let band = &result.metadata.raster[0];
        assert!(band.stats.minimum <= band.stats.mean && band.stats.mean <= band.stats.maximum);
        assert!(matches!(result.metadata.symbology, Symbology::Ramp { .. }));
        assert_eq!(fake.calls_of("convert_to_cog"), 1);
    }

    #[test]
    fn test_convert_is_idempotent_on_cog_input() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ortho.tif");
        let mut pixels = Vec::new();
        for i in 0..16 {
            pixels.extend([(i * 10) as u8, 255 - (i * 10) as u8, 7]);
        }
        write_rgb8_pixels(&path, 4, 4, &pixels).unwrap();

        let fake = Arc::new(FakeToolRunner::new());
        let conv = converter(Arc::clone(&fake));

        let first = conv.convert(&path).unwrap();
        assert_eq!(fake.calls_of("convert_to_cog"), 1);

        // Second pass sees COG layout and does not re-encode.
        let second = conv.convert(&path).unwrap();
        assert_eq!(fake.calls_of("convert_to_cog"), 1);
        assert_eq!(
            serde_json::to_string(&first.metadata).unwrap(),
            serde_json::to_string(&second.metadata).unwrap()
        );
    }

    #[test]
    fn test_rgb_product_gets_rgb_symbology_and_eo_bands() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ortho.tif");
        let mut pixels = Vec::new();
        for i in 0..16 {
            pixels.extend([i as u8, (i * 2) as u8, (i * 3) as u8]);
        }
        write_rgb8_pixels(&path, 4, 4, &pixels).unwrap();

        let fake = Arc::new(FakeToolRunner::new());
        let result = converter(fake).convert(&path).unwrap();

        assert_eq!(result.metadata.eo.len(), 3);
        assert_eq!(result.metadata.eo[0].name, "b1");
        assert!(matches!(result.metadata.symbology, Symbology::Rgb { .. }));
    }

    #[test]
    fn test_probe_failure_propagates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.tif");
        std::fs::write(&path, b"not a tiff").unwrap();

        let fake = Arc::new(FakeToolRunner::new());
        fake.fail_tool("probe");

        let err = converter(fake).convert(&path).unwrap_err();
        assert!(matches!(err, RasterError::Tool(_)));
    }
}
