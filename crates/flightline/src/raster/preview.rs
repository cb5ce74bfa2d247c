//! Low-resolution raster previews.
//!
//! A preview is a small JPEG (~6% linear scale by default) built by
//! sampling every n-th pixel while streaming the source block windows.
//! Each band is linearly stretched min→0, max→255 from the statistics
//! computed during conversion, clipped to [0, 255].

use std::path::Path;

use image::{GrayImage, RgbImage};

use crate::error::RasterError;
use crate::raster::dataset::RasterDataset;
use crate::raster::stats::BandStats;

/// Linear stretch of one sample to [0, 255].
pub fn stretch(value: f32, stats: &BandStats) -> u8 {
    let range = stats.maximum - stats.minimum;
    if range <= 0.0 {
        return 0;
    }
    let scaled = ((value as f64 - stats.minimum) / range) * 255.0;
    scaled.clamp(0.0, 255.0) as u8
}

/// Renders the preview next to the raster. Multi-band sources use the
/// first three bands as RGB; single-band sources render grayscale.
pub fn render_preview(
    ds: &mut RasterDataset,
    stats: &[BandStats],
    out_path: &Path,
    scale: f64,
) -> Result<(), RasterError> {
    if stats.len() < ds.band_count().min(3) {
        return Err(RasterError::Preview(format!(
            "have {} band stats for {} bands",
            stats.len(),
            ds.band_count()
        )));
    }

    let step = ((1.0 / scale).round() as u32).max(1);
    let out_w = ds.width().div_ceil(step).max(1);
    let out_h = ds.height().div_ceil(step).max(1);

    if ds.band_count() >= 3 {
        let mut img = RgbImage::new(out_w, out_h);
        sample_windows(ds, &[0, 1, 2], step, |out_x, out_y, values| {
            let px = image::Rgb([
                stretch(values[0], &stats[0]),
                stretch(values[1], &stats[1]),
                stretch(values[2], &stats[2]),
            ]);
            if out_x < out_w && out_y < out_h {
                img.put_pixel(out_x, out_y, px);
            }
        })?;
        img.save(out_path)
            .map_err(|e| RasterError::Preview(e.to_string()))?;
    } else {
        let mut img = GrayImage::new(out_w, out_h);
        sample_windows(ds, &[0], step, |out_x, out_y, values| {
            if out_x < out_w && out_y < out_h {
                img.put_pixel(out_x, out_y, image::Luma([stretch(values[0], &stats[0])]));
            }
        })?;
        img.save(out_path)
            .map_err(|e| RasterError::Preview(e.to_string()))?;
    }

    Ok(())
}

/// Streams the dataset and invokes `emit` for every sampled pixel with
/// its output coordinates and per-band values.
fn sample_windows<F>(
    ds: &mut RasterDataset,
    bands: &[usize],
    step: u32,
    mut emit: F,
) -> Result<(), RasterError>
where
    F: FnMut(u32, u32, &[f32]),
{
    let width = ds.width();
    let mut values = vec![0f32; bands.len()];

    for window in ds.windows() {
        let buffers = ds.read_window_bands(&window, bands)?;
        for row in 0..window.height {
            let abs_y = window.y + row;
            if abs_y % step != 0 {
                continue;
            }
            let out_y = abs_y / step;
            let mut x = 0;
            while x < width {
                let idx = (row * window.width + x) as usize;
                for (slot, buffer) in buffers.iter().enumerate() {
                    values[slot] = buffer[idx];
                }
                emit(x / step, out_y, &values);
                x += step;
            }
        }
    }

    Ok(())
}
