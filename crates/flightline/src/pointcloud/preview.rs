//! Down-sampled 3-D scatter previews for point clouds.
//!
//! The source is streamed in fixed-size chunks with a deterministic
//! sampling ratio `ceil(total_points / point_limit)`, so memory stays
//! bounded regardless of input size. Colors come from the cloud's RGB
//! samples when present, otherwise height is mapped through a diverging
//! color scale.

use std::path::Path;

use image::RgbImage;

use crate::error::PointCloudError;
use crate::pointcloud::las::{LasPoint, LasReader};

#[derive(Debug, Clone, Copy)]
pub struct PreviewOptions {
    pub point_limit: u64,
    pub chunk_points: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            point_limit: 100_000,
            chunk_points: 100_000,
            width: 800,
            height: 600,
        }
    }
}

/// Deterministic sampling ratio: keep every n-th point.
pub fn sampling_ratio(total_points: u64, point_limit: u64) -> u64 {
    if total_points == 0 {
        return 1;
    }
    total_points.div_ceil(point_limit).max(1)
}

/// Diverging blue→ivory→red scale for normalized height in [0, 1].
pub fn diverging_color(t: f32) -> [u8; 3] {
    const STOPS: [[f32; 3]; 3] = [
        [49.0, 54.0, 149.0],
        [255.0, 255.0, 191.0],
        [165.0, 0.0, 38.0],
    ];
    let t = t.clamp(0.0, 1.0) * (STOPS.len() - 1) as f32;
    let i = (t.floor() as usize).min(STOPS.len() - 2);
    let f = t - i as f32;
    let mut out = [0u8; 3];
    for c in 0..3 {
        out[c] = (STOPS[i][c] + (STOPS[i + 1][c] - STOPS[i][c]) * f).round() as u8;
    }
    out
}

/// Streams the cloud and renders an isometric scatter plot PNG.
pub fn render_scatter(
    reader: &mut LasReader,
    out_path: &Path,
    opts: &PreviewOptions,
) -> Result<(), PointCloudError> {
    let total = reader.header().point_count;
    let ratio = sampling_ratio(total, opts.point_limit);

    let mut sampled: Vec<LasPoint> = Vec::new();
    let mut index: u64 = 0;
    loop {
        let chunk = reader.read_chunk(opts.chunk_points as usize)?;
        if chunk.is_empty() {
            break;
        }
        for point in chunk {
            if index % ratio == 0 {
                sampled.push(point);
            }
            index += 1;
        }
    }

    if sampled.is_empty() {
        return Err(PointCloudError::Preview(
            "point cloud contains no points".to_string(),
        ));
    }

    // Bounds of the sample, used both for projection and height coloring.
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for p in &sampled {
        for (axis, v) in [p.x, p.y, p.z].into_iter().enumerate() {
            min[axis] = min[axis].min(v);
            max[axis] = max[axis].max(v);
        }
    }
    let span = |axis: usize| (max[axis] - min[axis]).max(f64::EPSILON);

    // Isometric projection of the unit cube.
    let project = |p: &LasPoint| -> (f64, f64) {
        let nx = (p.x - min[0]) / span(0);
        let ny = (p.y - min[1]) / span(1);
        let nz = (p.z - min[2]) / span(2);
        let px = (nx - ny) * 0.866;
        let py = (nx + ny) * 0.35 - nz * 0.6;
        (px, py)
    };

    let mut proj_min = (f64::INFINITY, f64::INFINITY);
    let mut proj_max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in &sampled {
        let (x, y) = project(p);
        proj_min.0 = proj_min.0.min(x);
        proj_min.1 = proj_min.1.min(y);
        proj_max.0 = proj_max.0.max(x);
        proj_max.1 = proj_max.1.max(y);
    }
    let proj_span_x = (proj_max.0 - proj_min.0).max(f64::EPSILON);
    let proj_span_y = (proj_max.1 - proj_min.1).max(f64::EPSILON);

    let margin = 10u32;
    let draw_w = opts.width.saturating_sub(2 * margin).max(1) as f64;
    let draw_h = opts.height.saturating_sub(2 * margin).max(1) as f64;

    let mut img = RgbImage::from_pixel(opts.width, opts.height, image::Rgb([255, 255, 255]));

    let use_rgb = reader.header().has_rgb();
    for p in &sampled {
        let (x, y) = project(p);
        let px = margin as f64 + (x - proj_min.0) / proj_span_x * draw_w;
        // Screen y grows downward; projected y grows with height.
        let py = margin as f64 + (1.0 - (y - proj_min.1) / proj_span_y) * draw_h;

        let color = match (use_rgb, p.rgb) {
            (true, Some(rgb)) => scale_rgb(rgb),
            _ => {
                let t = ((p.z - min[2]) / span(2)) as f32;
                diverging_color(t)
            }
        };

        // 2x2 dot so sparse clouds stay visible.
        for dy in 0..2u32 {
            for dx in 0..2u32 {
                let ix = (px as u32).saturating_add(dx).min(opts.width - 1);
                let iy = (py as u32).saturating_add(dy).min(opts.height - 1);
                img.put_pixel(ix, iy, image::Rgb(color));
            }
        }
    }

    img.save(out_path)
        .map_err(|e| PointCloudError::Preview(e.to_string()))?;
    Ok(())
}

/// LAS RGB samples are nominally 16-bit; many producers write 8-bit
/// values. Scale only when the sample really uses the upper byte.
fn scale_rgb(rgb: [u16; 3]) -> [u8; 3] {
    let wide = rgb.iter().any(|&c| c > 255);
    let mut out = [0u8; 3];
    for (i, &c) in rgb.iter().enumerate() {
        out[i] = if wide { (c >> 8) as u8 } else { c as u8 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_ratio() {
        assert_eq!(sampling_ratio(0, 100_000), 1);
        assert_eq!(sampling_ratio(50_000, 100_000), 1);
        assert_eq!(sampling_ratio(100_000, 100_000), 1);
        assert_eq!(sampling_ratio(100_001, 100_000), 2);
        assert_eq!(sampling_ratio(1_000_000, 100_000), 10);
        assert_eq!(sampling_ratio(1_000_001, 100_000), 11);
    }

    #[test]
    fn test_diverging_color_endpoints() {
        assert_eq!(diverging_color(0.0), [49, 54, 149]);
        assert_eq!(diverging_color(1.0), [165, 0, 38]);
        assert_eq!(diverging_color(0.5), [255, 255, 191]);
        // Clamped outside [0, 1].
        assert_eq!(diverging_color(-1.0), diverging_color(0.0));
        assert_eq!(diverging_color(2.0), diverging_color(1.0));
    }

    #[test]
    fn test_scale_rgb_narrow_and_wide() {
        assert_eq!(scale_rgb([10, 20, 30]), [10, 20, 30]);
        assert_eq!(scale_rgb([2560, 5120, 7680]), [10, 20, 30]);
    }
}
