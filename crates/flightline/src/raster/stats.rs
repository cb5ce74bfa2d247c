//! Streaming per-band statistics.
//!
//! Statistics are accumulated block window by block window so arbitrarily
//! large rasters never materialize in memory. Nodata and NaN samples are
//! excluded.

use serde::{Deserialize, Serialize};

use crate::error::RasterError;
use crate::raster::dataset::RasterDataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// Running accumulator for one band.
#[derive(Debug, Clone)]
pub struct BandAccumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
    minimum: f64,
    maximum: f64,
}

impl BandAccumulator {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            minimum: f64::INFINITY,
            maximum: f64::NEG_INFINITY,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        if value < self.minimum {
            self.minimum = value;
        }
        if value > self.maximum {
            self.maximum = value;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish(&self) -> Option<BandStats> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        Some(BandStats {
            minimum: self.minimum,
            maximum: self.maximum,
            mean,
            stddev: variance.sqrt(),
        })
    }
}

impl Default for BandAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_excluded(value: f32, nodata: Option<f64>) -> bool {
    if value.is_nan() {
        return true;
    }
    match nodata {
        Some(nd) if nd.is_nan() => false, // NaN nodata already caught above
        Some(nd) => (value as f64) == nd,
        None => false,
    }
}

/// Computes statistics for every band of the dataset.
pub fn compute_stats(ds: &mut RasterDataset) -> Result<Vec<BandStats>, RasterError> {
    let bands: Vec<usize> = (0..ds.band_count()).collect();
    let nodata = ds.nodata();
    let mut accumulators = vec![BandAccumulator::new(); bands.len()];

    for window in ds.windows() {
        let buffers = ds.read_window_bands(&window, &bands)?;
        for (acc, buffer) in accumulators.iter_mut().zip(&buffers) {
            for &value in buffer {
                if !is_excluded(value, nodata) {
                    acc.push(value as f64);
                }
            }
        }
    }

    accumulators
        .iter()
        .enumerate()
        .map(|(band, acc)| {
            acc.finish().ok_or_else(|| RasterError::EmptyBand {
                path: ds.path().to_path_buf(),
                band,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::dataset::write_gray_f32_pixels;
    use tempfile::TempDir;

    #[test]
    fn test_accumulator_basic() {
        let mut acc = BandAccumulator::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            acc.push(v);
        }
        let stats = acc.finish().unwrap();
        assert_eq!(stats.minimum, 1.0);
        assert_eq!(stats.maximum, 4.0);
        assert!((stats.mean - 2.5).abs() < 1e-9);
        // Population stddev of 1..4 is sqrt(1.25).
        assert!((stats.stddev - 1.25f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_accumulator_empty() {
        assert!(BandAccumulator::new().finish().is_none());
    }

    #[test]
    fn test_compute_stats_ordering_invariant() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vals.tif");
        let pixels: Vec<f32> = (0..64).map(|i| (i % 7) as f32).collect();
        write_gray_f32_pixels(&path, 8, 8, &pixels).unwrap();

        let mut ds = RasterDataset::open(&path).unwrap();
        let stats = compute_stats(&mut ds).unwrap();
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert!(s.minimum <= s.mean && s.mean <= s.maximum);
        assert_eq!(s.minimum, 0.0);
        assert_eq!(s.maximum, 6.0);
    }

    #[test]
    fn test_nan_pixels_excluded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nan.tif");
        let pixels = vec![1.0, f32::NAN, 3.0, f32::NAN];
        write_gray_f32_pixels(&path, 2, 2, &pixels).unwrap();

        let mut ds = RasterDataset::open(&path).unwrap();
        let stats = compute_stats(&mut ds).unwrap();
        assert_eq!(stats[0].minimum, 1.0);
        assert_eq!(stats[0].maximum, 3.0);
        assert!((stats[0].mean - 2.0).abs() < 1e-9);
    }
}
