//! Block-windowed GeoTIFF access.
//!
//! Raster algebra and statistics iterate the source's native block
//! windows and never materialize a full-resolution array. Reads assemble
//! at most one row of blocks at a time, so memory stays bounded by
//! `width * block_height * bands * 4` bytes regardless of raster size.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::RasterError;

/// GDAL's nodata side-car tag.
const TAG_GDAL_NODATA: u16 = 42113;

/// One native block window of a raster. Full-width, `height` rows tall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWindow {
    pub index: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BlockWindow {
    pub fn len(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A read-only raster dataset backed by a (Geo)TIFF file.
pub struct RasterDataset {
    decoder: Decoder<BufReader<File>>,
    path: PathBuf,
    width: u32,
    height: u32,
    bands: usize,
    block_width: u32,
    block_height: u32,
    chunks_across: u32,
    nodata: Option<f64>,
    data_type: String,
}

impl RasterDataset {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path).map_err(|e| RasterError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| RasterError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let (width, height) = decoder.dimensions().map_err(|e| RasterError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let bands = decoder
            .get_tag_u32(Tag::SamplesPerPixel)
            .unwrap_or(1) as usize;
        if bands == 0 {
            return Err(RasterError::NoBands {
                path: path.to_path_buf(),
            });
        }

        let (block_width, block_height) = decoder.chunk_dimensions();
        let block_width = block_width.min(width).max(1);
        let block_height = block_height.min(height).max(1);
        let chunks_across = width.div_ceil(block_width);

        let nodata = decoder
            .get_tag_ascii_string(Tag::Unknown(TAG_GDAL_NODATA))
            .ok()
            .and_then(|raw| {
                let raw = raw.trim().trim_end_matches('\0').trim();
                if raw.eq_ignore_ascii_case("nan") {
                    Some(f64::NAN)
                } else {
                    raw.parse::<f64>().ok()
                }
            });

        let data_type = detect_data_type(&mut decoder);

        Ok(Self {
            decoder,
            path: path.to_path_buf(),
            width,
            height,
            bands,
            block_width,
            block_height,
            chunks_across,
            nodata,
            data_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn band_count(&self) -> usize {
        self.bands
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Pixel data type name (`Byte`, `UInt16`, `Float32`, ...).
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Native block shape `(width, height)` of the underlying chunks.
    pub fn block_shape(&self) -> (u32, u32) {
        (self.block_width, self.block_height)
    }

    /// Full-width windows aligned to the native block rows, top to bottom.
    pub fn windows(&self) -> Vec<BlockWindow> {
        let mut out = Vec::new();
        let mut index = 0;
        let mut y = 0;
        while y < self.height {
            let h = self.block_height.min(self.height - y);
            out.push(BlockWindow {
                index,
                x: 0,
                y,
                width: self.width,
                height: h,
            });
            index += 1;
            y += h;
        }
        out
    }

    /// Reads the given bands (zero-based) of one window. Returns one
    /// `window.len()` buffer per requested band, row-major.
    pub fn read_window_bands(
        &mut self,
        window: &BlockWindow,
        bands: &[usize],
    ) -> Result<Vec<Vec<f32>>, RasterError> {
        for &b in bands {
            if b >= self.bands {
                return Err(RasterError::ReadBlock(format!(
                    "band {} out of range ({} bands) in {}",
                    b,
                    self.bands,
                    self.path.display()
                )));
            }
        }

        let mut out: Vec<Vec<f32>> = bands.iter().map(|_| vec![0f32; window.len()]).collect();

        let cy0 = window.y / self.block_height;
        let cy1 = (window.y + window.height - 1) / self.block_height;
        let cx1 = self.chunks_across - 1;

        for cy in cy0..=cy1 {
            for cx in 0..=cx1 {
                let chunk_index = cy * self.chunks_across + cx;
                let origin_x = cx * self.block_width;
                let origin_y = cy * self.block_height;
                let data_w = self.block_width.min(self.width - origin_x);
                let data_h = self.block_height.min(self.height - origin_y);

                let samples = self.read_chunk_f32(chunk_index)?;
                let expected = (data_w as usize) * (data_h as usize) * self.bands;
                if samples.len() < expected {
                    return Err(RasterError::ReadBlock(format!(
                        "chunk {} of {} has {} samples, expected {}",
                        chunk_index,
                        self.path.display(),
                        samples.len(),
                        expected
                    )));
                }

                // Intersection of this chunk with the requested window.
                let y_lo = window.y.max(origin_y);
                let y_hi = (window.y + window.height).min(origin_y + data_h);
                let x_lo = window.x.max(origin_x);
                let x_hi = (window.x + window.width).min(origin_x + data_w);
                if y_lo >= y_hi || x_lo >= x_hi {
                    continue;
                }

                for row in y_lo..y_hi {
                    let src_row = (row - origin_y) as usize;
                    let dst_row = (row - window.y) as usize;
                    for col in x_lo..x_hi {
                        let src_col = (col - origin_x) as usize;
                        let dst_col = (col - window.x) as usize;
                        let src_px = (src_row * data_w as usize + src_col) * self.bands;
                        let dst_px = dst_row * window.width as usize + dst_col;
                        for (slot, &b) in bands.iter().enumerate() {
                            out[slot][dst_px] = samples[src_px + b];
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// Reads a single band of one window.
    pub fn read_window_band(
        &mut self,
        window: &BlockWindow,
        band: usize,
    ) -> Result<Vec<f32>, RasterError> {
        Ok(self.read_window_bands(window, &[band])?.remove(0))
    }

    fn read_chunk_f32(&mut self, chunk_index: u32) -> Result<Vec<f32>, RasterError> {
        let result = self
            .decoder
            .read_chunk(chunk_index)
            .map_err(|e| RasterError::ReadBlock(format!("{}: {}", self.path.display(), e)))?;

        Ok(match result {
            DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::F32(v) => v,
            DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            #[allow(unreachable_patterns)]
            _ => {
                return Err(RasterError::ReadBlock(format!(
                    "unsupported sample format in {}",
                    self.path.display()
                )))
            }
        })
    }
}

/// First integral value of a tag that may be stored as a scalar or a
/// per-band list (BitsPerSample, SampleFormat).
fn first_tag_value(decoder: &mut Decoder<BufReader<File>>, tag: Tag, default: u32) -> u32 {
    use tiff::decoder::ifd::Value;

    fn unwrap_value(value: Value) -> Option<u32> {
        match value {
            Value::Byte(v) => Some(v as u32),
            Value::Short(v) => Some(v as u32),
            Value::Unsigned(v) => Some(v),
            Value::UnsignedBig(v) => Some(v as u32),
            Value::List(values) => values.into_iter().next().and_then(unwrap_value),
            _ => None,
        }
    }

    match decoder.find_tag(tag) {
        Ok(Some(value)) => unwrap_value(value).unwrap_or(default),
        _ => default,
    }
}

fn detect_data_type(decoder: &mut Decoder<BufReader<File>>) -> String {
    // SampleFormat: 1 = unsigned, 2 = signed, 3 = float.
    let format = first_tag_value(decoder, Tag::SampleFormat, 1);
    let bits = first_tag_value(decoder, Tag::BitsPerSample, 8);

    match (format, bits) {
        (3, 64) => "Float64",
        (3, _) => "Float32",
        (2, 8) => "Int8",
        (2, 16) => "Int16",
        (2, _) => "Int32",
        (_, 8) => "Byte",
        (_, 16) => "UInt16",
        (_, _) => "UInt32",
    }
    .to_string()
}

/// Writes a single-band float32 raster strip by strip.
///
/// `fill` is called once per window, top to bottom, and must return
/// exactly `window.len()` samples. The window height matches
/// `block_height`, so a toolbox operation can read the matching source
/// window inside the callback and stay memory-bounded.
pub fn write_gray_f32<F>(
    path: &Path,
    width: u32,
    height: u32,
    block_height: u32,
    mut fill: F,
) -> Result<(), RasterError>
where
    F: FnMut(&BlockWindow) -> Result<Vec<f32>, RasterError>,
{
    let file = File::create(path).map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut encoder = TiffEncoder::new(file).map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let block_height = block_height.min(height).max(1);

    let mut image = encoder
        .new_image::<colortype::Gray32Float>(width, height)
        .map_err(|e| RasterError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    image
        .rows_per_strip(block_height)
        .map_err(|e| RasterError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut index = 0;
    let mut y = 0;
    while y < height {
        let h = block_height.min(height - y);
        let window = BlockWindow {
            index,
            x: 0,
            y,
            width,
            height: h,
        };
        let data = fill(&window)?;
        if data.len() != window.len() {
            return Err(RasterError::Write {
                path: path.to_path_buf(),
                reason: format!(
                    "window {} produced {} samples, expected {}",
                    index,
                    data.len(),
                    window.len()
                ),
            });
        }
        image.write_strip(&data).map_err(|e| RasterError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        index += 1;
        y += h;
    }

    image.finish().map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(())
}

/// Writes a full in-memory single-band raster (tests and small outputs).
pub fn write_gray_f32_pixels(
    path: &Path,
    width: u32,
    height: u32,
    pixels: &[f32],
) -> Result<(), RasterError> {
    assert_eq!(pixels.len(), (width as usize) * (height as usize));
    write_gray_f32(path, width, height, height, |window| {
        let start = (window.y as usize) * (width as usize);
        let end = start + window.len();
        Ok(pixels[start..end].to_vec())
    })
}

/// Writes an interleaved 8-bit RGB raster in one strip (tests).
pub fn write_rgb8_pixels(
    path: &Path,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<(), RasterError> {
    assert_eq!(pixels.len(), (width as usize) * (height as usize) * 3);
    let file = File::create(path).map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut encoder = TiffEncoder::new(file).map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    encoder
        .write_image::<colortype::RGB8>(width, height, pixels)
        .map_err(|e| RasterError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(())
}

/// Writes an interleaved 8-bit RGBA raster in one strip (tests).
pub fn write_rgba8_pixels(
    path: &Path,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<(), RasterError> {
    assert_eq!(pixels.len(), (width as usize) * (height as usize) * 4);
    let file = File::create(path).map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut encoder = TiffEncoder::new(file).map_err(|e| RasterError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    encoder
        .write_image::<colortype::RGBA8>(width, height, pixels)
        .map_err(|e| RasterError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(())
}
