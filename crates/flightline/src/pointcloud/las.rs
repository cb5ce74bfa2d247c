//! Minimal LAS reader: header, spatial-reference VLR scan, and chunked
//! point reads.
//!
//! Only the fields the pipeline needs are parsed — coordinates, optional
//! RGB, and enough header state to validate the spatial reference and
//! bound memory while streaming. Compressed variants (.laz/.copc.laz) are
//! decompressed through the external pipeline engine first.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::PointCloudError;

const SIGNATURE: &[u8; 4] = b"LASF";
const BASE_HEADER_LEN: usize = 227;

/// Global-encoding bit signalling WKT CRS storage (LAS 1.4).
const WKT_BIT: u16 = 0x10;

/// VLR record ids carrying a spatial reference.
const CRS_RECORD_IDS: [u16; 3] = [2111, 2112, 34735];

#[derive(Debug, Clone)]
pub struct LasHeader {
    pub version: (u8, u8),
    pub global_encoding: u16,
    pub point_format: u8,
    pub record_length: u16,
    pub point_count: u64,
    pub offset_to_points: u32,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub min: [f64; 3],
    pub max: [f64; 3],
    /// True when a spatial reference was found (WKT bit or a
    /// `LASF_Projection` VLR).
    pub has_crs: bool,
}

impl LasHeader {
    pub fn has_rgb(&self) -> bool {
        matches!(self.point_format, 2 | 3 | 5 | 7 | 8 | 10)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LasPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rgb: Option<[u16; 3]>,
}

pub struct LasReader {
    reader: BufReader<File>,
    path: PathBuf,
    header: LasHeader,
    remaining: u64,
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(a)
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(a)
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(a)
}

fn le_i32(buf: &[u8], off: usize) -> i32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&buf[off..off + 4]);
    i32::from_le_bytes(a)
}

fn le_f64(buf: &[u8], off: usize) -> f64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&buf[off..off + 8]);
    f64::from_le_bytes(a)
}

/// Byte offset of the RGB triple inside one point record, per format.
fn rgb_offset(format: u8) -> Option<usize> {
    match format {
        2 => Some(20),
        3 | 5 => Some(28),
        7 | 8 => Some(30),
        10 => Some(30),
        _ => None,
    }
}

/// Minimum record length per supported point format.
fn min_record_length(format: u8) -> Option<usize> {
    match format {
        0 => Some(20),
        1 => Some(28),
        2 => Some(26),
        3 => Some(34),
        6 => Some(30),
        7 => Some(36),
        8 => Some(38),
        _ => None,
    }
}

impl LasReader {
    pub fn open(path: &Path) -> Result<Self, PointCloudError> {
        let file = File::open(path).map_err(|e| PointCloudError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut reader = BufReader::new(file);

        let mut base = [0u8; BASE_HEADER_LEN];
        reader
            .read_exact(&mut base)
            .map_err(|e| PointCloudError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;

        if &base[0..4] != SIGNATURE {
            return Err(PointCloudError::BadSignature {
                path: path.to_path_buf(),
            });
        }

        let global_encoding = le_u16(&base, 6);
        let version = (base[24], base[25]);
        let header_size = le_u16(&base, 94) as usize;
        let offset_to_points = le_u32(&base, 96);
        let vlr_count = le_u32(&base, 100);
        let point_format = base[104] & 0x3f; // mask off LAZ compressor bits
        let record_length = le_u16(&base, 105);
        let legacy_count = le_u32(&base, 107) as u64;

        if min_record_length(point_format).is_none() {
            return Err(PointCloudError::UnsupportedFormat(point_format));
        }

        // Read the remainder of an extended (1.3/1.4) header.
        let mut extended = vec![0u8; header_size.saturating_sub(BASE_HEADER_LEN)];
        if !extended.is_empty() {
            reader
                .read_exact(&mut extended)
                .map_err(|e| PointCloudError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        }

        // LAS 1.4 stores the real count at offset 247 when the legacy
        // field is zeroed.
        let point_count = if legacy_count == 0 && version >= (1, 4) && header_size >= 255 {
            le_u64(&extended, 247 - BASE_HEADER_LEN)
        } else {
            legacy_count
        };

        let scale = [le_f64(&base, 131), le_f64(&base, 139), le_f64(&base, 147)];
        let offset = [le_f64(&base, 155), le_f64(&base, 163), le_f64(&base, 171)];
        let max = [le_f64(&base, 179), le_f64(&base, 195), le_f64(&base, 211)];
        let min = [le_f64(&base, 187), le_f64(&base, 203), le_f64(&base, 219)];

        let mut has_crs = global_encoding & WKT_BIT != 0;
        if !has_crs {
            has_crs = scan_crs_vlrs(&mut reader, path, vlr_count)?;
        }

        reader
            .seek(SeekFrom::Start(offset_to_points as u64))
            .map_err(|e| PointCloudError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            header: LasHeader {
                version,
                global_encoding,
                point_format,
                record_length,
                point_count,
                offset_to_points,
                scale,
                offset,
                min,
                max,
                has_crs,
            },
            remaining: point_count,
        })
    }

    pub fn header(&self) -> &LasHeader {
        &self.header
    }

    /// Reads the next chunk of at most `max_points` points. Returns an
    /// empty vector once the cloud is exhausted.
    pub fn read_chunk(&mut self, max_points: usize) -> Result<Vec<LasPoint>, PointCloudError> {
        let count = (self.remaining as usize).min(max_points);
        if count == 0 {
            return Ok(Vec::new());
        }

        let stride = self.header.record_length as usize;
        let mut buf = vec![0u8; count * stride];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| PointCloudError::Read {
                path: self.path.clone(),
                source: e,
            })?;
        self.remaining -= count as u64;

        let rgb_off = rgb_offset(self.header.point_format)
            .filter(|off| off + 6 <= stride);
        let [sx, sy, sz] = self.header.scale;
        let [ox, oy, oz] = self.header.offset;

        let mut points = Vec::with_capacity(count);
        for record in buf.chunks_exact(stride) {
            let x = le_i32(record, 0) as f64 * sx + ox;
            let y = le_i32(record, 4) as f64 * sy + oy;
            let z = le_i32(record, 8) as f64 * sz + oz;
            let rgb = rgb_off.map(|off| {
                [
                    le_u16(record, off),
                    le_u16(record, off + 2),
                    le_u16(record, off + 4),
                ]
            });
            points.push(LasPoint { x, y, z, rgb });
        }

        Ok(points)
    }
}

/// Scans the VLR block for a spatial-reference record.
fn scan_crs_vlrs(
    reader: &mut BufReader<File>,
    path: &Path,
    vlr_count: u32,
) -> Result<bool, PointCloudError> {
    let mut found = false;
    for _ in 0..vlr_count {
        let mut vlr_header = [0u8; 54];
        if reader.read_exact(&mut vlr_header).is_err() {
            // Truncated VLR block: treat the remainder as absent rather
            // than failing the whole read.
            break;
        }
        let user_id = &vlr_header[2..18];
        let record_id = le_u16(&vlr_header, 18);
        let data_len = le_u16(&vlr_header, 20) as i64;

        let user = std::str::from_utf8(user_id)
            .unwrap_or("")
            .trim_end_matches('\0');
        if user == "LASF_Projection" && CRS_RECORD_IDS.contains(&record_id) {
            found = true;
        }

        reader
            .seek(SeekFrom::Current(data_len))
            .map_err(|e| PointCloudError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
    }
    Ok(found)
}


#[cfg(test)]
mod tests {
    use super::testutil::build_las;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_read_points() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cloud.las");
        let points = vec![
            (1.0, 2.0, 3.0, [256u16, 512, 768]),
            (4.0, 5.0, 6.0, [0, 0, 0]),
        ];
        std::fs::write(&path, build_las(&points, true)).unwrap();

        let mut reader = LasReader::open(&path).unwrap();
        assert_eq!(reader.header().point_count, 2);
        assert_eq!(reader.header().point_format, 2);
        assert!(reader.header().has_crs);
        assert!(reader.header().has_rgb());

        let chunk = reader.read_chunk(10).unwrap();
        assert_eq!(chunk.len(), 2);
        assert!((chunk[0].x - 1.0).abs() < 0.01);
        assert!((chunk[0].z - 3.0).abs() < 0.01);
        assert_eq!(chunk[0].rgb, Some([256, 512, 768]));

        // Exhausted.
        assert!(reader.read_chunk(10).unwrap().is_empty());
    }

    #[test]
    fn test_chunked_reads_are_bounded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cloud.las");
        let points: Vec<_> = (0..25)
            .map(|i| (i as f64, 0.0, 0.0, [0u16, 0, 0]))
            .collect();
        std::fs::write(&path, build_las(&points, true)).unwrap();

        let mut reader = LasReader::open(&path).unwrap();
        let mut total = 0;
        loop {
            let chunk = reader.read_chunk(10).unwrap();
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 10);
            total += chunk.len();
        }
        assert_eq!(total, 25);
    }

    #[test]
    fn test_missing_crs_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nocrs.las");
        std::fs::write(&path, build_las(&[(0.0, 0.0, 0.0, [0, 0, 0])], false)).unwrap();

        let reader = LasReader::open(&path).unwrap();
        assert!(!reader.header().has_crs);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("junk.las");
        std::fs::write(&path, vec![0u8; 300]).unwrap();

        assert!(matches!(
            LasReader::open(&path),
            Err(PointCloudError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.las");
        std::fs::write(&path, b"LASF").unwrap();

        assert!(matches!(
            LasReader::open(&path),
            Err(PointCloudError::Read { .. })
        ));
    }
}
