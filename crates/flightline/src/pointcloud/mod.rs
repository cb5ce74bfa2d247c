//! Point-cloud ingestion: COPC normalization and scatter previews.

pub mod converter;
pub mod las;
pub mod preview;

pub use converter::{PointCloudConversion, PointCloudConverter, FAILED_MARKER};
pub use las::{LasHeader, LasPoint, LasReader};
