//! Raster ingestion: COG normalization, derived metadata, previews.

pub mod converter;
pub mod dataset;
pub mod preview;
pub mod stats;

use serde::{Deserialize, Serialize};

use crate::raster::stats::BandStats;

pub use converter::{RasterConversion, RasterConverter};

/// Nodata value as persisted. JSON cannot represent NaN, so NaN is
/// normalized to the sentinel string `"nan"` before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodataValue {
    Number(f64),
    Sentinel(String),
}

impl NodataValue {
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            NodataValue::Sentinel("nan".to_string())
        } else {
            NodataValue::Number(value)
        }
    }
}

/// Per-band raster metadata persisted on the data product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterBandMeta {
    pub stats: BandStats,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodata: Option<NodataValue>,
    pub unit: String,
}

/// Electro-optical band descriptor (one per source band).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EoBand {
    pub name: String,
}

/// Default visualization for a product.
///
/// A single-band analytic product (DSM/DTM/index) gets a user-adjustable
/// linear color ramp; a 3-band-plus visual product gets a per-channel
/// min/max stretch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Symbology {
    Ramp {
        ramp: String,
        minimum: f64,
        maximum: f64,
    },
    Rgb {
        red: ChannelStretch,
        green: ChannelStretch,
        blue: ChannelStretch,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStretch {
    pub band: u32,
    pub minimum: f64,
    pub maximum: f64,
}

/// Structured metadata derived from a successful conversion. Populated
/// only on SUCCESS; complete and stable before any catalog publish is
/// attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedMetadata {
    pub raster: Vec<RasterBandMeta>,
    pub eo: Vec<EoBand>,
    pub symbology: Symbology,
}

impl DerivedMetadata {
    pub fn band_count(&self) -> usize {
        self.raster.len()
    }
}
