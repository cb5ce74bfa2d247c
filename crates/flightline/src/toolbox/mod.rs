//! Raster Algebra Toolbox: a pluggable name→operation registry.
//!
//! After an operation writes its raster, the output is pushed back
//! through the Raster Converter so every toolbox product is itself a
//! valid COG with derived metadata and a default symbology.

pub mod ops;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info_span;

use crate::config::Config;
use crate::error::{FlightlineError, WorkerError};
use crate::raster::converter::{RasterConversion, RasterConverter};
use crate::raster::dataset::RasterDataset;
use crate::tools::ToolRunner;

pub use ops::ToolboxOperation;

pub struct Toolbox {
    operations: HashMap<&'static str, Box<dyn ToolboxOperation>>,
    tools: Arc<dyn ToolRunner>,
    config: Arc<Config>,
}

impl Toolbox {
    /// Builds the registry with the built-in vegetation-index, canopy,
    /// and terrain operations.
    pub fn new(tools: Arc<dyn ToolRunner>, config: Arc<Config>) -> Self {
        let mut toolbox = Self {
            operations: HashMap::new(),
            tools,
            config,
        };
        toolbox.register(Box::new(ops::ExcessGreen));
        toolbox.register(Box::new(ops::NormalizedDifference));
        toolbox.register(Box::new(ops::Vari));
        toolbox.register(Box::new(ops::CanopyHeight));
        toolbox.register(Box::new(ops::Hillshade));
        toolbox
    }

    pub fn register(&mut self, operation: Box<dyn ToolboxOperation>) {
        self.operations.insert(operation.name(), operation);
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.operations.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Runs a named operation, then converts its output to a COG with
    /// derived metadata.
    pub fn run(
        &self,
        name: &str,
        in_raster: &Path,
        out_raster: &Path,
        params: &serde_json::Value,
    ) -> Result<RasterConversion, FlightlineError> {
        let operation = self
            .operations
            .get(name)
            .ok_or_else(|| WorkerError::UnknownOperation(name.to_string()))?;

        let _span = info_span!("toolbox", operation = name, input = %in_raster.display()).entered();

        let band_count = RasterDataset::open(in_raster)?.band_count();
        operation.validate(params, band_count)?;

        operation.run(self.tools.as_ref(), in_raster, out_raster, params)?;

        let converter = RasterConverter::new(Arc::clone(&self.tools), Arc::clone(&self.config));
        let conversion = converter.convert(out_raster)?;
        Ok(conversion)
    }
}
