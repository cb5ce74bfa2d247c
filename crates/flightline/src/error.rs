use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlightlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    #[error("Point cloud error: {0}")]
    PointCloud(#[from] PointCloudError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Bad input rejected before any work starts. Never retried.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Unsupported file format: '{0}'")]
    UnsupportedFormat(String),

    #[error("Unknown data type: '{0}'")]
    UnknownDataType(String),

    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Duplicated header: {0}")]
    DuplicatedHeader(&'static str),

    #[error("Missing required parameter '{name}' for operation '{operation}'")]
    MissingParameter {
        operation: &'static str,
        name: &'static str,
    },

    #[error("Invalid parameter '{name}' for operation '{operation}': {reason}")]
    InvalidParameter {
        operation: &'static str,
        name: &'static str,
        reason: String,
    },

    #[error("Band index {index} out of range (raster has {band_count} bands)")]
    BandOutOfRange { index: usize, band_count: usize },

    #[error("Point cloud has no spatial reference: {path}")]
    MissingCrs { path: PathBuf },
}

/// External tool invocation failed. Any nonzero exit is a hard failure.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to spawn '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool '{tool}' exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to parse output of '{tool}': {reason}")]
    ParseOutput { tool: String, reason: String },
}

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("Failed to open raster '{path}': {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Failed to read raster block: {0}")]
    ReadBlock(String),

    #[error("Failed to write raster '{path}': {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Rasters have mismatched block windows: {0}")]
    WindowMismatch(String),

    #[error("Raster has no bands: {path}")]
    NoBands { path: PathBuf },

    #[error("Band {band} of '{path}' has no valid pixels")]
    EmptyBand { path: PathBuf, band: usize },

    #[error("Failed to encode preview: {0}")]
    Preview(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum PointCloudError {
    #[error("Failed to read point cloud '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a LAS file: {path}")]
    BadSignature { path: PathBuf },

    #[error("Unsupported point record format {0}")]
    UnsupportedFormat(u8),

    #[error("Failed to encode preview: {0}")]
    Preview(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Unknown toolbox operation: '{0}'")]
    UnknownOperation(String),

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Artifact {artifact_id} not found")]
    ArtifactNotFound { artifact_id: String },
}

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Expected on-disk artifact missing: {path}")]
    ResourceMissing { path: PathBuf },

    #[error("Failed to scan '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, FlightlineError>;
