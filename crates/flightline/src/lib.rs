pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod pointcloud;
pub mod raster;
pub mod storage;
pub mod sweep;
pub mod toolbox;
pub mod tools;
pub mod worker;

pub use config::{load_config, Config};
pub use dispatch::{DispatchOutcome, Dispatcher, UploadEvent};
pub use error::{
    ConfigError, FlightlineError, PointCloudError, RasterError, Result, StorageError, SweepError,
    ToolError, ValidationError, WorkerError,
};
pub use ledger::{Job, JobLink, JobOutcome, JobState, JobStatus, Ledger};
pub use sweep::{RetentionSweeper, SweepReport};
pub use tools::{CommandToolRunner, PipelineSpec, RasterInfo, ToolRunner};
pub use worker::{Executor, Task, TaskSender, WorkerPool};
