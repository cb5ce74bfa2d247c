//! The unit placed on the queue: an operation name plus its arguments.
//!
//! Tasks are serde-serializable so the queue boundary stays independent
//! of any particular queue technology.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Task {
    UploadDataProduct {
        job_id: String,
        product_id: String,
        staged_path: PathBuf,
    },
    UploadRawData {
        job_id: String,
        raw_upload_id: String,
        staged_path: PathBuf,
    },
    ToolboxProcess {
        job_id: String,
        product_id: String,
        operation: String,
        source_path: PathBuf,
        params: serde_json::Value,
    },
    RetentionSweep {
        job_id: String,
        check_only: bool,
    },
    CalculateDiskUsage {
        job_id: String,
    },
}

impl Task {
    /// The ledger job this task executes.
    pub fn job_id(&self) -> &str {
        match self {
            Task::UploadDataProduct { job_id, .. }
            | Task::UploadRawData { job_id, .. }
            | Task::ToolboxProcess { job_id, .. }
            | Task::RetentionSweep { job_id, .. }
            | Task::CalculateDiskUsage { job_id } => job_id,
        }
    }

    /// Operation identifier recorded as the job name.
    pub fn job_name(&self) -> String {
        match self {
            Task::UploadDataProduct { .. } => "upload-data-product".to_string(),
            Task::UploadRawData { .. } => "upload-raw-data".to_string(),
            Task::ToolboxProcess { operation, .. } => format!("{}-process", operation),
            Task::RetentionSweep { .. } => "retention-sweep".to_string(),
            Task::CalculateDiskUsage { .. } => "calculate-disk-usage".to_string(),
        }
    }
}
