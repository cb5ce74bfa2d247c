//! Ingestion Dispatcher: turns a "file is fully uploaded" signal into a
//! routed, tracked processing task.
//!
//! The dispatcher blocks only on the local file move and the ledger
//! writes; the handoff to a converter is fire-and-forget and the caller
//! gets "accepted for processing" immediately. Success or failure is
//! learned later by polling job/artifact state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::db::product_repo::{ProductRow, FILEPATH_NULL};
use crate::db::raw_repo::RawUploadRow;
use crate::db::{product_repo, raw_repo, Database};
use crate::error::{FlightlineError, ValidationError, WorkerError};
use crate::ledger::{Job, JobLink, JobOutcome, Ledger};
use crate::storage::filesystem::{ensure_dir, move_file};
use crate::storage::paths::{ArtifactKind, StorageLayout};
use crate::worker::pool::TaskSender;
use crate::worker::task::Task;

/// The only actionable hook event; everything else is acknowledged and
/// ignored.
pub const EVENT_POST_FINISH: &str = "post-finish";

pub const HEADER_DATA_TYPE: &str = "x-data-type";
pub const HEADER_PROJECT_ID: &str = "x-project-id";
pub const HEADER_FLIGHT_ID: &str = "x-flight-id";

/// Upload-completion descriptor delivered by the resumable-upload
/// server's hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub upload_id: String,
    /// On-disk staging location written by the upload server.
    pub storage_path: PathBuf,
    pub original_filename: String,
    /// Raw custom headers. A header may legitimately arrive duplicated,
    /// which is a client error for the ones we require.
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

impl UploadEvent {
    /// Returns the single value of a required header. Missing or
    /// duplicated headers are client errors.
    pub fn header(&self, name: &'static str) -> Result<&str, ValidationError> {
        let values = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .ok_or(ValidationError::MissingHeader(name))?;
        match values.as_slice() {
            [single] => Ok(single),
            [] => Err(ValidationError::MissingHeader(name)),
            _ => Err(ValidationError::DuplicatedHeader(name)),
        }
    }
}

/// Coarse classification of an upload by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Raster,
    PointCloud,
    Image,
    Archive,
}

/// Classifies a filename against the supported extension sets, returning
/// the kind and the canonical extension for the staged file.
pub fn classify_filename(filename: &str) -> Option<(FileKind, &'static str)> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".copc.laz") {
        return Some((FileKind::PointCloud, "copc.laz"));
    }
    let ext = lower.rsplit('.').next()?;
    match ext {
        "tif" => Some((FileKind::Raster, "tif")),
        "las" => Some((FileKind::PointCloud, "las")),
        "laz" => Some((FileKind::PointCloud, "laz")),
        "jpg" | "jpeg" => Some((FileKind::Image, "jpg")),
        "png" => Some((FileKind::Image, "png")),
        "webp" => Some((FileKind::Image, "webp")),
        "avif" => Some((FileKind::Image, "avif")),
        "zip" => Some((FileKind::Archive, "zip")),
        _ => None,
    }
}

/// The file kind each declared data type accepts.
fn expected_kind(data_type: &str) -> FileKind {
    match data_type {
        "point_cloud" => FileKind::PointCloud,
        "panoramic" => FileKind::Image,
        "raw" => FileKind::Archive,
        _ => FileKind::Raster,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processing accepted; poll the job for the result.
    Accepted { job_id: String, artifact_id: String },
    /// A re-delivered completion signal; the original job is returned
    /// and no second artifact is created.
    Duplicate { job_id: String },
    /// Not a post-finish event.
    Ignored,
}

pub struct Dispatcher {
    db: Database,
    ledger: Ledger,
    layout: StorageLayout,
    queue: TaskSender,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, db: Database, queue: TaskSender) -> Self {
        let ledger = Ledger::new(db.clone());
        let layout = StorageLayout::new(&config.storage_root);
        Self {
            db,
            ledger,
            layout,
            queue,
        }
    }

    /// Handles one upload-completion signal.
    pub fn handle_event(&self, event: &UploadEvent) -> Result<DispatchOutcome, FlightlineError> {
        if event.event_type != EVENT_POST_FINISH {
            log::debug!("Ignoring upload event of type '{}'", event.event_type);
            return Ok(DispatchOutcome::Ignored);
        }

        let data_type = event.header(HEADER_DATA_TYPE)?.to_string();
        let project_id = event.header(HEADER_PROJECT_ID)?.to_string();
        let flight_id = event.header(HEADER_FLIGHT_ID)?.to_string();

        let (kind, ext) = classify_filename(&event.original_filename).ok_or_else(|| {
            ValidationError::UnsupportedFormat(event.original_filename.clone())
        })?;
        if kind != expected_kind(&data_type) {
            return Err(ValidationError::UnsupportedFormat(format!(
                "'{}' is not a valid upload for data type '{}'",
                event.original_filename, data_type
            ))
            .into());
        }

        // Re-delivered signals are keyed on the upload id.
        if let Some(existing) = self.ledger.find_by_upload_id(&event.upload_id)? {
            log::info!(
                "Duplicate completion signal for upload {} (job {})",
                event.upload_id,
                existing.id
            );
            return Ok(DispatchOutcome::Duplicate {
                job_id: existing.id,
            });
        }

        let artifact_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let (link, artifact_kind, job_name) = if kind == FileKind::Archive {
            raw_repo::insert(
                &self.db,
                &RawUploadRow {
                    id: artifact_id.clone(),
                    project_id: project_id.clone(),
                    flight_id: flight_id.clone(),
                    filepath: FILEPATH_NULL.to_string(),
                    original_filename: event.original_filename.clone(),
                    is_active: true,
                    deactivated_at: None,
                    created_at: now,
                },
            )?;
            (
                JobLink::RawUpload(artifact_id.clone()),
                ArtifactKind::RawData,
                "upload-raw-data",
            )
        } else {
            product_repo::insert(
                &self.db,
                &ProductRow {
                    id: artifact_id.clone(),
                    project_id: project_id.clone(),
                    flight_id: flight_id.clone(),
                    data_type,
                    filepath: FILEPATH_NULL.to_string(),
                    original_filename: event.original_filename.clone(),
                    derived_metadata: None,
                    is_active: true,
                    deactivated_at: None,
                    created_at: now,
                },
            )?;
            (
                JobLink::DataProduct(artifact_id.clone()),
                ArtifactKind::DataProduct,
                "upload-data-product",
            )
        };

        let mut job = match self.ledger.create(job_name, link, Some(&event.upload_id)) {
            Ok(job) => job,
            Err(e) if e.is_unique_violation() => {
                // Lost a race with a concurrent duplicate delivery. Drop
                // the artifact shell we just created and defer to the
                // winner.
                self.delete_artifact_row(&artifact_id, artifact_kind);
                let existing = self
                    .ledger
                    .find_by_upload_id(&event.upload_id)?
                    .map(|j| j.id)
                    .unwrap_or_default();
                return Ok(DispatchOutcome::Duplicate { job_id: existing });
            }
            Err(e) => return Err(e.into()),
        };

        // Move the staged file under a fresh opaque id, never the
        // client-supplied filename.
        let dir = self
            .layout
            .artifact_dir(&project_id, &flight_id, artifact_kind, &artifact_id);
        ensure_dir(&dir)?;
        let staged_path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), ext));
        if let Err(e) = move_file(&event.storage_path, &staged_path) {
            let _ = self.ledger.complete(
                &mut job,
                JobOutcome::Failed,
                Some(json!({ "error": e.to_string() })),
            );
            return Err(e.into());
        }

        let task = match artifact_kind {
            ArtifactKind::RawData => Task::UploadRawData {
                job_id: job.id.clone(),
                raw_upload_id: artifact_id.clone(),
                staged_path,
            },
            ArtifactKind::DataProduct => Task::UploadDataProduct {
                job_id: job.id.clone(),
                product_id: artifact_id.clone(),
                staged_path,
            },
        };
        self.enqueue(&mut job, task)?;

        log::info!(
            "Accepted upload {} as artifact {} (job {})",
            event.upload_id,
            artifact_id,
            job.id
        );
        Ok(DispatchOutcome::Accepted {
            job_id: job.id.clone(),
            artifact_id,
        })
    }

    /// Creates a toolbox product shell and queues the processing task for
    /// an already-materialized source product.
    pub fn request_toolbox(
        &self,
        operation: &str,
        source_product_id: &str,
        params: serde_json::Value,
    ) -> Result<DispatchOutcome, FlightlineError> {
        let source = product_repo::find_by_id(&self.db, source_product_id)?.ok_or_else(|| {
            WorkerError::ArtifactNotFound {
                artifact_id: source_product_id.to_string(),
            }
        })?;
        if !source.is_materialized() {
            return Err(ValidationError::InvalidParameter {
                operation: "toolbox",
                name: "source_product",
                reason: format!("product {} is still processing", source.id),
            }
            .into());
        }

        let artifact_id = uuid::Uuid::new_v4().to_string();
        product_repo::insert(
            &self.db,
            &ProductRow {
                id: artifact_id.clone(),
                project_id: source.project_id.clone(),
                flight_id: source.flight_id.clone(),
                data_type: operation.to_string(),
                filepath: FILEPATH_NULL.to_string(),
                original_filename: source.original_filename.clone(),
                derived_metadata: None,
                is_active: true,
                deactivated_at: None,
                created_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            },
        )?;

        let mut job = self.ledger.create(
            &format!("{}-process", operation),
            JobLink::DataProduct(artifact_id.clone()),
            None,
        )?;

        let task = Task::ToolboxProcess {
            job_id: job.id.clone(),
            product_id: artifact_id.clone(),
            operation: operation.to_string(),
            source_path: PathBuf::from(&source.filepath),
            params,
        };
        self.enqueue(&mut job, task)?;

        Ok(DispatchOutcome::Accepted {
            job_id: job.id.clone(),
            artifact_id,
        })
    }

    /// Queues a maintenance sweep (or dry run) as a tracked job.
    pub fn request_sweep(&self, check_only: bool) -> Result<DispatchOutcome, FlightlineError> {
        let mut job = self.ledger.create("retention-sweep", JobLink::None, None)?;
        let task = Task::RetentionSweep {
            job_id: job.id.clone(),
            check_only,
        };
        self.enqueue(&mut job, task)?;
        Ok(DispatchOutcome::Accepted {
            job_id: job.id.clone(),
            artifact_id: String::new(),
        })
    }

    /// Queues a disk-usage calculation as a tracked job.
    pub fn request_disk_usage(&self) -> Result<DispatchOutcome, FlightlineError> {
        let mut job = self.ledger.create("calculate-disk-usage", JobLink::None, None)?;
        let task = Task::CalculateDiskUsage {
            job_id: job.id.clone(),
        };
        self.enqueue(&mut job, task)?;
        Ok(DispatchOutcome::Accepted {
            job_id: job.id.clone(),
            artifact_id: String::new(),
        })
    }

    fn enqueue(&self, job: &mut Job, task: Task) -> Result<(), FlightlineError> {
        if let Err(e) = self.queue.submit(task) {
            let _ = self.ledger.complete(
                job,
                JobOutcome::Failed,
                Some(json!({ "error": e.to_string() })),
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn delete_artifact_row(&self, artifact_id: &str, kind: ArtifactKind) {
        let result = match kind {
            ArtifactKind::DataProduct => product_repo::delete(&self.db, artifact_id),
            ArtifactKind::RawData => raw_repo::delete(&self.db, artifact_id),
        };
        if let Err(e) = result {
            log::error!("Failed to drop artifact shell {}: {}", artifact_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(filename: &str, data_type: &str) -> UploadEvent {
        let mut headers = HashMap::new();
        headers.insert(HEADER_DATA_TYPE.to_string(), vec![data_type.to_string()]);
        headers.insert(HEADER_PROJECT_ID.to_string(), vec!["proj".to_string()]);
        headers.insert(HEADER_FLIGHT_ID.to_string(), vec!["flight".to_string()]);
        UploadEvent {
            event_type: EVENT_POST_FINISH.to_string(),
            upload_id: "upload-1".to_string(),
            storage_path: PathBuf::from("/tmp/staging/upload-1.bin"),
            original_filename: filename.to_string(),
            headers,
        }
    }

    #[test]
    fn test_classify_filename() {
        assert_eq!(classify_filename("a.tif"), Some((FileKind::Raster, "tif")));
        assert_eq!(classify_filename("A.TIF"), Some((FileKind::Raster, "tif")));
        assert_eq!(
            classify_filename("cloud.las"),
            Some((FileKind::PointCloud, "las"))
        );
        assert_eq!(
            classify_filename("cloud.copc.laz"),
            Some((FileKind::PointCloud, "copc.laz"))
        );
        assert_eq!(classify_filename("pano.jpeg"), Some((FileKind::Image, "jpg")));
        assert_eq!(classify_filename("pano.webp"), Some((FileKind::Image, "webp")));
        assert_eq!(classify_filename("raw.zip"), Some((FileKind::Archive, "zip")));
        assert_eq!(classify_filename("model.obj"), None);
        assert_eq!(classify_filename("noext"), None);
    }

    #[test]
    fn test_header_extraction() {
        let e = event("a.tif", "ortho");
        assert_eq!(e.header(HEADER_DATA_TYPE).unwrap(), "ortho");
        assert_eq!(e.header(HEADER_PROJECT_ID).unwrap(), "proj");
    }

    #[test]
    fn test_header_case_insensitive_storage() {
        let mut e = event("a.tif", "ortho");
        let values = e.headers.remove(HEADER_DATA_TYPE).unwrap();
        e.headers.insert("X-DATA-TYPE".to_string(), values);
        assert_eq!(e.header(HEADER_DATA_TYPE).unwrap(), "ortho");
    }

    #[test]
    fn test_missing_header_rejected() {
        let mut e = event("a.tif", "ortho");
        e.headers.remove(HEADER_FLIGHT_ID);
        assert!(matches!(
            e.header(HEADER_FLIGHT_ID),
            Err(ValidationError::MissingHeader(HEADER_FLIGHT_ID))
        ));
    }

    #[test]
    fn test_duplicated_header_rejected() {
        let mut e = event("a.tif", "ortho");
        e.headers.insert(
            HEADER_DATA_TYPE.to_string(),
            vec!["ortho".to_string(), "dsm".to_string()],
        );
        assert!(matches!(
            e.header(HEADER_DATA_TYPE),
            Err(ValidationError::DuplicatedHeader(HEADER_DATA_TYPE))
        ));
    }
}
