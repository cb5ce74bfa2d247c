//! Task execution: routes one task to the correct converter or toolbox
//! operation and records the terminal outcome in the ledger.
//!
//! Every failure is caught and converted into COMPLETED/FAILED — an
//! exception escaping the worker loop would leave the job stuck in
//! STARTED/INPROGRESS and invisible until the retention sweep.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::info_span;

use crate::config::Config;
use crate::db::product_repo::ProductRow;
use crate::db::{product_repo, raw_repo, Database};
use crate::error::{FlightlineError, WorkerError};
use crate::ledger::{JobOutcome, Ledger};
use crate::pointcloud::PointCloudConverter;
use crate::raster::RasterConverter;
use crate::storage::filesystem::{dir_size, remove_dir_if_exists};
use crate::storage::paths::{ArtifactKind, StorageLayout};
use crate::sweep::RetentionSweeper;
use crate::toolbox::Toolbox;
use crate::tools::ToolRunner;
use crate::worker::task::Task;

pub struct Executor {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    tools: Arc<dyn ToolRunner>,
    layout: StorageLayout,
}

impl Executor {
    pub fn new(config: Arc<Config>, db: Database, tools: Arc<dyn ToolRunner>) -> Self {
        let ledger = Ledger::new(db.clone());
        let layout = StorageLayout::new(&config.storage_root);
        Self {
            config,
            db,
            ledger,
            tools,
            layout,
        }
    }

    /// Runs one task to completion. Never propagates an error.
    pub fn execute(&self, task: &Task) {
        let _span = info_span!("task", op = %task.job_name(), job_id = %task.job_id()).entered();

        let mut job = match self.ledger.find(task.job_id()) {
            Ok(Some(job)) => job,
            Ok(None) => {
                log::error!("Dropping task for unknown job {}", task.job_id());
                return;
            }
            Err(e) => {
                log::error!("Failed to load job {}: {}", task.job_id(), e);
                return;
            }
        };

        if let Err(e) = self.ledger.start(&mut job) {
            log::error!("Failed to start job {}: {}", job.id, e);
            return;
        }

        match self.run_task(task) {
            Ok(extra) => {
                if let Err(e) = self.ledger.complete(&mut job, JobOutcome::Success, extra) {
                    log::error!("Failed to complete job {}: {}", job.id, e);
                }
            }
            Err(e) => {
                log::warn!("Job {} ({}) failed: {}", job.id, job.name, e);
                let extra = json!({ "error": e.to_string() });
                if let Err(e) = self.ledger.complete(&mut job, JobOutcome::Failed, Some(extra)) {
                    log::error!("Failed to record failure of job {}: {}", job.id, e);
                }
            }
        }
    }

    fn run_task(&self, task: &Task) -> Result<Option<serde_json::Value>, FlightlineError> {
        match task {
            Task::UploadDataProduct {
                product_id,
                staged_path,
                ..
            } => {
                let product = self.load_product(product_id)?;
                match product.data_type.as_str() {
                    "point_cloud" => self.process_point_cloud(&product, staged_path),
                    "panoramic" => self.process_image(&product, staged_path),
                    _ => self.process_raster(&product, staged_path),
                }
            }
            Task::UploadRawData {
                raw_upload_id,
                staged_path,
                ..
            } => self.process_raw(raw_upload_id, staged_path),
            Task::ToolboxProcess {
                product_id,
                operation,
                source_path,
                params,
                ..
            } => self.process_toolbox(product_id, operation, source_path, params),
            Task::RetentionSweep { check_only, .. } => {
                let sweeper = RetentionSweeper::new(Arc::clone(&self.config), self.db.clone());
                let report = sweeper.sweep(*check_only)?;
                Ok(Some(serde_json::to_value(report).unwrap_or_default()))
            }
            Task::CalculateDiskUsage { .. } => self.calculate_disk_usage(),
        }
    }

    fn load_product(&self, product_id: &str) -> Result<ProductRow, FlightlineError> {
        product_repo::find_by_id(&self.db, product_id)?
            .ok_or_else(|| {
                WorkerError::ArtifactNotFound {
                    artifact_id: product_id.to_string(),
                }
                .into()
            })
    }

    fn process_raster(
        &self,
        product: &ProductRow,
        staged_path: &Path,
    ) -> Result<Option<serde_json::Value>, FlightlineError> {
        let converter = RasterConverter::new(Arc::clone(&self.tools), Arc::clone(&self.config));
        match converter.convert(staged_path) {
            Ok(conversion) => {
                let metadata = serde_json::to_string(&conversion.metadata).map_err(|e| {
                    crate::error::RasterError::Write {
                        path: staged_path.to_path_buf(),
                        reason: e.to_string(),
                    }
                })?;
                product_repo::set_materialized(
                    &self.db,
                    &product.id,
                    &conversion.out_path.to_string_lossy(),
                    Some(metadata.as_str()),
                )?;
                Ok(None)
            }
            Err(e) => {
                // No partial outputs: the staging directory goes with it.
                if let Some(dir) = staged_path.parent() {
                    let _ = remove_dir_if_exists(dir);
                }
                Err(e.into())
            }
        }
    }

    fn process_point_cloud(
        &self,
        product: &ProductRow,
        staged_path: &Path,
    ) -> Result<Option<serde_json::Value>, FlightlineError> {
        let converter = PointCloudConverter::new(Arc::clone(&self.tools), Arc::clone(&self.config));
        // On failure the converter removed its partial outputs and left a
        // sentinel marker; the directory stays.
        let conversion = converter.convert(staged_path)?;
        let metadata = json!({ "point_cloud": { "count": conversion.point_count } }).to_string();
        product_repo::set_materialized(
            &self.db,
            &product.id,
            &conversion.out_path.to_string_lossy(),
            Some(metadata.as_str()),
        )?;
        Ok(None)
    }

    fn process_image(
        &self,
        product: &ProductRow,
        staged_path: &Path,
    ) -> Result<Option<serde_json::Value>, FlightlineError> {
        // Panoramic imagery is stored as-is; only the dimensions are
        // probed, and formats we cannot decode (e.g. AVIF) skip that.
        let metadata = image::image_dimensions(staged_path)
            .ok()
            .map(|(width, height)| json!({ "image": { "width": width, "height": height } }));
        product_repo::set_materialized(
            &self.db,
            &product.id,
            &staged_path.to_string_lossy(),
            metadata.map(|m| m.to_string()).as_deref(),
        )?;
        Ok(None)
    }

    fn process_raw(
        &self,
        raw_upload_id: &str,
        staged_path: &Path,
    ) -> Result<Option<serde_json::Value>, FlightlineError> {
        if raw_repo::find_by_id(&self.db, raw_upload_id)?.is_none() {
            return Err(WorkerError::ArtifactNotFound {
                artifact_id: raw_upload_id.to_string(),
            }
            .into());
        }
        raw_repo::set_filepath(&self.db, raw_upload_id, &staged_path.to_string_lossy())?;
        Ok(None)
    }

    fn process_toolbox(
        &self,
        product_id: &str,
        operation: &str,
        source_path: &Path,
        params: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, FlightlineError> {
        let product = self.load_product(product_id)?;
        let dir = self.layout.artifact_dir(
            &product.project_id,
            &product.flight_id,
            ArtifactKind::DataProduct,
            &product.id,
        );
        crate::storage::filesystem::ensure_dir(&dir)?;
        let out_raster = dir.join(format!("{}.tif", uuid::Uuid::new_v4()));

        let toolbox = Toolbox::new(Arc::clone(&self.tools), Arc::clone(&self.config));
        match toolbox.run(operation, source_path, &out_raster, params) {
            Ok(conversion) => {
                let metadata = serde_json::to_string(&conversion.metadata).unwrap_or_default();
                product_repo::set_materialized(
                    &self.db,
                    &product.id,
                    &conversion.out_path.to_string_lossy(),
                    Some(metadata.as_str()),
                )?;
                Ok(None)
            }
            Err(e) => {
                let _ = remove_dir_if_exists(&dir);
                Err(e)
            }
        }
    }

    fn calculate_disk_usage(&self) -> Result<Option<serde_json::Value>, FlightlineError> {
        let projects_dir = self.layout.projects_dir();
        let mut projects = serde_json::Map::new();
        let mut total: u64 = 0;

        if projects_dir.exists() {
            for entry in std::fs::read_dir(&projects_dir)
                .map_err(|e| crate::error::StorageError::ReadDirectory {
                    path: projects_dir.clone(),
                    source: e,
                })?
                .flatten()
            {
                if entry.path().is_dir() {
                    let bytes = dir_size(&entry.path());
                    total += bytes;
                    projects.insert(
                        entry.file_name().to_string_lossy().to_string(),
                        json!(bytes),
                    );
                }
            }
        }

        Ok(Some(json!({
            "total_bytes": total,
            "projects": projects,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::product_repo::{ProductRow, FILEPATH_NULL};
    use crate::ledger::{JobLink, JobState, JobStatus};
    use crate::pointcloud::FAILED_MARKER;
    use crate::raster::dataset::{write_gray_f32_pixels, write_rgb8_pixels};
    use crate::storage::filesystem::ensure_dir;
    use crate::tools::fake::FakeToolRunner;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        executor: Executor,
        db: Database,
        ledger: Ledger,
        layout: StorageLayout,
        fake: Arc<FakeToolRunner>,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(Config::with_storage_root(tmp.path()));
        let db = Database::open_in_memory().unwrap();
        let fake = Arc::new(FakeToolRunner::new());
        let tools: Arc<dyn ToolRunner> = fake.clone();
        let executor = Executor::new(Arc::clone(&config), db.clone(), tools);
        let ledger = Ledger::new(db.clone());
        let layout = StorageLayout::new(&config.storage_root);
        Harness {
            _tmp: tmp,
            executor,
            db,
            ledger,
            layout,
            fake,
        }
    }

    fn insert_pending_product(h: &Harness, id: &str, data_type: &str) -> ProductRow {
        let row = ProductRow {
            id: id.to_string(),
            project_id: "proj".to_string(),
            flight_id: "flight".to_string(),
            data_type: data_type.to_string(),
            filepath: FILEPATH_NULL.to_string(),
            original_filename: "upload.bin".to_string(),
            derived_metadata: None,
            is_active: true,
            deactivated_at: None,
            created_at: Utc::now().to_rfc3339(),
        };
        product_repo::insert(&h.db, &row).unwrap();
        row
    }

    fn stage_artifact_dir(h: &Harness, product_id: &str) -> std::path::PathBuf {
        let dir = h
            .layout
            .artifact_dir("proj", "flight", ArtifactKind::DataProduct, product_id);
        ensure_dir(&dir).unwrap();
        dir
    }

    #[test]
    fn test_upload_ortho_success_scenario() {
        let h = harness();
        insert_pending_product(&h, "p1", "ortho");
        let dir = stage_artifact_dir(&h, "p1");
        let staged = dir.join("abc.tif");
        // 3-band RGB ortho.
        let mut pixels = Vec::new();
        for i in 0..16u32 {
            pixels.extend([(i * 10) as u8, 100, 200]);
        }
        write_rgb8_pixels(&staged, 4, 4, &pixels).unwrap();

        let job = h
            .ledger
            .create("upload-data-product", JobLink::DataProduct("p1".into()), None)
            .unwrap();

        h.executor.execute(&Task::UploadDataProduct {
            job_id: job.id.clone(),
            product_id: "p1".into(),
            staged_path: staged.clone(),
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.status, JobStatus::Success);
        assert!(done.end_time.is_some());

        let product = product_repo::find_by_id(&h.db, "p1").unwrap().unwrap();
        assert!(product.is_materialized());
        let metadata: serde_json::Value =
            serde_json::from_str(product.derived_metadata.as_deref().unwrap()).unwrap();
        assert_eq!(metadata["eo"].as_array().unwrap().len(), 3);
        // Preview rendered beside the COG.
        assert!(dir.join("abc.jpg").exists());
    }

    #[test]
    fn test_raster_failure_marks_job_failed_and_removes_dir() {
        let h = harness();
        insert_pending_product(&h, "p2", "dsm");
        let dir = stage_artifact_dir(&h, "p2");
        let staged = dir.join("bad.tif");
        write_gray_f32_pixels(&staged, 2, 2, &[1.0; 4]).unwrap();

        h.fake.fail_tool("convert_to_cog");

        let job = h
            .ledger
            .create("upload-data-product", JobLink::DataProduct("p2".into()), None)
            .unwrap();

        h.executor.execute(&Task::UploadDataProduct {
            job_id: job.id.clone(),
            product_id: "p2".into(),
            staged_path: staged,
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.extra.unwrap()["error"].as_str().unwrap().contains("convert_to_cog"));

        // Staging directory deleted, filepath still the null sentinel.
        assert!(!dir.exists());
        let product = product_repo::find_by_id(&h.db, "p2").unwrap().unwrap();
        assert!(!product.is_materialized());
    }

    #[test]
    fn test_point_cloud_missing_crs_fails_without_preview() {
        let h = harness();
        insert_pending_product(&h, "pc1", "point_cloud");
        let dir = stage_artifact_dir(&h, "pc1");
        let staged = dir.join("cloud.las");
        let points: Vec<_> = (0..10).map(|i| (i as f64, 0.0, 0.0, [0u16; 3])).collect();
        std::fs::write(
            &staged,
            crate::pointcloud::las::testutil::build_las(&points, false),
        )
        .unwrap();

        let job = h
            .ledger
            .create("upload-data-product", JobLink::DataProduct("pc1".into()), None)
            .unwrap();

        h.executor.execute(&Task::UploadDataProduct {
            job_id: job.id.clone(),
            product_id: "pc1".into(),
            staged_path: staged,
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(!dir.join("cloud.png").exists());
        assert!(dir.join(FAILED_MARKER).exists());
    }

    #[test]
    fn test_point_cloud_success_records_count() {
        let h = harness();
        insert_pending_product(&h, "pc2", "point_cloud");
        let dir = stage_artifact_dir(&h, "pc2");
        let staged = dir.join("cloud.las");
        let points: Vec<_> = (0..25)
            .map(|i| (i as f64, i as f64 * 2.0, i as f64 * 0.5, [100u16, 200, 300]))
            .collect();
        std::fs::write(
            &staged,
            crate::pointcloud::las::testutil::build_las(&points, true),
        )
        .unwrap();

        let job = h
            .ledger
            .create("upload-data-product", JobLink::DataProduct("pc2".into()), None)
            .unwrap();

        h.executor.execute(&Task::UploadDataProduct {
            job_id: job.id.clone(),
            product_id: "pc2".into(),
            staged_path: staged,
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Success);

        let product = product_repo::find_by_id(&h.db, "pc2").unwrap().unwrap();
        assert!(product.filepath.ends_with("cloud.copc.laz"));
        let metadata: serde_json::Value =
            serde_json::from_str(product.derived_metadata.as_deref().unwrap()).unwrap();
        assert_eq!(metadata["point_cloud"]["count"], 25);
        assert!(dir.join("cloud.png").exists());
    }

    #[test]
    fn test_toolbox_task_produces_derived_product() {
        let h = harness();

        // Source ortho, already converted.
        insert_pending_product(&h, "src", "ortho");
        let src_dir = stage_artifact_dir(&h, "src");
        let src_path = src_dir.join("ortho.tif");
        let mut pixels = Vec::new();
        for _ in 0..16 {
            pixels.extend([100u8, 0, 200]);
        }
        write_rgb8_pixels(&src_path, 4, 4, &pixels).unwrap();

        // Output product shell.
        insert_pending_product(&h, "out", "ndvi");

        let job = h
            .ledger
            .create("ndvi-process", JobLink::DataProduct("out".into()), None)
            .unwrap();

        h.executor.execute(&Task::ToolboxProcess {
            job_id: job.id.clone(),
            product_id: "out".into(),
            operation: "ndvi".into(),
            source_path: src_path,
            params: serde_json::json!({"red_band": 1, "nir_band": 3}),
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Success, "extra: {:?}", done.extra);

        let product = product_repo::find_by_id(&h.db, "out").unwrap().unwrap();
        assert!(product.is_materialized());
        let metadata: serde_json::Value =
            serde_json::from_str(product.derived_metadata.as_deref().unwrap()).unwrap();
        assert_eq!(metadata["raster"].as_array().unwrap().len(), 1);
        assert_eq!(metadata["symbology"]["mode"], "ramp");
    }

    #[test]
    fn test_toolbox_validation_failure_is_terminal() {
        let h = harness();
        insert_pending_product(&h, "src2", "ortho");
        let src_dir = stage_artifact_dir(&h, "src2");
        let src_path = src_dir.join("ortho.tif");
        let mut pixels = Vec::new();
        for _ in 0..4 {
            pixels.extend([1u8, 2, 3]);
        }
        write_rgb8_pixels(&src_path, 2, 2, &pixels).unwrap();

        insert_pending_product(&h, "out2", "ndvi");
        let job = h
            .ledger
            .create("ndvi-process", JobLink::DataProduct("out2".into()), None)
            .unwrap();

        h.executor.execute(&Task::ToolboxProcess {
            job_id: job.id.clone(),
            product_id: "out2".into(),
            operation: "ndvi".into(),
            source_path: src_path,
            params: serde_json::json!({"red_band": 1}), // nir_band missing
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.extra.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("nir_band"));
    }

    #[test]
    fn test_retention_sweep_task_records_report() {
        let h = harness();
        let job = h.ledger.create("retention-sweep", JobLink::None, None).unwrap();

        h.executor.execute(&Task::RetentionSweep {
            job_id: job.id.clone(),
            check_only: true,
        });

        let done = h.ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Success);
        let extra = done.extra.unwrap();
        assert_eq!(extra["check_only"], true);
        assert_eq!(extra["bytes_reclaimed"], 0);
    }

    #[test]
    fn test_unknown_job_is_dropped() {
        let h = harness();
        // Must not panic or create rows.
        h.executor.execute(&Task::CalculateDiskUsage {
            job_id: "missing".into(),
        });
        assert!(h.ledger.find("missing").unwrap().is_none());
    }
}
