//! Retention Sweeper: reclaims disk space for abandoned or deactivated
//! artifacts.
//!
//! Lifecycle per entity: ACTIVE → INACTIVE (`deactivated_at`) → physically
//! removed once the grace period has passed. The contract is "remove
//! files first, then remove rows": a crash mid-sweep can leave a dangling
//! row pointing at a removed directory (re-evaluated on the next pass)
//! but never a removed row with files silently taking up space.
//!
//! Failures during one item's cleanup abort only that item; the sweep
//! continues for the rest.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::{job_repo, product_repo, raw_repo, Database};
use crate::error::SweepError;
use crate::storage::filesystem::{dir_size, remove_dir_if_exists};
use crate::storage::paths::{ArtifactKind, StorageLayout, DATA_PRODUCTS_DIR, RAW_DATA_DIR};

/// Upload job names the stale-job pass considers abandoned when stuck
/// outside COMPLETED past the grace window.
const UPLOAD_JOB_NAMES: [&str; 2] = ["upload-data-product", "upload-raw-data"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub check_only: bool,
    pub products_removed: u64,
    pub raw_uploads_removed: u64,
    pub stale_jobs_removed: u64,
    pub orphan_dirs_removed: u64,
    pub bytes_reclaimed: u64,
    pub item_errors: u64,
}

impl SweepReport {
    pub fn total_items(&self) -> u64 {
        self.products_removed + self.raw_uploads_removed + self.stale_jobs_removed
            + self.orphan_dirs_removed
    }
}

pub struct RetentionSweeper {
    config: Arc<Config>,
    db: Database,
    layout: StorageLayout,
}

impl RetentionSweeper {
    pub fn new(config: Arc<Config>, db: Database) -> Self {
        let layout = StorageLayout::new(&config.storage_root);
        Self { config, db, layout }
    }

    /// Runs all sweep passes. With `check_only` nothing is mutated; the
    /// report carries the counts and bytes that would be reclaimed.
    pub fn sweep(&self, check_only: bool) -> Result<SweepReport, SweepError> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let mut report = SweepReport {
            check_only,
            ..Default::default()
        };

        self.sweep_expired_products(&cutoff, check_only, &mut report)?;
        self.sweep_expired_raw_uploads(&cutoff, check_only, &mut report)?;
        self.sweep_stale_jobs(&cutoff, check_only, &mut report)?;
        self.sweep_orphan_dirs(check_only, &mut report)?;

        log::info!(
            "Retention sweep{}: {} items, {} bytes{}",
            if check_only { " (check only)" } else { "" },
            report.total_items(),
            report.bytes_reclaimed,
            if report.item_errors > 0 {
                format!(", {} item errors", report.item_errors)
            } else {
                String::new()
            }
        );

        Ok(report)
    }

    fn sweep_expired_products(
        &self,
        cutoff: &str,
        check_only: bool,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        for product in product_repo::find_expired(&self.db, cutoff)? {
            let dir = self.layout.artifact_dir(
                &product.project_id,
                &product.flight_id,
                ArtifactKind::DataProduct,
                &product.id,
            );
            let bytes = dir_size(&dir);

            if check_only {
                report.products_removed += 1;
                report.bytes_reclaimed += bytes;
                continue;
            }

            let result: Result<(), SweepError> = (|| {
                if !remove_dir_if_exists(&dir)? && product.is_materialized() {
                    // Row said there were files; they are already gone.
                    log::warn!(
                        "{}",
                        SweepError::ResourceMissing { path: dir.clone() }
                    );
                }
                job_repo::delete_by_product(&self.db, &product.id)?;
                product_repo::delete(&self.db, &product.id)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    report.products_removed += 1;
                    report.bytes_reclaimed += bytes;
                }
                Err(e) => {
                    log::error!("Failed to sweep product {}: {}", product.id, e);
                    report.item_errors += 1;
                }
            }
        }
        Ok(())
    }

    fn sweep_expired_raw_uploads(
        &self,
        cutoff: &str,
        check_only: bool,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        for raw in raw_repo::find_expired(&self.db, cutoff)? {
            let dir = self.layout.artifact_dir(
                &raw.project_id,
                &raw.flight_id,
                ArtifactKind::RawData,
                &raw.id,
            );
            let bytes = dir_size(&dir);

            if check_only {
                report.raw_uploads_removed += 1;
                report.bytes_reclaimed += bytes;
                continue;
            }

            let result: Result<(), SweepError> = (|| {
                remove_dir_if_exists(&dir)?;
                job_repo::delete_by_raw_upload(&self.db, &raw.id)?;
                raw_repo::delete(&self.db, &raw.id)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    report.raw_uploads_removed += 1;
                    report.bytes_reclaimed += bytes;
                }
                Err(e) => {
                    log::error!("Failed to sweep raw upload {}: {}", raw.id, e);
                    report.item_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// A job stuck outside COMPLETED past the grace window is abandoned
    /// work (the worker crashed between start and complete). Its
    /// artifact's directory (if any) is removed, then both rows.
    fn sweep_stale_jobs(
        &self,
        cutoff: &str,
        check_only: bool,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        for job in job_repo::find_stale_uploads(&self.db, &UPLOAD_JOB_NAMES, cutoff)? {
            let dir = if let Some(ref product_id) = job.data_product_id {
                product_repo::find_by_id(&self.db, product_id)?.map(|p| {
                    self.layout.artifact_dir(
                        &p.project_id,
                        &p.flight_id,
                        ArtifactKind::DataProduct,
                        &p.id,
                    )
                })
            } else if let Some(ref raw_id) = job.raw_upload_id {
                raw_repo::find_by_id(&self.db, raw_id)?.map(|r| {
                    self.layout.artifact_dir(
                        &r.project_id,
                        &r.flight_id,
                        ArtifactKind::RawData,
                        &r.id,
                    )
                })
            } else {
                None
            };
            let bytes = dir.as_ref().map(|d| dir_size(d)).unwrap_or(0);

            if check_only {
                report.stale_jobs_removed += 1;
                report.bytes_reclaimed += bytes;
                continue;
            }

            let result: Result<(), SweepError> = (|| {
                if let Some(ref dir) = dir {
                    remove_dir_if_exists(dir)?;
                }
                if let Some(ref product_id) = job.data_product_id {
                    product_repo::delete(&self.db, product_id)?;
                }
                if let Some(ref raw_id) = job.raw_upload_id {
                    raw_repo::delete(&self.db, raw_id)?;
                }
                job_repo::delete(&self.db, &job.id)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    report.stale_jobs_removed += 1;
                    report.bytes_reclaimed += bytes;
                }
                Err(e) => {
                    log::error!("Failed to sweep stale job {}: {}", job.id, e);
                    report.item_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Artifact directories on disk with no corresponding database row.
    fn sweep_orphan_dirs(
        &self,
        check_only: bool,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        let projects = self.layout.projects_dir();
        if !projects.exists() {
            return Ok(());
        }

        let known: HashSet<String> = product_repo::all_ids(&self.db)?
            .into_iter()
            .chain(raw_repo::all_ids(&self.db)?)
            .collect();

        // projects/<pid>/flights/<fid>/{data_products|raw_data}/<artifact_id>
        for entry in walkdir::WalkDir::new(&projects)
            .min_depth(5)
            .max_depth(5)
            .into_iter()
        {
            let entry = entry.map_err(|e| SweepError::ScanFailed {
                path: projects.clone(),
                source: e,
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let parent_name = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if parent_name != DATA_PRODUCTS_DIR && parent_name != RAW_DATA_DIR {
                continue;
            }
            let artifact_id = entry.file_name().to_string_lossy().to_string();
            if known.contains(&artifact_id) {
                continue;
            }

            let bytes = dir_size(entry.path());
            if check_only {
                report.orphan_dirs_removed += 1;
                report.bytes_reclaimed += bytes;
                continue;
            }

            match remove_dir_if_exists(entry.path()) {
                Ok(_) => {
                    report.orphan_dirs_removed += 1;
                    report.bytes_reclaimed += bytes;
                }
                Err(e) => {
                    log::error!("Failed to remove orphan dir {}: {}", entry.path().display(), e);
                    report.item_errors += 1;
                }
            }
        }
        Ok(())
    }
}
