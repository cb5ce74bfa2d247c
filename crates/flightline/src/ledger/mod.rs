//! Job Ledger — the persistent record of one asynchronous unit of work.
//!
//! Every mutation is a separate committed statement. A crash between
//! `start` and `complete` leaves a job permanently in STARTED/INPROGRESS;
//! that is the signal the retention sweeper uses to detect stuck work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{Database, DatabaseError};

/// Lifecycle stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "STARTED" => Some(JobState::Started),
            "COMPLETED" => Some(JobState::Completed),
            _ => None,
        }
    }
}

/// Outcome within the current lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    InProgress,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::InProgress => "INPROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(JobStatus::Waiting),
            "INPROGRESS" => Some(JobStatus::InProgress),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Terminal outcome passed to [`Ledger::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed,
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success => JobStatus::Success,
            JobOutcome::Failed => JobStatus::Failed,
        }
    }
}

/// Link from a job to the artifact it produces. At most one of the two
/// artifact kinds may be referenced; maintenance jobs reference neither.
/// The job holds a back-reference only — the flight owns the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLink {
    DataProduct(String),
    RawUpload(String),
    None,
}

/// An in-memory view of one ledger entry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub state: JobState,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub extra: Option<serde_json::Value>,
    pub link: JobLink,
    pub upload_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Illegal job transition: {from} -> {to} on job {job_id}")]
    IllegalTransition {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Corrupt ledger row for job {job_id}: {reason}")]
    CorruptRow { job_id: String, reason: String },
}

impl Job {
    fn from_row(row: JobRow) -> Result<Self, LedgerError> {
        let state = JobState::parse(&row.state).ok_or_else(|| LedgerError::CorruptRow {
            job_id: row.id.clone(),
            reason: format!("unknown state '{}'", row.state),
        })?;
        let status = JobStatus::parse(&row.status).ok_or_else(|| LedgerError::CorruptRow {
            job_id: row.id.clone(),
            reason: format!("unknown status '{}'", row.status),
        })?;
        let start_time = parse_time(&row.id, &row.start_time)?;
        let end_time = match &row.end_time {
            Some(t) => Some(parse_time(&row.id, t)?),
            None => None,
        };
        let extra = match &row.extra {
            Some(raw) => {
                Some(
                    serde_json::from_str(raw).map_err(|e| LedgerError::CorruptRow {
                        job_id: row.id.clone(),
                        reason: format!("bad extra JSON: {}", e),
                    })?,
                )
            }
            None => None,
        };
        let link = match (row.data_product_id, row.raw_upload_id) {
            (Some(id), None) => JobLink::DataProduct(id),
            (None, Some(id)) => JobLink::RawUpload(id),
            (None, None) => JobLink::None,
            (Some(_), Some(_)) => {
                return Err(LedgerError::CorruptRow {
                    job_id: row.id.clone(),
                    reason: "job links both artifact kinds".to_string(),
                })
            }
        };

        Ok(Self {
            id: row.id,
            name: row.name,
            state,
            status,
            start_time,
            end_time,
            extra,
            link,
            upload_id: row.upload_id,
        })
    }
}

fn parse_time(job_id: &str, raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::CorruptRow {
            job_id: job_id.to_string(),
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// The ledger facade. Cloning is cheap (shares the database handle).
#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new job in PENDING/WAITING with `start_time = now`.
    pub fn create(
        &self,
        name: &str,
        link: JobLink,
        upload_id: Option<&str>,
    ) -> Result<Job, DatabaseError> {
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            state: JobState::Pending,
            status: JobStatus::Waiting,
            start_time: Utc::now(),
            end_time: None,
            extra: None,
            link,
            upload_id: upload_id.map(|s| s.to_string()),
        };

        let (product_id, raw_id) = match &job.link {
            JobLink::DataProduct(id) => (Some(id.clone()), None),
            JobLink::RawUpload(id) => (None, Some(id.clone())),
            JobLink::None => (None, None),
        };

        job_repo::insert(
            &self.db,
            &JobRow {
                id: job.id.clone(),
                name: job.name.clone(),
                state: job.state.as_str().to_string(),
                status: job.status.as_str().to_string(),
                start_time: format_time(job.start_time),
                end_time: None,
                extra: None,
                data_product_id: product_id,
                raw_upload_id: raw_id,
                upload_id: job.upload_id.clone(),
            },
        )?;

        log::debug!("Created job {} ({})", job.id, job.name);
        Ok(job)
    }

    /// Transitions a job to STARTED/INPROGRESS. Calling twice re-applies
    /// the same transition, so worker retries are tolerated. Starting a
    /// COMPLETED job is illegal.
    pub fn start(&self, job: &mut Job) -> Result<(), LedgerError> {
        if job.state == JobState::Completed {
            return Err(LedgerError::IllegalTransition {
                job_id: job.id.clone(),
                from: "COMPLETED",
                to: "STARTED",
            });
        }

        job.state = JobState::Started;
        job.status = JobStatus::InProgress;
        self.persist(job)?;
        Ok(())
    }

    /// Transitions a job to COMPLETED with the given outcome, sets
    /// `end_time`, and merges `extra` into the diagnostic bag.
    ///
    /// A second terminal call overwrites the status (last-writer-wins);
    /// retry paths depend on this tolerance, so it is not an error.
    pub fn complete(
        &self,
        job: &mut Job,
        outcome: JobOutcome,
        extra: Option<serde_json::Value>,
    ) -> Result<(), LedgerError> {
        job.state = JobState::Completed;
        job.status = outcome.status();
        job.end_time = Some(Utc::now());
        if let Some(new) = extra {
            job.extra = Some(merge_extra(job.extra.take(), new));
        }
        self.persist(job)?;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Option<Job>, LedgerError> {
        match job_repo::find_by_id(&self.db, id)? {
            Some(row) => Ok(Some(Job::from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn find_by_upload_id(&self, upload_id: &str) -> Result<Option<Job>, LedgerError> {
        match job_repo::find_by_upload_id(&self.db, upload_id)? {
            Some(row) => Ok(Some(Job::from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), LedgerError> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        let jobs = rows
            .into_iter()
            .map(Job::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    fn persist(&self, job: &Job) -> Result<(), LedgerError> {
        let extra = match &job.extra {
            Some(v) => Some(serde_json::to_string(v).map_err(|e| LedgerError::CorruptRow {
                job_id: job.id.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        let end_time = job.end_time.map(format_time);
        job_repo::update_progress(
            &self.db,
            &job.id,
            job.state.as_str(),
            job.status.as_str(),
            end_time.as_deref(),
            extra.as_deref(),
        )?;
        Ok(())
    }
}

/// Merges a new diagnostic bag into the existing one. Object keys from
/// the new bag win; non-object values replace wholesale.
fn merge_extra(
    existing: Option<serde_json::Value>,
    new: serde_json::Value,
) -> serde_json::Value {
    match (existing, new) {
        (Some(serde_json::Value::Object(mut old)), serde_json::Value::Object(new)) => {
            for (k, v) in new {
                old.insert(k, v);
            }
            serde_json::Value::Object(old)
        }
        (_, new) => new,
    }
}
