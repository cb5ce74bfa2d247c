//! Job repository — CRUD operations for the `jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub name: String,
    pub state: String,
    pub status: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub extra: Option<String>,
    pub data_product_id: Option<String>,
    pub raw_upload_id: Option<String>,
    pub upload_id: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            state: row.get("state")?,
            status: row.get("status")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            extra: row.get("extra")?,
            data_product_id: row.get("data_product_id")?,
            raw_upload_id: row.get("raw_upload_id")?,
            upload_id: row.get("upload_id")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub name: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row. A UNIQUE violation on `upload_id` surfaces as a
/// constraint error the dispatcher checks with
/// [`DatabaseError::is_unique_violation`].
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, name, state, status, start_time, end_time, extra,
             data_product_id, raw_upload_id, upload_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.name,
                job.state,
                job.status,
                job.start_time,
                job.end_time,
                job.extra,
                job.data_product_id,
                job.raw_upload_id,
                job.upload_id,
            ],
        )?;
        Ok(())
    })
}

/// Updates the state-machine fields of a job. Identity and artifact links
/// never change after creation.
pub fn update_progress(
    db: &Database,
    id: &str,
    state: &str,
    status: &str,
    end_time: Option<&str>,
    extra: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET state=?2, status=?3, end_time=?4, extra=?5 WHERE id=?1",
            params![id, state, status, end_time, extra],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Finds the job created for a given upload id, if any.
pub fn find_by_upload_id(db: &Database, upload_id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE upload_id = ?1")?;
        let mut rows = stmt.query_map(params![upload_id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref name) = filter.name {
            conditions.push(format!("name = ?{}", param_values.len() + 1));
            param_values.push(Box::new(name.clone()));
        }
        if let Some(ref state) = filter.state {
            conditions.push(format!("state = ?{}", param_values.len() + 1));
            param_values.push(Box::new(state.clone()));
        }
        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY start_time DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Unfinished upload jobs whose start_time is older than the cutoff — the
/// sweeper treats these as abandoned.
pub fn find_stale_uploads(
    db: &Database,
    names: &[&str],
    cutoff: &str,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..names.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT * FROM jobs
             WHERE state != 'COMPLETED' AND start_time < ?1 AND name IN ({})",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;

        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(cutoff.to_string())];
        for name in names {
            param_values.push(Box::new(name.to_string()));
        }
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a job row. Only the retention sweeper calls this, once the
/// associated artifact is gone.
pub fn delete(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(())
    })
}

/// Deletes all jobs linked to a data product.
pub fn delete_by_product(db: &Database, product_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM jobs WHERE data_product_id = ?1",
            params![product_id],
        )?;
        Ok(())
    })
}

/// Deletes all jobs linked to a raw upload.
pub fn delete_by_raw_upload(db: &Database, raw_upload_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM jobs WHERE raw_upload_id = ?1",
            params![raw_upload_id],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            name: "upload-data-product".to_string(),
            state: "PENDING".to_string(),
            status: "WAITING".to_string(),
            start_time: "2026-01-01T00:00:00Z".to_string(),
            end_time: None,
            extra: None,
            data_product_id: Some("product-1".to_string()),
            raw_upload_id: None,
            upload_id: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.name, "upload-data-product");
        assert_eq!(found.state, "PENDING");
        assert_eq!(found.status, "WAITING");
        assert_eq!(found.data_product_id.as_deref(), Some("product-1"));
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_update_progress() {
        let db = test_db();
        insert(&db, &sample_job("job-2")).unwrap();

        update_progress(
            &db,
            "job-2",
            "COMPLETED",
            "SUCCESS",
            Some("2026-01-01T01:00:00Z"),
            Some(r#"{"batch_id":"b-7"}"#),
        )
        .unwrap();

        let found = find_by_id(&db, "job-2").unwrap().unwrap();
        assert_eq!(found.state, "COMPLETED");
        assert_eq!(found.status, "SUCCESS");
        assert!(found.end_time.is_some());
        assert!(found.extra.as_deref().unwrap().contains("b-7"));
    }

    #[test]
    fn test_find_by_upload_id() {
        let db = test_db();
        let mut job = sample_job("job-3");
        job.upload_id = Some("upload-abc".to_string());
        insert(&db, &job).unwrap();

        let found = find_by_upload_id(&db, "upload-abc").unwrap();
        assert_eq!(found.unwrap().id, "job-3");
        assert!(find_by_upload_id(&db, "upload-xyz").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_upload_id_is_unique_violation() {
        let db = test_db();
        let mut job = sample_job("job-4");
        job.upload_id = Some("upload-dup".to_string());
        insert(&db, &job).unwrap();

        let mut dup = sample_job("job-5");
        dup.upload_id = Some("upload-dup".to_string());
        let err = insert(&db, &dup).unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_query_with_filters() {
        let db = test_db();
        insert(&db, &sample_job("q1")).unwrap();

        let mut sweep = sample_job("q2");
        sweep.name = "retention-sweep".to_string();
        sweep.data_product_id = None;
        insert(&db, &sweep).unwrap();

        let (rows, total) = query(
            &db,
            &JobFilter {
                name: Some("retention-sweep".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "q2");
    }

    #[test]
    fn test_query_pagination() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.start_time = format!("2026-01-{:02}T00:00:00Z", i + 1);
            job.data_product_id = Some(format!("product-{}", i));
            insert(&db, &job).unwrap();
        }

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_find_stale_uploads() {
        let db = test_db();

        let mut stale = sample_job("stale");
        stale.state = "STARTED".to_string();
        stale.start_time = "2026-01-01T00:00:00Z".to_string();
        insert(&db, &stale).unwrap();

        let mut fresh = sample_job("fresh");
        fresh.state = "STARTED".to_string();
        fresh.start_time = "2026-03-01T00:00:00Z".to_string();
        fresh.data_product_id = Some("product-2".to_string());
        insert(&db, &fresh).unwrap();

        let mut done = sample_job("done");
        done.state = "COMPLETED".to_string();
        done.start_time = "2026-01-01T00:00:00Z".to_string();
        done.data_product_id = Some("product-3".to_string());
        insert(&db, &done).unwrap();

        let rows = find_stale_uploads(
            &db,
            &["upload-data-product", "upload-raw-data"],
            "2026-02-01T00:00:00Z",
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "stale");
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        insert(&db, &sample_job("gone")).unwrap();
        delete(&db, "gone").unwrap();
        assert!(find_by_id(&db, "gone").unwrap().is_none());
    }
}
