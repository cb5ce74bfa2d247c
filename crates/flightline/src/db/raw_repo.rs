//! Raw-upload repository — CRUD operations for the `raw_uploads` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw pre-processing upload (e.g. a zip of flight imagery).
#[derive(Debug, Clone)]
pub struct RawUploadRow {
    pub id: String,
    pub project_id: String,
    pub flight_id: String,
    pub filepath: String,
    pub original_filename: String,
    pub is_active: bool,
    pub deactivated_at: Option<String>,
    pub created_at: String,
}

impl RawUploadRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            flight_id: row.get("flight_id")?,
            filepath: row.get("filepath")?,
            original_filename: row.get("original_filename")?,
            is_active: row.get("is_active")?,
            deactivated_at: row.get("deactivated_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(db: &Database, raw: &RawUploadRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO raw_uploads (id, project_id, flight_id, filepath,
             original_filename, is_active, deactivated_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                raw.id,
                raw.project_id,
                raw.flight_id,
                raw.filepath,
                raw.original_filename,
                raw.is_active,
                raw.deactivated_at,
                raw.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RawUploadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM raw_uploads WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], RawUploadRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn set_filepath(db: &Database, id: &str, filepath: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE raw_uploads SET filepath = ?2 WHERE id = ?1",
            params![id, filepath],
        )?;
        Ok(())
    })
}

pub fn deactivate(db: &Database, id: &str, deactivated_at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE raw_uploads SET is_active = 0, deactivated_at = ?2 WHERE id = ?1",
            params![id, deactivated_at],
        )?;
        Ok(())
    })
}

/// Inactive raw uploads whose deactivated_at is older than the cutoff.
pub fn find_expired(db: &Database, cutoff: &str) -> Result<Vec<RawUploadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM raw_uploads
             WHERE is_active = 0 AND deactivated_at IS NOT NULL AND deactivated_at < ?1",
        )?;
        let rows: Vec<RawUploadRow> = stmt
            .query_map(params![cutoff], RawUploadRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn all_ids(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT id FROM raw_uploads")?;
        let ids: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

pub fn delete(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM raw_uploads WHERE id = ?1", params![id])?;
        Ok(())
    })
}
