//! Data-product repository — CRUD operations for the `data_products` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// Sentinel meaning "not yet materialized on disk" (the processing job is
/// still running). API consumers must never resolve this as a path.
pub const FILEPATH_NULL: &str = "null";

/// A raw data-product row from the database.
#[derive(Debug, Clone)]
pub struct ProductRow {
    pub id: String,
    pub project_id: String,
    pub flight_id: String,
    pub data_type: String,
    pub filepath: String,
    pub original_filename: String,
    pub derived_metadata: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<String>,
    pub created_at: String,
}

impl ProductRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            flight_id: row.get("flight_id")?,
            data_type: row.get("data_type")?,
            filepath: row.get("filepath")?,
            original_filename: row.get("original_filename")?,
            derived_metadata: row.get("derived_metadata")?,
            is_active: row.get("is_active")?,
            deactivated_at: row.get("deactivated_at")?,
            created_at: row.get("created_at")?,
        })
    }

    /// True once the processing job has produced the on-disk file.
    pub fn is_materialized(&self) -> bool {
        self.filepath != FILEPATH_NULL
    }
}

pub fn insert(db: &Database, product: &ProductRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO data_products (id, project_id, flight_id, data_type, filepath,
             original_filename, derived_metadata, is_active, deactivated_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                product.id,
                product.project_id,
                product.flight_id,
                product.data_type,
                product.filepath,
                product.original_filename,
                product.derived_metadata,
                product.is_active,
                product.deactivated_at,
                product.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ProductRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM data_products WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], ProductRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Records the materialized filepath and derived metadata after a
/// successful conversion. Point-cloud and image products may carry no
/// raster metadata.
pub fn set_materialized(
    db: &Database,
    id: &str,
    filepath: &str,
    derived_metadata: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE data_products SET filepath = ?2, derived_metadata = ?3 WHERE id = ?1",
            params![id, filepath, derived_metadata],
        )?;
        Ok(())
    })
}

/// Soft-deletes a product; the retention sweeper removes it physically
/// after the grace period.
pub fn deactivate(db: &Database, id: &str, deactivated_at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE data_products SET is_active = 0, deactivated_at = ?2 WHERE id = ?1",
            params![id, deactivated_at],
        )?;
        Ok(())
    })
}

/// Inactive products whose deactivated_at is older than the cutoff.
pub fn find_expired(db: &Database, cutoff: &str) -> Result<Vec<ProductRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM data_products
             WHERE is_active = 0 AND deactivated_at IS NOT NULL AND deactivated_at < ?1",
        )?;
        let rows: Vec<ProductRow> = stmt
            .query_map(params![cutoff], ProductRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// All product ids, for orphan-directory detection.
pub fn all_ids(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT id FROM data_products")?;
        let ids: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

pub fn delete(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM data_products WHERE id = ?1", params![id])?;
        Ok(())
    })
}
