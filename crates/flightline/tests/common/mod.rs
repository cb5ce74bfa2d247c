//! Shared harness for the end-to-end tests: an in-memory database, a
//! worker pool wired to the fake tool runner, and small file builders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use flightline::config::Config;
use flightline::db::Database;
use flightline::dispatch::{
    Dispatcher, UploadEvent, EVENT_POST_FINISH, HEADER_DATA_TYPE, HEADER_FLIGHT_ID,
    HEADER_PROJECT_ID,
};
use flightline::ledger::Ledger;
use flightline::tools::fake::FakeToolRunner;
use flightline::worker::{Executor, WorkerPool};

pub struct Harness {
    pub tmp: TempDir,
    pub config: Arc<Config>,
    pub db: Database,
    pub ledger: Ledger,
    pub fake: Arc<FakeToolRunner>,
    pool: Option<WorkerPool>,
    dispatcher: Option<Dispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_storage_root(tmp.path().join("storage"));
        config.is_test_mode = true;
        let config = Arc::new(config);

        let db = Database::open_in_memory().unwrap();
        let fake = Arc::new(FakeToolRunner::new());
        let tools: Arc<dyn flightline::ToolRunner> = fake.clone();
        let executor = Arc::new(Executor::new(Arc::clone(&config), db.clone(), tools));
        let pool = WorkerPool::new(executor, 2);
        let dispatcher = Dispatcher::new(Arc::clone(&config), db.clone(), pool.sender());
        let ledger = Ledger::new(db.clone());

        Self {
            tmp,
            config,
            db,
            ledger,
            fake,
            pool: Some(pool),
            dispatcher: Some(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.dispatcher.as_ref().expect("harness already drained")
    }

    /// Staging area the fake upload server writes into.
    pub fn staging_dir(&self) -> PathBuf {
        let dir = self.tmp.path().join("staging");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Drops all task senders, drains the queue, and joins the workers.
    pub fn drain(&mut self) {
        self.dispatcher.take();
        if let Some(pool) = self.pool.take() {
            pool.wait();
        }
    }
}

pub fn upload_event(
    upload_id: &str,
    staged: &Path,
    original_filename: &str,
    data_type: &str,
) -> UploadEvent {
    let mut headers = HashMap::new();
    headers.insert(HEADER_DATA_TYPE.to_string(), vec![data_type.to_string()]);
    headers.insert(HEADER_PROJECT_ID.to_string(), vec!["project-1".to_string()]);
    headers.insert(HEADER_FLIGHT_ID.to_string(), vec!["flight-1".to_string()]);
    UploadEvent {
        event_type: EVENT_POST_FINISH.to_string(),
        upload_id: upload_id.to_string(),
        storage_path: staged.to_path_buf(),
        original_filename: original_filename.to_string(),
        headers,
    }
}

/// Builds a minimal format-2 (XYZ + RGB) LAS 1.2 file.
pub fn build_las(points: &[(f64, f64, f64, [u16; 3])], with_crs: bool) -> Vec<u8> {
    const HEADER_LEN: usize = 227;
    let record_length: u16 = 26;

    let vlr: Vec<u8> = if with_crs {
        let mut v = vec![0u8; 54];
        v[2..18].copy_from_slice(b"LASF_Projection\0");
        v[18..20].copy_from_slice(&34735u16.to_le_bytes());
        v[20..22].copy_from_slice(&0u16.to_le_bytes());
        v
    } else {
        Vec::new()
    };

    let offset_to_points = (HEADER_LEN + vlr.len()) as u32;
    let mut header = vec![0u8; HEADER_LEN];
    header[0..4].copy_from_slice(b"LASF");
    header[24] = 1;
    header[25] = 2;
    header[94..96].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
    header[96..100].copy_from_slice(&offset_to_points.to_le_bytes());
    header[100..104].copy_from_slice(&(if with_crs { 1u32 } else { 0 }).to_le_bytes());
    header[104] = 2;
    header[105..107].copy_from_slice(&record_length.to_le_bytes());
    header[107..111].copy_from_slice(&(points.len() as u32).to_le_bytes());
    for (i, scale) in [(131usize, 0.001f64), (139, 0.001), (147, 0.001)] {
        header[i..i + 8].copy_from_slice(&scale.to_le_bytes());
    }

    let mut body = Vec::new();
    for &(x, y, z, rgb) in points {
        let mut rec = vec![0u8; record_length as usize];
        rec[0..4].copy_from_slice(&((x / 0.001) as i32).to_le_bytes());
        rec[4..8].copy_from_slice(&((y / 0.001) as i32).to_le_bytes());
        rec[8..12].copy_from_slice(&((z / 0.001) as i32).to_le_bytes());
        rec[20..22].copy_from_slice(&rgb[0].to_le_bytes());
        rec[22..24].copy_from_slice(&rgb[1].to_le_bytes());
        rec[24..26].copy_from_slice(&rgb[2].to_le_bytes());
        body.extend(rec);
    }

    let mut out = header;
    out.extend(vlr);
    out.extend(body);
    out
}
