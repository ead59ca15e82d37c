//! JSON snapshots on local disk
//!
//! Each snapshot is written to a temp file, fsynced, then renamed over the
//! previous one, so a crash mid-write leaves the last complete snapshot.

use common::SourceHealth;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::StorageResult;
use crate::types::HistorySnapshot;

const HISTORY_FILE: &str = "history.json";
const HEALTH_FILE: &str = "source_health.json";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Use `dir` for snapshots, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_history(&self, snapshot: &HistorySnapshot) -> StorageResult<()> {
        self.write_atomic(HISTORY_FILE, snapshot)
    }

    /// `None` when no snapshot has been written yet
    pub fn load_history(&self) -> StorageResult<Option<HistorySnapshot>> {
        self.read(HISTORY_FILE)
    }

    pub fn save_health(&self, health: &[SourceHealth]) -> StorageResult<()> {
        self.write_atomic(HEALTH_FILE, &health)
    }

    pub fn load_health(&self) -> StorageResult<Option<Vec<SourceHealth>>> {
        self.read(HEALTH_FILE)
    }

    fn write_atomic<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> StorageResult<()> {
        let path = self.dir.join(name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        let body = serde_json::to_vec_pretty(value)?;

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        debug!(path = %path.display(), bytes = body.len(), "Snapshot written");
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> StorageResult<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read(&path)?;
        let value = serde_json::from_slice(&body)?;
        info!(path = %path.display(), "Snapshot restored");
        Ok(Some(value))
    }
}
