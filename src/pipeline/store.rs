//! Per-run directory holding one JSON record per stage.
//!
//! Layout under `<output>/<run_id>/`:
//! - `stage<N>_<name>.json` for every stage that ran
//! - `stage2_generate.py`, the generated script as received
//! - `sandbox/`, the execution work directory
//! - `report.html`
//!
//! Records are written to a temporary file and renamed into place, so a
//! reader never sees a half-written record.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use super::stage::{StageKind, StageRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// New run id: UTC timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}

/// Durable storage for one run.
#[derive(Debug, Clone)]
pub struct StageStore {
    run_id: String,
    run_dir: PathBuf,
}

impl StageStore {
    /// Create `<output_root>/<run_id>/`.
    pub async fn create(output_root: &Path, run_id: impl Into<String>) -> Result<Self, StoreError> {
        let run_id = run_id.into();
        let run_dir = output_root.join(&run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(io_err(&run_dir))?;
        Ok(Self { run_id, run_dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn record_path(&self, stage: StageKind) -> PathBuf {
        self.run_dir.join(format!("{}.json", stage.file_stem()))
    }

    pub fn script_path(&self) -> PathBuf {
        self.run_dir
            .join(format!("{}.py", StageKind::Generate.file_stem()))
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.run_dir.join("sandbox")
    }

    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join("report.html")
    }

    /// Persist a stage record, replacing any earlier record for that stage.
    pub async fn write_record(&self, record: &StageRecord) -> Result<PathBuf, StoreError> {
        let path = self.record_path(record.stage);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &json).await?;
        tracing::debug!(
            run_id = %self.run_id,
            stage = %record.stage,
            status = %record.status,
            path = %path.display(),
            "Persisted stage record"
        );
        Ok(path)
    }

    /// Persist the generated script byte-for-byte.
    pub async fn write_script(&self, code: &str) -> Result<PathBuf, StoreError> {
        let path = self.script_path();
        write_atomic(&path, code.as_bytes()).await?;
        Ok(path)
    }

    pub async fn read_record(&self, stage: StageKind) -> Result<StageRecord, StoreError> {
        let path = self.record_path(stage);
        let bytes = tokio::fs::read(&path).await.map_err(io_err(&path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every record on disk, in stage order.
    pub async fn records(&self) -> Result<Vec<StageRecord>, StoreError> {
        let mut records = Vec::new();
        for stage in StageKind::ALL {
            if tokio::fs::try_exists(self.record_path(stage))
                .await
                .unwrap_or(false)
            {
                records.push(self.read_record(stage).await?);
            }
        }
        Ok(records)
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await.map_err(io_err(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{StageError, StageErrorKind, StageResult, StageStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        let (stamp, suffix) = id.split_once('-').unwrap();
        assert_eq!(stamp.len(), 16);
        assert!(stamp.ends_with('Z'));
        assert_eq!(suffix.len(), 8);
        assert_ne!(id, new_run_id());
    }

    #[tokio::test]
    async fn test_write_and_read_records() {
        let root = tempdir().unwrap();
        let store = StageStore::create(root.path(), "run-1").await.unwrap();
        assert_eq!(store.run_dir(), root.path().join("run-1"));

        let ok = StageResult::Success(serde_json::json!({"rows": 3}));
        let record = StageRecord::from_result(StageKind::Profile, &ok, Utc::now());
        let path = store.write_record(&record).await.unwrap();
        assert!(path.ends_with("stage0_profile.json"));
        assert!(!path.with_extension("tmp").exists());

        let failed: StageResult<serde_json::Value> =
            StageResult::Failure(StageError::new(StageErrorKind::FatalProviderError, "401"));
        let record = StageRecord::from_result(StageKind::Plan, &failed, Utc::now());
        store.write_record(&record).await.unwrap();

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, StageStatus::Success);
        assert_eq!(records[0].payload, Some(serde_json::json!({"rows": 3})));
        assert_eq!(records[1].stage, StageKind::Plan);
        assert_eq!(records[1].status, StageStatus::Failure);
    }

    #[tokio::test]
    async fn test_script_written_verbatim() {
        let root = tempdir().unwrap();
        let store = StageStore::create(root.path(), "run-2").await.unwrap();
        let code = "print('ünïcode')\r\n# trailing\n";
        let path = store.write_script(code).await.unwrap();
        assert!(path.ends_with("stage2_generate.py"));
        assert_eq!(std::fs::read(&path).unwrap(), code.as_bytes());
    }
}
