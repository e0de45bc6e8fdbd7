//! Durable job store: one JSON file per job.
//!
//! The directory is the source of truth and the recovery log; there is no
//! write-ahead log and no cache. Files are named
//! `<mirror_msg_id>_<tenant>_<chat>_<artifact_id>.json` so both keys are
//! recoverable from a directory listing alone. Writes go through a
//! write-temp-then-rename in the same directory, so readers never observe a
//! torn record. The store is the single writer of a job record per process;
//! per-job serialization is the scheduler's at-most-once-run guarantee.

use std::path::{Path, PathBuf};

use thiserror::Error;

use vidvault_core::job::{JobPatch, JobRecord};
use vidvault_core::util::sanitize::sanitize_filename;

/// Store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed job file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("job already exists for artifact {artifact_id} (mirror {mirror_msg_id})")]
    Duplicate {
        artifact_id: i64,
        mirror_msg_id: i64,
    },

    #[error("no job for mirror message {0}")]
    NotFound(i64),
}

/// Convenience result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Directory of per-job JSON records.
pub struct JobStore {
    dir: PathBuf,
    tenant: String,
}

impl JobStore {
    /// Open (and create) the job directory.
    pub fn open(dir: &Path, tenant: &str) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            tenant: sanitize_filename(tenant),
        })
    }

    /// Insert a new record, or update the one already stored for this job.
    ///
    /// A different job claiming the same artifact or mirror key is rejected:
    /// key uniqueness is the store's invariant, not the caller's.
    pub fn upsert(&self, record: &JobRecord) -> StoreResult<()> {
        for existing in self.scan()? {
            let same_mirror = existing.mirror_msg_id == record.mirror_msg_id;
            let same_artifact = existing.artifact_id == record.artifact_id;
            if same_mirror != same_artifact {
                return Err(StoreError::Duplicate {
                    artifact_id: record.artifact_id,
                    mirror_msg_id: record.mirror_msg_id,
                });
            }
        }
        self.write(record)
    }

    /// Read-modify-write a partial update; returns the merged record.
    pub fn merge(&self, mirror_msg_id: i64, patch: &JobPatch) -> StoreResult<JobRecord> {
        let mut record = self
            .get_by_mirror(mirror_msg_id)?
            .ok_or(StoreError::NotFound(mirror_msg_id))?;
        patch.apply(&mut record);
        self.write(&record)?;
        Ok(record)
    }

    /// Job mirrored by a given operator-chat message.
    pub fn get_by_mirror(&self, mirror_msg_id: i64) -> StoreResult<Option<JobRecord>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|r| r.mirror_msg_id == mirror_msg_id))
    }

    /// Job downloading a given remote artifact.
    pub fn get_by_artifact(&self, artifact_id: i64) -> StoreResult<Option<JobRecord>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|r| r.artifact_id == artifact_id))
    }

    /// All records, unordered.
    pub fn list_all(&self) -> StoreResult<Vec<JobRecord>> {
        self.scan()
    }

    /// Records with `completed = false`, unordered; the scheduler sorts.
    pub fn list_pending(&self) -> StoreResult<Vec<JobRecord>> {
        Ok(self.scan()?.into_iter().filter(|r| !r.completed).collect())
    }

    /// Remove a job file; `Ok(false)` when it was already gone.
    pub fn delete(&self, mirror_msg_id: i64) -> StoreResult<bool> {
        let Some(record) = self.get_by_mirror(mirror_msg_id)? else {
            return Ok(false);
        };
        let path = self.record_path(&record);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn record_path(&self, record: &JobRecord) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}_{}.json",
            record.mirror_msg_id,
            self.tenant,
            sanitize_filename(&record.source_chat),
            record.artifact_id,
        ))
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write(&self, record: &JobRecord) -> StoreResult<()> {
        let path = self.record_path(record);
        let tmp = path.with_extension("json.tmp");
        let json =
            serde_json::to_vec_pretty(record).map_err(|source| StoreError::Malformed {
                path: path.clone(),
                source,
            })?;
        std::fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        Ok(())
    }

    fn scan(&self) -> StoreResult<Vec<JobRecord>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut records = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unreadable job file");
                    continue;
                }
            };
            match serde_json::from_str::<JobRecord>(&text) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping malformed job file");
                }
            }
        }
        Ok(records)
    }
}
