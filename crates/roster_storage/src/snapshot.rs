#![forbid(unsafe_code)]

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use roster_kernel_contracts::identity::IdentityRecord;
use roster_kernel_contracts::{SchemaVersion, UnixTimeMs};

use crate::registry::StorageError;

const SNAPSHOT_SCHEMA: SchemaVersion = SchemaVersion(1);

#[derive(Serialize)]
struct SnapshotOut<'a> {
    schema_version: SchemaVersion,
    saved_at: UnixTimeMs,
    records: &'a [IdentityRecord],
}

#[derive(Deserialize)]
struct SnapshotIn {
    schema_version: SchemaVersion,
    records: Vec<IdentityRecord>,
}

/// Whole-registry JSON snapshot on local disk.
///
/// Clones share one save lock, so saves through any clone are serialized and
/// a save stamped older than the last written document is skipped.
#[derive(Debug, Clone)]
pub struct RegistrySnapshotFile {
    path: PathBuf,
    last_saved: Arc<Mutex<Option<UnixTimeMs>>>,
}

impl RegistrySnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_saved: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a uniquely named sibling temp file and renames it over the
    /// snapshot, so readers see either the previous or the new document.
    /// Returns `false` when a newer document was already written.
    pub fn save(
        &self,
        records: &[IdentityRecord],
        saved_at: UnixTimeMs,
    ) -> Result<bool, StorageError> {
        let mut last_saved = self
            .last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last_saved.is_some_and(|last| saved_at < last) {
            return Ok(false);
        }
        let doc = SnapshotOut {
            schema_version: SNAPSHOT_SCHEMA,
            saved_at,
            records,
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StorageError::persistence(format!("snapshot encode: {e}")))?;
        let dir = self.dir();
        let mut tmp = tempfile::Builder::new()
            .prefix(".roster_snapshot")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| {
                StorageError::persistence(format!("snapshot temp file in {}: {e}", dir.display()))
            })?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| {
                StorageError::persistence(format!("snapshot write {}: {e}", tmp.path().display()))
            })?;
        tmp.persist(&self.path).map_err(|e| {
            StorageError::persistence(format!("snapshot rename {}: {e}", self.path.display()))
        })?;
        *last_saved = Some(saved_at);
        Ok(true)
    }

    /// A missing file is an empty registry.
    pub fn load(&self) -> Result<Vec<IdentityRecord>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::persistence(format!(
                    "snapshot read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let doc: SnapshotIn = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::persistence(format!("snapshot decode: {e}")))?;
        if doc.schema_version != SNAPSHOT_SCHEMA {
            return Err(StorageError::persistence(format!(
                "snapshot schema {} not supported",
                doc.schema_version.0
            )));
        }
        Ok(doc.records)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}
