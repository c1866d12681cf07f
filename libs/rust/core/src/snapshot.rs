//! On-disk parameter snapshots.
//!
//! A snapshot is a JSON document holding the tensors in model order plus a SHA-256
//! checksum that is verified on load. Writes are atomic: the document goes to a sibling
//! temp file which is fsynced and renamed over the target.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FlError, Result};
use crate::parameters::ParameterSet;

pub const SNAPSHOT_FORMAT: &str = "fedround-snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
    pub checksum: String,
    pub tensors: ParameterSet,
}

impl Snapshot {
    pub fn new(tensors: ParameterSet, round: Option<u64>) -> Self {
        Self {
            format: SNAPSHOT_FORMAT.into(),
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            round,
            checksum: tensors.digest(),
            tensors,
        }
    }

    fn verify(&self) -> Result<()> {
        if self.format != SNAPSHOT_FORMAT {
            return Err(FlError::Snapshot(format!("unknown snapshot format {:?}", self.format)));
        }
        if self.version != SNAPSHOT_VERSION {
            return Err(FlError::Snapshot(format!("unsupported snapshot version {}", self.version)));
        }
        let actual = self.tensors.digest();
        if actual != self.checksum {
            return Err(FlError::Snapshot(format!("checksum mismatch: recorded {}, computed {actual}", self.checksum)));
        }
        Ok(())
    }
}

pub fn save(path: &Path, parameters: &ParameterSet, round: Option<u64>) -> Result<()> {
    let snapshot = Snapshot::new(parameters.clone(), round);
    let bytes = serde_json::to_vec(&snapshot)?;
    write_atomic(path, &bytes)?;
    info!(path = %path.display(), tensors = parameters.len(), checksum = %snapshot.checksum, "snapshot_written");
    Ok(())
}

pub fn load(path: &Path) -> Result<Snapshot> {
    let bytes = fs::read(path).map_err(|e| FlError::Snapshot(format!("cannot read {}: {e}", path.display())))?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)
        .map_err(|e| FlError::Snapshot(format!("cannot decode {}: {e}", path.display())))?;
    snapshot.verify()?;
    debug!(path = %path.display(), tensors = snapshot.tensors.len(), "snapshot_loaded");
    Ok(snapshot)
}

fn temp_path(path: &Path) -> PathBuf {
    let file = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_else(|| "snapshot".into());
    path.with_file_name(format!(".{file}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    // persist the rename itself; not every platform lets a directory be opened
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{Tensor, TensorData};

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fedround-snapshot-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample() -> ParameterSet {
        ParameterSet::new(vec![
            Tensor::new("conv.weight", vec![2, 1, 3], TensorData::F32(vec![0.5, -1.25, 3.0e-8, f32::NAN, 7.0, -0.0])).unwrap(),
            Tensor::new("conv.bias", vec![2], TensorData::F64(vec![1.0 / 3.0, f64::MAX])).unwrap(),
        ])
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let dir = scratch_dir();
        let path = dir.join("model.json");
        let params = sample();
        save(&path, &params, Some(4)).unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded.tensors.bit_eq(&params));
        assert_eq!(loaded.tensors.layout(), params.layout());
        assert_eq!(loaded.round, Some(4));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let dir = scratch_dir();
        let path = dir.join("nested").join("model.json");
        save(&path, &sample(), None).unwrap();
        save(&path, &sample(), Some(1)).unwrap();
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("model.json")]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let dir = scratch_dir();
        let path = dir.join("model.json");
        save(&path, &sample(), None).unwrap();
        let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        doc["tensors"][0]["name"] = serde_json::json!("renamed");
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(load(&path), Err(FlError::Snapshot(msg)) if msg.contains("checksum")));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_file_is_a_snapshot_error() {
        let err = load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, FlError::Snapshot(_)));
    }
}
