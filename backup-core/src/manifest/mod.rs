//! Integrity Manifest Service.
//!
//! `integrity.json` at the root of every backup directory lists a SHA-256
//! digest per file plus `backup_hash`, one digest streamed over the bytes of
//! every listed file in sorted relative-path order. The listed files are
//! authoritative: unlisted extras are ignored, while a missing or altered
//! listed file fails verification.

use crate::chain::record::BackupType;
use crate::fs::walker::{is_safe_relative, walk_files, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "integrity.json";

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub backup_id: String,
    pub creation_date: DateTime<Utc>,
    pub backup_type: BackupType,
    #[serde(rename = "backup_hash")]
    pub overall_hash: String,
    #[serde(rename = "files")]
    pub file_hashes: BTreeMap<String, String>,
}

/// Hash every file under `backup_dir` (except the manifest) and write the manifest.
pub fn generate(
    backup_dir: &Path,
    backup_id: &str,
    backup_type: BackupType,
    creation_date: DateTime<Utc>,
) -> Result<IntegrityManifest> {
    let files = walk_files(backup_dir, &WalkOptions::default())?;
    let keys: Vec<String> = files
        .into_iter()
        .map(|f| f.relative_path)
        .filter(|k| k != MANIFEST_FILE)
        .collect();

    let (overall_hash, file_hashes) = digest_files(backup_dir, &keys, backup_id)?;
    let manifest = IntegrityManifest {
        backup_id: backup_id.to_string(),
        creation_date,
        backup_type,
        overall_hash,
        file_hashes,
    };

    std::fs::write(
        backup_dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    info!(backup_id, files = manifest.file_hashes.len(), hash = %manifest.overall_hash, "Generated integrity manifest");
    Ok(manifest)
}

pub fn read(backup_dir: &Path) -> Result<IntegrityManifest> {
    let path = backup_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| {
        BackupError::integrity(&backup_dir.display().to_string(), format!("cannot read {}: {}", MANIFEST_FILE, e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        BackupError::integrity(&backup_dir.display().to_string(), format!("malformed {}: {}", MANIFEST_FILE, e))
    })
}

/// Recompute every listed digest. Any mismatch is an [`BackupError::Integrity`].
pub fn verify(backup_dir: &Path) -> Result<IntegrityManifest> {
    let manifest = read(backup_dir)?;
    let id = manifest.backup_id.as_str();

    for key in manifest.file_hashes.keys() {
        if !is_safe_relative(key) || key == MANIFEST_FILE {
            return Err(BackupError::integrity(id, format!("invalid listed path '{}'", key)));
        }
        if !backup_dir.join(key).is_file() {
            return Err(BackupError::integrity(id, format!("missing file '{}'", key)));
        }
    }

    let keys: Vec<String> = manifest.file_hashes.keys().cloned().collect();
    let (overall, actual) = digest_files(backup_dir, &keys, id)?;

    for (key, expected) in &manifest.file_hashes {
        if actual.get(key) != Some(expected) {
            warn!(backup_id = id, file = %key, "Digest mismatch");
            return Err(BackupError::integrity(id, format!("digest mismatch for '{}'", key)));
        }
    }
    if overall != manifest.overall_hash {
        return Err(BackupError::integrity(id, "backup_hash mismatch"));
    }

    info!(backup_id = id, files = keys.len(), "Integrity manifest verified");
    Ok(manifest)
}

/// Per-file digests plus the combined digest, reading each file once.
/// `keys` must already be sorted.
fn digest_files(
    root: &Path,
    keys: &[String],
    backup_id: &str,
) -> Result<(String, BTreeMap<String, String>)> {
    let mut overall = Sha256::new();
    let mut per_file = BTreeMap::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    for key in keys {
        let mut file = File::open(root.join(key))
            .map_err(|e| BackupError::integrity(backup_id, format!("cannot open '{}': {}", key, e)))?;
        let mut hasher = Sha256::new();
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            overall.update(&buffer[..read]);
        }
        per_file.insert(key.clone(), format!("{:x}", hasher.finalize()));
    }

    Ok((format!("{:x}", overall.finalize()), per_file))
}
