//! Atomic file persistence for scenario documents.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::document::Document;
use crate::error::NarratorError;

/// Temp file next to the target so the rename stays on one filesystem.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scenario.json".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

pub(crate) fn encode(doc: &Document) -> Result<Vec<u8>, NarratorError> {
    let mut bytes = serde_json::to_vec_pretty(doc)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write `bytes` to `path` as one atomic replace: temp file, fsync, rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), NarratorError> {
    let tmp = temp_path(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(NarratorError::persistence(path, e.to_string()));
    }
    Ok(())
}

/// What [`load`] found on disk.
#[derive(Debug)]
pub(crate) enum Loaded {
    Missing,
    Parsed(Document),
    /// The file did not parse and was moved to the returned path.
    Quarantined(PathBuf),
}

pub(crate) async fn load(path: &Path) -> Result<Loaded, NarratorError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(NarratorError::persistence(path, e.to_string())),
    };
    match serde_json::from_slice::<Document>(&bytes) {
        Ok(doc) => Ok(Loaded::Parsed(doc)),
        Err(parse_err) => {
            let aside = path.with_extension("corrupt");
            tracing::warn!(
                path = %path.display(),
                error = %parse_err,
                moved_to = %aside.display(),
                "scenario file is unreadable; starting from baseline"
            );
            tokio::fs::rename(path, &aside)
                .await
                .map_err(|e| NarratorError::persistence(path, e.to_string()))?;
            Ok(Loaded::Quarantined(aside))
        }
    }
}

/// Lowercase hex SHA-256.
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
