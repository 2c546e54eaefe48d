use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::contracts::{PipelineError, PipelineResult};
use crate::data_models::BatchId;

/// # NDOC
/// component: `archive`
/// purpose: Mirrors every batch's raw payload into the blob archive under a
///          batch-scoped prefix, plus credential disaster-recovery copies and
///          login-debug screenshots.
/// invariants:
///   - Payload path is deterministic: `{source}/batch_{batch_id}/data.json`.
///   - Overwrite is permitted; re-runs replace.
///   - Archive failures are non-fatal to the pipeline (callers alarm at
///     `warning` and continue).
#[derive(Debug, Clone)]
pub struct BlobArchive {
    bucket_name: String,
    root: PathBuf,
}

impl BlobArchive {
    pub fn new(bucket_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            root: root.into(),
        }
    }

    /// Stores one batch's raw payload; returns the bucket URI of the object.
    pub fn put(&self, source: &str, batch_id: &BatchId, payload: &Value) -> PipelineResult<String> {
        let blob_path = Self::payload_path(source, batch_id);
        self.put_json(&blob_path, payload)
    }

    /// Stores an arbitrary JSON document under an explicit blob path.
    pub fn put_json(&self, blob_path: &str, payload: &Value) -> PipelineResult<String> {
        let target = self.root.join(blob_path);
        ensure_parent_dir(&target)?;
        let body = serde_json::to_string_pretty(payload)
            .map_err(|err| PipelineError::internal(format!("payload not serializable: {err}")))?;
        fs::write(&target, body).map_err(|err| {
            PipelineError::storage(format!("failed to write blob {blob_path}: {err}"))
        })?;
        let uri = self.uri(blob_path);
        log::info!("archived blob to {}", uri);
        Ok(uri)
    }

    /// Stores raw bytes (video assets, debug screenshots).
    pub fn put_bytes(&self, blob_path: &str, bytes: &[u8]) -> PipelineResult<String> {
        let target = self.root.join(blob_path);
        ensure_parent_dir(&target)?;
        fs::write(&target, bytes).map_err(|err| {
            PipelineError::storage(format!("failed to write blob {blob_path}: {err}"))
        })?;
        Ok(self.uri(blob_path))
    }

    /// Reads a JSON blob back, if present.
    pub fn get_json(&self, blob_path: &str) -> PipelineResult<Option<Value>> {
        let target = self.root.join(blob_path);
        if !target.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&target).map_err(|err| {
            PipelineError::storage(format!("failed to read blob {blob_path}: {err}"))
        })?;
        let value = serde_json::from_str(&raw).map_err(|err| {
            PipelineError::invalid(format!("blob {blob_path} is not valid JSON: {err}"))
        })?;
        Ok(Some(value))
    }

    pub fn payload_path(source: &str, batch_id: &BatchId) -> String {
        format!("{source}/batch_{batch_id}/data.json")
    }

    pub fn video_path(source: &str, batch_id: &BatchId, material_id: &str) -> String {
        format!("{source}/batch_{batch_id}/video/{material_id}.mp4")
    }

    pub fn credential_mirror_path(provider: &str, file_name: &str) -> String {
        format!("{provider}/credentials/{file_name}")
    }

    pub fn screenshot_path(source: &str, name: &str) -> String {
        format!("{source}/screenshots/{name}")
    }

    fn uri(&self, blob_path: &str) -> String {
        format!("gs://{}/{}", self.bucket_name, blob_path)
    }
}

fn ensure_parent_dir(path: &Path) -> PipelineResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|err| {
        PipelineError::storage(format!("failed to create archive directory: {err}"))
    })
}
