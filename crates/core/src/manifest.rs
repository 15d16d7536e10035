//! Manifest read/write — the persistence half of §4.D.
//!
//! Manifests are plain JSON written atomically: serialize to a temp file in
//! the same directory, then rename over the destination. A reader never
//! observes a partially-written `manifest.json`.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{PreflightError, Result};
use crate::model::{Bundle, MAX_SKIPPED_FILES_IN_MANIFEST};

/// Read and parse a bundle's manifest.
pub fn load(manifest_path: &Path) -> Result<Bundle> {
    let bytes = fs::read(manifest_path).map_err(|_| PreflightError::BundleNotFound {
        id: manifest_path.display().to_string(),
        hint: "manifest.json missing at expected bundle path".to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        warn!(error = %e, path = %manifest_path.display(), "manifest failed to parse");
        PreflightError::IndexCorrupt { path: manifest_path.to_path_buf() }
    })
}

/// Write a manifest atomically: temp file + rename, truncating the
/// `skipped_files` list to [`MAX_SKIPPED_FILES_IN_MANIFEST`] entries first.
pub fn save(manifest_path: &Path, bundle: &Bundle) -> Result<()> {
    let mut bundle = bundle.clone();
    if let Some(skipped) = &mut bundle.skipped_files {
        if skipped.len() > MAX_SKIPPED_FILES_IN_MANIFEST {
            skipped.truncate(MAX_SKIPPED_FILES_IN_MANIFEST);
        }
    }

    let parent = manifest_path.parent().ok_or_else(|| PreflightError::OperationFailed {
        message: "manifest path has no parent directory".to_string(),
        source: None,
    })?;
    fs::create_dir_all(parent).map_err(|e| PreflightError::OperationFailed {
        message: format!("failed to create bundle directory: {e}"),
        source: Some(Box::new(e)),
    })?;

    let json = serde_json::to_vec_pretty(&bundle).map_err(|e| PreflightError::OperationFailed {
        message: format!("failed to serialize manifest: {e}"),
        source: Some(Box::new(e)),
    })?;

    let tmp_path = parent.join(format!(".manifest.json.tmp-{}", std::process::id()));
    fs::write(&tmp_path, &json).map_err(|e| PreflightError::OperationFailed {
        message: format!("failed to write temp manifest: {e}"),
        source: Some(Box::new(e)),
    })?;
    fs::rename(&tmp_path, manifest_path).map_err(|e| PreflightError::OperationFailed {
        message: format!("failed to publish manifest: {e}"),
        source: Some(Box::new(e)),
    })?;

    debug!(path = %manifest_path.display(), "manifest saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BundleInputs, SearchIndexDescriptor};

    fn sample(bundle_id: &str) -> Bundle {
        Bundle {
            schema_version: 1,
            bundle_id: bundle_id.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            fingerprint: "abc".to_string(),
            display_name: "test bundle".to_string(),
            description: None,
            tags: vec![],
            primary_language: None,
            bundle_type: None,
            inputs: BundleInputs::default(),
            repos: vec![],
            index: SearchIndexDescriptor { backend: "sqlite-fts5-lines".to_string(), include_docs: true, include_code: true },
            skipped_files: None,
        }
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bundles/abc/manifest.json");
        let bundle = sample("abc");

        save(&path, &bundle).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.bundle_id, "abc");
        assert_eq!(loaded.fingerprint, "abc");
    }

    #[test]
    fn missing_manifest_is_bundle_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bundles/missing/manifest.json");
        let err = load(&path).unwrap_err();
        assert_eq!(err.code(), "BUNDLE_NOT_FOUND");
    }

    #[test]
    fn skipped_files_are_truncated_on_save() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bundles/abc/manifest.json");
        let mut bundle = sample("abc");
        bundle.skipped_files =
            Some((0..(MAX_SKIPPED_FILES_IN_MANIFEST + 50)).map(|i| crate::model::SkippedFileEntry { path: format!("f{i}"), reason: "too large".to_string(), size: None }).collect());

        save(&path, &bundle).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.skipped_files.unwrap().len(), MAX_SKIPPED_FILES_IN_MANIFEST);
    }
}
