//! Dedup ledger & in-progress lock — §4.E.
//!
//! Two files live under the storage root: `dedup.json` (fingerprint ->
//! completed bundle id) and `locks/<fingerprint>.json` (one lock file per
//! fingerprint currently being built). Both are read-modify-written via the
//! same temp-file + rename pattern as [`crate::manifest`], so a concurrent
//! reader never observes a torn write.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PreflightError, Result};
use crate::model::{DedupEntry, DedupStatus, InProgressLock, LockPhase};

fn dedup_path(root: &Path) -> PathBuf {
    root.join("dedup.json")
}

fn lock_path(root: &Path, fingerprint: &str) -> PathBuf {
    root.join("locks").join(format!("{fingerprint}.json"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| PreflightError::OperationFailed { message: "path has no parent".to_string(), source: None })?;
    fs::create_dir_all(parent).map_err(|e| PreflightError::OperationFailed { message: format!("failed to create directory: {e}"), source: Some(Box::new(e)) })?;
    let tmp = parent.join(format!(".{}.tmp-{}", path.file_name().unwrap_or_default().to_string_lossy(), std::process::id()));
    fs::write(&tmp, bytes).map_err(|e| PreflightError::OperationFailed { message: format!("failed to write temp file: {e}"), source: Some(Box::new(e)) })?;
    fs::rename(&tmp, path).map_err(|e| PreflightError::OperationFailed { message: format!("failed to publish file: {e}"), source: Some(Box::new(e)) })
}

fn load_dedup_map(root: &Path) -> BTreeMap<String, DedupEntry> {
    let path = dedup_path(root);
    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => BTreeMap::new(),
    }
}

/// Look up a fingerprint in the dedup ledger. Returns `None` if there is no
/// entry, if the entry isn't `complete`, or if its bundle directory no
/// longer exists (e.g. after a `delete()` that raced a stale ledger entry).
pub fn find_existing(root: &Path, fingerprint: &str) -> Option<DedupEntry> {
    let entry = load_dedup_map(root).get(fingerprint).cloned()?;
    if entry.status == DedupStatus::Complete && !root.join("bundles").join(&entry.bundle_id).is_dir() {
        return None;
    }
    Some(entry)
}

/// Remove a fingerprint's entry from the dedup ledger entirely. Used by
/// `delete()` so a deleted bundle's fingerprint doesn't keep resolving to a
/// bundle id whose directory no longer exists.
pub fn remove_entry_for_bundle(root: &Path, bundle_id: &str) -> Result<()> {
    let mut map = load_dedup_map(root);
    let before = map.len();
    map.retain(|_, entry| entry.bundle_id != bundle_id);
    if map.len() == before {
        return Ok(());
    }
    let json = serde_json::to_vec_pretty(&map).map_err(|e| PreflightError::OperationFailed { message: format!("failed to serialize dedup ledger: {e}"), source: Some(Box::new(e)) })?;
    write_atomic(&dedup_path(root), &json)?;
    debug!(bundle_id, "dedup ledger entry removed");
    Ok(())
}

/// Mark a fingerprint complete in the dedup ledger, pointing at its bundle id.
pub fn mark_complete(root: &Path, fingerprint: &str, bundle_id: &str, created_at: &str) -> Result<()> {
    let mut map = load_dedup_map(root);
    map.insert(fingerprint.to_string(), DedupEntry { bundle_id: bundle_id.to_string(), status: DedupStatus::Complete, created_at: created_at.to_string() });
    let json = serde_json::to_vec_pretty(&map).map_err(|e| PreflightError::OperationFailed { message: format!("failed to serialize dedup ledger: {e}"), source: Some(Box::new(e)) })?;
    write_atomic(&dedup_path(root), &json)?;
    debug!(fingerprint, bundle_id, "dedup ledger marked complete");
    Ok(())
}

/// Acquire the in-progress lock for a fingerprint. Fails with
/// [`PreflightError::BundleInProgress`] if one is already held.
pub fn set_lock(root: &Path, fingerprint: &str, task_id: &str, started_at: &str, repos: Vec<String>) -> Result<()> {
    if let Some(existing) = check_lock(root, fingerprint) {
        return Err(PreflightError::BundleInProgress {
            task_id: existing.task_id,
            started_at: existing.started_at,
            repos: existing.repos,
            fingerprint: fingerprint.to_string(),
        });
    }
    let lock = InProgressLock {
        bundle_id: String::new(),
        fingerprint: fingerprint.to_string(),
        task_id: task_id.to_string(),
        status: LockPhase::Starting,
        started_at: started_at.to_string(),
        repos,
    };
    let json = serde_json::to_vec_pretty(&lock).map_err(|e| PreflightError::OperationFailed { message: format!("failed to serialize lock: {e}"), source: Some(Box::new(e)) })?;
    write_atomic(&lock_path(root, fingerprint), &json)?;
    debug!(fingerprint, task_id, "in-progress lock set");
    Ok(())
}

/// Advance the lock's phase in place (e.g. `Cloning` -> `Ingesting`).
pub fn advance_lock(root: &Path, fingerprint: &str, phase: LockPhase) -> Result<()> {
    let mut lock = check_lock(root, fingerprint)
        .ok_or_else(|| PreflightError::OperationFailed { message: format!("no lock held for fingerprint {fingerprint}"), source: None })?;
    lock.status = phase;
    let json = serde_json::to_vec_pretty(&lock).map_err(|e| PreflightError::OperationFailed { message: format!("failed to serialize lock: {e}"), source: Some(Box::new(e)) })?;
    write_atomic(&lock_path(root, fingerprint), &json)
}

/// Read the current lock for a fingerprint, if any is held.
pub fn check_lock(root: &Path, fingerprint: &str) -> Option<InProgressLock> {
    let bytes = fs::read(lock_path(root, fingerprint)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Release the in-progress lock, whether the build succeeded or failed.
pub fn clear_lock(root: &Path, fingerprint: &str) {
    let path = lock_path(root, fingerprint);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(fingerprint, error = %e, "failed to clear in-progress lock");
        }
    } else {
        debug!(fingerprint, "in-progress lock cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fingerprint_has_no_dedup_entry() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_existing(tmp.path(), "nope").is_none());
    }

    #[test]
    fn mark_complete_then_find_existing_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("bundles").join("bundle-1")).unwrap();
        mark_complete(tmp.path(), "fp1", "bundle-1", "2026-01-01T00:00:00Z").unwrap();

        let entry = find_existing(tmp.path(), "fp1").unwrap();
        assert_eq!(entry.bundle_id, "bundle-1");
        assert_eq!(entry.status, DedupStatus::Complete);
    }

    #[test]
    fn find_existing_returns_none_when_bundle_dir_missing() {
        let tmp = tempfile::tempdir().unwrap();
        mark_complete(tmp.path(), "fp1", "bundle-1", "2026-01-01T00:00:00Z").unwrap();

        // No `bundles/bundle-1` directory was ever created on disk.
        assert!(find_existing(tmp.path(), "fp1").is_none());
    }

    #[test]
    fn remove_entry_for_bundle_evicts_stale_entry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("bundles").join("bundle-1")).unwrap();
        mark_complete(tmp.path(), "fp1", "bundle-1", "2026-01-01T00:00:00Z").unwrap();
        assert!(find_existing(tmp.path(), "fp1").is_some());

        std::fs::remove_dir_all(tmp.path().join("bundles").join("bundle-1")).unwrap();
        remove_entry_for_bundle(tmp.path(), "bundle-1").unwrap();

        assert!(load_dedup_map(tmp.path()).is_empty());
    }

    #[test]
    fn second_lock_attempt_fails_with_bundle_in_progress() {
        let tmp = tempfile::tempdir().unwrap();
        set_lock(tmp.path(), "fp1", "task-1", "2026-01-01T00:00:00Z", vec!["o/r".to_string()]).unwrap();

        let err = set_lock(tmp.path(), "fp1", "task-2", "2026-01-01T00:00:01Z", vec![]).unwrap_err();
        assert_eq!(err.code(), "BUNDLE_IN_PROGRESS");
    }

    #[test]
    fn clear_then_relock_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        set_lock(tmp.path(), "fp1", "task-1", "2026-01-01T00:00:00Z", vec![]).unwrap();
        clear_lock(tmp.path(), "fp1");
        set_lock(tmp.path(), "fp1", "task-2", "2026-01-01T00:00:01Z", vec![]).unwrap();
        assert_eq!(check_lock(tmp.path(), "fp1").unwrap().task_id, "task-2");
    }

    #[test]
    fn advance_lock_updates_phase() {
        let tmp = tempfile::tempdir().unwrap();
        set_lock(tmp.path(), "fp1", "task-1", "2026-01-01T00:00:00Z", vec![]).unwrap();
        advance_lock(tmp.path(), "fp1", LockPhase::Indexing).unwrap();
        assert_eq!(check_lock(tmp.path(), "fp1").unwrap().status, LockPhase::Indexing);
    }
}
