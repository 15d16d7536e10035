//! Storage roots & path layout — §4.A.
//!
//! Maintains an ordered list of storage roots (primary + backups). Writes
//! pick the first writable root; reads/lookups scan roots in order and stop
//! on the first hit. Every bundle's on-disk shape is fixed (see [`get_paths`]).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PreflightError, Result};
use crate::model::Paths;

/// Build the fixed path layout for one bundle under one storage root.
///
/// ```text
/// <root>/bundles/<bundleId>/
///   manifest.json
///   START_HERE.md, AGENTS.md, OVERVIEW.md
///   indexes/search.sqlite3
///   repos/<owner>/<repo>/{raw,norm}/...
///   analysis/FACTS.json, analysis/*.json
///   deps/dependency-graph.json
///   trace/trace.sqlite3, trace/trace.json
///   cards/<safeRepoId>/CARD.json
/// ```
pub fn get_paths(root: &Path, bundle_id: &str) -> Paths {
    let bundle_dir = root.join("bundles").join(bundle_id);
    Paths {
        manifest: bundle_dir.join("manifest.json"),
        start_here: bundle_dir.join("START_HERE.md"),
        agents_md: bundle_dir.join("AGENTS.md"),
        overview_md: bundle_dir.join("OVERVIEW.md"),
        search_db: bundle_dir.join("indexes").join("search.sqlite3"),
        repos_dir: bundle_dir.join("repos"),
        analysis_dir: bundle_dir.join("analysis"),
        analysis_facts: bundle_dir.join("analysis").join("FACTS.json"),
        deps_cache: bundle_dir.join("deps").join("dependency-graph.json"),
        trace_db: bundle_dir.join("trace").join("trace.sqlite3"),
        trace_json: bundle_dir.join("trace").join("trace.json"),
        cards_dir: bundle_dir.join("cards"),
        bundle_dir,
    }
}

/// Linear scan of storage roots, stopping at the first root that already
/// has a `bundles/<bundleId>` directory.
pub fn find_bundle(storage_dirs: &[PathBuf], bundle_id: &str) -> Option<PathBuf> {
    storage_dirs.iter().find(|root| root.join("bundles").join(bundle_id).is_dir()).cloned()
}

/// Every bundle id visible across the configured storage roots, de-duplicated
/// and sorted for a stable listing order.
pub fn list_bundles(storage_dirs: &[PathBuf]) -> Vec<String> {
    let mut ids: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for root in storage_dirs {
        let bundles_dir = root.join("bundles");
        let Ok(entries) = std::fs::read_dir(&bundles_dir) else { continue };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.insert(name.to_string());
                }
            }
        }
    }
    ids.into_iter().collect()
}

fn is_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".write-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// First writable root in the configured order; the one that receives new writes.
pub fn effective_write_root(storage_dirs: &[PathBuf]) -> Result<PathBuf> {
    for root in storage_dirs {
        if is_writable(root) {
            return Ok(root.clone());
        }
        warn!(root = %root.display(), "storage root not writable, trying next");
    }
    Err(PreflightError::StorageUnavailable { tried: storage_dirs.to_vec() })
}

/// Best-effort copy of a bundle directory to backup roots. Failures are
/// logged, never fatal — mirroring is not part of the primary operation's
/// success/failure contract.
pub fn mirror(primary_root: &Path, backup_roots: &[PathBuf], bundle_id: &str) {
    let src = primary_root.join("bundles").join(bundle_id);
    if !src.is_dir() {
        return;
    }
    for backup in backup_roots {
        if backup == primary_root {
            continue;
        }
        let dst = backup.join("bundles").join(bundle_id);
        if let Err(e) = copy_dir_recursive(&src, &dst) {
            warn!(backup = %backup.display(), bundle_id, error = %e, "mirror to backup root failed (non-fatal)");
        } else {
            debug!(backup = %backup.display(), bundle_id, "mirrored bundle to backup root");
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_paths_is_fixed_layout() {
        let root = PathBuf::from("/tmp/preflight-root");
        let paths = get_paths(&root, "abc-123");
        assert_eq!(paths.manifest, root.join("bundles/abc-123/manifest.json"));
        assert_eq!(paths.search_db, root.join("bundles/abc-123/indexes/search.sqlite3"));
        assert_eq!(paths.trace_db, root.join("bundles/abc-123/trace/trace.sqlite3"));
    }

    #[test]
    fn list_bundles_is_sorted_and_deduped_across_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let root_a = tmp.path().join("a");
        let root_b = tmp.path().join("b");
        std::fs::create_dir_all(root_a.join("bundles").join("b-id")).unwrap();
        std::fs::create_dir_all(root_a.join("bundles").join("a-id")).unwrap();
        std::fs::create_dir_all(root_b.join("bundles").join("a-id")).unwrap();

        let ids = list_bundles(&[root_a, root_b]);
        assert_eq!(ids, vec!["a-id".to_string(), "b-id".to_string()]);
    }

    #[test]
    fn find_bundle_stops_at_first_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let root_a = tmp.path().join("a");
        let root_b = tmp.path().join("b");
        std::fs::create_dir_all(root_b.join("bundles").join("xyz")).unwrap();
        std::fs::create_dir_all(&root_a).unwrap();

        let found = find_bundle(&[root_a.clone(), root_b.clone()], "xyz");
        assert_eq!(found, Some(root_b));

        let missing = find_bundle(&[root_a], "nope");
        assert_eq!(missing, None);
    }

    #[test]
    fn mirror_copies_files_best_effort() {
        let tmp = tempfile::tempdir().unwrap();
        let primary = tmp.path().join("primary");
        let backup = tmp.path().join("backup");
        let bundle_dir = primary.join("bundles").join("id1");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("manifest.json"), b"{}").unwrap();

        mirror(&primary, &[backup.clone()], "id1");

        assert!(backup.join("bundles/id1/manifest.json").is_file());
    }
}
