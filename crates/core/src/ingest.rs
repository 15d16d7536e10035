//! Ingest normalizer — §4.B.
//!
//! Walks a repo root applying gitignore-style rules plus a built-in exclude
//! list (the same `ignore::WalkBuilder` configuration the teacher's
//! `server/src/scan.rs::walk_files_parallel` uses), enforces per-file and
//! per-bundle byte budgets, LF-normalizes text, and writes both the raw and
//! normalized copies under the bundle's `repos/<id>/{raw,norm}/` trees.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::{FileKind, IngestedFile, SkippedFileEntry};
use crate::util::{normalize_line_endings, to_posix};

/// Directories always skipped during ingestion, in addition to any
/// repo-embedded ignore rules (`.gitignore`, `.ignore`).
pub fn default_skip_dirs() -> HashSet<String> {
    [".git", "node_modules", "__pycache__", "target", "dist", "build", ".next", "vendor"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

const DOC_EXTENSIONS: &[&str] = &["md", "rst", "txt", "adoc", "mdx"];

fn classify_kind(ext: &str) -> FileKind {
    if DOC_EXTENSIONS.contains(&ext) {
        FileKind::Doc
    } else {
        FileKind::Code
    }
}

/// Classify by the file's extension (leading dot-less, as stored in `IngestedFile`).
pub fn classify_kind_by_path(path: &str) -> FileKind {
    let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    classify_kind(&ext)
}

/// Recursively list files under `dir`, sorted, skipping the same directories
/// `normalize_repo` skips. Used to rebuild an index from an already-normalized
/// tree (no re-ingestion, no byte budgets — the budget was already applied).
pub fn walk_normalized_files(dir: &Path) -> Vec<PathBuf> {
    let skip_dirs = default_skip_dirs();
    let walker = WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry({
            let skip_dirs = skip_dirs.clone();
            move |entry| {
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    let name = entry.file_name().to_string_lossy();
                    return !skip_dirs.contains(name.as_ref());
                }
                true
            }
        })
        .build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

pub struct IngestBudget {
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
}

pub struct IngestOutcome {
    pub files: Vec<IngestedFile>,
    pub skipped: Vec<SkippedFileEntry>,
}

/// Normalize one repo's working tree into `<bundle_dir>/repos/<repo_id>/{raw,norm}`.
///
/// Files are discovered via a parallelism-free walk (the bundle builder
/// already parallelizes across repos), sorted by POSIX path for stable
/// ordering, and processed in that order so the greedy `max_total_bytes`
/// budget is deterministic.
pub fn normalize_repo(repo_root: &Path, bundle_repo_dir: &Path, budget: &IngestBudget) -> std::io::Result<IngestOutcome> {
    let skip_dirs = default_skip_dirs();
    let mut candidates: Vec<PathBuf> = Vec::new();

    let walker = WalkBuilder::new(repo_root)
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(false)
        .filter_entry({
            let skip_dirs = skip_dirs.clone();
            move |entry| {
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    let name = entry.file_name().to_string_lossy();
                    return !skip_dirs.contains(name.as_ref());
                }
                true
            }
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if entry.file_type().is_some_and(|ft| ft.is_file()) {
            candidates.push(entry.path().to_path_buf());
        }
    }

    let mut rel_paths: Vec<(PathBuf, String)> = candidates
        .into_iter()
        .filter_map(|abs| {
            let rel = abs.strip_prefix(repo_root).ok()?.to_string_lossy().to_string();
            Some((abs, to_posix(&rel)))
        })
        .collect();
    rel_paths.sort_by(|a, b| a.1.cmp(&b.1));

    let raw_dir = bundle_repo_dir.join("raw");
    let norm_dir = bundle_repo_dir.join("norm");

    let mut files = Vec::new();
    let mut skipped = Vec::new();
    let mut total_bytes: u64 = 0;
    let mut total_cap_reached = false;

    for (abs_path, rel_path) in rel_paths {
        if total_cap_reached {
            skipped.push(SkippedFileEntry { path: rel_path, reason: "total-cap-reached".to_string(), size: None });
            continue;
        }

        let meta = match fs::symlink_metadata(&abs_path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.is_file() {
            // Symlinks and non-regular entries are skipped silently (not indexable content).
            continue;
        }

        let size = meta.len();
        if size > budget.max_file_bytes {
            skipped.push(SkippedFileEntry { path: rel_path, reason: "too large".to_string(), size: Some(size) });
            continue;
        }
        if total_bytes + size > budget.max_total_bytes {
            skipped.push(SkippedFileEntry { path: rel_path, reason: "total-cap-reached".to_string(), size: Some(size) });
            total_cap_reached = true;
            continue;
        }

        let raw_bytes = match fs::read(&abs_path) {
            Ok(b) => b,
            Err(_) => {
                skipped.push(SkippedFileEntry { path: rel_path, reason: "unreadable".to_string(), size: Some(size) });
                continue;
            }
        };

        let text = match String::from_utf8(raw_bytes.clone()) {
            Ok(t) => t,
            Err(_) => {
                skipped.push(SkippedFileEntry { path: rel_path, reason: "unreadable utf8".to_string(), size: Some(size) });
                continue;
            }
        };

        let normalized = normalize_line_endings(&text);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let content_hash = hex::encode(hasher.finalize());

        let raw_dest = raw_dir.join(&rel_path);
        let norm_dest = norm_dir.join(&rel_path);
        if let Some(parent) = raw_dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = norm_dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&raw_dest, &raw_bytes)?;
        fs::write(&norm_dest, normalized.as_bytes())?;

        let ext = abs_path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
        let bundle_rel_path = to_posix(&norm_dest.strip_prefix(bundle_repo_dir.parent().unwrap_or(bundle_repo_dir)).unwrap_or(&norm_dest).to_string_lossy());

        total_bytes += size;
        files.push(IngestedFile {
            repo_rel_path: rel_path,
            bundle_rel_path,
            kind: classify_kind(&ext),
            content_hash,
            size_bytes: normalized.len() as u64,
        });
    }

    debug!(files = files.len(), skipped = skipped.len(), total_bytes, "ingest normalizer complete");
    Ok(IngestOutcome { files, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn ingests_and_hashes_normalized_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        write_file(&repo.join("a.rs"), b"fn main() {}\r\n");

        let bundle_repo_dir = tmp.path().join("bundle/repos/o/r");
        let budget = IngestBudget { max_file_bytes: 1_000_000, max_total_bytes: 1_000_000 };
        let outcome = normalize_repo(&repo, &bundle_repo_dir, &budget).unwrap();

        assert_eq!(outcome.files.len(), 1);
        let f = &outcome.files[0];
        assert_eq!(f.repo_rel_path, "a.rs");

        let norm_path = bundle_repo_dir.join("norm").join("a.rs");
        let bytes = fs::read(&norm_path).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(hex::encode(hasher.finalize()), f.content_hash);
        assert_eq!(bytes, b"fn main() {}\n");
    }

    #[test]
    fn file_over_per_file_cap_is_skipped_with_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        write_file(&repo.join("big.txt"), &vec![b'x'; 100]);

        let bundle_repo_dir = tmp.path().join("bundle/repos/o/r");
        let budget = IngestBudget { max_file_bytes: 99, max_total_bytes: 1_000_000 };
        let outcome = normalize_repo(&repo, &bundle_repo_dir, &budget).unwrap();

        assert!(outcome.files.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].reason, "too large");
    }

    #[test]
    fn total_cap_stops_further_ingestion() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        write_file(&repo.join("a.txt"), &vec![b'x'; 60]);
        write_file(&repo.join("b.txt"), &vec![b'y'; 60]);

        let bundle_repo_dir = tmp.path().join("bundle/repos/o/r");
        let budget = IngestBudget { max_file_bytes: 1_000, max_total_bytes: 100 };
        let outcome = normalize_repo(&repo, &bundle_repo_dir, &budget).unwrap();

        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].reason, "total-cap-reached");
    }

    #[test]
    fn invalid_utf8_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        write_file(&repo.join("bin.dat"), &[0xff, 0xfe, 0x00, 0xff]);

        let bundle_repo_dir = tmp.path().join("bundle/repos/o/r");
        let budget = IngestBudget { max_file_bytes: 1_000, max_total_bytes: 1_000 };
        let outcome = normalize_repo(&repo, &bundle_repo_dir, &budget).unwrap();

        assert!(outcome.files.is_empty());
        assert_eq!(outcome.skipped[0].reason, "unreadable utf8");
    }
}
