//! Bundle builder — §4.H, the atomic create/update pipeline.
//!
//! Runs as an explicit phase state machine (reusing [`TaskPhase`] rather than
//! threading stringly-typed phase names through logging) so `ProgressTask`
//! updates always name a known, enumerated step. Guide and analysis
//! generation are delegated to host-adapter traits — the same shape as
//! [`crate::acquire::WebCrawler`] — since their real implementations (an
//! LLM-backed describer, an advanced facts analyzer) are out of scope here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::acquire::{self, WebCrawler};
use crate::config::Config;
use crate::dedup;
use crate::error::{PreflightError, Result};
use crate::fingerprint;
use crate::fts::{self, IndexableFile};
use crate::ingest::{self, IngestBudget};
use crate::manifest;
use crate::model::{Bundle, BundleInputs, DedupStatus, FileKind, LockPhase, RepoEntry, SearchIndexDescriptor, TaskPhase};
use crate::progress::ProgressTracker;
use crate::semaphore::CountingSemaphore;
use crate::storage;
use crate::util::now_rfc3339;
use crate::validate;

/// Writes minimal, valid guide content. The real collaborator (an
/// LLM-backed repo describer) is out of scope; this keeps `validate()`
/// satisfiable without one.
pub trait GuideGenerator: Send + Sync {
    fn generate(&self, bundle_dir: &Path, bundle: &Bundle) -> Result<()>;
}

pub struct PlaceholderGuideGenerator;

impl GuideGenerator for PlaceholderGuideGenerator {
    fn generate(&self, bundle_dir: &Path, bundle: &Bundle) -> Result<()> {
        let write = |name: &str, body: String| -> Result<()> {
            std::fs::write(bundle_dir.join(name), body).map_err(|e| PreflightError::OperationFailed { message: format!("failed to write {name}: {e}"), source: Some(Box::new(e)) })
        };
        write("START_HERE.md", format!("# {}\n\nBundle `{}`. Start with `OVERVIEW.md`.\n", bundle.display_name, bundle.bundle_id))?;
        write("AGENTS.md", format!("# Agent notes\n\nSearch with the `search` subcommand; query the dependency graph with `deps`.\n"))?;
        write("OVERVIEW.md", format!("# Overview\n\n{} repo(s), fingerprint `{}`.\n", bundle.repos.len(), bundle.fingerprint))?;
        Ok(())
    }
}

/// Runs derived analyzers (facts, advanced analysis) over the normalized
/// tree. The real analyzers are out of scope; the default is a no-op since
/// `validate()` does not require `analysis/` to be present.
pub trait AnalysisRunner: Send + Sync {
    fn analyze(&self, bundle_dir: &Path, bundle: &Bundle) -> Result<()>;
}

pub struct NoopAnalysisRunner;

impl AnalysisRunner for NoopAnalysisRunner {
    fn analyze(&self, _bundle_dir: &Path, _bundle: &Bundle) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfExists {
    Error,
    ReturnExisting,
    UpdateExisting,
    CreateNew,
}

pub struct CreateRequest {
    pub repos: Vec<RepoEntry>,
    pub libraries: Vec<String>,
    pub topics: Vec<String>,
    pub display_name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub if_exists: IfExists,
}

pub struct CheckForUpdatesOutcome {
    pub has_updates: bool,
    pub details: Vec<String>,
}

pub struct CreateOutcome {
    pub bundle_id: String,
    pub fingerprint: String,
    /// `false` when an existing bundle was returned/updated without a fresh build.
    pub created: bool,
    pub changed: bool,
    pub warnings: Vec<String>,
}

pub struct BundleBuilder {
    pub config: Config,
    pub progress: ProgressTracker,
    semaphore: CountingSemaphore,
    pub crawler: Box<dyn WebCrawler>,
    pub guide_generator: Box<dyn GuideGenerator>,
    pub analysis_runner: Box<dyn AnalysisRunner>,
}

impl BundleBuilder {
    pub fn new(config: Config) -> Self {
        let permits = config.bundle_creation_limiter;
        Self {
            config,
            progress: ProgressTracker::new(),
            semaphore: CountingSemaphore::new(permits),
            crawler: Box::new(acquire::NoNetworkWebCrawler),
            guide_generator: Box::new(PlaceholderGuideGenerator),
            analysis_runner: Box::new(NoopAnalysisRunner),
        }
    }

    pub fn create(&self, req: CreateRequest) -> Result<CreateOutcome> {
        let fp = fingerprint::compute_fingerprint(&req.repos, &req.libraries, &req.topics);
        let root = storage::effective_write_root(&self.config.storage_dirs)?;

        if req.if_exists != IfExists::CreateNew {
            if let Some(existing) = dedup::find_existing(&root, &fp) {
                if existing.status == DedupStatus::Complete {
                    match req.if_exists {
                        IfExists::Error => {
                            return Err(PreflightError::BundleCreationError { message: format!("bundle already exists for this fingerprint: {}", existing.bundle_id), source: None });
                        }
                        IfExists::ReturnExisting => {
                            return Ok(CreateOutcome { bundle_id: existing.bundle_id, fingerprint: fp, created: false, changed: false, warnings: vec!["returned existing bundle without rebuilding".to_string()] });
                        }
                        IfExists::UpdateExisting => {
                            return self.update(&existing.bundle_id, &req.repos, &req.libraries, &req.topics);
                        }
                        IfExists::CreateNew => unreachable!(),
                    }
                }
            }
        }

        let permit = self.semaphore.acquire();
        let bundle_id = Uuid::new_v4().to_string();
        let task_id = Uuid::new_v4().to_string();
        let started_at = now_rfc3339();
        let repo_labels: Vec<String> = req.repos.iter().map(repo_label).collect();

        dedup::set_lock(&root, &fp, &task_id, &started_at, repo_labels.clone())?;
        self.progress.start_task(&task_id, &fp, repo_labels, &started_at);

        let result = self.run_build(&root, &bundle_id, &fp, &task_id, &req);

        match &result {
            Ok(_) => {
                dedup::clear_lock(&root, &fp);
                self.progress.complete_task(&task_id, &bundle_id, &now_rfc3339());
            }
            Err(e) => {
                dedup::clear_lock(&root, &fp);
                self.progress.fail_task(&task_id, &e.to_string(), &now_rfc3339());
                warn!(bundle_id, error = %e, "bundle creation failed");
            }
        }
        drop(permit);

        result.map(|warnings| CreateOutcome { bundle_id, fingerprint: fp, created: true, changed: true, warnings })
    }

    fn run_build(&self, root: &Path, bundle_id: &str, fp: &str, task_id: &str, req: &CreateRequest) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let tmp_dir = self.config.tmp_dir.join("bundles-wip").join(bundle_id);
        let cleanup = TmpDirGuard::new(tmp_dir.clone());

        std::fs::create_dir_all(&tmp_dir).map_err(|e| PreflightError::OperationFailed { message: format!("failed to allocate tmp working dir: {e}"), source: Some(Box::new(e)) })?;

        dedup::advance_lock(root, fp, LockPhase::Cloning)?;
        self.progress.update_progress(task_id, TaskPhase::Cloning, 10, None, "acquiring repos", &now_rfc3339());

        let mut repo_records = Vec::new();
        let mut all_ingested: Vec<(IngestedFileRef, String)> = Vec::new();
        let mut skipped_total = Vec::new();

        for entry in &req.repos {
            let repo_dir = tmp_dir.join("repos").join(safe_dir_name(&repo_label(entry)));
            let (record, acquire_warnings) = acquire::acquire(entry, &repo_dir, Duration::from_millis(self.config.git_clone_timeout_ms), self.crawler.as_ref())?;
            warnings.extend(acquire_warnings);

            self.progress.update_progress(task_id, TaskPhase::Ingesting, 40, None, "normalizing files", &now_rfc3339());
            let budget = IngestBudget { max_file_bytes: self.config.max_file_bytes, max_total_bytes: self.config.max_total_bytes };
            let bundle_repo_dir = tmp_dir.join("repos").join(sanitize_id(&record.id));
            let outcome = ingest::normalize_repo(&repo_dir, &bundle_repo_dir, &budget).map_err(|e| PreflightError::IngestError { message: format!("normalizing '{}': {e}", record.id) })?;

            for f in &outcome.files {
                all_ingested.push((IngestedFileRef { bundle_rel_path: f.bundle_rel_path.clone(), repo: record.id.clone(), kind: f.kind, content_hash: f.content_hash.clone() }, bundle_repo_dir.join("norm").join(&f.repo_rel_path).to_string_lossy().to_string()));
            }
            skipped_total.extend(outcome.skipped);
            repo_records.push(record);
        }

        dedup::advance_lock(root, fp, LockPhase::Indexing)?;
        self.progress.update_progress(task_id, TaskPhase::Indexing, 60, None, "building search index", &now_rfc3339());

        let texts: Vec<String> = all_ingested.iter().map(|(_, disk_path)| std::fs::read_to_string(disk_path).unwrap_or_default()).collect();
        let indexable: Vec<IndexableFile> = all_ingested
            .iter()
            .zip(texts.iter())
            .map(|((f, _), text)| IndexableFile { path: &f.bundle_rel_path, repo: &f.repo, kind: f.kind, content_hash: &f.content_hash, normalized_text: text })
            .collect();

        let search_db = tmp_dir.join("indexes").join("search.sqlite3");
        fts::rebuild(&search_db, &indexable)?;

        if skipped_total.len() > crate::model::MAX_SKIPPED_FILES_IN_MANIFEST {
            warnings.push(format!("{} files skipped; manifest retains only the first {}", skipped_total.len(), crate::model::MAX_SKIPPED_FILES_IN_MANIFEST));
        }

        let now = now_rfc3339();
        let bundle = Bundle {
            schema_version: 1,
            bundle_id: bundle_id.to_string(),
            created_at: now.clone(),
            updated_at: now.clone(),
            fingerprint: fp.to_string(),
            display_name: req.display_name.clone(),
            description: req.description.clone(),
            tags: req.tags.clone(),
            primary_language: None,
            bundle_type: None,
            inputs: BundleInputs { repos: req.repos.clone(), libraries: req.libraries.clone(), topics: req.topics.clone() },
            repos: repo_records,
            index: SearchIndexDescriptor { backend: "sqlite-fts5-lines".to_string(), include_docs: true, include_code: true },
            skipped_files: if skipped_total.is_empty() { None } else { Some(skipped_total) },
        };

        manifest::save(&tmp_dir.join("manifest.json"), &bundle)?;

        dedup::advance_lock(root, fp, LockPhase::Generating)?;
        self.progress.update_progress(task_id, TaskPhase::Generating, 80, None, "writing guides", &now_rfc3339());
        self.guide_generator.generate(&tmp_dir, &bundle)?;

        if self.config.analysis_mode {
            dedup::advance_lock(root, fp, LockPhase::Analyzing)?;
            self.progress.update_progress(task_id, TaskPhase::Analyzing, 90, None, "running analyzers", &now_rfc3339());
            self.analysis_runner.analyze(&tmp_dir, &bundle)?;
        }

        let report = validate::validate(&tmp_dir);
        if !report.is_valid {
            return Err(PreflightError::BundleValidationError { bundle_id: bundle_id.to_string(), missing_components: report.missing_components });
        }

        dedup::advance_lock(root, fp, LockPhase::Finalizing)?;
        self.progress.update_progress(task_id, TaskPhase::Finalizing, 95, None, "publishing bundle", &now_rfc3339());

        let final_dir = storage::get_paths(root, bundle_id).bundle_dir;
        publish_atomic(&tmp_dir, &final_dir)?;
        cleanup.disarm();

        storage::mirror(root, &self.config.storage_dirs, bundle_id);
        dedup::mark_complete(root, fp, bundle_id, &now)?;

        info!(bundle_id, fingerprint = fp, "bundle created");
        Ok(warnings)
    }

    /// Re-acquire a bundle's repos and refresh derived artifacts in place.
    pub fn update(&self, bundle_id: &str, repos: &[RepoEntry], libraries: &[String], topics: &[String]) -> Result<CreateOutcome> {
        let root = storage::find_bundle(&self.config.storage_dirs, bundle_id).ok_or_else(|| PreflightError::BundleNotFound { id: bundle_id.to_string(), hint: "bundle not found on any configured storage root".to_string() })?;
        let paths = storage::get_paths(&root, bundle_id);
        let mut bundle = manifest::load(&paths.manifest)?;

        let mut changed = false;
        let mut warnings = Vec::new();
        let mut repo_records = Vec::new();
        for entry in repos {
            let repo_dir = paths.repos_dir.join(sanitize_id(&repo_label(entry)));
            let (record, acquire_warnings) = acquire::acquire(entry, &repo_dir, Duration::from_millis(self.config.git_clone_timeout_ms), self.crawler.as_ref())?;
            warnings.extend(acquire_warnings);
            if let Some(prior) = bundle.repos.iter().find(|r| r.id == record.id) {
                if prior.head_sha != record.head_sha {
                    changed = true;
                }
            } else {
                changed = true;
            }
            repo_records.push(record);
        }

        if changed {
            let mut all_ingested = Vec::new();
            let mut texts = Vec::new();
            let mut skipped_total = Vec::new();
            for record in &repo_records {
                let repo_dir = paths.repos_dir.join(sanitize_id(&record.id));
                let budget = IngestBudget { max_file_bytes: self.config.max_file_bytes, max_total_bytes: self.config.max_total_bytes };
                let outcome = ingest::normalize_repo(&repo_dir, &repo_dir, &budget).map_err(|e| PreflightError::IngestError { message: e.to_string() })?;
                for f in outcome.files {
                    let disk_path = repo_dir.join("norm").join(&f.repo_rel_path);
                    texts.push(std::fs::read_to_string(&disk_path).unwrap_or_default());
                    all_ingested.push((f.bundle_rel_path, record.id.clone(), f.kind, f.content_hash));
                }
                skipped_total.extend(outcome.skipped);
            }
            let indexable: Vec<IndexableFile> = all_ingested.iter().zip(texts.iter()).map(|((path, repo, kind, hash), text)| IndexableFile { path, repo, kind: *kind, content_hash: hash, normalized_text: text }).collect();
            let result = fts::incremental_update(&paths.search_db, &indexable)?;
            info!(bundle_id, ?result, "incremental index update applied");
            bundle.skipped_files = if skipped_total.is_empty() { None } else { Some(skipped_total) };
        }

        bundle.repos = repo_records;
        bundle.inputs = BundleInputs { repos: repos.to_vec(), libraries: libraries.to_vec(), topics: topics.to_vec() };
        bundle.updated_at = now_rfc3339();
        manifest::save(&paths.manifest, &bundle)?;

        dedup::mark_complete(&root, &bundle.fingerprint, bundle_id, &bundle.updated_at)?;
        storage::mirror(&root, &self.config.storage_dirs, bundle_id);

        Ok(CreateOutcome { bundle_id: bundle_id.to_string(), fingerprint: bundle.fingerprint, created: false, changed, warnings })
    }

    /// Peek each input repo's current head without mutating the bundle,
    /// comparing it against the stored `RepoRecord.head_sha`. Acquires into a
    /// scratch directory under `tmp_dir` and discards it immediately —
    /// `update()` is the call that actually refreshes the bundle in place.
    pub fn check_for_updates(&self, bundle_id: &str) -> Result<CheckForUpdatesOutcome> {
        let root = storage::find_bundle(&self.config.storage_dirs, bundle_id).ok_or_else(|| PreflightError::BundleNotFound { id: bundle_id.to_string(), hint: "bundle not found on any configured storage root".to_string() })?;
        let paths = storage::get_paths(&root, bundle_id);
        let bundle = manifest::load(&paths.manifest)?;

        let scratch = self.config.tmp_dir.join("bundles-check").join(Uuid::new_v4().to_string());
        let _cleanup = TmpDirGuard::new(scratch.clone());

        let mut has_updates = false;
        let mut details = Vec::new();
        for entry in &bundle.inputs.repos {
            let label = repo_label(entry);
            let repo_dir = scratch.join(safe_dir_name(&label));
            let record = match acquire::acquire(entry, &repo_dir, Duration::from_millis(self.config.git_clone_timeout_ms), self.crawler.as_ref()) {
                Ok((r, _warnings)) => r,
                Err(e) => {
                    details.push(format!("{label}: could not check for updates ({e})"));
                    continue;
                }
            };
            match bundle.repos.iter().find(|r| r.id == record.id) {
                Some(prior) if prior.head_sha != record.head_sha => {
                    has_updates = true;
                    details.push(format!("{label}: head changed ({:?} -> {:?})", prior.head_sha, record.head_sha));
                }
                Some(_) => details.push(format!("{label}: up to date")),
                None => {
                    has_updates = true;
                    details.push(format!("{label}: not present in the current manifest"));
                }
            }
        }

        Ok(CheckForUpdatesOutcome { has_updates, details })
    }

    /// Bridge [`validate::repair`]'s injected rebuild closure to a real
    /// rebuild: re-reads every normalized file already on disk under
    /// `repos/*/*/norm/` and feeds it back through [`fts::rebuild`].
    pub fn repair(&self, bundle_id: &str, mode: validate::RepairMode) -> Result<validate::RepairReport> {
        let root = storage::find_bundle(&self.config.storage_dirs, bundle_id).ok_or_else(|| PreflightError::BundleNotFound { id: bundle_id.to_string(), hint: "bundle not found on any configured storage root".to_string() })?;
        let paths = storage::get_paths(&root, bundle_id);
        let bundle_dir = paths.bundle_dir.clone();
        let search_db = paths.search_db.clone();
        let repos_dir = paths.repos_dir.clone();

        validate::repair(&bundle_dir, mode, || {
            let bundle = manifest::load(&paths.manifest)?;
            let mut all_ingested = Vec::new();
            let mut texts = Vec::new();
            for record in &bundle.repos {
                let norm_dir = repos_dir.join(sanitize_id(&record.id)).join("norm");
                if !norm_dir.is_dir() {
                    continue;
                }
                for entry in ingest::walk_normalized_files(&norm_dir) {
                    let rel = entry.strip_prefix(&norm_dir).unwrap_or(&entry).to_string_lossy().replace('\\', "/");
                    let bundle_rel_path = format!("repos/{}/norm/{}", sanitize_id(&record.id), rel);
                    let kind = ingest::classify_kind_by_path(&rel);
                    let text = std::fs::read_to_string(&entry).unwrap_or_default();
                    let mut hasher = Sha256::new();
                    hasher.update(text.as_bytes());
                    let content_hash = hex::encode(hasher.finalize());
                    texts.push(text);
                    all_ingested.push((bundle_rel_path, record.id.clone(), kind, content_hash));
                }
            }
            let indexable: Vec<IndexableFile> = all_ingested.iter().zip(texts.iter()).map(|((path, repo, kind, hash), text)| IndexableFile { path, repo, kind: *kind, content_hash: hash, normalized_text: text }).collect();
            fts::rebuild(&search_db, &indexable)
        })
    }

    pub fn delete(&self, bundle_id: &str) -> Result<()> {
        let root = storage::find_bundle(&self.config.storage_dirs, bundle_id).ok_or_else(|| PreflightError::BundleNotFound { id: bundle_id.to_string(), hint: "bundle not found on any configured storage root".to_string() })?;
        let paths = storage::get_paths(&root, bundle_id);
        std::fs::remove_dir_all(&paths.bundle_dir).map_err(|e| PreflightError::OperationFailed { message: format!("failed to delete bundle: {e}"), source: Some(Box::new(e)) })?;
        dedup::remove_entry_for_bundle(&root, bundle_id)
    }
}

struct IngestedFileRef {
    bundle_rel_path: String,
    repo: String,
    kind: FileKind,
    content_hash: String,
}

struct TmpDirGuard {
    path: PathBuf,
    armed: std::cell::Cell<bool>,
}

impl TmpDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: std::cell::Cell::new(true) }
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for TmpDirGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

fn repo_label(entry: &RepoEntry) -> String {
    match entry {
        RepoEntry::Github { owner, repo, .. } => format!("{owner}/{repo}"),
        RepoEntry::Local { repo_id, .. } => repo_id.clone(),
        RepoEntry::Web { url, .. } => url.clone(),
    }
}

fn safe_dir_name(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' }).collect()
}

fn sanitize_id(id: &str) -> String {
    safe_dir_name(id)
}

/// Rename `tmp` into `final_dir`; fall back to copy+remove on `EXDEV`
/// (crossing filesystem boundaries, e.g. tmp on tmpfs and storage elsewhere).
/// Still single-direction: `final_dir` is only ever populated from `tmp`,
/// never the reverse.
fn publish_atomic(tmp: &Path, final_dir: &Path) -> Result<()> {
    if let Some(parent) = final_dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PreflightError::OperationFailed { message: format!("failed to create storage parent dir: {e}"), source: Some(Box::new(e)) })?;
    }
    match std::fs::rename(tmp, final_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(18) => {
            warn!("cross-filesystem rename (EXDEV), falling back to copy+remove");
            copy_dir_recursive(tmp, final_dir).map_err(|e| PreflightError::OperationFailed { message: format!("fallback copy failed: {e}"), source: Some(Box::new(e)) })?;
            std::fs::remove_dir_all(tmp).map_err(|e| PreflightError::OperationFailed { message: format!("failed to remove tmp dir after fallback copy: {e}"), source: Some(Box::new(e)) })
        }
        Err(e) => Err(PreflightError::OperationFailed { message: format!("failed to publish bundle: {e}"), source: Some(Box::new(e)) }),
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
    fn create_request_with_createnew_bypasses_dedup() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dirs = vec![tmp.path().to_path_buf()];
        config.tmp_dir = tmp.path().join("tmp");
        let builder = BundleBuilder::new(config);

        let req = CreateRequest {
            repos: vec![RepoEntry::Local { repo_id: "local-a".to_string(), absolute_path: tmp.path().to_path_buf(), git_ref: None }],
            libraries: vec![],
            topics: vec![],
            display_name: "test bundle".to_string(),
            description: None,
            tags: vec![],
            if_exists: IfExists::CreateNew,
        };
        let outcome = builder.create(req).unwrap();
        assert!(outcome.created);

        let report = validate::validate(&storage::get_paths(tmp.path(), &outcome.bundle_id).bundle_dir);
        assert!(report.is_valid);
    }

    #[test]
    fn return_existing_short_circuits_without_rebuilding() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dirs = vec![tmp.path().to_path_buf()];
        config.tmp_dir = tmp.path().join("tmp");
        let builder = BundleBuilder::new(config);

        let repos = vec![RepoEntry::Local { repo_id: "local-a".to_string(), absolute_path: tmp.path().to_path_buf(), git_ref: None }];
        let make_req = |if_exists| CreateRequest { repos: repos.clone(), libraries: vec![], topics: vec![], display_name: "t".to_string(), description: None, tags: vec![], if_exists };

        let first = builder.create(make_req(IfExists::ReturnExisting)).unwrap();
        let second = builder.create(make_req(IfExists::ReturnExisting)).unwrap();

        assert_eq!(first.bundle_id, second.bundle_id);
        assert!(!second.created);
    }
}
