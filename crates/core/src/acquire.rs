//! Repo acquirer — §4.G.
//!
//! Resolves a [`RepoEntry`] into bytes on disk plus a [`RepoRecord`]: GitHub
//! via `git2` clone with an archive-download fallback, Local via path
//! resolution + `git2` HEAD read, Web via a host-adapter trait whose default
//! implementation refuses (the real crawler is out of scope).

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::build::RepoBuilder;
use git2::{FetchOptions, RemoteCallbacks, Repository};
use tracing::{debug, info, warn};

use crate::error::{PreflightError, Result};
use crate::model::{RepoEntry, RepoRecord, SourceKind};
use crate::util::now_rfc3339;

/// A single page fetched by a web crawler, pre-normalization.
pub struct CrawledPage {
    pub url: String,
    pub text: String,
}

pub struct CrawledPages {
    pub pages: Vec<CrawledPage>,
    pub used_llms_txt: bool,
}

/// Host adapter for the web-crawl source kind. The real crawler (rendering,
/// sitemap discovery, `llms.txt` preference) is out of scope for this
/// engine; callers that need it supply their own implementation.
pub trait WebCrawler: Send + Sync {
    fn fetch(&self, url: &str, config: &serde_json::Value) -> Result<CrawledPages>;
}

/// Default crawler: always refuses. Exists so bundle creation can at least
/// produce an actionable error instead of silently doing nothing.
pub struct NoNetworkWebCrawler;

impl WebCrawler for NoNetworkWebCrawler {
    fn fetch(&self, url: &str, _config: &serde_json::Value) -> Result<CrawledPages> {
        Err(PreflightError::CrawlError {
            message: format!(
                "no web crawler configured; cannot fetch '{url}'. Supply a WebCrawler implementation to acquire web sources."
            ),
        })
    }
}

/// Clone a GitHub repo into `dest`, enforcing `timeout` via a polling
/// transfer-progress callback (git2 has no native deadline). Falls back to
/// downloading a branch/tag/commit archive over HTTP on clone failure,
/// returning a user-visible warning for each step of the fallback.
pub fn acquire_github(owner: &str, repo: &str, git_ref: Option<&str>, dest: &Path, timeout: Duration) -> Result<(RepoRecord, Vec<String>)> {
    let url = format!("https://github.com/{owner}/{repo}.git");
    match clone_with_timeout(&url, git_ref, dest, timeout) {
        Ok(head_sha) => {
            info!(owner, repo, %head_sha, "github clone succeeded");
            Ok((
                RepoRecord {
                    id: format!("{owner}/{repo}"),
                    source: SourceKind::Git,
                    head_sha: Some(head_sha),
                    fetched_at: now_rfc3339(),
                    notes: None,
                    base_url: None,
                    page_count: None,
                    used_llms_txt: None,
                    ref_used: git_ref.map(str::to_string),
                },
                Vec::new(),
            ))
        }
        Err(clone_err) => {
            warn!(owner, repo, error = %clone_err, "clone failed, falling back to archive download");
            let mut warnings = vec![format!("git clone failed ({clone_err}); falling back to archive download")];
            let record = download_archive(owner, repo, git_ref, dest).map_err(|archive_err| PreflightError::GitHubError {
                message: format!("clone failed ({clone_err}) and archive fallback failed ({archive_err})"),
            })?;
            warnings.push("ZIP download completed".to_string());
            Ok((record, warnings))
        }
    }
}

fn clone_with_timeout(url: &str, git_ref: Option<&str>, dest: &Path, timeout: Duration) -> std::result::Result<String, String> {
    let deadline = Instant::now() + timeout;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |_progress| Instant::now() < deadline);

    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);
    fetch_opts.depth(1);

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_opts);
    if let Some(r) = git_ref {
        builder.branch(r);
    }

    let repo = builder.clone(url, dest).map_err(|e| e.to_string())?;
    let head = repo.head().map_err(|e| e.to_string())?;
    let oid = head.target().ok_or("HEAD has no target")?;
    Ok(oid.to_string())
}

/// Try `heads/<ref>`, then `tags/<ref>`, then the literal ref as a commit
/// archive path, downloading the first that resolves with a 2xx response.
fn download_archive(owner: &str, repo: &str, git_ref: Option<&str>, dest: &Path) -> std::result::Result<RepoRecord, String> {
    let r = git_ref.unwrap_or("HEAD");
    let candidates = [
        format!("https://github.com/{owner}/{repo}/archive/refs/heads/{r}.zip"),
        format!("https://github.com/{owner}/{repo}/archive/refs/tags/{r}.zip"),
        format!("https://github.com/{owner}/{repo}/archive/{r}.zip"),
    ];

    for url in &candidates {
        match ureq::get(url).call() {
            Ok(response) => {
                let mut bytes = Vec::new();
                response.into_reader().read_to_end(&mut bytes).map_err(|e| e.to_string())?;
                extract_zip(&bytes, dest)?;
                debug!(url, "archive download succeeded");
                return Ok(RepoRecord {
                    id: format!("{owner}/{repo}"),
                    source: SourceKind::Archive,
                    head_sha: None,
                    fetched_at: now_rfc3339(),
                    notes: Some(format!("fetched via archive fallback: {url}")),
                    base_url: None,
                    page_count: None,
                    used_llms_txt: None,
                    ref_used: git_ref.map(str::to_string),
                });
            }
            Err(_) => continue,
        }
    }
    Err(format!("no archive candidate resolved for {owner}/{repo}@{r}"))
}

fn extract_zip(bytes: &[u8], dest: &Path) -> std::result::Result<(), String> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| e.to_string())?;
    std::fs::create_dir_all(dest).map_err(|e| e.to_string())?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| e.to_string())?;
        let Some(enclosed) = entry.enclosed_name().map(|p| p.to_path_buf()) else { continue };
        // GitHub archives nest everything under a single top-level `<repo>-<ref>/` dir; strip it.
        let stripped: PathBuf = enclosed.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(&stripped);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| e.to_string())?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            let mut out = std::fs::File::create(&out_path).map_err(|e| e.to_string())?;
            std::io::copy(&mut entry, &mut out).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

/// Resolve a local path and, if it is a git working tree, read its HEAD sha
/// by opening the repo with `git2` rather than shelling out.
pub fn acquire_local(repo_id: &str, absolute_path: &Path, git_ref: Option<&str>) -> Result<RepoRecord> {
    let canonical = absolute_path.canonicalize().map_err(|e| PreflightError::IngestError {
        message: format!("local path '{}' could not be resolved: {e}", absolute_path.display()),
    })?;

    let head_sha = Repository::open(&canonical).ok().and_then(|repo| repo.head().ok()).and_then(|head| head.target()).map(|oid| oid.to_string());

    Ok(RepoRecord {
        id: repo_id.to_string(),
        source: SourceKind::Local,
        head_sha,
        fetched_at: now_rfc3339(),
        notes: None,
        base_url: None,
        page_count: None,
        used_llms_txt: None,
        ref_used: git_ref.map(str::to_string),
    })
}

/// Acquire a web source via the supplied crawler, recording page count and
/// whether `llms.txt` guided discovery.
pub fn acquire_web(url: &str, config: &serde_json::Value, crawler: &dyn WebCrawler) -> Result<(RepoRecord, CrawledPages)> {
    let pages = crawler.fetch(url, config)?;
    let record = RepoRecord {
        id: format!("web/{}", sanitize_for_id(url)),
        source: SourceKind::Crawl,
        head_sha: None,
        fetched_at: now_rfc3339(),
        notes: None,
        base_url: Some(url.to_string()),
        page_count: Some(pages.pages.len() as u64),
        used_llms_txt: Some(pages.used_llms_txt),
        ref_used: None,
    };
    Ok((record, pages))
}

fn sanitize_for_id(url: &str) -> String {
    url.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '-' }).collect()
}

/// Dispatch a [`RepoEntry`] to the matching acquirer. Returns the acquired
/// [`RepoRecord`] plus any user-visible warnings raised along the way (e.g.
/// the GitHub clone-then-archive fallback).
pub fn acquire(entry: &RepoEntry, dest: &Path, timeout: Duration, crawler: &dyn WebCrawler) -> Result<(RepoRecord, Vec<String>)> {
    match entry {
        RepoEntry::Github { owner, repo, git_ref } => acquire_github(owner, repo, git_ref.as_deref(), dest, timeout),
        RepoEntry::Local { repo_id, absolute_path, git_ref } => acquire_local(repo_id, absolute_path, git_ref.as_deref()).map(|record| (record, Vec::new())),
        RepoEntry::Web { url, config } => acquire_web(url, config, crawler).map(|(record, _pages)| (record, Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_network_crawler_refuses() {
        let crawler = NoNetworkWebCrawler;
        let err = crawler.fetch("https://example.com", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "CRAWL_ERROR");
    }

    #[test]
    fn local_acquire_resolves_non_git_dir_without_head_sha() {
        let tmp = tempfile::tempdir().unwrap();
        let record = acquire_local("my-local-repo", tmp.path(), None).unwrap();
        assert_eq!(record.id, "my-local-repo");
        assert!(record.head_sha.is_none());
        assert_eq!(record.source, SourceKind::Local);
    }

    #[test]
    fn local_acquire_missing_path_is_ingest_error() {
        let err = acquire_local("nope", Path::new("/definitely/not/a/real/path/xyz"), None).unwrap_err();
        assert_eq!(err.code(), "INGEST_ERROR");
    }

    #[test]
    fn web_id_is_sanitized() {
        assert_eq!(sanitize_for_id("https://example.com/a/b"), "https---example-com-a-b");
    }
}
