//! Fingerprint computation and canonicalization — §4.D.
//!
//! Two create-requests with the same fingerprint are considered the same
//! bundle. The canonical form is field-sorted and lowercased per the rules
//! below, then hashed with `sha2::Sha256` — the same hashing primitive the
//! ingest normalizer uses for content hashes, reused rather than duplicated.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::RepoEntry;

#[derive(Serialize)]
struct CanonicalRepo {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    git_ref: Option<String>,
}

fn canonicalize_repo(entry: &RepoEntry) -> CanonicalRepo {
    match entry {
        RepoEntry::Github { owner, repo, git_ref } => CanonicalRepo {
            kind: "github",
            repo: Some(format!("{}/{}", owner.to_lowercase(), repo.to_lowercase())),
            path: None,
            url: None,
            git_ref: Some(git_ref.clone().unwrap_or_else(|| "default".to_string()).to_lowercase()),
        },
        RepoEntry::Local { absolute_path, .. } => {
            let resolved = absolute_path.canonicalize().unwrap_or_else(|_| absolute_path.clone());
            CanonicalRepo {
                kind: "local",
                repo: None,
                path: Some(resolved.to_string_lossy().to_lowercase()),
                url: None,
                git_ref: None,
            }
        }
        RepoEntry::Web { url, .. } => {
            CanonicalRepo { kind: "web", repo: None, path: None, url: Some(normalize_url(url)), git_ref: None }
        }
    }
}

/// Normalize a URL for fingerprint purposes: lowercase scheme+host, strip a
/// trailing slash, drop the fragment.
fn normalize_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let trimmed = without_fragment.trim_end_matches('/');
    trimmed.to_lowercase()
}

#[derive(Serialize)]
struct CanonicalFingerprintInput {
    schema_version: u32,
    repos: Vec<CanonicalRepo>,
    libraries: Vec<String>,
    topics: Vec<String>,
}

/// Compute the deterministic SHA-256 fingerprint over normalized inputs.
pub fn compute_fingerprint(repos: &[RepoEntry], libraries: &[String], topics: &[String]) -> String {
    let mut canon_repos: Vec<CanonicalRepo> = repos.iter().map(canonicalize_repo).collect();
    canon_repos.sort_by(|a, b| canonical_sort_key(a).cmp(&canonical_sort_key(b)));

    let mut libs: Vec<String> = libraries.iter().map(|s| s.to_lowercase()).collect();
    libs.sort();
    let mut tops: Vec<String> = topics.iter().map(|s| s.to_lowercase()).collect();
    tops.sort();

    let canonical = CanonicalFingerprintInput { schema_version: 1, repos: canon_repos, libraries: libs, topics: tops };
    let json = serde_json::to_string(&canonical).expect("canonical fingerprint input is always serializable");

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_sort_key(r: &CanonicalRepo) -> String {
    format!("{}|{}|{}|{}", r.kind, r.repo.as_deref().unwrap_or(""), r.path.as_deref().unwrap_or(""), r.url.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gh(owner: &str, repo: &str, r: Option<&str>) -> RepoEntry {
        RepoEntry::Github { owner: owner.to_string(), repo: repo.to_string(), git_ref: r.map(str::to_string) }
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let a = compute_fingerprint(&[gh("Owner", "Repo", Some("Main"))], &[], &[]);
        let b = compute_fingerprint(&[gh("owner", "repo", Some("main"))], &[], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_ref_defaults_to_default() {
        let a = compute_fingerprint(&[gh("o", "r", None)], &[], &[]);
        let b = compute_fingerprint(&[gh("o", "r", Some("default"))], &[], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn repo_order_does_not_affect_fingerprint() {
        let a = compute_fingerprint(&[gh("a", "x", None), gh("b", "y", None)], &[], &[]);
        let b = compute_fingerprint(&[gh("b", "y", None), gh("a", "x", None)], &[], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_repos_produce_different_fingerprints() {
        let a = compute_fingerprint(&[gh("a", "x", None)], &[], &[]);
        let b = compute_fingerprint(&[gh("a", "y", None)], &[], &[]);
        assert_ne!(a, b);
    }
}
