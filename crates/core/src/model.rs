//! Core data model: bundles, repo entries, ingested files, fingerprints,
//! locks, progress tasks, graph nodes, evidence, trace edges, and claims.
//!
//! Mirrors the teacher's `types.rs` convention: plain public-field structs,
//! `#[derive(Clone, Serialize, Deserialize)]` everywhere a value crosses the
//! manifest/JSON boundary, `BTreeMap` where deterministic iteration order
//! matters (manifests, canonical fingerprints) and `HashMap`/`DashMap`
//! where it doesn't (lookup tables, in-memory task registries).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bundle + repo entries
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    Repo,
    Document,
}

/// One of the three ways a caller can name a source repo in a create request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RepoEntry {
    Github { owner: String, repo: String, #[serde(rename = "ref", skip_serializing_if = "Option::is_none")] git_ref: Option<String> },
    Local { repo_id: String, absolute_path: PathBuf, #[serde(rename = "ref", skip_serializing_if = "Option::is_none")] git_ref: Option<String> },
    Web { url: String, #[serde(default)] config: serde_json::Value },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Git,
    Archive,
    Local,
    Crawl,
}

/// Resolved record for one acquired repo, written into the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoRecord {
    /// Canonical id: `owner/repo`, or `web/<safeid>`.
    pub id: String,
    pub source: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
    pub fetched_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_llms_txt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_used: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Doc,
    Code,
}

/// Per-normalized-file record, one per ingested file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestedFile {
    /// Repo-relative path (POSIX separators).
    pub repo_rel_path: String,
    /// Bundle-relative normalized path (`repos/<id>/norm/<repo_rel_path>`).
    pub bundle_rel_path: String,
    pub kind: FileKind,
    /// SHA-256 hex over LF-normalized bytes.
    pub content_hash: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedFileEntry {
    pub path: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchIndexDescriptor {
    pub backend: String,
    pub include_docs: bool,
    pub include_code: bool,
}

/// Top-level bundle record as persisted in `manifest.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bundle {
    pub schema_version: u32,
    pub bundle_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub fingerprint: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_language: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub bundle_type: Option<BundleType>,
    pub inputs: BundleInputs,
    pub repos: Vec<RepoRecord>,
    pub index: SearchIndexDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_files: Option<Vec<SkippedFileEntry>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BundleInputs {
    pub repos: Vec<RepoEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

/// Maximum number of skipped-file entries persisted in a manifest.
pub const MAX_SKIPPED_FILES_IN_MANIFEST: usize = 200;

// ---------------------------------------------------------------------------
// Fingerprint / dedup / locks / progress
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupStatus {
    Complete,
    InProgress,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupEntry {
    pub bundle_id: String,
    pub status: DedupStatus,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPhase {
    Starting,
    Cloning,
    Ingesting,
    Indexing,
    Analyzing,
    Generating,
    Finalizing,
    Complete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InProgressLock {
    pub bundle_id: String,
    pub fingerprint: String,
    pub task_id: String,
    pub status: LockPhase,
    pub started_at: String,
    pub repos: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Starting,
    Cloning,
    Downloading,
    Ingesting,
    Crawling,
    Indexing,
    Analyzing,
    Generating,
    Finalizing,
    Complete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskTerminal {
    Ok { bundle_id: String },
    Err { error: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressTask {
    pub task_id: String,
    pub fingerprint: String,
    pub phase: TaskPhase,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub message: String,
    pub repos: Vec<String>,
    pub started_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TaskTerminal>,
}

// ---------------------------------------------------------------------------
// Dependency graph
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Symbol,
    Module,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Range {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphEdgeType {
    Imports,
    ImportsResolved,
    References,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Exact,
    Heuristic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphEdge {
    pub edge_type: GraphEdgeType,
    pub from: String,
    pub to: String,
    pub method: Method,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

// ---------------------------------------------------------------------------
// Evidence + claims
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evidence {
    pub file: String,
    pub range: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Supported,
    Inferred,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub text: String,
    pub confidence: f64,
    pub kind: String,
    pub status: ClaimStatus,
    pub evidence: Vec<Evidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub why_inferred: Option<String>,
}

// ---------------------------------------------------------------------------
// Trace edges
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEdgeType {
    TestedBy,
    Documents,
    Implements,
    RelatesTo,
    EntrypointOf,
    DependsOn,
}

impl TraceEdgeType {
    /// Types which MUST carry at least one source `Evidence` to be written.
    pub fn requires_evidence(self) -> bool {
        matches!(self, TraceEdgeType::TestedBy | TraceEdgeType::Documents | TraceEdgeType::Implements)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tested_by" => Some(Self::TestedBy),
            "documents" => Some(Self::Documents),
            "implements" => Some(Self::Implements),
            "relates_to" => Some(Self::RelatesTo),
            "entrypoint_of" => Some(Self::EntrypointOf),
            "depends_on" => Some(Self::DependsOn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestedBy => "tested_by",
            Self::Documents => "documents",
            Self::Implements => "implements",
            Self::RelatesTo => "relates_to",
            Self::EntrypointOf => "entrypoint_of",
            Self::DependsOn => "depends_on",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceEndpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceEdge {
    pub id: String,
    pub source: TraceEndpoint,
    pub target: TraceEndpoint,
    #[serde(rename = "type")]
    pub edge_type: TraceEdgeType,
    pub confidence: f64,
    pub method: Method,
    #[serde(default)]
    pub sources: Vec<Evidence>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// `BTreeMap` key for a trace edge's natural identity.
pub fn trace_edge_key(source: &TraceEndpoint, target: &TraceEndpoint, edge_type: TraceEdgeType) -> String {
    format!("{}:{}|{}:{}|{}", source.kind, source.id, target.kind, target.id, edge_type.as_str())
}

// ---------------------------------------------------------------------------
// Paths (per-bundle fixed layout)
// ---------------------------------------------------------------------------

/// All fixed on-disk paths for one bundle under one storage root.
#[derive(Clone, Debug)]
pub struct Paths {
    pub bundle_dir: PathBuf,
    pub manifest: PathBuf,
    pub start_here: PathBuf,
    pub agents_md: PathBuf,
    pub overview_md: PathBuf,
    pub search_db: PathBuf,
    pub repos_dir: PathBuf,
    pub analysis_dir: PathBuf,
    pub analysis_facts: PathBuf,
    pub deps_cache: PathBuf,
    pub trace_db: PathBuf,
    pub trace_json: PathBuf,
    pub cards_dir: PathBuf,
}

pub type Manifest = Bundle;
