//! Error taxonomy for the bundle lifecycle + evidence engine.
//!
//! Every variant carries a stable `code()` string and, where useful, a
//! [`NextAction`] pointing the caller at the right follow-up tool/parameters.
//! Recoverable conditions (skipped files, acquisition fallbacks) are never
//! represented here — they accumulate as `warnings` on the success value
//! instead. Only invariant violations and post-validation failures become
//! an `Err`.

use std::path::PathBuf;

use serde::Serialize;

/// A hint pointing the caller at the tool/arguments that would resolve an error.
#[derive(Debug, Clone, Serialize)]
pub struct NextAction {
    pub tool_name: String,
    pub suggested_args: serde_json::Value,
    pub reason: String,
}

impl NextAction {
    pub fn new(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { tool_name: tool_name.into(), suggested_args: serde_json::json!({}), reason: reason.into() }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.suggested_args = args;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("bundle not found: {id}")]
    BundleNotFound { id: String, hint: String },

    #[error("no writable storage root available")]
    StorageUnavailable { tried: Vec<PathBuf> },

    #[error("bundle failed completeness validation: missing {missing_components:?}")]
    BundleValidationError { bundle_id: String, missing_components: Vec<String> },

    #[error("bundle creation already in progress for fingerprint {fingerprint}")]
    BundleInProgress {
        task_id: String,
        started_at: String,
        repos: Vec<String>,
        fingerprint: String,
    },

    #[error("bundle creation failed: {message}")]
    BundleCreationError { message: String, #[source] source: Option<Box<PreflightError>> },

    #[error("search index missing or unreadable: {path}")]
    IndexCorrupt { path: PathBuf },

    #[error("github acquisition failed: {message}")]
    GitHubError { message: String },

    #[error("web crawl failed: {message}")]
    CrawlError { message: String },

    #[error("ingestion failed: {message}")]
    IngestError { message: String },

    #[error("invalid configuration: {message}")]
    ConfigError { message: String },

    #[error("operation failed: {message}")]
    OperationFailed { message: String, #[source] source: Option<Box<dyn std::error::Error + Send + Sync>> },
}

impl PreflightError {
    /// Stable machine-readable code string, suitable for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            PreflightError::BundleNotFound { .. } => "BUNDLE_NOT_FOUND",
            PreflightError::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            PreflightError::BundleValidationError { .. } => "BUNDLE_VALIDATION_ERROR",
            PreflightError::BundleInProgress { .. } => "BUNDLE_IN_PROGRESS",
            PreflightError::BundleCreationError { .. } => "BUNDLE_CREATION_ERROR",
            PreflightError::IndexCorrupt { .. } => "INDEX_CORRUPT",
            PreflightError::GitHubError { .. } => "GITHUB_ERROR",
            PreflightError::CrawlError { .. } => "CRAWL_ERROR",
            PreflightError::IngestError { .. } => "INGEST_ERROR",
            PreflightError::ConfigError { .. } => "CONFIG_ERROR",
            PreflightError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }

    /// Actionable next step for the caller, where one is known.
    pub fn next_action(&self) -> Option<NextAction> {
        match self {
            PreflightError::BundleNotFound { id, .. } => Some(
                NextAction::new("list_bundles", "confirm the bundle id is correct and still exists")
                    .with_args(serde_json::json!({ "hint": format!("'{id}' should be a UUID") })),
            ),
            PreflightError::IndexCorrupt { .. } => Some(NextAction::new(
                "repair_bundle",
                "the search index is missing or unreadable; repair rebuilds it from normalized files",
            )),
            PreflightError::BundleInProgress { task_id, .. } => Some(
                NextAction::new("get_task_status", "poll the in-progress build by task id")
                    .with_args(serde_json::json!({ "taskId": task_id })),
            ),
            PreflightError::GitHubError { .. } => Some(NextAction::new(
                "create_bundle",
                "retry with a local path, or a wider gitCloneTimeoutMs, if the clone keeps failing",
            )),
            PreflightError::BundleValidationError { bundle_id, .. } => Some(
                NextAction::new("repair_bundle", "re-run repair to regenerate the missing derived artifacts")
                    .with_args(serde_json::json!({ "bundleId": bundle_id })),
            ),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PreflightError>;
