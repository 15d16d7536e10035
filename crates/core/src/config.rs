//! Runtime configuration, loaded from a TOML file or built programmatically.
//!
//! Mirrors the teacher's `ScanConfig` (`crates/core/src/types.rs`): a plain
//! struct with sane `Default`s, constructed once at startup and threaded
//! through by reference.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PreflightError, Result};

/// AST engine selection for the dependency graph engine's import extraction.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AstEngine {
    /// Parser-backed extraction (tree-sitter), when the `treesitter` feature is compiled in.
    Wasm,
    /// Anything else forces the regex-heuristic path.
    Heuristic,
}

impl Default for AstEngine {
    fn default() -> Self {
        AstEngine::Wasm
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ordered storage roots; first is primary (writes prefer it).
    pub storage_dirs: Vec<PathBuf>,
    /// Working directory for in-progress bundles.
    pub tmp_dir: PathBuf,
    /// Per-file ingest cap, in bytes.
    pub max_file_bytes: u64,
    /// Per-bundle ingest cap, in bytes.
    pub max_total_bytes: u64,
    /// Clone wall-clock limit, in milliseconds.
    pub git_clone_timeout_ms: u64,
    pub ast_engine: AstEngine,
    /// Toggles analyzers that run during build (facts, advanced analysis).
    pub analysis_mode: bool,
    /// Semaphore permit count for concurrent bundle creation.
    pub bundle_creation_limiter: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dirs: vec![default_storage_dir()],
            tmp_dir: std::env::temp_dir().join("bundles-wip"),
            max_file_bytes: 1_000_000,
            max_total_bytes: 200_000_000,
            git_clone_timeout_ms: 30_000,
            ast_engine: AstEngine::default(),
            analysis_mode: true,
            bundle_creation_limiter: 4,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs_home().join(".preflight").join("bundles-root")
}

/// Minimal home-directory resolution without pulling in the `dirs` crate —
/// the only place this engine needs it, and `$HOME`/`USERPROFILE` cover the
/// platforms this workspace targets.
fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PreflightError::ConfigError { message: format!("reading {}: {e}", path.display()) })?;
        toml::from_str(&text).map_err(|e| PreflightError::ConfigError { message: format!("parsing {}: {e}", path.display()) })
    }

    /// `true` when the dependency graph engine should attempt parser-backed extraction.
    pub fn use_parser_engine(&self) -> bool {
        self.ast_engine == AstEngine::Wasm && cfg!(feature = "treesitter")
    }
}
