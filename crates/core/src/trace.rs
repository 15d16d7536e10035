//! Trace store — §4.J.
//!
//! A plain `rusqlite` table under `trace/trace.sqlite3` (no FTS: lookups are
//! by exact id/type, not free text). Every successful `upsert` re-exports the
//! full table to `trace/trace.json` via `serde_json`, the same dump-on-write
//! idiom the rest of this engine uses for its JSON artifacts.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{PreflightError, Result};
use crate::model::{Evidence, Method, TraceEdge, TraceEdgeType, TraceEndpoint, trace_edge_key};

fn db_err(path: &Path, e: rusqlite::Error) -> PreflightError {
    tracing::warn!(error = %e, path = %path.display(), "trace store operation failed");
    PreflightError::IndexCorrupt { path: path.to_path_buf() }
}

fn open(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PreflightError::OperationFailed { message: format!("failed to create trace directory: {e}"), source: Some(Box::new(e)) })?;
    }
    let conn = Connection::open(db_path).map_err(|e| db_err(db_path, e))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            edge_key TEXT UNIQUE,
            source_type TEXT, source_id TEXT,
            target_type TEXT, target_id TEXT,
            edge_type TEXT,
            confidence REAL,
            method TEXT,
            sources TEXT,
            notes TEXT,
            created_at TEXT,
            updated_at TEXT
        );",
    )
    .map_err(|e| db_err(db_path, e))?;
    Ok(conn)
}

pub struct UpsertOutcome {
    pub upserted: usize,
    pub ids: Vec<String>,
    pub warnings: Vec<String>,
    pub blocked: Vec<BlockedEdge>,
}

pub struct BlockedEdge {
    pub edge_key: String,
    /// Stable machine-readable code, e.g. `MISSING_EVIDENCE`, `INVALID_CONFIDENCE`.
    pub code: &'static str,
    pub reason: String,
}

fn validate_edge(edge: &TraceEdge) -> std::result::Result<(), (&'static str, String)> {
    if !(0.0..=1.0).contains(&edge.confidence) {
        return Err(("INVALID_CONFIDENCE", format!("confidence {} out of range [0,1]", edge.confidence)));
    }
    if edge.edge_type.requires_evidence() && edge.sources.is_empty() {
        return Err(("MISSING_EVIDENCE", format!("edge type '{}' requires at least one source", edge.edge_type.as_str())));
    }
    if edge.method == Method::Exact && edge.sources.iter().all(|s| s.snippet.is_none()) {
        return Err(("METHOD_EVIDENCE_MISMATCH", "method=exact requires at least one source with a snippet".to_string()));
    }
    Ok(())
}

/// Validate and (unless `dry_run`) idempotently insert/update edges keyed on
/// `(source, target, type)`. Always re-exports `trace/trace.json` after a
/// real write.
pub fn upsert(db_path: &Path, json_path: &Path, edges: &[TraceEdge], dry_run: bool) -> Result<UpsertOutcome> {
    let mut outcome = UpsertOutcome { upserted: 0, ids: vec![], warnings: vec![], blocked: vec![] };
    let mut accepted: Vec<&TraceEdge> = Vec::new();

    for edge in edges {
        let key = trace_edge_key(&edge.source, &edge.target, edge.edge_type);
        match validate_edge(edge) {
            Ok(()) => accepted.push(edge),
            Err((code, reason)) => outcome.blocked.push(BlockedEdge { edge_key: key, code, reason }),
        }
    }

    if dry_run {
        outcome.warnings.push("dryRun: no writes performed".to_string());
        outcome.ids = accepted.iter().map(|e| e.id.clone()).collect();
        return Ok(outcome);
    }

    let conn = open(db_path)?;
    for edge in &accepted {
        let key = trace_edge_key(&edge.source, &edge.target, edge.edge_type);
        let sources_json = serde_json::to_string(&edge.sources).unwrap_or_default();
        let notes_json = serde_json::to_string(&edge.notes).unwrap_or_default();
        conn.execute(
            "INSERT INTO edges (id, edge_key, source_type, source_id, target_type, target_id, edge_type, confidence, method, sources, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(edge_key) DO UPDATE SET
                confidence = excluded.confidence, method = excluded.method,
                sources = excluded.sources, notes = excluded.notes, updated_at = excluded.updated_at",
            rusqlite::params![
                edge.id, key, edge.source.kind, edge.source.id, edge.target.kind, edge.target.id,
                edge.edge_type.as_str(), edge.confidence,
                if edge.method == Method::Exact { "exact" } else { "heuristic" },
                sources_json, notes_json, edge.created_at, edge.updated_at,
            ],
        )
        .map_err(|e| db_err(db_path, e))?;
        outcome.ids.push(edge.id.clone());
        outcome.upserted += 1;
    }

    export_json(db_path, json_path)?;
    info!(upserted = outcome.upserted, blocked = outcome.blocked.len(), "trace upsert complete");
    Ok(outcome)
}

pub struct QueryFilters<'a> {
    pub source_id: Option<&'a str>,
    pub target_id: Option<&'a str>,
    pub edge_type: Option<TraceEdgeType>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub limit: usize,
}

pub struct QueryResult {
    pub edges: Vec<TraceEdge>,
    pub reason: Option<&'static str>,
}

pub fn query(db_path: &Path, filters: &QueryFilters) -> Result<QueryResult> {
    if !db_path.exists() {
        return Ok(QueryResult { edges: vec![], reason: Some("not_initialized") });
    }
    let conn = open(db_path)?;

    let mut sql = "SELECT id, source_type, source_id, target_type, target_id, edge_type, confidence, method, sources, notes, created_at, updated_at FROM edges WHERE 1=1".to_string();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

    if let Some(sid) = filters.source_id {
        sql.push_str(" AND source_id = ?");
        params.push(Box::new(sid.to_string()));
    }
    if let Some(tid) = filters.target_id {
        sql.push_str(" AND target_id = ?");
        params.push(Box::new(tid.to_string()));
    }
    if let Some(et) = filters.edge_type {
        sql.push_str(" AND edge_type = ?");
        params.push(Box::new(et.as_str().to_string()));
    }
    if let Some(min) = filters.min_confidence {
        sql.push_str(" AND confidence >= ?");
        params.push(Box::new(min));
    }
    if let Some(max) = filters.max_confidence {
        sql.push_str(" AND confidence <= ?");
        params.push(Box::new(max));
    }
    sql.push_str(" ORDER BY created_at ASC LIMIT ?");
    params.push(Box::new(filters.limit as i64));

    let mut stmt = conn.prepare(&sql).map_err(|e| db_err(db_path, e))?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            let source_type: String = row.get(1)?;
            let source_id: String = row.get(2)?;
            let target_type: String = row.get(3)?;
            let target_id: String = row.get(4)?;
            let edge_type_str: String = row.get(5)?;
            let method_str: String = row.get(7)?;
            let sources_json: String = row.get(8)?;
            let notes_json: String = row.get(9)?;
            Ok(TraceEdge {
                id: row.get(0)?,
                source: TraceEndpoint { kind: source_type, id: source_id },
                target: TraceEndpoint { kind: target_type, id: target_id },
                edge_type: TraceEdgeType::parse(&edge_type_str).unwrap_or(TraceEdgeType::RelatesTo),
                confidence: row.get(6)?,
                method: if method_str == "exact" { Method::Exact } else { Method::Heuristic },
                sources: serde_json::from_str::<Vec<Evidence>>(&sources_json).unwrap_or_default(),
                notes: serde_json::from_str::<Vec<String>>(&notes_json).unwrap_or_default(),
                created_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        })
        .map_err(|e| db_err(db_path, e))?;

    let mut edges = Vec::new();
    for row in rows {
        edges.push(row.map_err(|e| db_err(db_path, e))?);
    }

    let reason = if edges.is_empty() {
        if filters.source_id.is_some() || filters.target_id.is_some() || filters.edge_type.is_some() {
            Some("no_matching_edges")
        } else {
            Some("no_edges")
        }
    } else {
        None
    };

    Ok(QueryResult { edges, reason })
}

/// Dump the full `edges` table to `trace/trace.json`.
pub fn export_json(db_path: &Path, json_path: &Path) -> Result<usize> {
    let result = query(db_path, &QueryFilters { source_id: None, target_id: None, edge_type: None, min_confidence: None, max_confidence: None, limit: 1_000_000 })?;

    if let Some(parent) = json_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PreflightError::OperationFailed { message: format!("failed to create trace export directory: {e}"), source: Some(Box::new(e)) })?;
    }
    let json = serde_json::to_vec_pretty(&result.edges).map_err(|e| PreflightError::OperationFailed { message: format!("failed to serialize trace export: {e}"), source: Some(Box::new(e)) })?;
    let tmp = json_path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| PreflightError::OperationFailed { message: format!("failed to write trace export: {e}"), source: Some(Box::new(e)) })?;
    std::fs::rename(&tmp, json_path).map_err(|e| PreflightError::OperationFailed { message: format!("failed to publish trace export: {e}"), source: Some(Box::new(e)) })?;

    debug!(count = result.edges.len(), "trace exported to json");
    Ok(result.edges.len())
}

/// Heuristic suggestions: pair code files with companion test files by naming
/// convention, skipping pairs that already have an edge (keyed `source|target`).
pub fn suggest_tested_by(code_files: &[String], existing_pairs: &HashSet<String>, min_confidence: f64, limit: usize) -> Vec<(String, String, f64, &'static str)> {
    let mut out = Vec::new();
    for file in code_files {
        if is_test_file(file) {
            continue;
        }
        let Some((candidate, confidence, why)) = companion_test_candidate(file, code_files) else { continue };
        let key = format!("{file}|{candidate}");
        if existing_pairs.contains(&key) || confidence < min_confidence {
            continue;
        }
        out.push((file.clone(), candidate, confidence, why));
        if out.len() >= limit {
            break;
        }
    }
    out
}

fn is_test_file(path: &str) -> bool {
    path.contains(".test.") || path.contains("_test.") || path.contains("test_") || path.contains("/tests/")
}

fn companion_test_candidate(file: &str, all_files: &[String]) -> Option<(String, f64, &'static str)> {
    let path = Path::new(file);
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    let dir = path.parent().map(|p| p.to_string_lossy().to_string()).unwrap_or_default();

    let candidates: &[(String, f64, &'static str)] = &[
        (format!("{dir}/{stem}.test.{ext}"), 0.9, "same-directory *.test.ext convention"),
        (format!("{dir}/test_{stem}.{ext}"), 0.85, "same-directory test_*.ext convention"),
        (format!("{dir}/{stem}_test.{ext}"), 0.85, "same-directory *_test.ext convention"),
        (format!("tests/{stem}.{ext}"), 0.6, "top-level tests/ directory convention"),
    ];

    candidates.iter().find(|(path, _, _)| all_files.contains(path)).map(|(p, c, w)| (p.clone(), *c, *w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_rfc3339;

    fn edge(id: &str, edge_type: TraceEdgeType, sources: Vec<Evidence>) -> TraceEdge {
        let now = now_rfc3339();
        TraceEdge {
            id: id.to_string(),
            source: TraceEndpoint { kind: "file".to_string(), id: "src/a.rs".to_string() },
            target: TraceEndpoint { kind: "file".to_string(), id: "tests/a_test.rs".to_string() },
            edge_type,
            confidence: 0.8,
            method: Method::Heuristic,
            sources,
            notes: vec![],
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn mandatory_evidence_edge_without_source_is_blocked() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("trace.sqlite3");
        let json = tmp.path().join("trace.json");
        let e = edge("e1", TraceEdgeType::TestedBy, vec![]);

        let outcome = upsert(&db, &json, &[e], false).unwrap();
        assert_eq!(outcome.upserted, 0);
        assert_eq!(outcome.blocked.len(), 1);
        assert_eq!(outcome.blocked[0].code, "MISSING_EVIDENCE");
    }

    #[test]
    fn valid_edge_upserts_and_exports() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("trace.sqlite3");
        let json = tmp.path().join("trace.json");
        let evidence = Evidence { file: "tests/a_test.rs".to_string(), range: crate::model::Range { start_line: 1, start_col: 0, end_line: 1, end_col: 1 }, uri: None, snippet: None, snippet_sha256: None, note: None };
        let e = edge("e1", TraceEdgeType::RelatesTo, vec![evidence]);

        let outcome = upsert(&db, &json, &[e], false).unwrap();
        assert_eq!(outcome.upserted, 1);
        assert!(json.exists());
    }

    #[test]
    fn dry_run_performs_no_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("trace.sqlite3");
        let json = tmp.path().join("trace.json");
        let evidence = Evidence { file: "tests/a_test.rs".to_string(), range: crate::model::Range { start_line: 1, start_col: 0, end_line: 1, end_col: 1 }, uri: None, snippet: None, snippet_sha256: None, note: None };
        let e = edge("e1", TraceEdgeType::RelatesTo, vec![evidence]);

        upsert(&db, &json, &[e], true).unwrap();
        let result = query(&db, &QueryFilters { source_id: None, target_id: None, edge_type: None, min_confidence: None, max_confidence: None, limit: 10 }).unwrap();
        assert!(result.edges.is_empty());
    }

    #[test]
    fn empty_query_without_filters_reports_no_edges() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("trace.sqlite3");
        open(&db).unwrap();
        let result = query(&db, &QueryFilters { source_id: None, target_id: None, edge_type: None, min_confidence: None, max_confidence: None, limit: 10 }).unwrap();
        assert_eq!(result.reason, Some("no_edges"));
    }

    #[test]
    fn suggest_finds_companion_test_by_convention() {
        let files = vec!["src/a.rs".to_string(), "src/a_test.rs".to_string()];
        let suggestions = suggest_tested_by(&files, &HashSet::new(), 0.5, 10);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].1, "src/a_test.rs");
    }
}
