//! Full-text search index — §4.C.
//!
//! One SQLite database per bundle (`indexes/search.sqlite3`), backed by
//! `rusqlite`'s `bundled` feature so FTS5 is always available regardless of
//! the host's system SQLite. A plain `files` table tracks per-file content
//! hashes for incremental updates; an `fts5` virtual table holds one row per
//! non-empty normalized line.

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{PreflightError, Result};
use crate::model::FileKind;
use crate::tokenizer::Tokenizer;

fn open(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PreflightError::OperationFailed { message: format!("failed to create index directory: {e}"), source: Some(Box::new(e)) })?;
    }
    let conn = Connection::open(db_path).map_err(|e| db_err(db_path, e))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(|e| db_err(db_path, e))?;
    Ok(conn)
}

fn kind_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Doc => "doc",
        FileKind::Code => "code",
    }
}

/// One file to index: its identity plus the normalized text to split into lines.
pub struct IndexableFile<'a> {
    pub path: &'a str,
    pub repo: &'a str,
    pub kind: FileKind,
    pub content_hash: &'a str,
    pub normalized_text: &'a str,
}

/// Drop and recreate both tables, then index every file from scratch.
pub fn rebuild(db_path: &Path, files: &[IndexableFile]) -> Result<usize> {
    let mut conn = open(db_path)?;
    let tx = conn.transaction().map_err(|e| db_err(db_path, e))?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS lines;
         DROP TABLE IF EXISTS files;
         CREATE TABLE files (path TEXT PRIMARY KEY, repo TEXT, kind TEXT, content_hash TEXT);
         CREATE VIRTUAL TABLE lines USING fts5(path UNINDEXED, repo UNINDEXED, kind UNINDEXED, line_no UNINDEXED, text);",
    )
    .map_err(|e| db_err(db_path, e))?;

    let mut total = 0usize;
    for file in files {
        insert_file(&tx, file).map_err(|e| db_err(db_path, e))?;
        total += 1;
    }
    tx.commit().map_err(|e| db_err(db_path, e))?;
    info!(indexed = total, "search index rebuilt");
    Ok(total)
}

fn insert_file(conn: &Connection, file: &IndexableFile) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO files (path, repo, kind, content_hash) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![file.path, file.repo, kind_str(file.kind), file.content_hash],
    )?;
    let mut stmt = conn.prepare_cached("INSERT INTO lines (path, repo, kind, line_no, text) VALUES (?1, ?2, ?3, ?4, ?5)")?;
    for (i, line) in file.normalized_text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        stmt.execute(rusqlite::params![file.path, file.repo, kind_str(file.kind), (i + 1) as i64, line])?;
    }
    Ok(())
}

fn remove_file(conn: &Connection, path: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM lines WHERE path = ?1", [path])?;
    conn.execute("DELETE FROM files WHERE path = ?1", [path])?;
    Ok(())
}

#[derive(Debug, Default, serde::Serialize)]
pub struct IncrementalResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub total_indexed: usize,
}

/// Diff `files` against the `files` table by `content_hash`, re-indexing only
/// what changed. Files present in the table but absent from `files` are removed.
pub fn incremental_update(db_path: &Path, files: &[IndexableFile]) -> Result<IncrementalResult> {
    let mut conn = open(db_path)?;
    ensure_schema(&conn).map_err(|e| db_err(db_path, e))?;

    let existing: std::collections::HashMap<String, String> = {
        let mut stmt = conn.prepare("SELECT path, content_hash FROM files").map_err(|e| db_err(db_path, e))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))).map_err(|e| db_err(db_path, e))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let incoming_paths: std::collections::HashSet<&str> = files.iter().map(|f| f.path).collect();
    let mut result = IncrementalResult::default();

    let tx = conn.transaction().map_err(|e| db_err(db_path, e))?;
    for file in files {
        match existing.get(file.path) {
            Some(hash) if hash == file.content_hash => {
                result.unchanged += 1;
            }
            Some(_) => {
                remove_file(&tx, file.path).map_err(|e| db_err(db_path, e))?;
                insert_file(&tx, file).map_err(|e| db_err(db_path, e))?;
                result.updated += 1;
            }
            None => {
                insert_file(&tx, file).map_err(|e| db_err(db_path, e))?;
                result.added += 1;
            }
        }
    }
    for existing_path in existing.keys() {
        if !incoming_paths.contains(existing_path.as_str()) {
            remove_file(&tx, existing_path).map_err(|e| db_err(db_path, e))?;
            result.removed += 1;
        }
    }
    tx.commit().map_err(|e| db_err(db_path, e))?;

    result.total_indexed = files.len();
    debug!(?result, "incremental index update complete");
    Ok(result)
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (path TEXT PRIMARY KEY, repo TEXT, kind TEXT, content_hash TEXT);
         CREATE VIRTUAL TABLE IF NOT EXISTS lines USING fts5(path UNINDEXED, repo UNINDEXED, kind UNINDEXED, line_no UNINDEXED, text);",
    )
}

fn db_err(path: &Path, e: rusqlite::Error) -> PreflightError {
    tracing::warn!(error = %e, path = %path.display(), "search index operation failed");
    PreflightError::IndexCorrupt { path: path.to_path_buf() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Docs,
    Code,
    All,
}

#[derive(Debug, serde::Serialize)]
pub struct SearchHit {
    pub path: String,
    pub repo: String,
    pub kind: String,
    pub line_no: i64,
    pub snippet: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_context: Option<CodeContext>,
}

/// Surrounding context for a hit, extracted when a bundle root is supplied.
#[derive(Debug, serde::Serialize)]
pub struct CodeContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclosing_symbol: Option<String>,
    pub surrounding_lines: Vec<(i64, String)>,
}

/// Translate the two accepted query dialects into an FTS5 `MATCH` expression:
/// raw FTS syntax when prefixed `fts:`, otherwise a simple AND-of-terms with
/// prefix (wildcard) expansion on every term.
fn build_match_expr(query: &str) -> String {
    if let Some(raw) = query.strip_prefix("fts:") {
        return raw.to_string();
    }
    query
        .split_whitespace()
        .map(|term| {
            let escaped = term.replace('"', "\"\"");
            format!("\"{escaped}\"*")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn scope_clause(scope: Scope) -> &'static str {
    match scope {
        Scope::All => "",
        Scope::Docs => " AND kind = 'doc'",
        Scope::Code => " AND kind = 'code'",
    }
}

/// Search the index for `query`, optionally scoped to docs or code, ordered
/// deterministically by (score ascending — BM25 is lower-is-better, path,
/// lineNo). When `bundle_root` is supplied, each hit's surrounding lines and
/// enclosing function/class name are attached as [`CodeContext`].
pub fn search(db_path: &Path, query: &str, scope: Scope, limit: usize, bundle_root: Option<&Path>) -> Result<Vec<SearchHit>> {
    let conn = open(db_path)?;
    ensure_schema(&conn).map_err(|e| db_err(db_path, e))?;

    let match_expr = build_match_expr(query);
    let sql = format!(
        "SELECT path, repo, kind, line_no, text, bm25(lines) AS score FROM lines
         WHERE lines MATCH ?1{} ORDER BY score ASC, path ASC, line_no ASC LIMIT ?2",
        scope_clause(scope)
    );

    let mut stmt = conn.prepare(&sql).map_err(|e| db_err(db_path, e))?;
    let rows = stmt
        .query_map(rusqlite::params![match_expr, limit as i64], |row| {
            Ok(SearchHit {
                path: row.get(0)?,
                repo: row.get(1)?,
                kind: row.get(2)?,
                line_no: row.get(3)?,
                snippet: row.get(4)?,
                score: row.get(5)?,
                code_context: None,
            })
        })
        .map_err(|e| db_err(db_path, e))?;

    let mut hits = Vec::new();
    for row in rows {
        let mut hit = row.map_err(|e| db_err(db_path, e))?;
        if let Some(root) = bundle_root {
            hit.code_context = extract_code_context(root, &hit.path, hit.line_no);
        }
        hits.push(hit);
    }
    Ok(hits)
}

/// Read the on-disk file at `<bundle_root>/<path>`, collecting up to three
/// lines of context on either side of `line_no` and walking backward for the
/// nearest enclosing `fn`/`def`/`class`/`function` declaration. Best-effort:
/// returns `None` if the file cannot be read.
fn extract_code_context(bundle_root: &Path, path: &str, line_no: i64) -> Option<CodeContext> {
    let text = std::fs::read_to_string(bundle_root.join(path)).ok()?;
    let lines: Vec<&str> = text.lines().collect();
    let idx = (line_no as usize).saturating_sub(1);
    if idx >= lines.len() {
        return None;
    }

    const CONTEXT_RADIUS: usize = 3;
    let start = idx.saturating_sub(CONTEXT_RADIUS);
    let end = (idx + CONTEXT_RADIUS + 1).min(lines.len());
    let surrounding_lines = (start..end).map(|i| ((i + 1) as i64, lines[i].to_string())).collect();

    let enclosing_symbol = find_enclosing_symbol(&lines, idx);
    Some(CodeContext { enclosing_symbol, surrounding_lines })
}

fn find_enclosing_symbol(lines: &[&str], from_idx: usize) -> Option<String> {
    let needles: &[(&str, &str)] = &[("fn ", "fn"), ("def ", "def"), ("class ", "class"), ("function ", "function")];
    for i in (0..=from_idx).rev() {
        let trimmed = lines[i].trim_start();
        for (needle, _) in needles {
            if let Some(rest) = trimmed.strip_prefix(needle).or_else(|| trimmed.strip_prefix(&format!("pub {needle}"))).or_else(|| trimmed.strip_prefix(&format!("async {needle}"))) {
                let name: String = rest.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }
    None
}

/// One file's aggregated hits, returned by [`search_advanced`] when
/// `group_by_file` is set.
#[derive(Debug, serde::Serialize)]
pub struct GroupedHit {
    pub path: String,
    pub hit_count: usize,
    pub lines: Vec<SearchHit>,
    pub top_snippet: String,
    pub top_score: f64,
}

#[derive(Debug, Default)]
pub struct AdvancedSearchOptions<'a> {
    pub extensions: Option<&'a [String]>,
    pub group_by_file: bool,
    pub bundle_root: Option<&'a Path>,
    pub token_budget: Option<(usize, &'a dyn Tokenizer)>,
}

pub enum AdvancedSearchResult {
    Flat(Vec<SearchHit>),
    Grouped(Vec<GroupedHit>),
}

/// `search` plus an extension allowlist, optional per-file grouping, and a
/// token-budget hint: once the cumulative token count of included snippets
/// would exceed the budget, trailing results are dropped rather than
/// returned half-formed.
pub fn search_advanced(db_path: &Path, query: &str, scope: Scope, limit: usize, opts: &AdvancedSearchOptions) -> Result<AdvancedSearchResult> {
    let mut hits = search(db_path, query, scope, limit, opts.bundle_root)?;

    if let Some(exts) = opts.extensions {
        hits.retain(|h| exts.iter().any(|ext| h.path.ends_with(&format!(".{ext}"))));
    }

    if let Some((budget, tokenizer)) = opts.token_budget {
        let mut spent = 0usize;
        let mut kept = Vec::new();
        for hit in hits {
            let cost = tokenizer.count_tokens(&hit.snippet);
            if spent + cost > budget && !kept.is_empty() {
                break;
            }
            spent += cost;
            kept.push(hit);
        }
        hits = kept;
    }

    if !opts.group_by_file {
        return Ok(AdvancedSearchResult::Flat(hits));
    }

    let mut by_path: std::collections::BTreeMap<String, Vec<SearchHit>> = std::collections::BTreeMap::new();
    for hit in hits {
        by_path.entry(hit.path.clone()).or_default().push(hit);
    }

    let mut groups: Vec<GroupedHit> = by_path
        .into_iter()
        .map(|(path, lines)| {
            let top = lines.iter().min_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal)).expect("group always has at least one line");
            let top_snippet = top.snippet.clone();
            let top_score = top.score;
            GroupedHit { path, hit_count: lines.len(), lines, top_snippet, top_score }
        })
        .collect();
    groups.sort_by(|a, b| a.top_score.partial_cmp(&b.top_score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.path.cmp(&b.path)));

    Ok(AdvancedSearchResult::Grouped(groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::BytesEstimateTokenizer;

    fn file<'a>(path: &'a str, text: &'a str, hash: &'a str) -> IndexableFile<'a> {
        IndexableFile { path, repo: "o/r", kind: FileKind::Code, content_hash: hash, normalized_text: text }
    }

    #[test]
    fn rebuild_indexes_non_empty_lines_only() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let f = file("a.rs", "fn main() {\n\n    println!(\"hi\");\n}\n", "h1");
        let n = rebuild(&db, &[f]).unwrap();
        assert_eq!(n, 1);

        let hits = search(&db, "println", Scope::All, 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line_no, 3);
    }

    #[test]
    fn incremental_update_detects_added_updated_removed_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");

        let a = file("a.rs", "alpha\n", "h1");
        let b = file("b.rs", "beta\n", "h2");
        rebuild(&db, &[a, b]).unwrap();

        let a2 = file("a.rs", "alpha\n", "h1");
        let b2 = file("b.rs", "beta changed\n", "h2-changed");
        let c = file("c.rs", "gamma\n", "h3");
        let result = incremental_update(&db, &[a2, b2, c]).unwrap();

        assert_eq!(result.unchanged, 1);
        assert_eq!(result.updated, 1);
        assert_eq!(result.added, 1);
        assert_eq!(result.removed, 0);
    }

    #[test]
    fn scope_filters_by_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let code = IndexableFile { path: "a.rs", repo: "o/r", kind: FileKind::Code, content_hash: "h1", normalized_text: "widget lookup\n" };
        let doc = IndexableFile { path: "a.md", repo: "o/r", kind: FileKind::Doc, content_hash: "h2", normalized_text: "widget guide\n" };
        rebuild(&db, &[code, doc]).unwrap();

        let docs_only = search(&db, "widget", Scope::Docs, 10, None).unwrap();
        assert_eq!(docs_only.len(), 1);
        assert_eq!(docs_only[0].path, "a.md");
    }

    #[test]
    fn raw_fts_dialect_is_passed_through_unescaped() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let f = file("a.rs", "alpha beta\ngamma delta\n", "h1");
        rebuild(&db, &[f]).unwrap();

        let hits = search(&db, "fts:alpha OR gamma", Scope::All, 10, None).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn default_dialect_expands_prefix_per_term() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let f = file("a.py", "def bar_helper(): pass\n", "h1");
        rebuild(&db, &[f]).unwrap();

        let hits = search(&db, "bar", Scope::All, 10, None).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn code_context_finds_enclosing_function() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let text = "fn outer() {\n    let x = 1;\n    println!(\"{x}\");\n}\n";
        let f = file("a.rs", text, "h1");
        rebuild(&db, &[f]).unwrap();
        std::fs::write(tmp.path().join("a.rs"), text).unwrap();

        let hits = search(&db, "println", Scope::All, 10, Some(tmp.path())).unwrap();
        assert_eq!(hits.len(), 1);
        let ctx = hits[0].code_context.as_ref().unwrap();
        assert_eq!(ctx.enclosing_symbol.as_deref(), Some("outer"));
        assert!(ctx.surrounding_lines.len() >= 3);
    }

    #[test]
    fn search_advanced_filters_by_extension_and_groups_by_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let rs = file("a.rs", "widget one\nwidget two\n", "h1");
        let md = file("a.md", "widget guide\n", "h2");
        rebuild(&db, &[rs, md]).unwrap();

        let opts = AdvancedSearchOptions { extensions: Some(&["rs".to_string()]), group_by_file: true, bundle_root: None, token_budget: None };
        let result = search_advanced(&db, "widget", Scope::All, 10, &opts).unwrap();
        match result {
            AdvancedSearchResult::Grouped(groups) => {
                assert_eq!(groups.len(), 1);
                assert_eq!(groups[0].path, "a.rs");
                assert_eq!(groups[0].hit_count, 2);
            }
            AdvancedSearchResult::Flat(_) => panic!("expected grouped result"),
        }
    }

    #[test]
    fn search_advanced_respects_token_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("search.sqlite3");
        let f = file("a.rs", "widget alpha line one here\nwidget beta line two here\nwidget gamma line three here\n", "h1");
        rebuild(&db, &[f]).unwrap();

        let tok = BytesEstimateTokenizer;
        let opts = AdvancedSearchOptions { extensions: None, group_by_file: false, bundle_root: None, token_budget: Some((5, &tok)) };
        let result = search_advanced(&db, "widget", Scope::All, 10, &opts).unwrap();
        match result {
            AdvancedSearchResult::Flat(hits) => assert!(hits.len() < 3),
            AdvancedSearchResult::Grouped(_) => panic!("expected flat result"),
        }
    }
}
