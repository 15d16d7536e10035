//! Dependency graph engine — §4.I.
//!
//! Two modes sharing one output schema: target mode extracts and resolves
//! imports for a single file; global mode walks every indexable file in a
//! bundle and reports module-level coupling. Import extraction is
//! parser-backed when the `treesitter` feature is compiled in and
//! `Config::use_parser_engine()` says so, falling back to per-language regex
//! heuristics otherwise — both paths always compile, matching the way the
//! teacher gates `ast.rs`/`graph.rs` behind its own AST feature.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PreflightError, Result};
use crate::model::{GraphEdge, GraphEdgeType, GraphNode, Method, NodeKind, Range};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeStrategy {
    Skip,
    Truncate,
}

#[derive(Debug, Clone)]
pub struct GraphBudget {
    pub max_files: usize,
    pub max_nodes: usize,
    pub max_edges: usize,
    pub time_budget_ms: u64,
    pub max_file_size_bytes: u64,
    pub size_strategy: SizeStrategy,
}

impl Default for GraphBudget {
    fn default() -> Self {
        Self { max_files: 5_000, max_nodes: 20_000, max_edges: 40_000, time_budget_ms: 30_000, max_file_size_bytes: 2_000_000, size_strategy: SizeStrategy::Skip }
    }
}

struct BudgetTracker {
    budget: GraphBudget,
    started: Instant,
    files_seen: usize,
    nodes_seen: usize,
    edges_seen: usize,
    pub truncated: bool,
    pub truncated_reason: Option<String>,
}

impl BudgetTracker {
    fn new(budget: GraphBudget) -> Self {
        Self { budget, started: Instant::now(), files_seen: 0, nodes_seen: 0, edges_seen: 0, truncated: false, truncated_reason: None }
    }

    /// Returns `false` once any limit is tripped, recording the first reason hit.
    fn check(&mut self, during: &str) -> bool {
        if self.truncated {
            return false;
        }
        if self.files_seen >= self.budget.max_files {
            self.trip("maxFiles");
        } else if self.nodes_seen >= self.budget.max_nodes {
            self.trip("maxNodes");
        } else if self.edges_seen >= self.budget.max_edges {
            self.trip("maxEdges reached");
        } else if self.started.elapsed().as_millis() as u64 > self.budget.time_budget_ms {
            self.trip(&format!("timeBudget exceeded during {during}"));
        }
        !self.truncated
    }

    fn trip(&mut self, reason: &str) {
        self.truncated = true;
        self.truncated_reason = Some(reason.to_string());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PerLanguageStats {
    pub scanned: usize,
    pub parsed: usize,
    pub edges: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct CoverageReport {
    pub scanned_files_count: usize,
    pub parsed_files_count: usize,
    pub per_language: BTreeMap<String, PerLanguageStats>,
    pub per_dir: BTreeMap<String, usize>,
    pub skipped_files: Vec<SkippedFile>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct GraphSignals {
    pub stats: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_value_modules: Option<HighValueModules>,
}

#[derive(Debug, Default, Serialize)]
pub struct HighValueModules {
    pub high_coupling: Vec<String>,
    pub hub: Vec<String>,
    pub entry_point: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct GraphResult {
    pub meta: GraphMeta,
    pub facts: GraphFacts,
    pub signals: GraphSignals,
    pub coverage_report: CoverageReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mermaid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GraphMeta {
    pub mode: &'static str,
}

#[derive(Debug, Default, Serialize)]
pub struct GraphFacts {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

// ---------------------------------------------------------------------------
// Import extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExtractedImport {
    pub module: String,
    pub range: Range,
    pub kind: Method,
}

/// Regex-heuristic import extraction, the fallback (and, without the
/// `treesitter` feature, only) extraction path. `method=heuristic conf=0.7`.
pub fn extract_imports_heuristic(lang: &str, text: &str) -> Vec<ExtractedImport> {
    let patterns: &[&str] = match lang {
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => &[
            r#"(?:import|export)\s+(?:[\w*${},\s]+\s+from\s+)?['"]([^'"]+)['"]"#,
            r#"require\(\s*['"]([^'"]+)['"]\s*\)"#,
        ],
        "py" => &[r#"^\s*from\s+([\w.]+)\s+import"#, r#"^\s*import\s+([\w.]+)"#],
        "go" => &[r#"^\s*"([^"]+)"\s*$"#, r#"import\s+"([^"]+)""#],
        "rs" => &[r#"use\s+((?:crate|self|super)(?:::\w+)*)"#],
        _ => &[],
    };

    let mut out = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        for pat in patterns {
            if let Ok(re) = Regex::new(pat) {
                if let Some(caps) = re.captures(line) {
                    if let Some(m) = caps.get(1) {
                        out.push(ExtractedImport {
                            module: m.as_str().to_string(),
                            range: Range { start_line: (line_idx + 1) as u32, start_col: m.start() as u32, end_line: (line_idx + 1) as u32, end_col: m.end() as u32 },
                            kind: Method::Heuristic,
                        });
                    }
                }
            }
        }
    }
    out
}

/// Strip one layer of quote characters from a string-literal node's text and
/// report the range of the inner specifier (not the surrounding quotes), so
/// callers get the same column convention the regex path's capture groups
/// produce.
#[cfg(feature = "treesitter")]
fn string_node_specifier(node: tree_sitter::Node, source: &[u8]) -> Option<(String, Range)> {
    let text = node.utf8_text(source).ok()?;
    let inner = text.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let start = node.start_position();
    let end = node.end_position();
    let start_col = start.column as u32 + 1;
    let end_col = if end.row == start.row { (end.column as u32).saturating_sub(1) } else { end.column as u32 };
    Some((inner.to_string(), Range { start_line: (start.row + 1) as u32, start_col, end_line: (end.row + 1) as u32, end_col }))
}

#[cfg(feature = "treesitter")]
fn push_node_text(node: tree_sitter::Node, source: &[u8], out: &mut Vec<ExtractedImport>) {
    if let Ok(text) = node.utf8_text(source) {
        let start = node.start_position();
        let end = node.end_position();
        out.push(ExtractedImport {
            module: text.to_string(),
            range: Range { start_line: (start.row + 1) as u32, start_col: start.column as u32, end_line: (end.row + 1) as u32, end_col: end.column as u32 },
            kind: Method::Exact,
        });
    }
}

/// Walk the syntax tree looking for the node kinds each language's grammar
/// uses for imports (`import_statement`/`require(...)` for JS/TS,
/// `import_statement`/`import_from_statement` for Python, `import_spec` for
/// Go, `use_declaration` for Rust), the same per-node-kind dispatch
/// `ast.rs`'s `classify_node`/`walk_node` use for symbol extraction.
#[cfg(feature = "treesitter")]
fn walk_import_nodes(lang: &str, node: tree_sitter::Node, source: &[u8], out: &mut Vec<ExtractedImport>) {
    match lang {
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => match node.kind() {
            "import_statement" | "export_statement" => {
                if let Some(src) = node.child_by_field_name("source") {
                    if let Some((module, range)) = string_node_specifier(src, source) {
                        out.push(ExtractedImport { module, range, kind: Method::Exact });
                    }
                }
            }
            "call_expression" => {
                let is_require = node.child_by_field_name("function").and_then(|f| f.utf8_text(source).ok()) == Some("require");
                if is_require {
                    if let Some(args) = node.child_by_field_name("arguments") {
                        let mut cursor = args.walk();
                        if let Some(first) = args.named_children(&mut cursor).next() {
                            if first.kind() == "string" {
                                if let Some((module, range)) = string_node_specifier(first, source) {
                                    out.push(ExtractedImport { module, range, kind: Method::Exact });
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        },
        "py" => match node.kind() {
            "import_from_statement" => {
                if let Some(m) = node.child_by_field_name("module_name") {
                    push_node_text(m, source, out);
                }
            }
            "import_statement" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    match child.kind() {
                        "dotted_name" => push_node_text(child, source, out),
                        "aliased_import" => {
                            if let Some(name) = child.child_by_field_name("name") {
                                push_node_text(name, source, out);
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        },
        "go" => {
            if node.kind() == "import_spec" {
                if let Some(path) = node.child_by_field_name("path") {
                    if let Some((module, range)) = string_node_specifier(path, source) {
                        out.push(ExtractedImport { module, range, kind: Method::Exact });
                    }
                }
            }
        }
        "rs" => {
            if node.kind() == "use_declaration" {
                if let Some(arg) = node.child_by_field_name("argument") {
                    if let Ok(text) = arg.utf8_text(source) {
                        if text.starts_with("crate") || text.starts_with("self") || text.starts_with("super") {
                            push_node_text(arg, source, out);
                        }
                    }
                }
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_import_nodes(lang, child, source, out);
    }
}

#[cfg(feature = "treesitter")]
pub fn extract_imports_parsed(lang: &str, text: &str) -> Option<Vec<ExtractedImport>> {
    // Parser-backed extraction walks the syntax tree for import/use/require
    // nodes per grammar, rather than re-running the regex table. Falls back
    // to the heuristic path on parse failure.
    use tree_sitter::Parser;

    let language = match lang {
        "rs" => tree_sitter_rust::LANGUAGE.into(),
        "ts" | "tsx" => tree_sitter_typescript::LANGUAGE_TSX.into(),
        "js" | "jsx" | "mjs" | "cjs" => tree_sitter_javascript::LANGUAGE.into(),
        "py" => tree_sitter_python::LANGUAGE.into(),
        "go" => tree_sitter_go::LANGUAGE.into(),
        _ => return None,
    };

    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(text, None)?;
    if tree.root_node().has_error() {
        return None;
    }

    let mut out = Vec::new();
    walk_import_nodes(lang, tree.root_node(), text.as_bytes(), &mut out);
    Some(out)
}

pub fn extract_imports(lang: &str, text: &str, use_parser: bool) -> Vec<ExtractedImport> {
    #[cfg(feature = "treesitter")]
    if use_parser {
        if let Some(imports) = extract_imports_parsed(lang, text) {
            return imports;
        }
        warn!(lang, "parser-backed extraction failed, falling back to heuristic");
    }
    #[cfg(not(feature = "treesitter"))]
    if use_parser {
        warn!(lang, "astEngine=wasm requested but treesitter feature not compiled in, using heuristic extraction");
    }
    extract_imports_heuristic(lang, text)
}

pub fn extension_language(ext: &str) -> Option<&'static str> {
    match ext {
        "ts" => Some("ts"),
        "tsx" => Some("tsx"),
        "js" => Some("js"),
        "jsx" => Some("jsx"),
        "mjs" => Some("mjs"),
        "cjs" => Some("cjs"),
        "py" => Some("py"),
        "go" => Some("go"),
        "rs" => Some("rs"),
        "java" => Some("java"),
        "rb" => Some("rb"),
        "php" => Some("php"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Module resolution
// ---------------------------------------------------------------------------

/// A minimal file-existence oracle the resolver consults; callers supply a
/// view over the bundle's `repos/*/*/norm/` tree.
pub trait FileSet {
    fn exists(&self, bundle_rel_path: &str) -> bool;
    fn all_paths(&self) -> Vec<String>;
}

pub fn resolve_js_ts(importer: &str, specifier: &str, files: &dyn FileSet) -> Option<String> {
    if !(specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')) {
        return None;
    }
    let base = if let Some(stripped) = specifier.strip_prefix('/') {
        PathBuf::from(stripped)
    } else {
        let importer_dir = Path::new(importer).parent().unwrap_or_else(|| Path::new(""));
        normalize_path(&importer_dir.join(specifier))
    };

    let mut candidates = vec![base.clone()];

    // `.ts`/`.tsx` swap of a `.js`/`.jsx` specifier extension (not `.mjs`/`.cjs`,
    // `.mts`/`.cts` — see open-question resolution in DESIGN.md).
    if let Some(stem) = strip_js_extension(&base) {
        for ext in ["ts", "tsx"] {
            candidates.push(with_extension(&stem, ext));
        }
    }

    for ext in ["ts", "tsx", "js", "jsx"] {
        candidates.push(with_extension(&base, ext));
    }
    for ext in ["ts", "tsx", "js", "jsx"] {
        candidates.push(base.join(format!("index.{ext}")));
    }

    candidates.into_iter().map(|p| p.to_string_lossy().replace('\\', "/")).find(|p| files.exists(p))
}

fn strip_js_extension(base: &Path) -> Option<PathBuf> {
    match base.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("jsx") => Some(base.with_extension("")),
        _ => None,
    }
}

pub fn resolve_python(importer: &str, specifier: &str, dots: usize, files: &dyn FileSet) -> Option<String> {
    let importer_path = Path::new(importer);
    let parts: Vec<&str> = specifier.split('.').filter(|s| !s.is_empty()).collect();

    let mut roots: Vec<PathBuf> = Vec::new();
    if dots > 0 {
        let mut dir = importer_path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        for _ in 1..dots {
            dir = dir.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        }
        roots.push(dir);
    } else {
        if let Some(src) = find_ancestor_dir(importer_path, "src") {
            roots.push(src);
        }
        if let Some(top) = importer_path.components().next() {
            roots.push(PathBuf::from(top.as_os_str()));
        }
        roots.push(PathBuf::from(""));
        roots.push(PathBuf::from("src"));
    }

    let mut found: Vec<String> = Vec::new();
    for root in &roots {
        let base = parts.iter().fold(root.clone(), |acc, p| acc.join(p));
        for candidate in [with_extension(&base, "py"), base.join("__init__.py")] {
            let p = candidate.to_string_lossy().replace('\\', "/");
            if files.exists(&p) {
                found.push(p);
            }
        }
    }
    found.sort();
    found.dedup();
    if found.len() == 1 {
        Some(found.remove(0))
    } else {
        None
    }
}

fn find_ancestor_dir(path: &Path, name: &str) -> Option<PathBuf> {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d.file_name().map(|n| n == name).unwrap_or(false) {
            return Some(d.to_path_buf());
        }
        dir = d.parent();
    }
    None
}

pub fn resolve_go(importer: &str, specifier: &str, files: &dyn FileSet, go_mod_modules: &HashMap<String, String>) -> Option<String> {
    let importer_path = Path::new(importer);
    let mut dir = importer_path.parent();
    while let Some(d) = dir {
        let go_mod_path = d.join("go.mod").to_string_lossy().replace('\\', "/");
        if let Some(module) = go_mod_modules.get(&go_mod_path) {
            if let Some(remainder) = specifier.strip_prefix(module.as_str()) {
                let subdir = d.join(remainder.trim_start_matches('/'));
                let mut candidates: Vec<String> = files
                    .all_paths()
                    .into_iter()
                    .filter(|p| {
                        let p_path = Path::new(p);
                        p_path.parent() == Some(subdir.as_path()) && p.ends_with(".go") && !p.ends_with("_test.go")
                    })
                    .collect();
                candidates.sort();
                return candidates.into_iter().next();
            }
            return None;
        }
        dir = d.parent();
    }
    None
}

pub fn resolve_rust(importer: &str, specifier: &str, files: &dyn FileSet) -> Option<String> {
    let crate_root = find_rust_crate_root(importer)?;
    let segments: Vec<&str> = specifier.split("::").collect();
    if segments.is_empty() {
        return None;
    }

    let start_dir = match segments[0] {
        "crate" => crate_root.clone(),
        "self" => Path::new(importer).parent().unwrap_or_else(|| Path::new("")).to_path_buf(),
        "super" => Path::new(importer).parent().and_then(Path::parent).unwrap_or_else(|| Path::new("")).to_path_buf(),
        _ => return None,
    };

    let mut dir = start_dir;
    let mut last_good: Option<String> = None;
    for seg in &segments[1..] {
        let as_file = dir.join(format!("{seg}.rs")).to_string_lossy().replace('\\', "/");
        let as_mod = dir.join(seg).join("mod.rs").to_string_lossy().replace('\\', "/");
        if files.exists(&as_file) {
            last_good = Some(as_file);
            dir = dir.join(seg);
        } else if files.exists(&as_mod) {
            last_good = Some(as_mod.clone());
            dir = dir.join(seg);
        } else {
            break;
        }
    }
    last_good
}

fn find_rust_crate_root(importer: &str) -> Option<PathBuf> {
    let mut dir = Path::new(importer).parent();
    while let Some(d) = dir {
        if d.file_name().map(|n| n == "src").unwrap_or(false) {
            return Some(d.to_path_buf());
        }
        dir = d.parent();
    }
    Path::new(importer).parent().map(|p| p.to_path_buf())
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for comp in path.components() {
        match comp {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str().to_owned()),
        }
    }
    out.into_iter().collect()
}

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.to_string_lossy().to_string();
    s.push('.');
    s.push_str(ext);
    PathBuf::from(s)
}

pub fn resolve_import(importer: &str, specifier: &str, lang: &str, files: &dyn FileSet, go_mod_modules: &HashMap<String, String>) -> Option<String> {
    match lang {
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => resolve_js_ts(importer, specifier, files),
        "py" => {
            let dots = specifier.chars().take_while(|c| *c == '.').count();
            resolve_python(importer, specifier.trim_start_matches('.'), dots, files)
        }
        "go" => resolve_go(importer, specifier, files, go_mod_modules),
        "rs" => resolve_rust(importer, specifier, files),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Target mode
// ---------------------------------------------------------------------------

pub struct TargetModeInput<'a> {
    pub file_path: &'a str,
    pub file_text: &'a str,
    pub symbol: Option<&'a str>,
    pub edge_types_all: bool,
    pub use_parser: bool,
    pub budget: GraphBudget,
}

pub fn run_target_mode(input: &TargetModeInput, files: &dyn FileSet, go_mod_modules: &HashMap<String, String>, fts_hits: impl Fn(&str) -> Vec<(String, i64, String)>) -> Result<GraphResult> {
    if Path::new(input.file_path).is_absolute() {
        return Err(PreflightError::IngestError { message: format!("target.file must be bundle-relative, got absolute path '{}'", input.file_path) });
    }

    let ext = Path::new(input.file_path).extension().and_then(|e| e.to_str()).unwrap_or("");
    let lang = extension_language(ext).unwrap_or("");

    let mut tracker = BudgetTracker::new(input.budget.clone());
    let mut nodes = vec![GraphNode { id: input.file_path.to_string(), kind: NodeKind::File, name: input.file_path.to_string(), file: Some(input.file_path.to_string()), range: None, attrs: None }];
    let mut edges = Vec::new();
    let mut warnings = Vec::new();
    let mut per_language = BTreeMap::new();

    let imports = extract_imports(lang, input.file_text, input.use_parser);
    let lang_stats = per_language.entry(lang.to_string()).or_insert_with(PerLanguageStats::default);
    lang_stats.scanned = 1;
    lang_stats.parsed = 1;

    for import in &imports {
        if !tracker.check("import extraction") {
            break;
        }
        tracker.edges_seen += 1;
        let module_node_id = format!("module:{}", import.module);
        nodes.push(GraphNode { id: module_node_id.clone(), kind: NodeKind::Module, name: import.module.clone(), file: None, range: Some(import.range.clone()), attrs: None });
        tracker.nodes_seen += 1;
        edges.push(GraphEdge {
            edge_type: GraphEdgeType::Imports,
            from: input.file_path.to_string(),
            to: module_node_id.clone(),
            method: import.kind,
            confidence: if import.kind == Method::Exact { 0.9 } else { 0.7 },
            range: Some(import.range.clone()),
        });
        lang_stats.edges += 1;

        if let Some(resolved) = resolve_import(input.file_path, &import.module, lang, files, go_mod_modules) {
            tracker.edges_seen += 1;
            edges.push(GraphEdge {
                edge_type: GraphEdgeType::ImportsResolved,
                from: input.file_path.to_string(),
                to: resolved.clone(),
                method: import.kind,
                confidence: if import.kind == Method::Exact { 0.9 } else { 0.7 },
                range: Some(import.range.clone()),
            });
            lang_stats.edges += 1;
        }
    }

    if let (Some(symbol), true) = (input.symbol, input.edge_types_all) {
        let call_re = Regex::new(&format!(r"\b{}\b\s*\(", regex::escape(symbol))).unwrap();
        for (path, line_no, text) in fts_hits(symbol) {
            if !tracker.check("reference search") {
                break;
            }
            if call_re.is_match(&text) {
                tracker.edges_seen += 1;
                edges.push(GraphEdge {
                    edge_type: GraphEdgeType::References,
                    from: input.file_path.to_string(),
                    to: format!("{path}:{line_no}"),
                    method: Method::Heuristic,
                    confidence: 0.5,
                    range: None,
                });
            }
        }
    } else if input.symbol.is_some() {
        warnings.push("references skipped: edgeTypes must be 'all' to search for symbol call sites".to_string());
    }

    let coverage = CoverageReport {
        scanned_files_count: 1,
        parsed_files_count: 1,
        per_language,
        per_dir: BTreeMap::new(),
        skipped_files: vec![],
        truncated: tracker.truncated,
        truncated_reason: tracker.truncated_reason.clone(),
    };

    Ok(GraphResult {
        meta: GraphMeta { mode: "target" },
        facts: GraphFacts { nodes, edges },
        signals: GraphSignals { stats: BTreeMap::new(), warnings, high_value_modules: None },
        coverage_report: coverage,
        mermaid: None,
    })
}

// ---------------------------------------------------------------------------
// Global mode
// ---------------------------------------------------------------------------

pub struct GlobalModeInput<'a> {
    pub files: &'a [(String, String)], // (bundle_rel_path, normalized_text)
    pub use_parser: bool,
    pub budget: GraphBudget,
}

pub fn run_global_mode(input: &GlobalModeInput, files: &dyn FileSet, go_mod_modules: &HashMap<String, String>) -> GraphResult {
    let mut tracker = BudgetTracker::new(input.budget.clone());
    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
    let mut edges = Vec::new();
    let mut skipped = Vec::new();
    let mut per_language: BTreeMap<String, PerLanguageStats> = BTreeMap::new();
    let mut per_dir: BTreeMap<String, usize> = BTreeMap::new();
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut out_degree: HashMap<String, usize> = HashMap::new();

    let mut sorted_files: Vec<&(String, String)> = input.files.iter().collect();
    sorted_files.sort_by(|a, b| a.0.cmp(&b.0));

    for (path, text) in sorted_files {
        if !tracker.check("global walk") {
            break;
        }
        tracker.files_seen += 1;

        let top_dir = path.split('/').next().unwrap_or("").to_string();
        *per_dir.entry(top_dir).or_insert(0) += 1;

        let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("");
        let Some(lang) = extension_language(ext) else { continue };

        if text.len() as u64 > input.budget.max_file_size_bytes {
            match input.budget.size_strategy {
                SizeStrategy::Skip => {
                    skipped.push(SkippedFile { path: path.clone(), size: Some(text.len() as u64), reason: "max file size exceeded".to_string() });
                    continue;
                }
                SizeStrategy::Truncate => {}
            }
        }

        let stats = per_language.entry(lang.to_string()).or_default();
        stats.scanned += 1;

        nodes.entry(path.clone()).or_insert_with(|| GraphNode { id: path.clone(), kind: NodeKind::File, name: path.clone(), file: Some(path.clone()), range: None, attrs: None });
        tracker.nodes_seen = nodes.len();

        let imports = extract_imports(lang, text, input.use_parser);
        stats.parsed += 1;

        for import in imports {
            if !tracker.check("import resolution") {
                break;
            }
            if let Some(resolved) = resolve_import(path, &import.module, lang, files, go_mod_modules) {
                tracker.edges_seen += 1;
                nodes.entry(resolved.clone()).or_insert_with(|| GraphNode { id: resolved.clone(), kind: NodeKind::File, name: resolved.clone(), file: Some(resolved.clone()), range: None, attrs: None });
                *in_degree.entry(resolved.clone()).or_insert(0) += 1;
                *out_degree.entry(path.clone()).or_insert(0) += 1;
                stats.edges += 1;
                edges.push(GraphEdge {
                    edge_type: GraphEdgeType::ImportsResolved,
                    from: path.clone(),
                    to: resolved,
                    method: import.kind,
                    confidence: if import.kind == Method::Exact { 0.9 } else { 0.7 },
                    range: Some(import.range),
                });
            }
        }
    }

    let mut high_coupling: Vec<String> = in_degree.iter().filter(|(_, &n)| n >= 10).map(|(k, _)| k.clone()).collect();
    high_coupling.sort();
    let mut hub: Vec<String> = out_degree.iter().filter(|(_, &n)| n >= 15).map(|(k, _)| k.clone()).collect();
    hub.sort();
    let mut entry_point: Vec<String> = out_degree
        .iter()
        .filter(|(k, &out)| out >= 8 && *in_degree.get(k.as_str()).unwrap_or(&0) <= 2)
        .map(|(k, _)| k.clone())
        .collect();
    entry_point.sort();

    let mermaid = render_mermaid(&nodes, &in_degree, &out_degree);

    let skipped_capped: Vec<SkippedFile> = skipped.into_iter().take(50).collect();

    GraphResult {
        meta: GraphMeta { mode: "global" },
        facts: GraphFacts { nodes: nodes.into_values().collect(), edges },
        signals: GraphSignals {
            stats: BTreeMap::new(),
            warnings: vec![],
            high_value_modules: Some(HighValueModules { high_coupling, hub, entry_point }),
        },
        coverage_report: CoverageReport {
            scanned_files_count: tracker.files_seen,
            parsed_files_count: per_language.values().map(|s| s.parsed).sum(),
            per_language,
            per_dir,
            skipped_files: skipped_capped,
            truncated: tracker.truncated,
            truncated_reason: tracker.truncated_reason,
        },
        mermaid: Some(mermaid),
    }
}

fn render_mermaid(nodes: &BTreeMap<String, GraphNode>, in_degree: &HashMap<String, usize>, out_degree: &HashMap<String, usize>) -> String {
    let mut by_degree: Vec<(&String, usize)> = nodes.keys().map(|k| (k, in_degree.get(k).unwrap_or(&0) + out_degree.get(k).unwrap_or(&0))).collect();
    by_degree.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let top: HashSet<&String> = by_degree.into_iter().take(15).map(|(k, _)| k).collect();

    let mut lines = vec!["flowchart LR".to_string()];
    let mut node_ids: Vec<&String> = top.iter().copied().collect();
    node_ids.sort();
    for (i, n) in node_ids.iter().enumerate() {
        lines.push(format!("  n{i}[\"{n}\"]"));
    }
    debug!(top_count = top.len(), "mermaid flowchart rendered for top-degree nodes");
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFiles(HashSet<String>);
    impl FileSet for FakeFiles {
        fn exists(&self, p: &str) -> bool {
            self.0.contains(p)
        }
        fn all_paths(&self) -> Vec<String> {
            self.0.iter().cloned().collect()
        }
    }

    #[test]
    fn heuristic_extracts_js_relative_import() {
        let imports = extract_imports_heuristic("ts", "import { widget } from './widget';\n");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].module, "./widget");
        assert_eq!(imports[0].kind, Method::Heuristic);
    }

    #[test]
    fn heuristic_extracts_rust_use_paths() {
        let imports = extract_imports_heuristic("rs", "use crate::model::Bundle;\n");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].module, "crate::model");
    }

    #[test]
    fn resolve_js_ts_prefers_exact_then_extension_swap() {
        let files = FakeFiles(["src/widget.ts".to_string()].into_iter().collect());
        let resolved = resolve_js_ts("src/app.ts", "./widget", &files);
        assert_eq!(resolved.as_deref(), Some("src/widget.ts"));
    }

    #[test]
    fn resolve_js_ts_swaps_dot_js_specifier_for_dot_ts_file() {
        let files = FakeFiles(["repos/o/r/norm/b.ts".to_string()].into_iter().collect());
        let resolved = resolve_js_ts("repos/o/r/norm/a.ts", "./b.js", &files);
        assert_eq!(resolved.as_deref(), Some("repos/o/r/norm/b.ts"));
    }

    #[test]
    fn resolve_rust_walks_crate_path() {
        let files = FakeFiles(["src/model.rs".to_string()].into_iter().collect());
        let resolved = resolve_rust("src/main.rs", "crate::model", &files);
        assert_eq!(resolved.as_deref(), Some("src/model.rs"));
    }

    #[test]
    fn target_mode_rejects_absolute_path() {
        let files = FakeFiles(HashSet::new());
        let input = TargetModeInput { file_path: "/etc/passwd", file_text: "", symbol: None, edge_types_all: false, use_parser: false, budget: GraphBudget::default() };
        let err = run_target_mode(&input, &files, &HashMap::new(), |_| vec![]).unwrap_err();
        assert_eq!(err.code(), "INGEST_ERROR");
    }

    #[test]
    fn max_edges_budget_truncates_with_reason() {
        let files = FakeFiles(HashSet::new());
        let mut budget = GraphBudget::default();
        budget.max_edges = 1;
        let text = "import a from './a';\nimport b from './b';\n";
        let input = TargetModeInput { file_path: "src/app.ts", file_text: text, symbol: None, edge_types_all: false, use_parser: false, budget };
        let result = run_target_mode(&input, &files, &HashMap::new(), |_| vec![]).unwrap();
        assert!(result.coverage_report.truncated);
        assert_eq!(result.coverage_report.truncated_reason.as_deref(), Some("maxEdges reached"));
    }
}
