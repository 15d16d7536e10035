//! Preflight CLI — command-line front end for the bundle lifecycle and
//! evidence engine.
//!
//! Each subcommand is a thin pass-through to `preflight-core`'s public
//! functions; this binary owns argument parsing, config loading, and JSON
//! rendering of results, nothing else.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use preflight_core::bundle::{BundleBuilder, CreateRequest, IfExists};
use preflight_core::config::Config;
use preflight_core::error::PreflightError;
use preflight_core::model::{RepoEntry, TraceEdge, TraceEdgeType};
use preflight_core::{fts, graph, manifest, storage, tokenizer, trace, validate};

#[derive(Parser)]
#[command(name = "preflight", version, about = "Bundle lifecycle and evidence engine")]
struct Cli {
    /// Path to a TOML config file (see `Config`); falls back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured storage roots (first is primary, rest are backups).
    #[arg(long = "storage-dir", global = true)]
    storage_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct RepoArgs {
    /// GitHub source: `owner/repo` or `owner/repo@ref`. Repeatable.
    #[arg(long = "github", value_name = "OWNER/REPO[@REF]")]
    github: Vec<String>,
    /// Local filesystem source: `path` or `path:repo_id`. Repeatable.
    #[arg(long = "local", value_name = "PATH[:REPO_ID]")]
    local: Vec<String>,
    /// Web source URL. Repeatable (acquisition requires a configured crawler).
    #[arg(long = "web")]
    web: Vec<String>,
    /// Library name associated with this bundle. Repeatable.
    #[arg(long = "library")]
    libraries: Vec<String>,
    /// Topic tag used in fingerprinting. Repeatable.
    #[arg(long = "topic")]
    topics: Vec<String>,
}

impl RepoArgs {
    fn into_repos(&self) -> Vec<RepoEntry> {
        let mut repos = Vec::new();
        for g in &self.github {
            repos.push(parse_github_repo(g).unwrap_or_else(|e| fail_str(&e)));
        }
        for l in &self.local {
            repos.push(parse_local_repo(l));
        }
        for w in &self.web {
            repos.push(RepoEntry::Web { url: w.clone(), config: serde_json::json!({}) });
        }
        repos
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a new bundle from one or more repo sources.
    Create {
        #[command(flatten)]
        repos: RepoArgs,
        #[arg(long, default_value = "untitled bundle")]
        display_name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, value_enum, default_value = "error")]
        if_exists: IfExistsArg,
    },
    /// Re-acquire an existing bundle's repos and refresh derived artifacts.
    Update {
        bundle_id: String,
        #[command(flatten)]
        repos: RepoArgs,
        /// Only report whether the remote heads moved; don't rebuild anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete a bundle from its storage root.
    Delete { bundle_id: String },
    /// Validate a bundle, optionally fixing recoverable problems.
    Repair {
        bundle_id: String,
        #[arg(long, value_enum, default_value = "repair")]
        mode: RepairModeArg,
    },
    /// List every bundle id visible across the configured storage roots.
    List,
    /// Show a bundle's manifest and completeness report.
    Status { bundle_id: String },
    /// Full-text search a bundle's normalized files.
    Search {
        bundle_id: String,
        query: String,
        #[arg(long, value_enum, default_value = "all")]
        scope: ScopeArg,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Restrict to these file extensions (without the dot). Repeatable.
        #[arg(long = "ext")]
        extensions: Vec<String>,
        #[arg(long)]
        group_by_file: bool,
        /// Cap cumulative snippet tokens; trailing hits are dropped once exceeded.
        #[arg(long)]
        token_budget: Option<usize>,
        #[arg(long, default_value = "bytes-estimate")]
        tokenizer: String,
    },
    /// Query the dependency graph for one file (target mode) or the whole bundle (global mode).
    Deps {
        bundle_id: String,
        /// Bundle-relative path to a normalized file, e.g. `repos/o/r/norm/src/main.rs`.
        #[arg(long)]
        file: Option<String>,
        /// Run in global mode over every normalized file instead of one target file.
        #[arg(long)]
        global: bool,
        /// Symbol to search for call-site references (target mode only).
        #[arg(long)]
        symbol: Option<String>,
        /// Include `references` edges in addition to `imports`/`importsResolved`.
        #[arg(long)]
        edge_types_all: bool,
        #[arg(long)]
        use_parser: bool,
        #[arg(long, default_value_t = 5_000)]
        max_files: usize,
        #[arg(long, default_value_t = 20_000)]
        max_nodes: usize,
        #[arg(long, default_value_t = 40_000)]
        max_edges: usize,
        #[arg(long, default_value_t = 30_000)]
        time_budget_ms: u64,
    },
    /// Insert or update trace edges from a JSON file (an array of `TraceEdge`).
    TraceUpsert {
        bundle_id: String,
        edges_file: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Query trace edges.
    TraceQuery {
        bundle_id: String,
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long)]
        target_id: Option<String>,
        #[arg(long)]
        edge_type: Option<String>,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long)]
        max_confidence: Option<f64>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Suggest `tested_by` edges by file-naming convention.
    TraceSuggest {
        bundle_id: String,
        #[arg(long, default_value_t = 0.5)]
        min_confidence: f64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-export the trace store to `trace/trace.json`.
    TraceExport { bundle_id: String },
    /// Run the bundle completeness validator (and, with `--claims-file`, claim validation).
    ValidateReport {
        bundle_id: String,
        #[arg(long)]
        claims_file: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum IfExistsArg {
    Error,
    ReturnExisting,
    UpdateExisting,
    CreateNew,
}

impl From<IfExistsArg> for IfExists {
    fn from(v: IfExistsArg) -> Self {
        match v {
            IfExistsArg::Error => IfExists::Error,
            IfExistsArg::ReturnExisting => IfExists::ReturnExisting,
            IfExistsArg::UpdateExisting => IfExists::UpdateExisting,
            IfExistsArg::CreateNew => IfExists::CreateNew,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RepairModeArg {
    Validate,
    Repair,
}

impl From<RepairModeArg> for validate::RepairMode {
    fn from(v: RepairModeArg) -> Self {
        match v {
            RepairModeArg::Validate => validate::RepairMode::ValidateOnly,
            RepairModeArg::Repair => validate::RepairMode::Repair,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Docs,
    Code,
    All,
}

impl From<ScopeArg> for fts::Scope {
    fn from(v: ScopeArg) -> Self {
        match v {
            ScopeArg::Docs => fts::Scope::Docs,
            ScopeArg::Code => fts::Scope::Code,
            ScopeArg::All => fts::Scope::All,
        }
    }
}

fn parse_github_repo(s: &str) -> Result<RepoEntry, String> {
    let (owner_repo, git_ref) = match s.split_once('@') {
        Some((a, b)) => (a, Some(b.to_string())),
        None => (s, None),
    };
    let (owner, repo) = owner_repo.split_once('/').ok_or_else(|| format!("expected owner/repo, got '{s}'"))?;
    Ok(RepoEntry::Github { owner: owner.to_string(), repo: repo.to_string(), git_ref })
}

fn parse_local_repo(s: &str) -> RepoEntry {
    let (path_part, repo_id) = match s.split_once(':') {
        Some((p, id)) => (p, Some(id.to_string())),
        None => (s, None),
    };
    let absolute_path = PathBuf::from(path_part);
    let repo_id = repo_id.unwrap_or_else(|| absolute_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| path_part.to_string()));
    RepoEntry::Local { repo_id, absolute_path, git_ref: None }
}

fn load_config(cli: &Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => Config::from_toml_file(path).unwrap_or_else(|e| fail_err(e)),
        None => Config::default(),
    };
    if !cli.storage_dirs.is_empty() {
        config.storage_dirs = cli.storage_dirs.clone();
    }
    config
}

fn fail_err(e: PreflightError) -> ! {
    let body = serde_json::json!({
        "error": {
            "code": e.code(),
            "message": e.to_string(),
            "nextAction": e.next_action(),
        }
    });
    eprintln!("{}", serde_json::to_string_pretty(&body).unwrap());
    std::process::exit(1);
}

fn fail_str(message: &str) -> ! {
    eprintln!("{}", serde_json::json!({ "error": { "message": message } }));
    std::process::exit(1);
}

fn print_json(value: impl serde::Serialize) {
    println!("{}", serde_json::to_string_pretty(&value).unwrap());
}

fn bundle_dir_or_fail(config: &Config, bundle_id: &str) -> (PathBuf, preflight_core::model::Paths) {
    let root = storage::find_bundle(&config.storage_dirs, bundle_id).unwrap_or_else(|| fail_err(PreflightError::BundleNotFound { id: bundle_id.to_string(), hint: "bundle not found on any configured storage root".to_string() }));
    let paths = storage::get_paths(&root, bundle_id);
    (root, paths)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("preflight=info".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli);

    match cli.command {
        Command::Create { repos, display_name, description, tags, if_exists } => {
            let builder = BundleBuilder::new(config);
            let req = CreateRequest { repos: repos.into_repos(), libraries: repos.libraries.clone(), topics: repos.topics.clone(), display_name, description, tags, if_exists: if_exists.into() };
            let outcome = builder.create(req).unwrap_or_else(|e| fail_err(e));
            print_json(serde_json::json!({
                "bundleId": outcome.bundle_id,
                "fingerprint": outcome.fingerprint,
                "created": outcome.created,
                "changed": outcome.changed,
                "warnings": outcome.warnings,
            }));
        }

        Command::Update { bundle_id, repos, dry_run } => {
            let builder = BundleBuilder::new(config);
            if dry_run {
                let outcome = builder.check_for_updates(&bundle_id).unwrap_or_else(|e| fail_err(e));
                print_json(serde_json::json!({ "hasUpdates": outcome.has_updates, "details": outcome.details }));
            } else {
                let entries = repos.into_repos();
                let outcome = builder.update(&bundle_id, &entries, &repos.libraries, &repos.topics).unwrap_or_else(|e| fail_err(e));
                print_json(serde_json::json!({
                    "bundleId": outcome.bundle_id,
                    "fingerprint": outcome.fingerprint,
                    "changed": outcome.changed,
                    "warnings": outcome.warnings,
                }));
            }
        }

        Command::Delete { bundle_id } => {
            let builder = BundleBuilder::new(config);
            builder.delete(&bundle_id).unwrap_or_else(|e| fail_err(e));
            print_json(serde_json::json!({ "deleted": bundle_id }));
        }

        Command::Repair { bundle_id, mode } => {
            let builder = BundleBuilder::new(config);
            let report = builder.repair(&bundle_id, mode.into()).unwrap_or_else(|e| fail_err(e));
            print_json(report);
        }

        Command::List => {
            print_json(storage::list_bundles(&config.storage_dirs));
        }

        Command::Status { bundle_id } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let bundle = manifest::load(&paths.manifest).unwrap_or_else(|e| fail_err(e));
            let report = validate::validate(&paths.bundle_dir);
            print_json(serde_json::json!({ "bundle": bundle, "validation": report }));
        }

        Command::Search { bundle_id, query, scope, limit, extensions, group_by_file, token_budget, tokenizer: tokenizer_name } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let tok = tokenizer::create_tokenizer(&tokenizer_name);
            let opts = fts::AdvancedSearchOptions {
                extensions: if extensions.is_empty() { None } else { Some(&extensions) },
                group_by_file,
                bundle_root: Some(paths.bundle_dir.as_path()),
                token_budget: token_budget.map(|b| (b, tok.as_ref() as &dyn preflight_core::tokenizer::Tokenizer)),
            };
            let result = fts::search_advanced(&paths.search_db, &query, scope.into(), limit, &opts).unwrap_or_else(|e| fail_err(e));
            match result {
                fts::AdvancedSearchResult::Flat(hits) => print_json(hits),
                fts::AdvancedSearchResult::Grouped(groups) => print_json(groups),
            }
        }

        Command::Deps { bundle_id, file, global, symbol, edge_types_all, use_parser, max_files, max_nodes, max_edges, time_budget_ms } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let file_set = BundleFileSet::scan(&paths.bundle_dir).unwrap_or_else(|e| fail_err(e));
            let go_mod_modules = build_go_mod_modules(&paths.bundle_dir, &file_set);
            let budget = graph::GraphBudget { max_files, max_nodes, max_edges, time_budget_ms, ..graph::GraphBudget::default() };

            if global {
                let files: Vec<(String, String)> = file_set
                    .paths
                    .iter()
                    .filter_map(|p| std::fs::read_to_string(paths.bundle_dir.join(p)).ok().map(|text| (p.clone(), text)))
                    .collect();
                let input = graph::GlobalModeInput { files: &files, use_parser, budget };
                let result = graph::run_global_mode(&input, &file_set, &go_mod_modules);
                print_json(result);
            } else {
                let file_path = file.unwrap_or_else(|| fail_str("--file is required unless --global is set"));
                let file_text = std::fs::read_to_string(paths.bundle_dir.join(&file_path)).unwrap_or_else(|e| fail_str(&format!("could not read '{file_path}': {e}")));
                let input = graph::TargetModeInput { file_path: &file_path, file_text: &file_text, symbol: symbol.as_deref(), edge_types_all, use_parser, budget };
                let search_db = paths.search_db.clone();
                let fts_hits = move |q: &str| -> Vec<(String, i64, String)> {
                    fts::search(&search_db, q, fts::Scope::Code, 200, None).unwrap_or_default().into_iter().map(|h| (h.path, h.line_no, h.snippet)).collect()
                };
                let result = graph::run_target_mode(&input, &file_set, &go_mod_modules, fts_hits).unwrap_or_else(|e| fail_err(e));
                print_json(result);
            }
        }

        Command::TraceUpsert { bundle_id, edges_file, dry_run } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let text = std::fs::read_to_string(&edges_file).unwrap_or_else(|e| fail_str(&format!("could not read '{}': {e}", edges_file.display())));
            let edges: Vec<TraceEdge> = serde_json::from_str(&text).unwrap_or_else(|e| fail_str(&format!("invalid trace edge JSON: {e}")));
            let outcome = trace::upsert(&paths.trace_db, &paths.trace_json, &edges, dry_run).unwrap_or_else(|e| fail_err(e));
            let blocked: Vec<serde_json::Value> = outcome
                .blocked
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "edgeKey": b.edge_key,
                        "code": b.code,
                        "reason": b.reason,
                        "nextAction": { "toolName": "trace_upsert", "reason": "add at least one source Evidence for this edge and retry" },
                    })
                })
                .collect();
            print_json(serde_json::json!({ "upserted": outcome.upserted, "ids": outcome.ids, "warnings": outcome.warnings, "blocked": blocked }));
        }

        Command::TraceQuery { bundle_id, source_id, target_id, edge_type, min_confidence, max_confidence, limit } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let edge_type = edge_type.map(|s| TraceEdgeType::parse(&s).unwrap_or_else(|| fail_str(&format!("unknown edge type '{s}'"))));
            let filters = trace::QueryFilters { source_id: source_id.as_deref(), target_id: target_id.as_deref(), edge_type, min_confidence, max_confidence, limit };
            let result = trace::query(&paths.trace_db, &filters).unwrap_or_else(|e| fail_err(e));
            print_json(serde_json::json!({ "edges": result.edges, "reason": result.reason }));
        }

        Command::TraceSuggest { bundle_id, min_confidence, limit } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let bundle = manifest::load(&paths.manifest).unwrap_or_else(|e| fail_err(e));
            let file_set = BundleFileSet::scan(&paths.bundle_dir).unwrap_or_else(|e| fail_err(e));
            let existing = trace::query(&paths.trace_db, &trace::QueryFilters { source_id: None, target_id: None, edge_type: Some(TraceEdgeType::TestedBy), min_confidence: None, max_confidence: None, limit: 1_000_000 }).unwrap_or_else(|e| fail_err(e));
            let _ = bundle;
            let existing_pairs: HashSet<String> = existing.edges.iter().map(|e| format!("{}|{}", e.source.id, e.target.id)).collect();
            let suggestions = trace::suggest_tested_by(&file_set.paths, &existing_pairs, min_confidence, limit);
            print_json(
                suggestions
                    .into_iter()
                    .map(|(source, target, confidence, why)| serde_json::json!({ "source": source, "target": target, "confidence": confidence, "why": why }))
                    .collect::<Vec<_>>(),
            );
        }

        Command::TraceExport { bundle_id } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let count = trace::export_json(&paths.trace_db, &paths.trace_json).unwrap_or_else(|e| fail_err(e));
            print_json(serde_json::json!({ "exported": count, "path": paths.trace_json }));
        }

        Command::ValidateReport { bundle_id, claims_file } => {
            let (_root, paths) = bundle_dir_or_fail(&config, &bundle_id);
            let report = validate::validate(&paths.bundle_dir);
            if let Some(claims_path) = claims_file {
                let text = std::fs::read_to_string(&claims_path).unwrap_or_else(|e| fail_str(&format!("could not read '{}': {e}", claims_path.display())));
                let claims: Vec<preflight_core::model::Claim> = serde_json::from_str(&text).unwrap_or_else(|e| fail_str(&format!("invalid claims JSON: {e}")));
                let bundle_dir = paths.bundle_dir.clone();
                let claim_report = validate::validate_claims(&claims, |p| {
                    let candidate = bundle_dir.join(p);
                    candidate.is_file().then_some(candidate)
                });
                print_json(serde_json::json!({ "bundle": report, "claims": claim_report }));
            } else {
                print_json(report);
            }
        }
    }
}

/// Walks a bundle's `repos/*/*/norm/` tree and reports bundle-relative,
/// POSIX-separated paths (e.g. `repos/o/r/norm/src/main.rs`) — the same
/// identity space [`fts::IndexableFile::path`] uses.
struct BundleFileSet {
    paths: Vec<String>,
    set: HashSet<String>,
}

impl BundleFileSet {
    fn scan(bundle_dir: &Path) -> Result<Self, PreflightError> {
        let repos_dir = bundle_dir.join("repos");
        if !repos_dir.is_dir() {
            return Ok(Self { paths: vec![], set: HashSet::new() });
        }

        let mut paths = Vec::new();
        for repo_entry in std::fs::read_dir(&repos_dir).map_err(|e| PreflightError::OperationFailed { message: format!("reading repos dir: {e}"), source: Some(Box::new(e)) })? {
            let repo_entry = repo_entry.map_err(|e| PreflightError::OperationFailed { message: e.to_string(), source: Some(Box::new(e)) })?;
            if !repo_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let norm_dir = repo_entry.path().join("norm");
            if !norm_dir.is_dir() {
                continue;
            }
            for file in preflight_core::ingest::walk_normalized_files(&norm_dir) {
                let rel = file.strip_prefix(bundle_dir).unwrap_or(&file).to_string_lossy().replace('\\', "/");
                paths.push(rel);
            }
        }
        paths.sort();
        let set = paths.iter().cloned().collect();
        Ok(Self { paths, set })
    }
}

impl graph::FileSet for BundleFileSet {
    fn exists(&self, bundle_rel_path: &str) -> bool {
        self.set.contains(bundle_rel_path)
    }

    fn all_paths(&self) -> Vec<String> {
        self.paths.clone()
    }
}

/// Scan every `go.mod` under the bundle's normalized tree and map its
/// bundle-relative path to the module name declared on its `module` line —
/// the lookup `graph::resolve_go` needs.
fn build_go_mod_modules(bundle_dir: &Path, file_set: &BundleFileSet) -> HashMap<String, String> {
    let mut modules = HashMap::new();
    for path in &file_set.paths {
        if !path.ends_with("/go.mod") && path != "go.mod" {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(bundle_dir.join(path)) else { continue };
        for line in text.lines() {
            if let Some(module) = line.trim().strip_prefix("module ") {
                modules.insert(path.clone(), module.trim().to_string());
                break;
            }
        }
    }
    modules
}
