//! Tool registry and the four agent-callable tools.
//!
//! Grounded on the original `BaseTool`/`ToolRegistry`/`KeywordSearchTool`/
//! `FileReadTool`/`KnowledgeQueryTool` (`tools.py`); `dir_scan` is
//! authored directly from §4.7's contract since its Python source file
//! wasn't part of the retrieval pack. `ctx` is passed behind a `tokio::Mutex`
//! because Phase 1/2 tasks may execute tools concurrently against the same
//! session state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::cluster_store::ClusterStore;
use crate::context::SearchContext;
use crate::embeddings::Embedder;
use crate::llm::LlmClient;
use crate::retriever::{GrepRetriever, SearchFlags};
use crate::scan::DirectoryScanner;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn schema(&self) -> Value;
    async fn execute(&self, ctx: &Mutex<SearchContext>, args: Value) -> (String, Value);
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn get_all_schemas(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Dispatches by name. An unknown tool name is a hard error string;
    /// a tool-level panic-free failure is caught and returned as error text
    /// with `{"error": "..."}` metadata, matching the source's try/except wrapping.
    pub async fn execute(&self, name: &str, ctx: &Mutex<SearchContext>, args: Value) -> (String, Value) {
        match self.tools.get(name) {
            Some(tool) => tool.execute(ctx, args).await,
            None => (format!("Unknown tool: {name}"), json!({"error": "unknown_tool"})),
        }
    }
}

// ---------------------------------------------------------------------------
// knowledge_query
// ---------------------------------------------------------------------------

pub struct KnowledgeQueryTool {
    store: Arc<ClusterStore>,
    embedder: Arc<dyn Embedder>,
}

impl KnowledgeQueryTool {
    pub fn new(store: Arc<ClusterStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl Tool for KnowledgeQueryTool {
    fn name(&self) -> &'static str {
        "knowledge_query"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "knowledge_query",
            "description": "Search cached knowledge clusters for an answer already synthesised from a prior search.",
            "parameters": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "default": 3}
            }
        })
    }

    async fn execute(&self, ctx: &Mutex<SearchContext>, args: Value) -> (String, Value) {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(3) as usize;

        let embedding = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => return (format!("knowledge_query failed: {e}"), json!({"error": e.to_string()})),
        };

        let hits = self.store.search_similar_clusters(&embedding, limit, 0.0);
        if hits.is_empty() {
            {
                let mut guard = ctx.lock().await;
                guard.add_log("knowledge_query", 0, json!({"hits": 0}));
            }
            return ("No cached knowledge found for this query.".to_string(), json!({"hits": []}));
        }

        let mut blocks = Vec::new();
        for (id, _score) in &hits {
            if let Ok(Some(cluster)) = self.store.get(id) {
                blocks.push(format!(
                    "### {} (id: {})\n{}\n\n{}",
                    cluster.name,
                    cluster.id,
                    cluster.description.join(" "),
                    cluster.content.join("\n")
                ));
            }
        }

        {
            let mut guard = ctx.lock().await;
            guard.add_log("knowledge_query", 0, json!({"hits": hits.len()}));
        }

        (blocks.join("\n\n"), json!({"hits": hits.len()}))
    }
}

// ---------------------------------------------------------------------------
// keyword_search
// ---------------------------------------------------------------------------

pub struct KeywordSearchTool {
    retriever: Arc<GrepRetriever>,
    search_paths: Vec<PathBuf>,
}

impl KeywordSearchTool {
    pub fn new(retriever: Arc<GrepRetriever>, search_paths: Vec<PathBuf>) -> Self {
        Self { retriever, search_paths }
    }
}

#[async_trait]
impl Tool for KeywordSearchTool {
    fn name(&self) -> &'static str {
        "keyword_search"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "keyword_search",
            "description": "Literal per-term lexical search across the configured search paths.",
            "parameters": {
                "keywords": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    async fn execute(&self, ctx: &Mutex<SearchContext>, args: Value) -> (String, Value) {
        let keywords: Vec<String> = args
            .get("keywords")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        if keywords.is_empty() {
            return ("No keywords provided.".to_string(), json!({"paths": []}));
        }

        let matches = match self.retriever.search(&keywords, &self.search_paths, SearchFlags::default()).await {
            Ok(m) => m,
            Err(e) => return (format!("keyword_search failed: {e}"), json!({"error": e.to_string()})),
        };

        let block = format_diverse_snippets(&matches, &keywords);
        let paths: Vec<String> = matches.iter().map(|m| m.path.clone()).collect();

        {
            let mut guard = ctx.lock().await;
            guard.add_search(keywords.join(" "));
            guard.add_log("keyword_search", 0, json!({"paths": paths}));
        }

        if block.is_empty() {
            ("No matches found.".to_string(), json!({"paths": paths}))
        } else {
            (block, json!({"paths": paths}))
        }
    }
}

/// Groups matches by originating keyword (first keyword found in the line)
/// and round-robins across groups so every queried term contributes at
/// least one snippet when possible.
fn format_diverse_snippets(matches: &[crate::retriever::FileMatches], keywords: &[String]) -> String {
    let mut by_keyword: HashMap<String, Vec<(String, u64, String)>> = HashMap::new();
    let mut seen_lines = std::collections::HashSet::new();

    for file in matches {
        for event in &file.events {
            if !seen_lines.insert((file.path.clone(), event.line_number)) {
                continue;
            }
            let tag = keywords
                .iter()
                .find(|k| event.line_text.to_lowercase().contains(&k.to_lowercase()))
                .cloned()
                .unwrap_or_else(|| "_".to_string());
            by_keyword.entry(tag).or_default().push((file.path.clone(), event.line_number, event.line_text.clone()));
        }
    }

    let mut groups: Vec<Vec<(String, u64, String)>> = by_keyword.into_values().collect();
    let mut ordered = Vec::new();
    loop {
        let mut any = false;
        for group in groups.iter_mut() {
            if let Some(entry) = group.pop() {
                ordered.push(entry);
                any = true;
            }
        }
        if !any {
            break;
        }
    }

    let mut by_path: Vec<(String, Vec<(u64, String)>)> = Vec::new();
    for (path, line, text) in ordered {
        if let Some((_, lines)) = by_path.iter_mut().find(|(p, _)| *p == path) {
            lines.push((line, text));
        } else {
            by_path.push((path, vec![(line, text)]));
        }
    }

    by_path
        .into_iter()
        .map(|(path, mut lines)| {
            lines.sort_by_key(|(n, _)| *n);
            let body = lines.iter().map(|(n, t)| format!("  L{n}: {t}")).collect::<Vec<_>>().join("\n");
            format!("[{path}]\n{body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// file_read
// ---------------------------------------------------------------------------

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "log", "csv", "json", "yaml", "yml", "toml", "ini", "cfg",
    "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "hpp", "sh", "html", "xml",
];

pub struct FileReadTool {
    max_chars_per_file: usize,
}

impl FileReadTool {
    pub fn new(max_chars_per_file: usize) -> Self {
        Self { max_chars_per_file }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &'static str {
        "file_read"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "file_read",
            "description": "Read the full (truncated) content of one or more files.",
            "parameters": {
                "file_paths": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    async fn execute(&self, ctx: &Mutex<SearchContext>, args: Value) -> (String, Value) {
        let paths: Vec<String> = args
            .get("file_paths")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        if paths.is_empty() {
            return ("No file paths provided.".to_string(), json!({"read": []}));
        }

        {
            let guard = ctx.lock().await;
            if guard.is_budget_exceeded() {
                return ("Budget exceeded; cannot read more files.".to_string(), json!({"read": []}));
            }
        }

        let mut blocks = Vec::new();
        let mut read_paths = Vec::new();

        for path in &paths {
            let already_read = ctx.lock().await.is_file_read(path);
            if already_read {
                continue;
            }

            let p = PathBuf::from(path);
            let ext = p.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
            let content = if TEXT_EXTENSIONS.contains(&ext.as_str()) {
                tokio::fs::read_to_string(&p).await.ok()
            } else {
                None
            };

            let Some(mut text) = content else {
                blocks.push(format!("[{path}]\n<extraction not available for this format>"));
                continue;
            };

            if text.chars().count() > self.max_chars_per_file {
                text = text.chars().take(self.max_chars_per_file).collect::<String>();
                text.push_str("\n... [truncated]");
            }

            blocks.push(format!("[{path}]\n{text}"));
            read_paths.push(path.clone());
        }

        {
            let mut guard = ctx.lock().await;
            for path in &read_paths {
                guard.mark_file_read(path);
            }
            guard.add_log("file_read", 0, json!({"read": read_paths}));
        }

        (blocks.join("\n\n---\n\n"), json!({"read": read_paths}))
    }
}

// ---------------------------------------------------------------------------
// dir_scan
// ---------------------------------------------------------------------------

pub struct DirScanTool {
    scanner: Arc<DirectoryScanner>,
    search_paths: Vec<PathBuf>,
    llm: Arc<dyn LlmClient>,
}

impl DirScanTool {
    pub fn new(scanner: Arc<DirectoryScanner>, search_paths: Vec<PathBuf>, llm: Arc<dyn LlmClient>) -> Self {
        Self { scanner, search_paths, llm }
    }
}

#[async_trait]
impl Tool for DirScanTool {
    fn name(&self) -> &'static str {
        "dir_scan"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "dir_scan",
            "description": "Scan the search paths and rank files by relevance to a query.",
            "parameters": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "default": 20}
            }
        })
    }

    async fn execute(&self, ctx: &Mutex<SearchContext>, args: Value) -> (String, Value) {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let top_k = args.get("top_k").and_then(|v| v.as_u64()).unwrap_or(20) as usize;

        let ranked = match self.scanner.scan_and_rank(query, &self.search_paths, top_k, self.llm.as_ref()).await {
            Ok(r) => r,
            Err(e) => return (format!("dir_scan failed: {e}"), json!({"error": e.to_string()})),
        };

        let mut blocks = Vec::new();
        let mut paths = Vec::new();
        for candidate in ranked.ranked_candidates.iter().take(top_k) {
            paths.push(candidate.path.display().to_string());
            let body = if candidate.content_loaded {
                candidate.full_content.clone().unwrap_or_default()
            } else {
                candidate.preview.clone()
            };
            blocks.push(format!(
                "[{}] relevance={:?} reason={}\n{}",
                candidate.path.display(),
                candidate.relevance,
                candidate.reason,
                body
            ));
        }

        {
            let mut guard = ctx.lock().await;
            guard.add_log("dir_scan", 0, json!({"paths": paths}));
        }

        (blocks.join("\n\n"), json!({"paths": paths}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyword_search_with_no_keywords_spawns_nothing() {
        let retriever = Arc::new(GrepRetriever::new("rga", 1, 5));
        let tool = KeywordSearchTool::new(retriever, vec![]);
        let ctx = Mutex::new(SearchContext::new(1000, 5));
        let (text, _) = tool.execute(&ctx, json!({"keywords": []})).await;
        assert_eq!(text, "No keywords provided.");
    }

    #[tokio::test]
    async fn file_read_with_no_paths_returns_message() {
        let tool = FileReadTool::new(30_000);
        let ctx = Mutex::new(SearchContext::new(1000, 5));
        let (text, _) = tool.execute(&ctx, json!({"file_paths": []})).await;
        assert_eq!(text, "No file paths provided.");
    }

    #[tokio::test]
    async fn file_read_truncates_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        tokio::fs::write(&path, "x".repeat(100)).await.unwrap();

        let tool = FileReadTool::new(10);
        let ctx = Mutex::new(SearchContext::new(10_000, 5));
        let (text, _) = tool.execute(&ctx, json!({"file_paths": [path.to_string_lossy()]})).await;
        assert!(text.contains("[truncated]"));
    }

    #[tokio::test]
    async fn file_read_skips_already_read_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "hello").await.unwrap();

        let tool = FileReadTool::new(1000);
        let ctx = Mutex::new(SearchContext::new(10_000, 5));
        ctx.lock().await.mark_file_read(&path.to_string_lossy());

        let (text, meta) = tool.execute(&ctx, json!({"file_paths": [path.to_string_lossy()]})).await;
        assert_eq!(text, "");
        assert_eq!(meta["read"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn registry_reports_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }
}
