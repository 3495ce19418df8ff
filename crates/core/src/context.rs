//! Per-session search state: token budget, file-dedup, retrieval logs, loop counter.
//!
//! `SearchContext` is exclusively owned by one search session. It is never
//! shared across tasks except by read-only snapshot into prompt text, and it
//! is never persisted verbatim — a derived summary is written to the spec
//! cache instead (see `spec_cache.rs`).

use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Usage as reported by one LLM call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One entry in the retrieval log: a tool invocation and its approximate cost.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalLogEntry {
    pub tool_name: String,
    pub approx_tokens: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub metadata: serde_json::Value,
}

/// Per-session state shared by every component of one `search`/`search_deep` call.
pub struct SearchContext {
    pub max_token_budget: u32,
    pub max_loops: u32,
    total_llm_tokens: u32,
    llm_usages: Vec<LlmUsage>,
    read_file_ids: HashSet<String>,
    retrieval_logs: Vec<RetrievalLogEntry>,
    search_history: Vec<String>,
    loop_count: u32,
    start_time: Instant,
}

impl SearchContext {
    pub fn new(max_token_budget: u32, max_loops: u32) -> Self {
        Self {
            max_token_budget,
            max_loops,
            total_llm_tokens: 0,
            llm_usages: Vec::new(),
            read_file_ids: HashSet::new(),
            retrieval_logs: Vec::new(),
            search_history: Vec::new(),
            loop_count: 0,
            start_time: Instant::now(),
        }
    }

    /// Canonicalizes a path string for dedup purposes: absolute-ish string
    /// equality, not stat-equality — two different strings naming the same
    /// inode are treated as distinct.
    fn canonical_key(path: &str) -> String {
        path.replace('\\', "/")
    }

    /// Records usage from an LLM call. The `tokens` figure is diagnostic only
    /// (matches the original's `add_log` contract) and does not itself affect
    /// the budget — only `add_llm_tokens` does.
    pub fn add_llm_tokens(&mut self, tokens: u32, usage: Option<LlmUsage>) {
        self.total_llm_tokens += tokens;
        if let Some(u) = usage {
            self.llm_usages.push(u);
        } else {
            self.llm_usages.push(LlmUsage { total_tokens: tokens, ..Default::default() });
        }
    }

    pub fn total_llm_tokens(&self) -> u32 {
        self.total_llm_tokens
    }

    pub fn llm_usages(&self) -> &[LlmUsage] {
        &self.llm_usages
    }

    /// Budget is exceeded once consumption strictly exceeds the cap.
    pub fn is_budget_exceeded(&self) -> bool {
        self.total_llm_tokens > self.max_token_budget
    }

    pub fn budget_remaining(&self) -> u32 {
        self.max_token_budget.saturating_sub(self.total_llm_tokens)
    }

    pub fn mark_file_read(&mut self, path: &str) {
        self.read_file_ids.insert(Self::canonical_key(path));
    }

    pub fn is_file_read(&self, path: &str) -> bool {
        self.read_file_ids.contains(&Self::canonical_key(path))
    }

    pub fn read_file_ids(&self) -> &HashSet<String> {
        &self.read_file_ids
    }

    pub fn add_log(&mut self, tool_name: impl Into<String>, tokens: u32, metadata: serde_json::Value) {
        self.retrieval_logs.push(RetrievalLogEntry {
            tool_name: tool_name.into(),
            approx_tokens: tokens,
            timestamp: chrono::Utc::now(),
            metadata,
        });
    }

    pub fn retrieval_logs(&self) -> &[RetrievalLogEntry] {
        &self.retrieval_logs
    }

    pub fn add_search(&mut self, query: impl Into<String>) {
        self.search_history.push(query.into());
    }

    pub fn search_history(&self) -> &[String] {
        &self.search_history
    }

    pub fn increment_loop(&mut self) {
        self.loop_count += 1;
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Reached once the loop counter catches up to the cap — `>=`, not `>`,
    /// so a context created with `loop_count == max_loops` is already done.
    pub fn is_loop_limit_reached(&self) -> bool {
        self.loop_count >= self.max_loops
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// One-line diagnostic summary, consumed by logging and by the spec cache.
    pub fn summary(&self) -> String {
        format!(
            "phases={}/{} llm_tokens={}/{} llm_calls={} files_read={} searches={}",
            self.loop_count,
            self.max_loops,
            self.total_llm_tokens,
            self.max_token_budget,
            self.llm_usages.len(),
            self.read_file_ids.len(),
            self.search_history.len(),
        )
    }
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::new(64_000, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_is_strict_greater_than() {
        let mut ctx = SearchContext::new(100, 5);
        ctx.add_llm_tokens(100, None);
        assert!(!ctx.is_budget_exceeded(), "exactly at budget must not be exceeded");
        ctx.add_llm_tokens(1, None);
        assert!(ctx.is_budget_exceeded());
    }

    #[test]
    fn loop_limit_reached_is_greater_or_equal() {
        let mut ctx = SearchContext::new(1000, 3);
        ctx.increment_loop();
        ctx.increment_loop();
        assert!(!ctx.is_loop_limit_reached());
        ctx.increment_loop();
        assert!(ctx.is_loop_limit_reached());
    }

    #[test]
    fn file_dedup_is_string_equal_not_stat_equal() {
        let mut ctx = SearchContext::new(1000, 3);
        ctx.mark_file_read("/a/b.txt");
        assert!(ctx.is_file_read("/a/b.txt"));
        assert!(!ctx.is_file_read("/a/./b.txt"));
    }

    #[test]
    fn summary_matches_expected_format() {
        let mut ctx = SearchContext::new(200, 5);
        ctx.increment_loop();
        ctx.add_llm_tokens(50, None);
        ctx.mark_file_read("/x.txt");
        ctx.add_search("hello");
        assert_eq!(ctx.summary(), "phases=1/5 llm_tokens=50/200 llm_calls=1 files_read=1 searches=1");
    }

    #[test]
    fn total_tokens_equals_sum_of_usages() {
        let mut ctx = SearchContext::new(10_000, 5);
        ctx.add_llm_tokens(30, Some(LlmUsage { prompt_tokens: 10, completion_tokens: 20, total_tokens: 30 }));
        ctx.add_llm_tokens(70, Some(LlmUsage { prompt_tokens: 40, completion_tokens: 30, total_tokens: 70 }));
        let sum: u32 = ctx.llm_usages().iter().map(|u| u.total_tokens).sum();
        assert_eq!(sum, ctx.total_llm_tokens());
    }
}
