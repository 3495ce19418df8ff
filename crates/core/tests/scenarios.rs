//! End-to-end scenarios that don't require a live LLM endpoint (§8.4):
//! the filename-only fast path and the empty-query boundary. Scenarios
//! that require cluster reuse, ReAct budget exhaustion, and index repair
//! are covered by targeted unit tests colocated with their modules
//! (`cluster_store.rs`, `react_agent.rs`, `context.rs`).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sirchmunk_core::agentic_search::{AgenticSearch, SearchOptions};
use sirchmunk_core::config::EngineConfig;
use sirchmunk_core::embeddings::Embedder;
use sirchmunk_core::error::Result;
use sirchmunk_core::llm::{ChatResponse, LlmClient, Message};

struct UnreachableLlm;

#[async_trait]
impl LlmClient for UnreachableLlm {
    async fn chat(&self, _messages: &[Message]) -> Result<ChatResponse> {
        panic!("filename-only search must never call the LLM");
    }
}

struct UnreachableEmbedder;

#[async_trait]
impl Embedder for UnreachableEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        panic!("filename-only search must never call the embedder");
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        panic!("filename-only search must never call the embedder");
    }
}

fn test_config(work_path: PathBuf, search_paths: Vec<PathBuf>) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.work_path = work_path;
    config.search_paths = search_paths;
    config.enable_cluster_reuse = false;
    config
}

#[tokio::test]
async fn filename_only_fast_path_bypasses_llm_and_finds_matching_file() {
    let work_dir = tempfile::tempdir().unwrap();
    let corpus_dir = tempfile::tempdir().unwrap();
    std::fs::write(corpus_dir.path().join("quarterly_budget_report.txt"), "irrelevant body").unwrap();
    std::fs::write(corpus_dir.path().join("unrelated_notes.txt"), "irrelevant body").unwrap();

    let config = test_config(work_dir.path().to_path_buf(), vec![corpus_dir.path().to_path_buf()]);
    let engine = AgenticSearch::new(config, Arc::new(UnreachableLlm), Arc::new(UnreachableEmbedder)).unwrap();

    let outcome = engine
        .search_deep("budget", SearchOptions { filename_only: true, return_cluster: false })
        .await
        .unwrap();

    assert!(outcome.answer.contains("quarterly_budget_report.txt"));
    assert!(outcome.cluster_id.is_none());
}

#[tokio::test]
async fn filename_only_fast_path_with_no_match_returns_sentinel() {
    let work_dir = tempfile::tempdir().unwrap();
    let corpus_dir = tempfile::tempdir().unwrap();
    std::fs::write(corpus_dir.path().join("unrelated_notes.txt"), "irrelevant body").unwrap();

    let config = test_config(work_dir.path().to_path_buf(), vec![corpus_dir.path().to_path_buf()]);
    let engine = AgenticSearch::new(config, Arc::new(UnreachableLlm), Arc::new(UnreachableEmbedder)).unwrap();

    let outcome = engine
        .search_deep("nonexistentterm12345", SearchOptions { filename_only: true, return_cluster: false })
        .await
        .unwrap();

    assert!(outcome.answer.starts_with("No relevant information found for the query:"));
}

#[tokio::test]
async fn whitespace_only_query_yields_no_results_sentinel_without_touching_llm() {
    let work_dir = tempfile::tempdir().unwrap();
    let corpus_dir = tempfile::tempdir().unwrap();

    let config = test_config(work_dir.path().to_path_buf(), vec![corpus_dir.path().to_path_buf()]);
    let engine = AgenticSearch::new(config, Arc::new(UnreachableLlm), Arc::new(UnreachableEmbedder)).unwrap();

    let outcome = engine
        .search_deep("   ", SearchOptions { filename_only: false, return_cluster: false })
        .await
        .unwrap();

    assert!(outcome.answer.starts_with("No relevant information found for the query:"));
}
