//! `AgenticSearch`: the five-phase retrieval pipeline (§4.10).
//!
//! A single concrete struct, not a trait — per the design notes, a trait
//! hierarchy is reserved for the collaborators that are genuinely
//! substituted (`LlmClient`, `Embedder`); the orchestration shape itself has
//! exactly one implementation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cluster_store::{ClusterStore, KnowledgeCluster};
use crate::config::EngineConfig;
use crate::context::SearchContext;
use crate::embeddings::Embedder;
use crate::knowledge_base::{BuildRequest, KnowledgeBase};
use crate::llm::{LlmClient, Message};
use crate::prompts;
use crate::react_agent::ReActAgent;
use crate::retriever::GrepRetriever;
use crate::sampler::MonteCarloEvidenceSampler;
use crate::scan::DirectoryScanner;
use crate::spec_cache::{SpecCache, SpecCacheEntryTemplate};
use crate::tools::{DirScanTool, FileReadTool, KeywordSearchTool, KnowledgeQueryTool, ToolRegistry};

pub const NO_RESULTS_SENTINEL: &str = "No relevant information found for the query: ";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub answer: String,
    pub cluster_id: Option<String>,
    pub from_cache: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub filename_only: bool,
    pub return_cluster: bool,
}

pub struct AgenticSearch {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn Embedder>,
    store: Arc<ClusterStore>,
    spec_cache: Arc<SpecCache>,
    scanner: Arc<DirectoryScanner>,
    retriever: Arc<GrepRetriever>,
    sampler: Arc<MonteCarloEvidenceSampler>,
    tools: Arc<ToolRegistry>,
    react_agent: Arc<ReActAgent>,
}

impl AgenticSearch {
    pub fn new(config: EngineConfig, llm: Arc<dyn LlmClient>, embedder: Arc<dyn Embedder>) -> crate::error::Result<Self> {
        let store = Arc::new(ClusterStore::open(
            config.knowledge_dir().join("clusters.mpk"),
            config.knowledge_dir().join("clusters.idx"),
        )?);
        let spec_cache = Arc::new(SpecCache::new(config.spec_dir()));
        let scanner = Arc::new(DirectoryScanner::new(&config));
        let retriever = Arc::new(GrepRetriever::new("rga", config.grep_concurrent_limit, config.grep_timeout_secs));
        let sampler = Arc::new(MonteCarloEvidenceSampler::default());

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(KnowledgeQueryTool::new(store.clone(), embedder.clone())));
        registry.register(Arc::new(KeywordSearchTool::new(retriever.clone(), config.search_paths.clone())));
        registry.register(Arc::new(FileReadTool::new(config.max_chars_per_file)));
        registry.register(Arc::new(DirScanTool::new(scanner.clone(), config.search_paths.clone(), llm.clone())));
        let tools = Arc::new(registry);

        let react_agent = Arc::new(ReActAgent::new(llm.clone(), tools.clone()));

        Ok(Self { config, llm, embedder, store, spec_cache, scanner, retriever, sampler, tools, react_agent })
    }

    /// Convenience entry point returning just the answer text.
    pub async fn search(&self, query: &str) -> crate::error::Result<String> {
        Ok(self.search_deep(query, SearchOptions::default()).await?.answer)
    }

    pub async fn search_deep(&self, query: &str, options: SearchOptions) -> crate::error::Result<SearchOutcome> {
        if query.trim().is_empty() {
            return Ok(SearchOutcome {
                answer: format!("{NO_RESULTS_SENTINEL}{query}"),
                cluster_id: None,
                from_cache: false,
            });
        }

        if options.filename_only {
            return self.search_filename_only(query).await;
        }

        let ctx = Mutex::new(SearchContext::new(self.config.max_token_budget, self.config.max_loops));

        // Phase 0: cluster-reuse short-circuit.
        if self.config.enable_cluster_reuse {
            if let Some(outcome) = self.try_cluster_reuse(query).await {
                return Ok(outcome);
            }
        }

        // Phase 1: four concurrent probes.
        let (keyword_result, scan_result, cache_candidate_ids, spec_hint) = tokio::join!(
            self.extract_keywords(query),
            self.scan_only(),
            self.cluster_candidate_paths(query),
            self.spec_cache.load_context(&self.config.search_paths, self.config.spec_cache_ttl_hours),
        );
        let (idf_map, keywords) = keyword_result.unwrap_or_default();
        let scan_result = scan_result.unwrap_or_default();

        // Phase 2: two concurrent retrievals.
        let keyword_args = serde_json::json!({"keywords": keywords});
        let (keyword_observation, rank_result) = tokio::join!(
            self.tools.execute("keyword_search", &ctx, keyword_args),
            self.scanner.rank(query, &scan_result, self.config.default_top_k_files, self.llm.as_ref()),
        );
        let keyword_paths = extract_paths_from_metadata(&keyword_observation.1);
        let ranked_high: Vec<PathBuf> = rank_result
            .map(|r| {
                r.ranked_candidates
                    .into_iter()
                    .filter(|c| matches!(c.relevance, crate::scan::Relevance::High))
                    .map(|c| c.path)
                    .collect()
            })
            .unwrap_or_default();

        // Phase 3: merge (priority: keyword_search > knowledge_cache > dir_scan) and build.
        let merged_paths = merge_paths(vec![keyword_paths, cache_candidate_ids.unwrap_or_default(), ranked_high]);

        let built_cluster = if !merged_paths.is_empty() {
            let kb = KnowledgeBase::new(self.sampler.clone(), self.llm.clone());
            kb.build(BuildRequest {
                user_input: query,
                files: &merged_paths,
                top_k_files: self.config.default_top_k_files,
                top_k_snippets: 5,
            })
            .await
            .unwrap_or(None)
        } else {
            None
        };

        // Phase 4: answer generation.
        let (mut cluster, answer) = if let Some(cluster) = built_cluster {
            let text_content = cluster.content.join("\n");
            let prompt = prompts::search_result_summary_prompt(query, &text_content);
            let response = self.llm.chat(&[Message::user(prompt)]).await?;
            let summary = crate::llm::extract_tag(&response.content, "SUMMARY").unwrap_or(response.content);
            (cluster, summary)
        } else {
            let outcome = self
                .react_agent
                .run(&format!("{query}\n\nPrior context: {spec_hint}"), &ctx, Some(keywords.clone()))
                .await?;
            let read_files: Vec<PathBuf> = ctx.lock().await.read_file_ids().iter().map(PathBuf::from).collect();
            let mut cluster = KnowledgeCluster::new(uuid::Uuid::new_v4().to_string(), query.to_string());
            cluster.content = vec![outcome.answer.clone()];
            cluster.related_clusters = read_files.iter().map(|p| p.display().to_string()).collect();
            (cluster, outcome.answer)
        };

        if answer.trim().is_empty() {
            return Ok(SearchOutcome {
                answer: format!("{NO_RESULTS_SENTINEL}{query}"),
                cluster_id: None,
                from_cache: false,
            });
        }

        cluster.push_query(query.to_string(), self.config.max_queries_per_cluster);
        cluster.push_search_result(answer.clone(), self.config.max_search_results_per_cluster);
        cluster.last_modified = chrono::Utc::now();

        // Phase 5: fire-and-forget persistence.
        self.spawn_persistence(cluster.clone(), idf_map, &ctx).await;

        Ok(SearchOutcome { answer, cluster_id: Some(cluster.id), from_cache: false })
    }

    async fn try_cluster_reuse(&self, query: &str) -> Option<SearchOutcome> {
        let embedding = self.embedder.embed(query).await.ok()?;
        let hits = self.store.search_similar_clusters(&embedding, self.config.cluster_sim_top_k, self.config.cluster_sim_threshold);
        let (id, _score) = hits.first()?;
        let mut cluster = self.store.get(id).ok()??;

        cluster.push_query(query.to_string(), self.config.max_queries_per_cluster);
        cluster.hotness = (cluster.hotness + 0.1).min(1.0);
        cluster.last_modified = chrono::Utc::now();

        if let Ok(new_embedding) = self.embedder.embed(&cluster.combined_queries_text()).await {
            let hash = crate::retriever::content_fingerprint(cluster.combined_queries_text().as_bytes(), 64);
            cluster.embedding_vector = Some(new_embedding.clone());
            cluster.embedding_text_hash = Some(hash.clone());
            self.store.set_embedding(&cluster.id, new_embedding, "default".to_string(), hash);
        }

        let _ = self.store.upsert(&cluster);
        Some(SearchOutcome { answer: cluster.content.join("\n"), cluster_id: Some(cluster.id), from_cache: true })
    }

    async fn extract_keywords(&self, query: &str) -> crate::error::Result<(serde_json::Value, Vec<String>)> {
        let prompt = format!(
            "Extract search keywords from this query at two levels of granularity (broad and specific). \
             Query: \"{query}\"\nRespond with JSON: {{\"level_1\": [...], \"level_2\": [...]}}"
        );
        let response = self.llm.chat(&[Message::user(prompt)]).await?;
        let parsed: serde_json::Value = serde_json::from_str(&response.content).unwrap_or_default();

        let mut keywords = Vec::new();
        for level in ["level_1", "level_2"] {
            if let Some(arr) = parsed.get(level).and_then(|v| v.as_array()) {
                keywords.extend(arr.iter().filter_map(|v| v.as_str().map(String::from)));
            }
        }
        if keywords.is_empty() {
            keywords = query.split_whitespace().map(String::from).collect();
        }

        let idf_map = serde_json::json!({});
        Ok((idf_map, keywords))
    }

    async fn scan_only(&self) -> crate::error::Result<crate::scan::ScanResult> {
        Ok(self.scanner.scan(&self.config.search_paths))
    }

    async fn cluster_candidate_paths(&self, query: &str) -> crate::error::Result<Vec<PathBuf>> {
        let Ok(embedding) = self.embedder.embed(query).await else { return Ok(Vec::new()) };
        let hits = self.store.search_similar_clusters(&embedding, self.config.cluster_sim_top_k, 0.0);
        let mut paths = Vec::new();
        for (id, _) in hits {
            if let Ok(Some(cluster)) = self.store.get(&id) {
                for evidence in cluster.evidences {
                    let p = PathBuf::from(&evidence.file_or_url);
                    if p.exists() {
                        paths.push(p);
                    }
                }
            }
        }
        Ok(paths)
    }

    async fn spawn_persistence(
        &self,
        cluster: KnowledgeCluster,
        _idf_map: serde_json::Value,
        ctx: &Mutex<SearchContext>,
    ) {
        let store = self.store.clone();
        let embedder = self.embedder.clone();
        let spec_cache = self.spec_cache.clone();
        let search_paths = self.config.search_paths.clone();

        let combined = cluster.combined_queries_text();
        let summary = {
            let guard = ctx.lock().await;
            guard.summary()
        };
        let files_read: Vec<String> = {
            let guard = ctx.lock().await;
            guard.read_file_ids().iter().cloned().collect()
        };
        let search_history: Vec<String> = {
            let guard = ctx.lock().await;
            guard.search_history().to_vec()
        };
        let total_llm_tokens = {
            let guard = ctx.lock().await;
            guard.total_llm_tokens()
        };
        let loop_count = {
            let guard = ctx.lock().await;
            guard.loop_count()
        };

        tokio::spawn(async move {
            let mut cluster = cluster;
            if let Ok(embedding) = embedder.embed(&combined).await {
                let hash = crate::retriever::content_fingerprint(combined.as_bytes(), 64);
                cluster.embedding_vector = Some(embedding.clone());
                cluster.embedding_text_hash = Some(hash.clone());
                store.set_embedding(&cluster.id, embedding, "default".to_string(), hash);
            }
            if let Err(e) = store.upsert(&cluster) {
                tracing::warn!(error = %e, "background cluster persistence failed");
            }

            let template = SpecCacheEntryTemplate { total_llm_tokens, loop_count, files_read, search_history, summary, retrieval_logs: vec![] };
            spec_cache.save_context(&search_paths, &template).await;
        });
    }

    async fn search_filename_only(&self, query: &str) -> crate::error::Result<SearchOutcome> {
        let scan = self.scanner.scan(&self.config.search_paths);
        let words: Vec<String> = query.split_whitespace().map(|w| format!(".*{}.*", regex::escape(w))).collect();

        let candidates: Vec<PathBuf> = scan.candidates.iter().map(|c| c.path.clone()).collect();
        let hits = self.retriever.search_filenames(&words, &candidates);

        if hits.is_empty() {
            return Ok(SearchOutcome { answer: format!("{NO_RESULTS_SENTINEL}{query}"), cluster_id: None, from_cache: false });
        }

        let answer = hits
            .iter()
            .take(self.config.default_top_k_files)
            .map(|h| h.path.clone())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(SearchOutcome { answer, cluster_id: None, from_cache: false })
    }

    /// One-shot classification of whether `query` is a whole-document
    /// operation (summarise/translate/etc.) rather than a targeted lookup.
    pub async fn detect_doc_intent(&self, query: &str) -> crate::error::Result<bool> {
        let prompt = prompts::detect_doc_intent_prompt(query);
        let response = self.llm.chat(&[Message::user(prompt)]).await?;
        Ok(response.content.trim().eq_ignore_ascii_case("DOCUMENT"))
    }
}

/// De-duplicates path lists while preserving priority order across groups:
/// entries in an earlier group win over later duplicates.
fn merge_paths(groups: Vec<Vec<PathBuf>>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for group in groups {
        for path in group {
            if seen.insert(path.clone()) {
                merged.push(path);
            }
        }
    }
    merged
}

fn extract_paths_from_metadata(metadata: &serde_json::Value) -> Vec<PathBuf> {
    metadata
        .get("paths")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(PathBuf::from)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_paths_preserves_priority_and_dedupes() {
        let a = vec![PathBuf::from("/x.txt"), PathBuf::from("/y.txt")];
        let b = vec![PathBuf::from("/y.txt"), PathBuf::from("/z.txt")];
        let merged = merge_paths(vec![a, b]);
        assert_eq!(merged, vec![PathBuf::from("/x.txt"), PathBuf::from("/y.txt"), PathBuf::from("/z.txt")]);
    }

    #[test]
    fn extract_paths_from_metadata_reads_paths_array() {
        let meta = serde_json::json!({"paths": ["/a.txt", "/b.txt"]});
        let paths = extract_paths_from_metadata(&meta);
        assert_eq!(paths, vec![PathBuf::from("/a.txt"), PathBuf::from("/b.txt")]);
    }

    #[test]
    fn extract_paths_from_metadata_missing_key_is_empty() {
        let meta = serde_json::json!({});
        assert!(extract_paths_from_metadata(&meta).is_empty());
    }
}
