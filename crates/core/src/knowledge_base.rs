//! Builds a `KnowledgeCluster` from a set of retrieved files and a query.
//!
//! Per §4.9: extract evidence per file via the Monte-Carlo sampler, then ask
//! the LLM to synthesise a name/description/content triple from whichever
//! evidence units were actually found.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster_store::{EvidenceUnit, KnowledgeCluster, Snippet};
use crate::llm::{extract_tag, LlmClient, Message};
use crate::prompts;
use crate::sampler::MonteCarloEvidenceSampler;

pub struct BuildRequest<'a> {
    pub user_input: &'a str,
    pub files: &'a [PathBuf],
    pub top_k_files: usize,
    pub top_k_snippets: usize,
}

pub struct KnowledgeBase {
    sampler: Arc<MonteCarloEvidenceSampler>,
    llm: Arc<dyn LlmClient>,
}

impl KnowledgeBase {
    pub fn new(sampler: Arc<MonteCarloEvidenceSampler>, llm: Arc<dyn LlmClient>) -> Self {
        Self { sampler, llm }
    }

    pub async fn build(&self, request: BuildRequest<'_>) -> crate::error::Result<Option<KnowledgeCluster>> {
        let evidence_guide = vec![request.user_input.to_string()];
        let mut evidences = Vec::new();

        for path in request.files.iter().take(request.top_k_files) {
            let Ok(text) = tokio::fs::read_to_string(path).await else { continue };
            let rois = self.sampler.top_k(path, &evidence_guide, request.top_k_snippets).unwrap_or_default();
            let is_found = !rois.is_empty();

            let snippets: Vec<Snippet> = rois
                .iter()
                .map(|r| Snippet { content: r.content.clone(), score: r.score, range: r.range, hit_count: r.hit_count })
                .collect();

            let summary = rois.first().map(|r| r.content.chars().take(200).collect()).unwrap_or_default();
            let doc_id = crate::retriever::content_fingerprint(text.as_bytes(), 4096);

            evidences.push(EvidenceUnit {
                doc_id,
                file_or_url: path.display().to_string(),
                summary,
                is_found,
                snippets,
                extracted_at: chrono::Utc::now(),
                conflict_group: Vec::new(),
            });
        }

        if evidences.iter().all(|e| !e.is_found) {
            return Ok(None);
        }

        let joined_summaries = evidences
            .iter()
            .filter(|e| e.is_found)
            .map(|e| format!("[{}]\n{}", e.file_or_url, e.summary))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = prompts::evidence_summary_prompt(request.user_input, &joined_summaries);
        let response = self.llm.chat(&[Message::user(prompt)]).await?;

        let name = extract_tag(&response.content, "NAME").unwrap_or_else(|| request.user_input.to_string());
        let description = extract_tag(&response.content, "DESCRIPTION").unwrap_or_default();
        let content = extract_tag(&response.content, "CONTENT").unwrap_or(response.content);

        let mut cluster = KnowledgeCluster::new(Uuid::new_v4().to_string(), name);
        cluster.description = vec![description];
        cluster.content = vec![content];
        cluster.evidences = evidences;
        Ok(Some(cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use async_trait::async_trait;

    struct StubLlm(String);

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn chat(&self, _messages: &[Message]) -> crate::error::Result<ChatResponse> {
            Ok(ChatResponse { content: self.0.clone(), ..Default::default() })
        }
    }

    #[tokio::test]
    async fn build_returns_none_when_no_evidence_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "").await.unwrap();

        let sampler = Arc::new(MonteCarloEvidenceSampler::new(5, 5000, 1));
        let llm = Arc::new(StubLlm("<NAME>x</NAME>".to_string()));
        let kb = KnowledgeBase::new(sampler, llm);

        let result = kb
            .build(BuildRequest { user_input: "find x", files: &[path], top_k_files: 5, top_k_snippets: 3 })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn build_produces_cluster_from_found_evidence() {
        // The sampler's anchors come from whitespace-stripped windows of
        // `user_input`, so this fixture embeds the stripped query text
        // contiguously in the file to guarantee an anchor match.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(
            &path,
            "Our internal schedule notes that marchbudgetreview happens every year in the finance office.",
        )
        .await
        .unwrap();

        let sampler = Arc::new(MonteCarloEvidenceSampler::new(20, 5000, 7));
        let llm = Arc::new(StubLlm(
            "<NAME>Budget Review</NAME><DESCRIPTION>Happens in March</DESCRIPTION><CONTENT>March review</CONTENT>"
                .to_string(),
        ));
        let kb = KnowledgeBase::new(sampler, llm);

        let result = kb
            .build(BuildRequest { user_input: "marchbudgetreview", files: &[path], top_k_files: 5, top_k_snippets: 3 })
            .await
            .unwrap();
        assert!(result.is_some());
        let cluster = result.unwrap();
        assert_eq!(cluster.name, "Budget Review");
    }
}
