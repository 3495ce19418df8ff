//! Append-log cluster store with an offset index and embedding-based reuse.
//!
//! On-disk layout: a data file (`.mpk`) of concatenated
//! `packb(cluster) || 0x00` records, and a separate index file (`.idx`)
//! mapping `id -> (offset, length)`. Grounded on §4.5; the original's
//! destructive-by-default `insert_cluster(overwrite=True)` becomes
//! `insert`/`insert_batch`, while the non-destructive `upsert` (the
//! supplement this expansion adds) is what online search sessions use.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::embeddings::cosine_similarity;
use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbstractionLevel {
    Concrete,
    General,
    Meta,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Emerging,
    Stable,
    Contested,
    Deprecated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceUnit {
    pub doc_id: String,
    pub file_or_url: String,
    pub summary: String,
    pub is_found: bool,
    pub snippets: Vec<Snippet>,
    pub extracted_at: chrono::DateTime<chrono::Utc>,
    pub conflict_group: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snippet {
    pub content: String,
    pub score: f64,
    pub range: (usize, usize),
    pub hit_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeCluster {
    pub id: String,
    pub name: String,
    pub description: Vec<String>,
    pub content: Vec<String>,
    pub queries: Vec<String>,
    pub search_results: Vec<String>,
    pub scripts: Vec<String>,
    pub resources: Vec<String>,
    pub patterns: Vec<String>,
    pub constraints: Vec<String>,
    pub evidences: Vec<EvidenceUnit>,
    pub confidence: f32,
    pub abstraction_level: AbstractionLevel,
    pub landmark_potential: f32,
    pub hotness: f32,
    pub lifecycle: Lifecycle,
    pub create_time: chrono::DateTime<chrono::Utc>,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    pub version: u32,
    pub related_clusters: Vec<String>,
    pub embedding_vector: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub embedding_text_hash: Option<String>,
}

pub const MAX_QUERIES_PER_CLUSTER_DEFAULT: usize = 20;
pub const MAX_SEARCH_RESULTS_PER_CLUSTER_DEFAULT: usize = 10;

impl KnowledgeCluster {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: Vec::new(),
            content: Vec::new(),
            queries: Vec::new(),
            search_results: Vec::new(),
            scripts: Vec::new(),
            resources: Vec::new(),
            patterns: Vec::new(),
            constraints: Vec::new(),
            evidences: Vec::new(),
            confidence: 0.5,
            abstraction_level: AbstractionLevel::Concrete,
            landmark_potential: 0.0,
            hotness: 0.5,
            lifecycle: Lifecycle::Emerging,
            create_time: now,
            last_modified: now,
            version: 1,
            related_clusters: Vec::new(),
            embedding_vector: None,
            embedding_model: None,
            embedding_timestamp: None,
            embedding_text_hash: None,
        }
    }

    /// FIFO-pushes `query` onto `queries`, evicting the oldest beyond `cap`.
    pub fn push_query(&mut self, query: String, cap: usize) {
        self.queries.push(query);
        while self.queries.len() > cap {
            self.queries.remove(0);
        }
    }

    /// FIFO-pushes a synthesized answer onto `search_results` (resolves Open Question 4).
    pub fn push_search_result(&mut self, result: String, cap: usize) {
        self.search_results.push(result);
        while self.search_results.len() > cap {
            self.search_results.remove(0);
        }
    }

    pub fn combined_queries_text(&self) -> String {
        self.queries.join(" ")
    }
}

struct IndexEntry {
    offset: u64,
    length: u64,
}

struct EmbeddingRow {
    vector: Vec<f32>,
    model: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    text_hash: String,
}

struct StoreState {
    index: HashMap<String, IndexEntry>,
    embeddings: HashMap<String, EmbeddingRow>,
    mmap: Option<Mmap>,
}

/// Append-log cluster store. `data_path`/`index_path` name the `.mpk`/`.idx`
/// files; callers typically point these at `EngineConfig::knowledge_dir()`.
pub struct ClusterStore {
    data_path: PathBuf,
    index_path: PathBuf,
    state: Arc<RwLock<StoreState>>,
}

impl ClusterStore {
    pub fn open(data_path: PathBuf, index_path: PathBuf) -> Result<Self> {
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !data_path.exists() {
            File::create(&data_path)?;
        }

        let index = if index_path.exists() {
            load_index(&index_path).unwrap_or_default()
        } else {
            HashMap::new()
        };
        let mmap = open_mmap(&data_path);

        Ok(Self {
            data_path,
            index_path,
            state: Arc::new(RwLock::new(StoreState { index, embeddings: HashMap::new(), mmap })),
        })
    }

    /// Overwrites the entire store with `clusters`. Mirrors the source's
    /// `insert_cluster(overwrite=True)` batch-build default.
    pub fn insert_batch(&self, clusters: &[KnowledgeCluster], overwrite: bool) -> Result<()> {
        let mut state = self.state.write();
        if overwrite {
            std::fs::write(&self.data_path, [])?;
            state.index.clear();
        }

        let mut file = OpenOptions::new().append(true).open(&self.data_path)?;
        for cluster in clusters {
            let offset = file.metadata()?.len();
            let bytes = rmp_serde::to_vec(cluster)?;
            file.write_all(&bytes)?;
            file.write_all(&[0x00])?;
            state.index.insert(cluster.id.clone(), IndexEntry { offset, length: bytes.len() as u64 + 1 });
        }
        file.sync_all()?;
        drop(file);

        state.mmap = open_mmap(&self.data_path);
        write_index_atomic(&self.index_path, &state.index)?;
        Ok(())
    }

    pub fn insert(&self, cluster: &KnowledgeCluster) -> Result<()> {
        self.insert_batch(std::slice::from_ref(cluster), true)
    }

    /// Always appends a fresh record for `cluster.id`, leaving every other
    /// record untouched. The online-update path (Phase 0 reuse, Phase 5
    /// persistence) must use this, never `insert`.
    pub fn upsert(&self, cluster: &KnowledgeCluster) -> Result<()> {
        let mut state = self.state.write();
        let mut file = OpenOptions::new().append(true).open(&self.data_path)?;
        let offset = file.metadata()?.len();
        let bytes = rmp_serde::to_vec(cluster)?;
        file.write_all(&bytes)?;
        file.write_all(&[0x00])?;
        file.sync_all()?;
        drop(file);

        state.index.insert(cluster.id.clone(), IndexEntry { offset, length: bytes.len() as u64 + 1 });
        state.mmap = open_mmap(&self.data_path);
        write_index_atomic(&self.index_path, &state.index)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<KnowledgeCluster>> {
        let (offset, length) = {
            let state = self.state.read();
            let Some(entry) = state.index.get(id) else { return Ok(None) };
            (entry.offset, entry.length)
        };

        let state = self.state.read();
        let Some(mmap) = state.mmap.as_ref() else { return Ok(None) };
        let start = offset as usize;
        let end = start + (length as usize).saturating_sub(1);
        if end > mmap.len() {
            return Ok(None);
        }
        let cluster: KnowledgeCluster = rmp_serde::from_slice(&mmap[start..end])?;
        Ok(Some(cluster))
    }

    /// Index-only deletion; space reclaimed by `rebuild()`.
    pub fn delete_batch(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write();
        for id in ids {
            state.index.remove(id);
            state.embeddings.remove(id);
        }
        write_index_atomic(&self.index_path, &state.index)?;
        Ok(())
    }

    /// Compacts the store: rewrites the data file containing only live ids.
    pub fn rebuild(&self) -> Result<()> {
        let live_ids: Vec<String> = {
            let state = self.state.read();
            state.index.keys().cloned().collect()
        };
        let mut clusters = Vec::with_capacity(live_ids.len());
        for id in &live_ids {
            if let Some(c) = self.get(id)? {
                clusters.push(c);
            }
        }
        self.insert_batch(&clusters, true)
    }

    /// Rebuilds the index by scanning the data file for `0x00`-terminated records.
    pub fn repair(&self) -> Result<()> {
        let mut file = File::open(&self.data_path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut index = HashMap::new();
        let mut offset = 0usize;
        let mut start = 0usize;
        while start < buf.len() {
            let Some(rel_end) = buf[start..].iter().position(|&b| b == 0x00) else { break };
            let end = start + rel_end;
            if let Ok(cluster) = rmp_serde::from_slice::<KnowledgeCluster>(&buf[start..end]) {
                index.insert(cluster.id, IndexEntry { offset: start as u64, length: (end - start + 1) as u64 });
            }
            offset = end + 1;
            start = offset;
        }

        let mut state = self.state.write();
        state.index = index;
        state.mmap = open_mmap(&self.data_path);
        write_index_atomic(&self.index_path, &state.index)?;
        Ok(())
    }

    /// Stores (or replaces) an embedding row for `id`, used by cluster reuse search.
    pub fn set_embedding(&self, id: &str, vector: Vec<f32>, model: String, text_hash: String) {
        let mut state = self.state.write();
        state
            .embeddings
            .insert(id.to_string(), EmbeddingRow { vector, model, timestamp: chrono::Utc::now(), text_hash });
    }

    pub fn search_similar_clusters(&self, query_embedding: &[f32], top_k: usize, threshold: f32) -> Vec<(String, f32)> {
        let state = self.state.read();
        let mut scored: Vec<(String, f32)> = state
            .embeddings
            .iter()
            .map(|(id, row)| (id.clone(), cosine_similarity(query_embedding, &row.vector)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn open_mmap(path: &Path) -> Option<Mmap> {
    let file = File::open(path).ok()?;
    if file.metadata().ok()?.len() == 0 {
        return None;
    }
    unsafe { Mmap::map(&file).ok() }
}

fn load_index(path: &Path) -> Result<HashMap<String, IndexEntry>> {
    let bytes = std::fs::read(path)?;
    let raw: HashMap<String, (u64, u64)> =
        bincode::deserialize(&bytes).map_err(|e| EngineError::Storage(e.to_string()))?;
    Ok(raw.into_iter().map(|(k, (offset, length))| (k, IndexEntry { offset, length })).collect())
}

fn write_index_atomic(path: &Path, index: &HashMap<String, IndexEntry>) -> Result<()> {
    let raw: HashMap<String, (u64, u64)> =
        index.iter().map(|(k, v)| (k.clone(), (v.offset, v.length))).collect();
    let bytes = bincode::serialize(&raw).map_err(|e| EngineError::Storage(e.to_string()))?;

    let tmp_path = path.with_extension("idx.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ClusterStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::open(dir.path().join("clusters.mpk"), dir.path().join("clusters.idx")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (_dir, store) = temp_store();
        let cluster = KnowledgeCluster::new("c1", "test cluster");
        store.insert(&cluster).unwrap();
        let fetched = store.get("c1").unwrap().unwrap();
        assert_eq!(fetched.id, "c1");
        assert_eq!(fetched.name, "test cluster");
    }

    #[test]
    fn upsert_does_not_truncate_other_records() {
        let (_dir, store) = temp_store();
        let c1 = KnowledgeCluster::new("c1", "one");
        let c2 = KnowledgeCluster::new("c2", "two");
        store.insert_batch(&[c1, c2], true).unwrap();

        let mut updated = store.get("c1").unwrap().unwrap();
        updated.hotness = 0.9;
        store.upsert(&updated).unwrap();

        assert!(store.get("c1").unwrap().unwrap().hotness > 0.8);
        assert!(store.get("c2").unwrap().is_some(), "upsert must not destroy sibling records");
    }

    #[test]
    fn insert_with_same_id_overwrites_via_index_update() {
        let (_dir, store) = temp_store();
        let mut c = KnowledgeCluster::new("dup", "v1");
        store.upsert(&c).unwrap();
        c.name = "v2".to_string();
        store.upsert(&c).unwrap();
        assert_eq!(store.get("dup").unwrap().unwrap().name, "v2");
    }

    #[test]
    fn delete_batch_then_rebuild_removes_dead_record() {
        let (_dir, store) = temp_store();
        let c1 = KnowledgeCluster::new("c1", "one");
        let c2 = KnowledgeCluster::new("c2", "two");
        store.insert_batch(&[c1, c2], true).unwrap();
        store.delete_batch(&["c1".to_string()]).unwrap();
        store.rebuild().unwrap();

        assert!(store.get("c1").unwrap().is_none());
        assert!(store.get("c2").unwrap().is_some());
    }

    #[test]
    fn repair_recovers_index_from_data_alone() {
        let (_dir, store) = temp_store();
        let c1 = KnowledgeCluster::new("c1", "one");
        let c2 = KnowledgeCluster::new("c2", "two");
        store.insert_batch(&[c1, c2], true).unwrap();

        std::fs::remove_file(&store.index_path).unwrap();
        store.repair().unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("c1").unwrap().is_some());
    }

    #[test]
    fn queries_fifo_eviction_respects_cap() {
        let mut cluster = KnowledgeCluster::new("c1", "one");
        for i in 0..5 {
            cluster.push_query(format!("q{i}"), 3);
        }
        assert_eq!(cluster.queries.len(), 3);
        assert_eq!(cluster.queries, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn search_similar_clusters_filters_by_threshold() {
        let (_dir, store) = temp_store();
        store.set_embedding("c1", vec![1.0, 0.0], "m".into(), "h".into());
        store.set_embedding("c2", vec![0.0, 1.0], "m".into(), "h".into());
        let hits = store.search_similar_clusters(&[1.0, 0.0], 5, 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "c1");
    }
}
