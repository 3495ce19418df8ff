//! Per-search-path scratch cache used to warm-start ReAct sessions.
//!
//! Keyed by the first 16 hex digits of SHA-256 of the canonical path string.
//! Writes are serialised per path behind a `tokio::Mutex` (held across
//! `.await`, unlike `ClusterStore`'s synchronous `parking_lot::RwLock`) and
//! land via temp-file-then-rename. Never fails the calling session: read and
//! write errors are logged and swallowed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpecCacheEntry {
    pub search_path: String,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub total_llm_tokens: u32,
    pub loop_count: u32,
    pub files_read: Vec<String>,
    pub search_history: Vec<String>,
    pub summary: String,
    pub retrieval_logs: Vec<String>,
}

pub struct SpecCache {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SpecCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, lock: Arc::new(Mutex::new(())) }
    }

    fn key_for(path: &Path) -> String {
        let canonical = path.to_string_lossy().replace('\\', "/");
        let digest = Sha256::digest(canonical.as_bytes());
        hex_prefix(&digest, 16)
    }

    fn entry_path(&self, path: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key_for(path)))
    }

    /// Reads one entry per path, skipping entries older than `stale_hours`,
    /// and concatenates their `summary` text. Never errors: a missing or
    /// corrupt entry is simply omitted.
    pub async fn load_context(&self, paths: &[PathBuf], stale_hours: i64) -> String {
        let _guard = self.lock.lock().await;
        let now = chrono::Utc::now();
        let mut summaries = Vec::new();

        for path in paths {
            let entry_path = self.entry_path(path);
            let Ok(text) = tokio::fs::read_to_string(&entry_path).await else { continue };
            let Ok(entry) = serde_json::from_str::<SpecCacheEntry>(&text) else {
                tracing::warn!(path = %entry_path.display(), "spec cache entry corrupt, ignoring");
                continue;
            };
            let age_hours = (now - entry.cached_at).num_hours();
            if age_hours > stale_hours {
                continue;
            }
            summaries.push(entry.summary);
        }

        summaries.join("\n")
    }

    /// Writes one entry per path, via temp-file-then-rename, under the
    /// shared lock so concurrent sessions don't interleave writes.
    pub async fn save_context(&self, paths: &[PathBuf], entry_template: &SpecCacheEntryTemplate) {
        let _guard = self.lock.lock().await;
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::warn!(error = %e, "failed to create spec cache dir");
            return;
        }

        for path in paths {
            let entry = SpecCacheEntry {
                search_path: path.to_string_lossy().to_string(),
                cached_at: chrono::Utc::now(),
                total_llm_tokens: entry_template.total_llm_tokens,
                loop_count: entry_template.loop_count,
                files_read: entry_template.files_read.clone(),
                search_history: entry_template.search_history.clone(),
                summary: entry_template.summary.clone(),
                retrieval_logs: entry_template.retrieval_logs.clone(),
            };

            let final_path = self.entry_path(path);
            let tmp_path = final_path.with_extension("json.tmp");
            let Ok(bytes) = serde_json::to_vec_pretty(&entry) else { continue };

            if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
                tracing::warn!(path = %tmp_path.display(), error = %e, "failed to write spec cache entry");
                continue;
            }
            if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
                tracing::warn!(path = %final_path.display(), error = %e, "failed to rename spec cache entry into place");
            }
        }
    }
}

/// Plain data the caller assembles from `SearchContext` to hand to `save_context`.
#[derive(Clone, Debug, Default)]
pub struct SpecCacheEntryTemplate {
    pub total_llm_tokens: u32,
    pub loop_count: u32,
    pub files_read: Vec<String>,
    pub search_history: Vec<String>,
    pub summary: String,
    pub retrieval_logs: Vec<String>,
}

fn hex_prefix(bytes: &[u8], hex_chars: usize) -> String {
    let needed_bytes = hex_chars.div_ceil(2);
    let mut s: String = bytes[..needed_bytes.min(bytes.len())].iter().map(|b| format!("{b:02x}")).collect();
    s.truncate(hex_chars);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips_summary() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpecCache::new(dir.path().to_path_buf());
        let path = PathBuf::from("/a/b/docs");

        let template = SpecCacheEntryTemplate { summary: "prior session found X".to_string(), ..Default::default() };
        cache.save_context(&[path.clone()], &template).await;

        let loaded = cache.load_context(&[path], 72).await;
        assert_eq!(loaded, "prior session found X");
    }

    #[tokio::test]
    async fn stale_entry_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpecCache::new(dir.path().to_path_buf());
        let path = PathBuf::from("/a/b/docs");

        let entry = SpecCacheEntry {
            search_path: path.to_string_lossy().to_string(),
            cached_at: chrono::Utc::now() - chrono::Duration::hours(200),
            total_llm_tokens: 0,
            loop_count: 0,
            files_read: vec![],
            search_history: vec![],
            summary: "stale".to_string(),
            retrieval_logs: vec![],
        };
        let entry_path = cache.entry_path(&path);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&entry_path, serde_json::to_vec(&entry).unwrap()).await.unwrap();

        let loaded = cache.load_context(&[path], 72).await;
        assert_eq!(loaded, "");
    }

    #[tokio::test]
    async fn missing_entry_yields_empty_string_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpecCache::new(dir.path().to_path_buf());
        let loaded = cache.load_context(&[PathBuf::from("/nonexistent")], 72).await;
        assert_eq!(loaded, "");
    }

    #[test]
    fn key_for_is_deterministic_and_16_hex_chars() {
        let key1 = SpecCache::key_for(Path::new("/a/b/c"));
        let key2 = SpecCache::key_for(Path::new("/a/b/c"));
        assert_eq!(key1, key2);
        assert_eq!(key1.len(), 16);
    }
}
