//! Filesystem scanning and LLM-assisted ranking over an arbitrary document corpus.
//!
//! Grounded on the teacher's `server/src/scan.rs` (`walk_files_parallel`,
//! `is_text_file`, `describe`), generalized from a source-code repository
//! walk to heterogeneous documents: the walk itself is identical in shape
//! (`ignore::WalkBuilder` + `rayon`), only the per-file metadata extracted
//! changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::llm::{LlmClient, Message};

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "log", "csv", "json", "yaml", "yml", "toml", "ini", "cfg",
    "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "hpp", "sh", "html", "xml",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relevance {
    High,
    Medium,
    Low,
    Unset,
}

impl Default for Relevance {
    fn default() -> Self {
        Relevance::Unset
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileCandidate {
    pub path: PathBuf,
    pub filename: String,
    pub extension: String,
    pub size_bytes: u64,
    pub modified_at: Option<SystemTime>,
    pub created_at: Option<SystemTime>,
    pub mime_type: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: Option<u32>,
    pub encoding: Option<String>,
    pub line_count: Option<usize>,
    pub keywords: Vec<String>,
    pub preview: String,
    pub full_content: Option<String>,
    pub content_loaded: bool,
    pub relevance: Relevance,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub candidates: Vec<FileCandidate>,
    pub ranked_candidates: Vec<FileCandidate>,
    pub total_files: usize,
    pub total_dirs: usize,
    pub duration: Duration,
}

pub struct DirectoryScanner {
    max_depth: usize,
    max_files: usize,
    small_file_threshold: u64,
    skip_dirs: HashSet<String>,
}

impl DirectoryScanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_depth: config.default_max_depth,
            max_files: config.max_files,
            small_file_threshold: config.small_file_threshold,
            skip_dirs: config.skip_dirs.clone(),
        }
    }

    /// Breadth-first (depth-bounded) parallel walk of `paths`, building file
    /// candidates with per-format metadata. Never enters a skip-dir or dotfile.
    pub fn scan(&self, paths: &[PathBuf]) -> ScanResult {
        let start = Instant::now();
        let candidates: Mutex<Vec<FileCandidate>> = Mutex::new(Vec::new());
        let dirs_seen: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());

        for root in paths {
            if !root.exists() {
                tracing::warn!(path = %root.display(), "scan root does not exist, skipping");
                continue;
            }

            let skip = self.skip_dirs.clone();
            let walker = WalkBuilder::new(root)
                .hidden(true)
                .git_ignore(false)
                .git_global(false)
                .git_exclude(false)
                .max_depth(Some(self.max_depth))
                .threads(rayon::current_num_threads().min(12))
                .filter_entry(move |entry| {
                    if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                        let name = entry.file_name().to_string_lossy().to_string();
                        return !skip.contains(&name);
                    }
                    true
                })
                .build();

            let mut files_this_root = Vec::new();
            for entry in walker.flatten() {
                let path = entry.path().to_path_buf();
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    dirs_seen.lock().unwrap().insert(path);
                    continue;
                }
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    continue;
                }
                files_this_root.push(path);
                if files_this_root.len() >= self.max_files {
                    break;
                }
            }

            let small_threshold = self.small_file_threshold;
            let extracted: Vec<FileCandidate> =
                files_this_root.par_iter().map(|p| extract_metadata(p, small_threshold)).collect();
            candidates.lock().unwrap().extend(extracted);
        }

        let mut candidates = candidates.into_inner().unwrap();
        candidates.truncate(self.max_files);
        let total_dirs = dirs_seen.into_inner().unwrap().len();

        ScanResult {
            total_files: candidates.len(),
            ranked_candidates: Vec::new(),
            candidates,
            total_dirs,
            duration: start.elapsed(),
        }
    }

    /// Asks the LLM to rank the top-`top_k` candidates by relevance to `query`.
    pub async fn rank(
        &self,
        query: &str,
        scan_result: &ScanResult,
        top_k: usize,
        llm: &dyn LlmClient,
    ) -> crate::error::Result<ScanResult> {
        let digest_candidates: Vec<&FileCandidate> = scan_result.candidates.iter().take(top_k).collect();
        if digest_candidates.is_empty() {
            return Ok(scan_result.clone());
        }

        let digest = digest_candidates
            .iter()
            .map(|c| format!("{}\t{}\t{}", c.path.display(), c.title.clone().unwrap_or_default(), c.preview))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Given the query \"{query}\", rank these files by relevance. \
             Respond with a JSON array: [{{\"path\": str, \"relevance\": \"high\"|\"medium\"|\"low\", \"reason\": str}}].\n\n{digest}"
        );

        let response = llm.chat(&[Message::user(prompt)]).await?;
        let judged = crate::llm::parse_json_array(&response.content).unwrap_or_default();

        let mut ranked = scan_result.candidates.clone();
        for entry in judged {
            let Some(judged_path) = entry.get("path").and_then(|v| v.as_str()) else { continue };
            let relevance = match entry.get("relevance").and_then(|v| v.as_str()) {
                Some("high") => Relevance::High,
                Some("medium") => Relevance::Medium,
                Some("low") => Relevance::Low,
                _ => Relevance::Unset,
            };
            let reason = entry.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string();

            if let Some(candidate) = match_candidate_mut(&mut ranked, judged_path) {
                candidate.relevance = relevance;
                candidate.reason = reason;
            }
        }

        ranked.sort_by_key(|c| match c.relevance {
            Relevance::High => 0,
            Relevance::Medium => 1,
            Relevance::Low => 2,
            Relevance::Unset => 3,
        });

        Ok(ScanResult {
            candidates: scan_result.candidates.clone(),
            ranked_candidates: ranked,
            total_files: scan_result.total_files,
            total_dirs: scan_result.total_dirs,
            duration: scan_result.duration,
        })
    }

    pub async fn scan_and_rank(
        &self,
        query: &str,
        paths: &[PathBuf],
        top_k: usize,
        llm: &dyn LlmClient,
    ) -> crate::error::Result<ScanResult> {
        let scanned = self.scan(paths);
        self.rank(query, &scanned, top_k, llm).await
    }
}

/// Three-level path matcher: exact string match, then unique basename, then suffix.
fn match_candidate_mut<'a>(candidates: &'a mut [FileCandidate], judged_path: &str) -> Option<&'a mut FileCandidate> {
    if let Some(idx) = candidates.iter().position(|c| c.path.to_string_lossy() == judged_path) {
        return Some(&mut candidates[idx]);
    }

    let judged_name = Path::new(judged_path).file_name()?.to_string_lossy().to_string();
    let matches: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.filename == judged_name)
        .map(|(i, _)| i)
        .collect();
    if matches.len() == 1 {
        return Some(&mut candidates[matches[0]]);
    }

    let idx = candidates.iter().position(|c| c.path.to_string_lossy().ends_with(judged_path))?;
    Some(&mut candidates[idx])
}

fn extract_metadata(path: &Path, small_file_threshold: u64) -> FileCandidate {
    let meta = std::fs::metadata(path).ok();
    let size_bytes = meta.as_ref().map(|m| m.len()).unwrap_or(0);
    let modified_at = meta.as_ref().and_then(|m| m.modified().ok());
    let created_at = meta.as_ref().and_then(|m| m.created().ok());

    let filename = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
    let is_text = TEXT_EXTENSIONS.contains(&extension.as_str()) || sniff_is_text(path);

    let mime_type = if is_text { "text/plain".to_string() } else { "application/octet-stream".to_string() };

    let mut candidate = FileCandidate {
        path: path.to_path_buf(),
        filename,
        extension,
        size_bytes,
        modified_at,
        created_at,
        mime_type,
        title: None,
        author: None,
        page_count: None,
        encoding: None,
        line_count: None,
        keywords: Vec::new(),
        preview: String::new(),
        full_content: None,
        content_loaded: false,
        relevance: Relevance::Unset,
        reason: String::new(),
    };

    if is_text {
        if let Ok(text) = std::fs::read_to_string(path) {
            candidate.encoding = Some("utf-8".to_string());
            candidate.line_count = Some(text.lines().count());
            candidate.title = text.lines().find(|l| !l.trim().is_empty()).map(|l| l.trim().to_string());
            candidate.preview = text.chars().take(240).collect();
            candidate.keywords = extract_keywords(&text);

            if size_bytes <= small_file_threshold {
                candidate.full_content = Some(text);
                candidate.content_loaded = true;
            }
        }
    }

    candidate
}

fn sniff_is_text(path: &Path) -> bool {
    use std::io::Read;
    let Ok(mut file) = std::fs::File::open(path) else { return false };
    let mut buf = [0u8; 8192];
    let Ok(n) = file.read(&mut buf) else { return false };
    !buf[..n].contains(&0)
}

/// Crude keyword extraction from a text file's first lines: lowercase
/// word-frequency over the first 20 non-empty lines, top 8 by count.
fn extract_keywords(text: &str) -> Vec<String> {
    use std::collections::HashMap;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()).take(20) {
        for word in line.split_whitespace() {
            let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if cleaned.len() > 3 {
                *counts.entry(cleaned.to_lowercase()).or_insert(0) += 1;
            }
        }
    }
    let mut pairs: Vec<(String, usize)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1));
    pairs.into_iter().take(8).map(|(w, _)| w).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, filename: &str) -> FileCandidate {
        FileCandidate {
            path: PathBuf::from(path),
            filename: filename.to_string(),
            extension: "txt".to_string(),
            size_bytes: 0,
            modified_at: None,
            created_at: None,
            mime_type: "text/plain".to_string(),
            title: None,
            author: None,
            page_count: None,
            encoding: None,
            line_count: None,
            keywords: vec![],
            preview: String::new(),
            full_content: None,
            content_loaded: false,
            relevance: Relevance::Unset,
            reason: String::new(),
        }
    }

    #[test]
    fn match_candidate_exact_path_wins() {
        let mut cands = vec![candidate("/a/b.txt", "b.txt"), candidate("/c/b.txt", "b.txt")];
        let m = match_candidate_mut(&mut cands, "/a/b.txt").unwrap();
        assert_eq!(m.path, PathBuf::from("/a/b.txt"));
    }

    #[test]
    fn match_candidate_unique_basename_fallback() {
        let mut cands = vec![candidate("/a/unique.txt", "unique.txt"), candidate("/c/other.txt", "other.txt")];
        let m = match_candidate_mut(&mut cands, "unique.txt").unwrap();
        assert_eq!(m.filename, "unique.txt");
    }

    #[test]
    fn extract_keywords_ignores_short_words() {
        let text = "the cat sat on the mat\nhello world hello world";
        let kws = extract_keywords(text);
        assert!(kws.contains(&"hello".to_string()));
        assert!(!kws.contains(&"cat".to_string()) || kws.len() <= 8);
    }

    #[test]
    fn scan_respects_max_files_cap() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "hello").unwrap();
        }
        let mut config = EngineConfig::default();
        config.max_files = 3;
        let scanner = DirectoryScanner::new(&config);
        let result = scanner.scan(&[dir.path().to_path_buf()]);
        assert!(result.candidates.len() <= 3);
    }
}
