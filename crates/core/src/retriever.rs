//! Lexical search adapter over an external `rga`-compatible process.
//!
//! Grounded on the `KeywordSearchTool`'s `_do_search_per_term` /
//! `_do_search_regex` split in the original source: literal multi-term
//! search must not be expressed as a single `a|b|c` alternation (the
//! external binary's `-F` flag does not compose with `|`), so literal
//! terms are issued as parallel single-term invocations and merged here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::error::Result;

/// One submatch span within a matched line.
#[derive(Clone, Debug, Deserialize)]
pub struct SubMatch {
    #[serde(rename = "match")]
    pub text: MatchText,
    pub start: usize,
    pub end: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MatchText {
    pub text: String,
}

/// A single `match`-type JSON event, already narrowed past `begin`/`end`/`context`.
#[derive(Clone, Debug)]
pub struct GrepEvent {
    pub path: String,
    pub line_number: u64,
    pub line_text: String,
    pub submatches: Vec<SubMatch>,
}

/// Per-file aggregate after `merge_results`.
#[derive(Clone, Debug)]
pub struct FileMatches {
    pub path: String,
    pub events: Vec<GrepEvent>,
    pub total_matches: usize,
    pub score: f64,
}

/// Result of a filename-only pattern search (no content read).
#[derive(Clone, Debug)]
pub struct FilenameHit {
    pub filename: String,
    pub path: String,
    pub match_score: f64,
    pub matched_pattern: String,
}

#[derive(Clone, Copy, Debug)]
pub struct SearchFlags {
    pub case_sensitive: bool,
    pub whole_word: bool,
    pub literal: bool,
    pub max_depth: Option<usize>,
}

impl Default for SearchFlags {
    fn default() -> Self {
        Self { case_sensitive: false, whole_word: false, literal: true, max_depth: None }
    }
}

/// Unimodal score with a log-decay tail outside `ideal_range`, peaking at
/// 1.0 when `count` sits on the range's midpoint. Resolves the source's
/// unspecified `penalty()` constant (see design notes).
pub fn penalty(count: f64, ideal_range: (f64, f64)) -> f64 {
    if count <= 0.0 {
        return 0.0;
    }
    let midpoint = (ideal_range.0 + ideal_range.1) / 2.0;
    1.0 / (1.0 + (count / midpoint).ln().abs())
}

pub struct GrepRetriever {
    binary: String,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl GrepRetriever {
    pub fn new(binary: impl Into<String>, concurrent_limit: usize, timeout_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            semaphore: Arc::new(Semaphore::new(concurrent_limit.max(1))),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Searches `paths` for `keywords`. With `literal=true`, issues one
    /// external invocation per keyword (never an OR-alternation) and merges.
    pub async fn search(
        &self,
        keywords: &[String],
        paths: &[PathBuf],
        flags: SearchFlags,
    ) -> Result<Vec<FileMatches>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut per_term: Vec<Vec<GrepEvent>> = Vec::with_capacity(keywords.len());
        if flags.literal {
            let mut handles = Vec::new();
            for kw in keywords {
                handles.push(self.run_one(kw.clone(), paths.to_vec(), flags, true));
            }
            for h in handles {
                per_term.push(h.await?);
            }
        } else {
            let pattern = keywords
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            per_term.push(self.run_one(pattern, paths.to_vec(), flags, false).await?);
        }

        let all_events: Vec<GrepEvent> = per_term.into_iter().flatten().collect();
        let merged = merge_results(all_events);
        Ok(merged.into_iter().filter(|f| f.total_matches >= keywords.len().min(1)).collect())
    }

    async fn run_one(
        &self,
        pattern: String,
        paths: Vec<PathBuf>,
        flags: SearchFlags,
        literal: bool,
    ) -> Result<Vec<GrepEvent>> {
        let permit = self.semaphore.clone().acquire_owned().await;
        let Ok(_permit) = permit else {
            return Ok(Vec::new());
        };

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--json");
        if literal {
            cmd.arg("-F");
        }
        if !flags.case_sensitive {
            cmd.arg("-i");
        }
        if flags.whole_word {
            cmd.arg("-w");
        }
        if let Some(depth) = flags.max_depth {
            cmd.arg("--max-depth").arg(depth.to_string());
        }
        cmd.arg(&pattern);
        for p in &paths {
            cmd.arg(p);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, binary = %self.binary, "failed to spawn lexical search process");
                return Ok(Vec::new());
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();
        let mut events = Vec::new();

        let read_fut = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(ev) = parse_event_line(&line) {
                    events.push(ev);
                }
            }
        };

        if tokio::time::timeout(self.timeout, read_fut).await.is_err() {
            tracing::warn!(pattern = %pattern, "lexical search timed out, killing process, returning partial results");
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
        Ok(events)
    }

    /// Filename-only search: regex patterns against filenames under `paths`,
    /// no content read.
    pub fn search_filenames(&self, patterns: &[String], candidates: &[PathBuf]) -> Vec<FilenameHit> {
        let mut hits = Vec::new();
        for pattern in patterns {
            let re = match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(r) => r,
                Err(_) => continue,
            };
            for path in candidates {
                let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if let Some(m) = re.find(filename) {
                    let match_score = m.as_str().len() as f64 / filename.len().max(1) as f64;
                    hits.push(FilenameHit {
                        filename: filename.to_string(),
                        path: path.display().to_string(),
                        match_score,
                        matched_pattern: pattern.clone(),
                    });
                }
            }
        }
        hits.sort_by(|a, b| b.match_score.partial_cmp(&a.match_score).unwrap_or(std::cmp::Ordering::Equal));
        hits
    }
}

fn parse_event_line(line: &str) -> Option<GrepEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("type")?.as_str()? != "match" {
        return None;
    }
    let data = value.get("data")?;
    let path = data.get("path")?.get("text")?.as_str()?.to_string();
    let line_number = data.get("line_number")?.as_u64()?;
    let line_text = data.get("lines")?.get("text")?.as_str()?.trim_end().to_string();
    let submatches: Vec<SubMatch> = data
        .get("submatches")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    Some(GrepEvent { path, line_number, line_text, submatches })
}

/// Groups raw match events by path, computing per-file `total_matches`.
pub fn merge_results(events: Vec<GrepEvent>) -> Vec<FileMatches> {
    let mut by_path: HashMap<String, Vec<GrepEvent>> = HashMap::new();
    for ev in events {
        by_path.entry(ev.path.clone()).or_default().push(ev);
    }

    by_path
        .into_iter()
        .map(|(path, events)| {
            let total_matches = events.iter().map(|e| e.submatches.len().max(1)).sum();
            let score = score_file(&events);
            FileMatches { path, events, total_matches, score }
        })
        .collect()
}

fn score_file(events: &[GrepEvent]) -> f64 {
    let mut per_line_counts: HashMap<u64, usize> = HashMap::new();
    for ev in events {
        *per_line_counts.entry(ev.line_number).or_insert(0) += ev.submatches.len().max(1);
    }
    let doc_count = events.len() as f64;
    let mut score = penalty(doc_count, (1.0, 10.0));
    for ev in events {
        let tf_line = *per_line_counts.get(&ev.line_number).unwrap_or(&1) as f64;
        score += penalty(tf_line, (1.0, 5.0)) * penalty(ev.line_text.len() as f64, (50.0, 200.0));
    }
    score
}

/// First-N-bytes content fingerprint, used to collapse near-identical files.
pub fn content_fingerprint(bytes: &[u8], n: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&bytes[..bytes.len().min(n)]);
    format!("{:x}", hasher.finalize())
}

/// Deduplicates by content fingerprint, retaining the highest-scoring copy.
pub fn dedup_by_fingerprint(files: Vec<FileMatches>, fingerprints: &HashMap<String, String>) -> Vec<FileMatches> {
    let mut best: HashMap<String, FileMatches> = HashMap::new();
    for f in files {
        let key = fingerprints.get(&f.path).cloned().unwrap_or_else(|| f.path.clone());
        match best.get(&key) {
            Some(existing) if existing.score >= f.score => {}
            _ => {
                best.insert(key, f);
            }
        }
    }
    best.into_values().collect()
}

pub fn discover_binary(work_path: &Path, candidates: &[&str]) -> Option<PathBuf> {
    for name in candidates {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
        let local = work_path.join("bin").join(name);
        if local.exists() {
            return Some(local);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_peaks_at_midpoint() {
        let p = penalty(125.0, (50.0, 200.0));
        assert!((p - 1.0).abs() < 1e-9, "expected peak of 1.0, got {p}");
    }

    #[test]
    fn penalty_decays_outside_range_both_directions() {
        let low = penalty(1.0, (50.0, 200.0));
        let high = penalty(10_000.0, (50.0, 200.0));
        assert!(low < 1.0 && high < 1.0);
    }

    #[test]
    fn penalty_zero_count_is_zero() {
        assert_eq!(penalty(0.0, (50.0, 200.0)), 0.0);
    }

    #[test]
    fn merge_results_groups_by_path() {
        let events = vec![
            GrepEvent { path: "a.txt".into(), line_number: 1, line_text: "hello world".into(), submatches: vec![] },
            GrepEvent { path: "a.txt".into(), line_number: 2, line_text: "hello again".into(), submatches: vec![] },
            GrepEvent { path: "b.txt".into(), line_number: 1, line_text: "hello".into(), submatches: vec![] },
        ];
        let merged = merge_results(events);
        assert_eq!(merged.len(), 2);
        let a = merged.iter().find(|f| f.path == "a.txt").unwrap();
        assert_eq!(a.total_matches, 2);
    }

    #[test]
    fn dedup_keeps_highest_scoring_copy() {
        let fingerprints: HashMap<String, String> =
            [("a.txt".to_string(), "fp1".to_string()), ("b.txt".to_string(), "fp1".to_string())]
                .into_iter()
                .collect();
        let files = vec![
            FileMatches { path: "a.txt".into(), events: vec![], total_matches: 1, score: 0.3 },
            FileMatches { path: "b.txt".into(), events: vec![], total_matches: 1, score: 0.9 },
        ];
        let deduped = dedup_by_fingerprint(files, &fingerprints);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].path, "b.txt");
    }

    #[test]
    fn content_fingerprint_is_stable() {
        let a = content_fingerprint(b"hello world", 5);
        let b = content_fingerprint(b"hello there", 5);
        assert_eq!(a, b);
    }
}
