//! Layered engine configuration.
//!
//! Loaded lowest-to-highest precedence: built-in defaults, an optional
//! `.codescope.toml`-style TOML file, then environment variables. Mirrors
//! the way `ScanConfig` is constructed and overridden in the teacher
//! codebase, generalized from scan-only settings to the full set of
//! engine knobs.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;

/// Runtime configuration for a single engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub work_path: PathBuf,
    pub search_paths: Vec<PathBuf>,
    pub verbose: bool,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model_name: String,

    pub enable_cluster_reuse: bool,
    pub cluster_sim_threshold: f32,
    pub cluster_sim_top_k: usize,
    pub max_queries_per_cluster: usize,
    pub max_search_results_per_cluster: usize,

    pub default_max_depth: usize,
    pub default_top_k_files: usize,
    pub default_keyword_levels: usize,

    pub grep_timeout_secs: u64,
    pub grep_concurrent_limit: usize,

    pub max_loops: u32,
    pub max_token_budget: u32,

    pub small_file_threshold: u64,
    pub max_files: usize,
    pub max_chars_per_file: usize,

    pub spec_cache_ttl_hours: i64,

    pub skip_dirs: HashSet<String>,
}

/// Shape of an optional `.codescope.toml`-style override file. All fields
/// optional; anything absent falls through to the built-in default or the
/// matching environment variable.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    work_path: Option<PathBuf>,
    search_paths: Option<Vec<PathBuf>>,
    verbose: Option<bool>,
    llm_base_url: Option<String>,
    llm_model_name: Option<String>,
    enable_cluster_reuse: Option<bool>,
    cluster_sim_threshold: Option<f32>,
    cluster_sim_top_k: Option<usize>,
    max_queries_per_cluster: Option<usize>,
    default_max_depth: Option<usize>,
    default_top_k_files: Option<usize>,
    default_keyword_levels: Option<usize>,
    grep_timeout_secs: Option<u64>,
    grep_concurrent_limit: Option<usize>,
    max_loops: Option<u32>,
    max_token_budget: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_path: PathBuf::from("."),
            search_paths: Vec::new(),
            verbose: false,

            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model_name: "gpt-4o-mini".to_string(),

            enable_cluster_reuse: true,
            cluster_sim_threshold: 0.82,
            cluster_sim_top_k: 3,
            max_queries_per_cluster: 20,
            max_search_results_per_cluster: 10,

            default_max_depth: 8,
            default_top_k_files: 10,
            default_keyword_levels: 2,

            grep_timeout_secs: 30,
            grep_concurrent_limit: 5,

            max_loops: 10,
            max_token_budget: 64_000,

            small_file_threshold: 100 * 1024,
            max_files: 500,
            max_chars_per_file: 30_000,

            spec_cache_ttl_hours: 72,

            skip_dirs: [".git", "node_modules", "__pycache__", "target", "dist", "build", ".next", "vendor"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults -> `<work_path>/.codescope.toml` (if present) -> env vars.
    pub fn load(work_path: PathBuf) -> Self {
        let mut cfg = Self { work_path: work_path.clone(), ..Self::default() };

        let toml_path = work_path.join(".codescope.toml");
        if let Ok(text) = std::fs::read_to_string(&toml_path) {
            match toml::from_str::<FileOverrides>(&text) {
                Ok(overrides) => cfg.apply_file_overrides(overrides),
                Err(e) => tracing::warn!(path = %toml_path.display(), error = %e, "failed to parse config file, ignoring"),
            }
        }

        cfg.apply_env();
        cfg
    }

    fn apply_file_overrides(&mut self, o: FileOverrides) {
        if let Some(v) = o.work_path {
            self.work_path = v;
        }
        if let Some(v) = o.search_paths {
            self.search_paths = v;
        }
        if let Some(v) = o.verbose {
            self.verbose = v;
        }
        if let Some(v) = o.llm_base_url {
            self.llm_base_url = v;
        }
        if let Some(v) = o.llm_model_name {
            self.llm_model_name = v;
        }
        if let Some(v) = o.enable_cluster_reuse {
            self.enable_cluster_reuse = v;
        }
        if let Some(v) = o.cluster_sim_threshold {
            self.cluster_sim_threshold = v;
        }
        if let Some(v) = o.cluster_sim_top_k {
            self.cluster_sim_top_k = v;
        }
        if let Some(v) = o.max_queries_per_cluster {
            self.max_queries_per_cluster = v;
        }
        if let Some(v) = o.default_max_depth {
            self.default_max_depth = v;
        }
        if let Some(v) = o.default_top_k_files {
            self.default_top_k_files = v;
        }
        if let Some(v) = o.default_keyword_levels {
            self.default_keyword_levels = v;
        }
        if let Some(v) = o.grep_timeout_secs {
            self.grep_timeout_secs = v;
        }
        if let Some(v) = o.grep_concurrent_limit {
            self.grep_concurrent_limit = v;
        }
        if let Some(v) = o.max_loops {
            self.max_loops = v;
        }
        if let Some(v) = o.max_token_budget {
            self.max_token_budget = v;
        }
    }

    fn apply_env(&mut self) {
        use std::env::var;

        if let Ok(v) = var("LLM_BASE_URL") {
            self.llm_base_url = v;
        }
        if let Ok(v) = var("LLM_API_KEY") {
            self.llm_api_key = v;
        }
        if let Ok(v) = var("LLM_MODEL_NAME") {
            self.llm_model_name = v;
        }
        if let Ok(v) = var("SIRCHMUNK_WORK_PATH") {
            self.work_path = PathBuf::from(v);
        }
        if let Ok(v) = var("SIRCHMUNK_SEARCH_PATHS") {
            self.search_paths = split_search_paths(&v);
        }
        if let Ok(v) = var("SIRCHMUNK_VERBOSE") {
            self.verbose = parse_bool(&v);
        }
        if let Ok(v) = var("SIRCHMUNK_ENABLE_CLUSTER_REUSE") {
            self.enable_cluster_reuse = parse_bool(&v);
        }
        if let Ok(v) = var("CLUSTER_SIM_THRESHOLD") {
            if let Ok(f) = v.parse() {
                self.cluster_sim_threshold = f;
            }
        }
        if let Ok(v) = var("CLUSTER_SIM_TOP_K") {
            if let Ok(n) = v.parse() {
                self.cluster_sim_top_k = n;
            }
        }
        if let Ok(v) = var("MAX_QUERIES_PER_CLUSTER") {
            if let Ok(n) = v.parse() {
                self.max_queries_per_cluster = n;
            }
        }
        if let Ok(v) = var("DEFAULT_MAX_DEPTH") {
            if let Ok(n) = v.parse() {
                self.default_max_depth = n;
            }
        }
        if let Ok(v) = var("DEFAULT_TOP_K_FILES") {
            if let Ok(n) = v.parse() {
                self.default_top_k_files = n;
            }
        }
        if let Ok(v) = var("DEFAULT_KEYWORD_LEVELS") {
            if let Ok(n) = v.parse() {
                self.default_keyword_levels = n;
            }
        }
        if let Ok(v) = var("GREP_TIMEOUT") {
            if let Ok(n) = v.parse() {
                self.grep_timeout_secs = n;
            }
        }
        if let Ok(v) = var("GREP_CONCURRENT_LIMIT") {
            if let Ok(n) = v.parse() {
                self.grep_concurrent_limit = n;
            }
        }
    }

    pub fn knowledge_dir(&self) -> PathBuf {
        self.work_path.join(".cache").join("knowledge")
    }

    pub fn spec_dir(&self) -> PathBuf {
        self.work_path.join(".cache").join("spec")
    }
}

/// Splits on `,`, the full-width comma `，`, or the OS path-list separator.
fn split_search_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(|c| c == ',' || c == '，' || c == std::path::MAIN_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_search_paths_handles_mixed_delimiters() {
        let paths = split_search_paths("/a/b,/c/d，/e/f");
        assert_eq!(paths, vec![PathBuf::from("/a/b"), PathBuf::from("/c/d"), PathBuf::from("/e/f")]);
    }

    #[test]
    fn parse_bool_recognizes_common_truthy_strings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("no"));
    }

    #[test]
    fn default_config_matches_source_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_loops, 10);
        assert_eq!(cfg.max_token_budget, 64_000);
        assert_eq!(cfg.spec_cache_ttl_hours, 72);
    }
}
