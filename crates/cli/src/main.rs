use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sirchmunk_core::agentic_search::{AgenticSearch, SearchOptions};
use sirchmunk_core::cluster_store::ClusterStore;
use sirchmunk_core::config::EngineConfig;
use sirchmunk_core::embeddings::OpenAiEmbeddings;
use sirchmunk_core::llm::OpenAiChat;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sirchmunk", about = "Agentic local-document search engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Root directory holding .cache/ and optional .codescope.toml.
    #[arg(long, global = true)]
    work_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a search and return a synthesized answer.
    Search {
        query: String,
        #[arg(long)]
        path: Vec<PathBuf>,
    },
    /// Run the full five-phase pipeline, including cluster reuse and persistence.
    SearchDeep {
        query: String,
        #[arg(long)]
        path: Vec<PathBuf>,
        #[arg(long)]
        filename_only: bool,
    },
    /// Check store integrity and external-tool availability.
    Doctor,
}

fn resolve_work_path(cli: &Cli) -> PathBuf {
    cli.work_path.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sirchmunk=info".parse()?))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let work_path = resolve_work_path(&cli);

    match &cli.command {
        Commands::Search { query, path } => run_search(&cli, work_path, query, path, false, false).await,
        Commands::SearchDeep { query, path, filename_only } => {
            run_search(&cli, work_path, query, path, true, *filename_only).await
        }
        Commands::Doctor => run_doctor(&cli, work_path).await,
    }
}

async fn run_search(
    cli: &Cli,
    work_path: PathBuf,
    query: &str,
    extra_paths: &[PathBuf],
    deep: bool,
    filename_only: bool,
) -> anyhow::Result<()> {
    let mut config = EngineConfig::load(work_path);
    if !extra_paths.is_empty() {
        config.search_paths = extra_paths.to_vec();
    }
    if config.search_paths.is_empty() {
        config.search_paths = vec![std::env::current_dir()?];
    }

    let llm = Arc::new(OpenAiChat::new(config.llm_base_url.clone(), config.llm_api_key.clone(), config.llm_model_name.clone()));
    let embedder = Arc::new(OpenAiEmbeddings::new(config.llm_api_key.clone()).with_base_url(config.llm_base_url.clone()));
    let engine = AgenticSearch::new(config, llm, embedder)?;

    let outcome = if deep {
        engine.search_deep(query, SearchOptions { filename_only, return_cluster: false }).await?
    } else {
        sirchmunk_core::agentic_search::SearchOutcome {
            answer: engine.search(query).await?,
            cluster_id: None,
            from_cache: false,
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.answer);
        if let Some(id) = &outcome.cluster_id {
            eprintln!("(cached as cluster {id}, from_cache={})", outcome.from_cache);
        }
    }
    Ok(())
}

async fn run_doctor(cli: &Cli, work_path: PathBuf) -> anyhow::Result<()> {
    let config = EngineConfig::load(work_path.clone());
    let store = ClusterStore::open(config.knowledge_dir().join("clusters.mpk"), config.knowledge_dir().join("clusters.idx"));

    let store_status = match &store {
        Ok(s) => format!("ok ({} clusters)", s.len()),
        Err(e) => format!("error: {e}"),
    };

    let binary = sirchmunk_core::retriever::discover_binary(&work_path, &["rga", "rg"])
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "not found".to_string());

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "work_path": work_path.display().to_string(),
                "cluster_store": store_status,
                "lexical_search_binary": binary,
                "llm_base_url": config.llm_base_url,
            })
        );
    } else {
        println!("work_path: {}", work_path.display());
        println!("cluster store: {store_status}");
        println!("lexical search binary: {binary}");
        println!("llm base url: {}", config.llm_base_url);
    }
    Ok(())
}
