mod cleaner;
mod crawler;
mod fetcher;
mod parser;
mod queue;
mod scope;
mod stats;
mod store;
mod writer;

use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cleaner::{UrlNormalizer, NON_SEMANTIC_PARAMS};
use crawler::{CrawlSettings, CrawlSummary, Crawler, CrawlerError};
use fetcher::{FetcherOptions, HttpPageFetcher};
use scope::{ScopePolicy, DEFAULT_ALLOW_PATTERNS, DEFAULT_DENY_PATTERNS};
use store::DocumentStore;

const DEFAULT_SEED: &str = "https://learn.microsoft.com/en-us/";
const DEFAULT_USER_AGENT: &str = "docs-harvester/0.1";

#[derive(Debug, Error)]
enum ConfigError {
    #[error("io error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
struct Config {
    #[serde(default = "default_database_path")]
    database_path: PathBuf,
    #[serde(default = "default_aftermath_dir")]
    aftermath_dir: PathBuf,
    #[serde(default = "default_seed_url")]
    seed_url: String,
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_max_links_per_page")]
    max_links_per_page: usize,
    #[serde(default = "default_min_content_chars")]
    min_content_chars: usize,
    #[serde(default = "default_politeness_ms")]
    politeness_ms: u64,
    #[serde(default = "default_progress_interval_secs")]
    progress_interval_secs: u64,
    #[serde(default = "default_page_load_timeout_secs")]
    page_load_timeout_secs: u64,
    #[serde(default = "default_content_ready_timeout_secs")]
    content_ready_timeout_secs: u64,
    #[serde(default = "default_content_selector")]
    content_selector: String,
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default = "default_allow_patterns")]
    allow_patterns: Vec<String>,
    #[serde(default = "default_deny_patterns")]
    deny_patterns: Vec<String>,
    #[serde(default = "default_removable_query_params")]
    removable_query_params: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            aftermath_dir: default_aftermath_dir(),
            seed_url: default_seed_url(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_links_per_page: default_max_links_per_page(),
            min_content_chars: default_min_content_chars(),
            politeness_ms: default_politeness_ms(),
            progress_interval_secs: default_progress_interval_secs(),
            page_load_timeout_secs: default_page_load_timeout_secs(),
            content_ready_timeout_secs: default_content_ready_timeout_secs(),
            content_selector: default_content_selector(),
            user_agent: default_user_agent(),
            allow_patterns: default_allow_patterns(),
            deny_patterns: default_deny_patterns(),
            removable_query_params: default_removable_query_params(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("microsoft_docs.db")
}

fn default_aftermath_dir() -> PathBuf {
    PathBuf::from("aftermath")
}

fn default_seed_url() -> String {
    DEFAULT_SEED.to_string()
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    writer::DEFAULT_BATCH_SIZE
}

fn default_max_links_per_page() -> usize {
    15
}

fn default_min_content_chars() -> usize {
    200
}

fn default_politeness_ms() -> u64 {
    1000
}

fn default_progress_interval_secs() -> u64 {
    30
}

fn default_page_load_timeout_secs() -> u64 {
    30
}

fn default_content_ready_timeout_secs() -> u64 {
    10
}

fn default_content_selector() -> String {
    "main".to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_allow_patterns() -> Vec<String> {
    DEFAULT_ALLOW_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_deny_patterns() -> Vec<String> {
    DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_removable_query_params() -> Vec<String> {
    NON_SEMANTIC_PARAMS.iter().map(|p| p.to_string()).collect()
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("workers", self.workers as u64),
            ("batch_size", self.batch_size as u64),
            ("progress_interval_secs", self.progress_interval_secs),
            ("page_load_timeout_secs", self.page_load_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            workers: self.workers,
            batch_size: self.batch_size,
            max_links_per_page: self.max_links_per_page,
            min_content_chars: self.min_content_chars,
            politeness: Duration::from_millis(self.politeness_ms),
            progress_interval: Duration::from_secs(self.progress_interval_secs),
        }
    }

    fn fetcher_options(&self) -> FetcherOptions {
        FetcherOptions {
            user_agent: Some(self.user_agent.clone()),
            page_load_timeout: Duration::from_secs(self.page_load_timeout_secs),
            content_ready_timeout: Duration::from_secs(self.content_ready_timeout_secs),
            content_selector: self.content_selector.clone(),
            ..FetcherOptions::default()
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "docs-harvester",
    version,
    about = "Crawl a documentation site into a SQLite document store"
)]
struct Cli {
    /// YAML configuration file; defaults are used when it does not exist
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Override the SQLite database path
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl from the seed URL (the default command)
    Crawl {
        /// Override the seed URL
        #[arg(long)]
        seed: Option<String>,

        /// Override the number of concurrent workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Export stored documentation pages as a JSON array
    Export { output: PathBuf },
    /// Print aggregate statistics about the stored documents
    Stats,
}

fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = if path.exists() {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str::<Config>(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let store = DocumentStore::open(&config.database_path)?;

    match cli.command.unwrap_or(Command::Crawl {
        seed: None,
        workers: None,
    }) {
        Command::Crawl { seed, workers } => {
            if let Some(seed) = seed {
                config.seed_url = seed;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.validate()?;
            crawl(&config, store).await?;
        }
        Command::Export { output } => {
            let exported = store.export_json(&output).await?;
            info!("exported {exported} documents to {}", output.display());
        }
        Command::Stats => {
            let summary = store.summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_crawler(config: &Config, store: DocumentStore) -> Result<Crawler, CrawlerError> {
    let scope = ScopePolicy::new(&config.allow_patterns[..], &config.deny_patterns[..])?;
    let fetcher = HttpPageFetcher::new(config.fetcher_options())?;
    Ok(Crawler::new(
        config.crawl_settings(),
        store,
        Arc::new(fetcher),
        scope,
        UrlNormalizer::new(&config.removable_query_params),
    ))
}

async fn crawl(config: &Config, store: DocumentStore) -> Result<(), Box<dyn Error>> {
    let crawler = build_crawler(config, store)?;

    let shutdown = crawler.shutdown_handle();
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl+c; shutting down");
            shutdown.request().await;
        }
    });

    let result = crawler.run(&config.seed_url).await;
    ctrl_c.abort();

    let summary = match &result {
        Ok(summary) => summary.clone(),
        Err(err) => {
            error!("crawl error: {err}");
            crawler.summary().await
        }
    };
    write_aftermath(config, &summary)?;

    result?;
    Ok(())
}

fn write_aftermath(config: &Config, summary: &CrawlSummary) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(&config.aftermath_dir)?;
    let filename = format!("session-{}.json", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let path = config.aftermath_dir.join(filename);

    let report = json!({
        "started_at": summary.stats.started_at.to_rfc3339(),
        "ended_at": summary.stats.ended_at.to_rfc3339(),
        "duration_secs": summary.stats.duration_secs,
        "seed_url": config.seed_url,
        "workers": config.workers,
        "database_path": config.database_path.to_string_lossy().to_string(),
        "stats": {
            "processed": summary.stats.processed,
            "skipped": summary.stats.skipped,
            "discovered": summary.stats.discovered,
            "worker_errors": summary.stats.errors,
            "queue_len": summary.stats.queue_len,
            "visited": summary.stats.visited_len,
        },
        "batches": {
            "committed_documents": summary.committed,
            "flushes": summary.flushes,
            "failed_flushes": summary.failed_flushes,
            "rejected_documents": summary.rejected,
            "unflushed": summary.unflushed,
        },
    });

    fs::write(&path, serde_json::to_string_pretty(&report)?)?;
    info!("wrote aftermath summary to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = load_config(Path::new("does/not/exist.yml")).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_links_per_page, 15);
        assert_eq!(config.min_content_chars, 200);
        assert_eq!(config.crawl_settings().politeness, Duration::from_secs(1));
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "workers: 8\nallow_patterns:\n  - '^https://site\\.example/docs/'\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.allow_patterns, vec![r"^https://site\.example/docs/".to_string()]);
        assert_eq!(config.deny_patterns.len(), DEFAULT_DENY_PATTERNS.len());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "workers: 0\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Zero("workers"))));
    }

    #[test]
    fn bad_scope_pattern_fails_crawler_construction() {
        let config = Config {
            deny_patterns: vec!["([".to_string()],
            ..Config::default()
        };
        let store = DocumentStore::open_in_memory().unwrap();
        assert!(matches!(
            build_crawler(&config, store),
            Err(CrawlerError::Scope(_))
        ));
    }
}
