use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use rand::{seq::SliceRandom, thread_rng};
use reqwest::{header, Client, StatusCode};
use scraper::Selector;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::parser::parse_html;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries for {0}")]
    Exhausted(String),
    #[error("http status {0} for {1}")]
    Status(StatusCode, String),
    #[error("reqwest error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("unsupported content-type {0} for {1}")]
    ContentType(String, String),
    #[error("main content region never appeared on {0}")]
    MissingContent(String),
    #[error("timed out after {0:?} loading {1}")]
    Timeout(Duration, String),
    #[error("invalid content selector {0:?}")]
    Selector(String),
    #[error("fetcher has been closed")]
    Closed,
}

/// What the crawl needs from a rendered page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContent {
    pub title: String,
    pub main_content: String,
    pub outbound_links: Vec<String>,
}

/// Page loading and extraction, treated by the crawl as an opaque service.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError>;

    /// Releases whatever the fetcher holds. Safe to call more than once.
    async fn close(&self) {}
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub user_agent: Option<String>,
    pub page_load_timeout: Duration,
    pub content_ready_timeout: Duration,
    pub content_selector: String,
    pub max_retries: usize,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            page_load_timeout: Duration::from_secs(30),
            content_ready_timeout: Duration::from_secs(10),
            content_selector: "main".to_string(),
            max_retries: 4,
        }
    }
}

/// Plain HTTP page loader. The main content region is looked up with a CSS
/// selector on the served HTML.
pub struct HttpPageFetcher {
    client: Client,
    user_agents: Vec<String>,
    region: Selector,
    deadline: Duration,
    max_retries: usize,
    base_backoff: Duration,
    closed: AtomicBool,
}

impl HttpPageFetcher {
    pub fn new(options: FetcherOptions) -> Result<Self, FetchError> {
        let region = Selector::parse(&options.content_selector)
            .map_err(|_| FetchError::Selector(options.content_selector.clone()))?;

        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENTS[0])
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(options.page_load_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .build()?;

        let user_agents = match options.user_agent {
            Some(ua) => vec![ua],
            None => DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        };

        Ok(Self {
            client,
            user_agents,
            region,
            deadline: options.page_load_timeout + options.content_ready_timeout,
            max_retries: options.max_retries.max(1),
            base_backoff: Duration::from_millis(100),
            closed: AtomicBool::new(false),
        })
    }

    async fn load(&self, url: &Url) -> Result<(Url, String), FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let resp = self
                .client
                .get(url.clone())
                .header(header::USER_AGENT, self.pick_user_agent())
                .header(
                    header::ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
                .send()
                .await;

            let retry_after = match resp {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().clone();
                    let content_type = resp
                        .headers()
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    if let Some(ct) = content_type {
                        if !ct.contains("text/html") && !ct.contains("application/xhtml") {
                            return Err(FetchError::ContentType(ct, final_url.to_string()));
                        }
                    }
                    let body = resp.text().await?;
                    return Ok((final_url, body));
                }
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    parse_retry_after(&resp)
                }
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(FetchError::Status(resp.status(), resp.url().to_string()));
                }
                Ok(resp) if resp.status().is_server_error() => None,
                Err(err) => {
                    tracing::debug!("network error for {}: {err}", url);
                    None
                }
                Ok(_) => return Err(FetchError::Exhausted(url.to_string())),
            };

            if attempt >= self.max_retries {
                return Err(FetchError::Exhausted(url.to_string()));
            }
            match retry_after {
                Some(wait) => sleep(wait).await,
                None => self.backoff(attempt).await,
            }
        }
    }

    fn pick_user_agent(&self) -> &str {
        let mut rng = thread_rng();
        self.user_agents
            .choose(&mut rng)
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_USER_AGENTS[0])
    }

    async fn backoff(&self, attempt: usize) {
        let pow: u32 = 1u32 << attempt.min(5);
        let jitter = Duration::from_millis(rand::random::<u8>() as u64);
        sleep(self.base_backoff * pow + jitter).await;
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FetchError::Closed);
        }
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;

        let (final_url, body) = timeout(self.deadline, self.load(&parsed))
            .await
            .map_err(|_| FetchError::Timeout(self.deadline, url.to_string()))??;

        let page = parse_html(&body, &final_url, &self.region)
            .ok_or_else(|| FetchError::MissingContent(url.to_string()))?;

        Ok(PageContent {
            title: page.title,
            main_content: page.content,
            outbound_links: page.links,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("http fetcher closed");
        }
    }
}

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let secs = resp
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs))
}
