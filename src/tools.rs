//! # Web Search Provider
//!
//! DuckDuckGo's HTML endpoint, scraped with reqwest. No API key needed.
//!
//! Each result block on the page looks roughly like:
//!
//! ```text
//! <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2F...&rut=...">Title</a>
//! ...
//! <a class="result__snippet" href="...">Snippet with <b>highlights</b></a>
//! ```

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use research_flow::{AdapterError, SearchHit, SearchProvider};

/// Default DuckDuckGo HTML endpoint
pub const DUCKDUCKGO_HTML_URL: &str = "https://html.duckduckgo.com/html/";

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Failed to perform web search: {0}")]
    SearchFailed(String),

    #[error("Rate limited by search provider, please wait")]
    RateLimited,

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// # Rust Concept: Converting Between Error Types
///
/// Every search failure is recoverable at the stage boundary: a failed query
/// simply contributes no sources.
impl From<SearchError> for AdapterError {
    fn from(error: SearchError) -> Self {
        match error {
            SearchError::NetworkError(e) if e.is_timeout() => {
                AdapterError::call(format!("Search request timed out: {}", e))
            }
            other => AdapterError::call(other.to_string()),
        }
    }
}

// =============================================================================
// DUCKDUCKGO PROVIDER
// =============================================================================
#[derive(Debug, Clone)]
pub struct DuckDuckGoProvider {
    client: reqwest::Client,
    base_url: String,
    /// Pause before each request, to stay under the rate limit
    request_delay: Duration,
}

impl DuckDuckGoProvider {
    pub fn new(timeout: Duration) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: DUCKDUCKGO_HTML_URL.to_string(),
            request_delay: Duration::from_millis(500),
        })
    }

    /// Point at another endpoint (mirrors, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    async fn fetch(&self, query: &str) -> Result<String, SearchError> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let url = format!("{}?q={}", self.base_url, urlencoding::encode(query));
        debug!(url = %url, "Fetching search results");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            return Err(SearchError::SearchFailed(format!("HTTP {}", status)));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, AdapterError> {
        info!(query = %query, "Performing web search");

        let body = self.fetch(query).await?;
        let hits = parse_results(&body, max_results);

        if hits.is_empty() {
            warn!(query = %query, "No search results found");
        } else {
            info!(query = %query, count = hits.len(), "Search completed");
        }
        Ok(hits)
    }
}

// =============================================================================
// HTML PARSING
// =============================================================================
/// Extract ranked hits from a results page.
///
/// Result blocks give title and snippet. Pages without them fall back to
/// bare redirect links, titled by domain.
pub fn parse_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    let mut raw: Vec<(String, String, String)> = Vec::new();

    for block in html.split("class=\"result__a\"").skip(1) {
        if raw.len() >= max_results {
            break;
        }
        let Some(url) = attr_value(block, "href").and_then(|href| resolve_href(&href)) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        let title = block
            .find('>')
            .map(|i| element_text(&block[i + 1..]))
            .unwrap_or_default();
        let snippet = block
            .find("result__snippet")
            .and_then(|i| block[i..].find('>').map(|j| i + j + 1))
            .map(|start| element_text(&block[start..]))
            .unwrap_or_default();
        raw.push((url, title, snippet));
    }

    if raw.is_empty() {
        for segment in html.split("uddg=").skip(1) {
            if raw.len() >= max_results {
                break;
            }
            let end = segment.find(['&', '"', '\'']).unwrap_or(segment.len());
            let Ok(url) = urlencoding::decode(&segment[..end]) else {
                continue;
            };
            let url = url.into_owned();
            if is_external(&url) && seen.insert(url.clone()) {
                let title = extract_domain(&url).unwrap_or_else(|| "Result".to_string());
                raw.push((url, title, String::new()));
            }
        }
    }

    let count = raw.len().max(1) as f32;
    raw.into_iter()
        .enumerate()
        .map(|(rank, (url, title, snippet))| {
            // Rank 0 scores 1.0, the last result just above 0.5
            let relevance = 1.0 - (rank as f32 / count) * 0.5;
            let content = if snippet.is_empty() { title.clone() } else { snippet };
            let title = if title.is_empty() {
                extract_domain(&url).unwrap_or_else(|| "Result".to_string())
            } else {
                title
            };
            SearchHit::new(url, content, relevance).with_title(title)
        })
        .collect()
}

/// Value of the first `name="..."` attribute in `tag`
fn attr_value(tag: &str, name: &str) -> Option<String> {
    let marker = format!("{}=\"", name);
    let start = tag.find(&marker)? + marker.len();
    let end = tag[start..].find('"')?;
    Some(tag[start..start + end].to_string())
}

/// Resolve a result link, unwrapping DuckDuckGo's redirect
fn resolve_href(href: &str) -> Option<String> {
    let href = decode_entities(href);
    let url = match href.split_once("uddg=") {
        Some((_, rest)) => {
            let encoded = rest.split('&').next().unwrap_or(rest);
            urlencoding::decode(encoded).ok()?.into_owned()
        }
        None if href.starts_with("//") => format!("https:{}", href),
        None => href,
    };
    is_external(&url).then_some(url)
}

fn is_external(url: &str) -> bool {
    url.starts_with("http") && !url.contains("duckduckgo.com")
}

/// Text up to the closing `</a>`, tags stripped and whitespace collapsed
fn element_text(fragment: &str) -> String {
    let inner = fragment.split("</a>").next().unwrap_or(fragment);
    let mut text = String::with_capacity(inner.len());
    let mut in_tag = false;
    for c in inner.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

/// Extract the domain name from a URL.
fn extract_domain(url: &str) -> Option<String> {
    url.split("//")
        .nth(1)?
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
