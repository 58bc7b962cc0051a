//! Bounded page fetcher shared by every plugin that reads the web.
//!
//! A single [`PageFetcher`] is created per run. Its page pool bounds how many
//! pages are in flight at once, independently of the row and model-request
//! pools. Successful visits are cached under the `fetch` namespace keyed by
//! the normalized URL.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::{Client, redirect};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use url::Url;

use rowforge_shared::{Result, RowForgeError};
use rowforge_storage::{FETCH_NAMESPACE, KeyValueCache, cache_key};

use crate::render::{PageLink, render};

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!("rowforge/", env!("CARGO_PKG_VERSION"));

/// Redirect hops followed before a visit fails.
const MAX_REDIRECTS: usize = 5;

/// Default cap on a fetched body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// A visited page, rendered for model consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Normalized URL that was requested.
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub links: Vec<PageLink>,
}

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// HTTP page visitor with a bounded page pool and optional fetch cache.
pub struct PageFetcher {
    client: Client,
    pages: Arc<Semaphore>,
    cache: Option<Arc<dyn KeyValueCache>>,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    /// Shared with the redirect policy, which re-checks every hop.
    allow_private_hosts: Arc<AtomicBool>,
    max_body_bytes: usize,
}

impl PageFetcher {
    /// Create a fetcher allowing at most `max_pages` concurrent visits.
    pub fn new(max_pages: usize) -> Result<Self> {
        let allow_private_hosts = Arc::new(AtomicBool::new(false));
        let policy_allows = allow_private_hosts.clone();
        let policy = redirect::Policy::custom(move |attempt| {
            let allow_private = policy_allows.load(Ordering::Relaxed);
            match check_redirect(attempt.url(), attempt.previous().len(), allow_private) {
                Ok(()) => attempt.follow(),
                Err(reason) => attempt.error(reason),
            }
        });

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(policy)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RowForgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            pages: Arc::new(Semaphore::new(max_pages.max(1))),
            cache: None,
            allow_private_hosts,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Fail visits whose body exceeds `bytes`.
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes.max(1);
        self
    }

    /// Serve repeated visits from `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Allow visiting localhost/private IPs (mock servers in tests).
    pub fn allow_private_hosts(self, allow: bool) -> Self {
        self.allow_private_hosts.store(allow, Ordering::Relaxed);
        self
    }

    /// Visit a page: fetch, render to text, and extract its link model.
    ///
    /// Every failure is reported as [`RowForgeError::CrawlPage`] so callers can
    /// isolate it to this one page.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn visit(&self, url: &str) -> Result<Page> {
        let parsed = Url::parse(url).map_err(|e| page_error(url, format!("invalid URL: {e}")))?;

        if !self.allow_private_hosts.load(Ordering::Relaxed) && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(page_error(url, "blocked by SSRF protection"));
        }

        let normalized = normalize_url(&parsed);
        let key = cache_key(&normalized);

        if let Some(cache) = &self.cache {
            match cache.get(FETCH_NAMESPACE, &key).await {
                Ok(Some(hit)) => match serde_json::from_str::<Page>(&hit) {
                    Ok(page) => {
                        debug!("fetch cache hit");
                        return Ok(page);
                    }
                    Err(e) => warn!(error = %e, "discarding unreadable fetch cache entry"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "fetch cache lookup failed"),
            }
        }

        let body = {
            let _permit = self
                .pages
                .acquire()
                .await
                .map_err(|e| page_error(url, format!("page pool closed: {e}")))?;
            self.fetch_body(&parsed).await?
        };

        let rendered = render(&body, &parsed).map_err(|e| page_error(url, e.to_string()))?;
        let page = Page {
            url: normalized,
            title: rendered.title,
            text: rendered.text,
            links: rendered.links,
        };
        debug!(links = page.links.len(), text_len = page.text.len(), "page rendered");

        if let Some(cache) = &self.cache {
            match serde_json::to_string(&page) {
                Ok(serialized) => {
                    if let Err(e) = cache.put(FETCH_NAMESPACE, &key, &serialized).await {
                        warn!(error = %e, "failed to store fetch cache entry");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize page for cache"),
            }
        }

        Ok(page)
    }

    async fn fetch_body(&self, url: &Url) -> Result<String> {
        debug!(%url, "fetching page");

        let mut response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| page_error(url.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(page_error(url.as_str(), format!("HTTP {status}")));
        }

        let too_large = || {
            page_error(
                url.as_str(),
                format!("body exceeds {} bytes", self.max_body_bytes),
            )
        };
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| page_error(url.as_str(), format!("body read failed: {e}")))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Decide whether a redirect hop to `next` may be followed after `hops` earlier URLs.
fn check_redirect(next: &Url, hops: usize, allow_private: bool) -> std::result::Result<(), String> {
    if hops > MAX_REDIRECTS {
        return Err(format!("more than {MAX_REDIRECTS} redirects"));
    }
    if !allow_private && is_ssrf_target(next) {
        return Err(format!("redirect to {next} blocked by SSRF protection"));
    }
    Ok(())
}

fn page_error(url: &str, message: impl Into<String>) -> RowForgeError {
    RowForgeError::CrawlPage {
        url: url.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Normalize a URL for deduplication (strip fragment, trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Remove trailing slash for consistency (except root path)
    if s.ends_with('/') && url.path() != "/" {
        s.pop();
    }
    s
}

/// Normalize a URL string; unparseable input is returned unchanged.
pub fn normalize_str(url: &str) -> String {
    Url::parse(url)
        .map(|u| normalize_url(&u))
        .unwrap_or_else(|_| url.to_string())
}

/// True when both URLs share scheme, host and port.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
