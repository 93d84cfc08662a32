//! Rate-limited web fetch for URL baseline sources.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use skillfactory_shared::{BaselineFetchConfig, BaselineReference, Result, SkillFactoryError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::convert::{html_to_markdown, looks_like_html};

const USER_AGENT: &str = concat!("SkillFactory/", env!("CARGO_PKG_VERSION"));

/// Fetches single pages, enforcing a minimum interval between requests.
pub struct Fetcher {
    client: Client,
    min_interval: Duration,
    last_fetch: Mutex<Option<Instant>>,
    allow_localhost: bool,
}

impl Fetcher {
    pub fn new(config: &BaselineFetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SkillFactoryError::Network(e.to_string()))?;

        Ok(Self {
            client,
            min_interval: Duration::from_millis(config.rate_limit_ms),
            last_fetch: Mutex::new(None),
            allow_localhost: false,
        })
    }

    /// Allow loopback targets (for testing with local mock servers).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Fetch a URL and return it as a Markdown reference.
    pub async fn fetch(&self, raw_url: &str) -> Result<BaselineReference> {
        let url = Url::parse(raw_url)
            .map_err(|e| SkillFactoryError::validation(format!("invalid URL {raw_url}: {e}")))?;
        if !self.allow_localhost && is_blocked_target(&url) {
            return Err(SkillFactoryError::validation(format!(
                "refusing to fetch non-public URL {url}"
            )));
        }

        self.wait_turn().await;
        tracing::debug!(%url, "fetching baseline page");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| SkillFactoryError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SkillFactoryError::Network(format!("{url}: HTTP {status}")));
        }

        let is_html_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("html"));

        let body = response
            .text()
            .await
            .map_err(|e| SkillFactoryError::Network(format!("{url}: body read failed: {e}")))?;

        let content = if is_html_type || looks_like_html(&body) {
            html_to_markdown(&body, Some(&url))?
        } else {
            body
        };

        if content.trim().is_empty() {
            return Err(SkillFactoryError::Conversion(format!("{url}: no content")));
        }
        Ok(BaselineReference::new(url.to_string(), content))
    }

    /// Sleep until `min_interval` has passed since the previous fetch.
    async fn wait_turn(&self) {
        let mut last = self.last_fetch.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Non-HTTP schemes and private or loopback hosts.
fn is_blocked_target(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return true;
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

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
