use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{FetchConfig, USER_AGENT};
use crate::error::FetchError;

const READY_POLL: Duration = Duration::from_millis(250);
/// Launch and teardown allowance on top of navigation and readiness.
const SESSION_SLACK: Duration = Duration::from_secs(15);

/// Rendered HTML plus the URL relative links resolve against.
#[derive(Debug, Clone)]
pub struct Document {
    pub url: Url,
    pub html: String,
}

impl Document {
    pub fn new(url: Url, html: impl Into<String>) -> Self {
        Self {
            url,
            html: html.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchTier {
    Http,
    Browser,
}

impl fmt::Display for FetchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchTier::Http => f.write_str("http"),
            FetchTier::Browser => f.write_str("browser"),
        }
    }
}

/// Anything that can turn a URL into a document at a given tier.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &Url, tier: FetchTier) -> Result<Document, FetchError>;
}

// ── Tier 1 ──

pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, timeout })
    }

    pub async fn get(&self, url: &Url) -> Result<Document, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.map_err(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::status(url.as_str(), status.as_u16()));
        }

        let final_url = response.url().clone();
        let html = response.text().await.map_err(|e| self.map_err(url, e))?;
        Ok(Document::new(final_url, html))
    }

    fn map_err(&self, url: &Url, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            FetchError::unreachable(url.as_str(), err.to_string())
        }
    }
}

// ── Tier 2 ──

pub struct BrowserFetcher {
    nav_timeout: Duration,
    ready_timeout: Duration,
    sessions: Semaphore,
}

impl BrowserFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            nav_timeout: config.browser_timeout,
            ready_timeout: config.ready_timeout,
            sessions: Semaphore::new(config.browser_sessions.max(1)),
        }
    }

    /// Render `url` in a fresh headless browser. The whole session, launch to teardown, is bounded.
    pub async fn render(&self, url: &Url) -> Result<Document, FetchError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|e| FetchError::unreachable(url.as_str(), e.to_string()))?;

        let budget = self.nav_timeout + self.ready_timeout + SESSION_SLACK;
        bounded(budget, url, self.session(url)).await
    }

    async fn session(&self, url: &Url) -> Result<Document, FetchError> {
        info!("Rendering {} in browser", url);
        let config = BrowserConfig::builder()
            .no_sandbox()
            .arg(format!("--user-agent={USER_AGENT}"))
            .build()
            .map_err(|e| FetchError::unreachable(url.as_str(), format!("browser config: {e}")))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::unreachable(url.as_str(), format!("browser launch: {e}")))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = self.capture(&browser, url).await;

        if let Err(e) = browser.close().await {
            warn!("Browser close failed for {}: {}", url, e);
        }
        if let Err(e) = browser.wait().await {
            warn!("Browser wait failed for {}: {}", url, e);
        }
        events.abort();

        result
    }

    async fn capture(&self, browser: &Browser, url: &Url) -> Result<Document, FetchError> {
        let page = bounded(self.nav_timeout, url, async {
            browser
                .new_page(url.as_str())
                .await
                .map_err(|e| FetchError::unreachable(url.as_str(), e.to_string()))
        })
        .await?;

        // Readiness is best-effort: a page without images is still captured.
        let ready = tokio::time::timeout(self.ready_timeout, async {
            while page.find_element("img").await.is_err() {
                tokio::time::sleep(READY_POLL).await;
            }
        })
        .await;
        if ready.is_err() {
            debug!("No image rendered on {} within {:?}", url, self.ready_timeout);
        }

        let html = page
            .content()
            .await
            .map_err(|e| FetchError::unreachable(url.as_str(), e.to_string()))?;
        let reported = page.url().await.ok().flatten();
        Ok(Document::new(final_url(reported.as_deref(), url), html))
    }
}

/// Run `fut` under `budget`; running out is a `FetchError::Timeout` for `url`.
async fn bounded<T>(
    budget: Duration,
    url: &Url,
    fut: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| FetchError::Timeout {
            url: url.to_string(),
            secs: budget.as_secs(),
        })?
}

/// Where the browser ended up after redirects, falling back to the requested URL.
fn final_url(reported: Option<&str>, requested: &Url) -> Url {
    reported
        .and_then(|u| Url::parse(u).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or_else(|| requested.clone())
}

// ── Combined ──

/// Both tiers behind one `PageSource`. Escalation between them is the caller's decision.
pub struct Fetcher {
    http: HttpFetcher,
    browser: BrowserFetcher,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http_timeout)?,
            browser: BrowserFetcher::new(config),
        })
    }
}

#[async_trait]
impl PageSource for Fetcher {
    async fn fetch(&self, url: &Url, tier: FetchTier) -> Result<Document, FetchError> {
        match tier {
            FetchTier::Http => self.http.get(url).await,
            FetchTier::Browser => self.browser.render(url).await,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory site: per-tier HTML keyed by URL, with a log of every fetch.
    #[derive(Default)]
    pub struct FakeSite {
        pages: HashMap<(String, FetchTier), String>,
        pub calls: Mutex<Vec<(String, FetchTier)>>,
    }

    impl FakeSite {
        pub fn page(mut self, url: &str, tier: FetchTier, html: &str) -> Self {
            self.pages.insert((url.to_string(), tier), html.to_string());
            self
        }

        /// Same HTML at both tiers.
        pub fn both(self, url: &str, html: &str) -> Self {
            self.page(url, FetchTier::Http, html)
                .page(url, FetchTier::Browser, html)
        }

        pub fn count(&self, url: &str, tier: FetchTier) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, t)| u == url && *t == tier)
                .count()
        }
    }

    #[async_trait]
    impl PageSource for FakeSite {
        async fn fetch(&self, url: &Url, tier: FetchTier) -> Result<Document, FetchError> {
            self.calls.lock().unwrap().push((url.to_string(), tier));
            match self.pages.get(&(url.to_string(), tier)) {
                Some(html) => Ok(Document::new(url.clone(), html.clone())),
                None => Err(FetchError::status(url.as_str(), 404)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSite;
    use super::*;

    #[tokio::test]
    async fn fake_site_records_calls_per_tier() {
        let site = FakeSite::default().page("https://a.test/x", FetchTier::Http, "<p>x</p>");
        let url = Url::parse("https://a.test/x").unwrap();
        assert!(site.fetch(&url, FetchTier::Http).await.is_ok());
        assert!(site.fetch(&url, FetchTier::Browser).await.is_err());
        assert_eq!(site.count("https://a.test/x", FetchTier::Http), 1);
        assert_eq!(site.count("https://a.test/x", FetchTier::Browser), 1);
    }

    #[tokio::test]
    async fn stalled_operation_times_out() {
        let url = Url::parse("https://a.test/slow").unwrap();
        let result: Result<(), FetchError> =
            bounded(Duration::from_millis(10), &url, std::future::pending()).await;
        assert!(matches!(result, Err(FetchError::Timeout { .. })));

        let done = bounded(Duration::from_secs(1), &url, async { Ok(7) }).await;
        assert_eq!(done.unwrap(), 7);
    }

    #[test]
    fn rendered_document_uses_final_url() {
        let requested = Url::parse("https://shop.test/old.html").unwrap();
        assert_eq!(
            final_url(Some("https://shop.test/new.html?path=0_1"), &requested).as_str(),
            "https://shop.test/new.html?path=0_1"
        );
        assert_eq!(final_url(None, &requested), requested);
        assert_eq!(final_url(Some("about:blank"), &requested), requested);
    }

    #[test]
    fn tier_names() {
        assert_eq!(FetchTier::Http.to_string(), "http");
        assert_eq!(FetchTier::Browser.to_string(), "browser");
    }
}
