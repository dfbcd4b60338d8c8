use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::error::FetchError;
use crate::fetch::{Document, FetchTier, PageSource};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
        }
    }
}

/// One queued product page after both fetch tiers had their chance.
#[derive(Debug)]
pub struct Fetched {
    pub page_id: i64,
    pub url: String,
    pub result: Result<Document, FetchError>,
}

/// Fetch pages concurrently and stream each result to the returned receiver as it completes.
/// The channel closes once every page has been sent, or early on cancellation.
pub fn scrape_pages_streaming(
    source: Arc<dyn PageSource>,
    pages: Vec<(i64, String)>,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> mpsc::Receiver<Fetched> {
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, rx) = mpsc::channel::<Fetched>(concurrency * 2);

    for (page_id, url) in pages {
        let source = Arc::clone(&source);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            let result = match Url::parse(&url) {
                Ok(parsed) => fetch_product(source.as_ref(), &parsed, retry).await,
                Err(e) => Err(FetchError::unreachable(&url, e.to_string())),
            };
            let _ = tx.send(Fetched { page_id, url, result }).await;
        });
    }

    rx
}

/// Tier 1 with retry on transient statuses, then the browser when tier 1 gives up.
pub async fn fetch_product(
    source: &dyn PageSource,
    url: &Url,
    retry: RetryPolicy,
) -> Result<Document, FetchError> {
    match fetch_with_retry(source, url, retry).await {
        Ok(doc) => Ok(doc),
        Err(e) => {
            info!("Fetch failed for {} ({}), retrying with browser", url, e);
            source.fetch(url, FetchTier::Browser).await
        }
    }
}

async fn fetch_with_retry(
    source: &dyn PageSource,
    url: &Url,
    retry: RetryPolicy,
) -> Result<Document, FetchError> {
    let mut attempt = 0;
    loop {
        match source.fetch(url, FetchTier::Http).await {
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let backoff = retry.base_backoff * 2u32.pow(attempt);
                warn!(
                    "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                    url,
                    attempt + 1,
                    retry.max_retries,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::fetch::testing::FakeSite;

    const NO_WAIT: RetryPolicy = RetryPolicy {
        max_retries: 3,
        base_backoff: Duration::ZERO,
    };

    /// Tier 1 answers from a script of statuses; tier 2 always renders.
    struct Flaky {
        script: Mutex<VecDeque<u16>>,
        http_calls: Mutex<usize>,
        browser_calls: Mutex<usize>,
    }

    impl Flaky {
        fn new(script: &[u16]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                http_calls: Mutex::new(0),
                browser_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for Flaky {
        async fn fetch(&self, url: &Url, tier: FetchTier) -> Result<Document, FetchError> {
            match tier {
                FetchTier::Http => {
                    *self.http_calls.lock().unwrap() += 1;
                    match self.script.lock().unwrap().pop_front().unwrap_or(200) {
                        200 => Ok(Document::new(url.clone(), "<p>http</p>")),
                        status => Err(FetchError::status(url.as_str(), status)),
                    }
                }
                FetchTier::Browser => {
                    *self.browser_calls.lock().unwrap() += 1;
                    Ok(Document::new(url.clone(), "<p>browser</p>"))
                }
            }
        }
    }

    fn url() -> Url {
        Url::parse("https://bags.qiqiyg.com/productinfoen_1.html").unwrap()
    }

    #[tokio::test]
    async fn transient_statuses_are_retried() {
        let source = Flaky::new(&[503, 429]);
        let doc = fetch_product(&source, &url(), NO_WAIT).await.unwrap();
        assert_eq!(doc.html, "<p>http</p>");
        assert_eq!(*source.http_calls.lock().unwrap(), 3);
        assert_eq!(*source.browser_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate() {
        let source = Flaky::new(&[500, 500, 500, 500]);
        let doc = fetch_product(&source, &url(), NO_WAIT).await.unwrap();
        assert_eq!(doc.html, "<p>browser</p>");
        assert_eq!(*source.http_calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn hard_failures_escalate_immediately() {
        let source = Flaky::new(&[404]);
        let doc = fetch_product(&source, &url(), NO_WAIT).await.unwrap();
        assert_eq!(doc.html, "<p>browser</p>");
        assert_eq!(*source.http_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn streams_every_page() {
        let site = FakeSite::default()
            .page("https://a.test/p1", FetchTier::Http, "<p>1</p>")
            .page("https://a.test/p2", FetchTier::Browser, "<p>2</p>");
        let pages = vec![
            (1, "https://a.test/p1".to_string()),
            (2, "https://a.test/p2".to_string()),
            (3, "https://a.test/p3".to_string()),
            (4, "not a url".to_string()),
        ];

        let mut rx = scrape_pages_streaming(Arc::new(site), pages, 2, NO_WAIT, CancellationToken::new());
        let mut got = Vec::new();
        while let Some(f) = rx.recv().await {
            got.push((f.page_id, f.result.is_ok()));
        }
        got.sort();
        assert_eq!(got, vec![(1, true), (2, true), (3, false), (4, false)]);
    }

    #[tokio::test]
    async fn cancelled_before_start_sends_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let site = FakeSite::default().both("https://a.test/p1", "<p>1</p>");
        let mut rx = scrape_pages_streaming(
            Arc::new(site),
            vec![(1, "https://a.test/p1".to_string())],
            1,
            NO_WAIT,
            cancel,
        );
        assert!(rx.recv().await.is_none());
    }
}
