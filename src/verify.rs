use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::USER_AGENT;
use crate::error::{FetchError, ValidationError};
use crate::models::MatchResult;
use crate::parser::meta;

const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const PAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Network checks behind official-image resolution.
#[async_trait]
pub trait ImageProbe: Send + Sync {
    /// Ok only when the URL answers a HEAD request with 200.
    async fn head_ok(&self, url: &str) -> Result<(), ValidationError>;
    async fn page_html(&self, url: &str) -> Result<String, FetchError>;
}

pub struct HttpProbe {
    head: reqwest::Client,
    page: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> anyhow::Result<Self> {
        let build = |timeout: Duration| {
            reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()
        };
        Ok(Self {
            head: build(HEAD_TIMEOUT)?,
            page: build(PAGE_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl ImageProbe for HttpProbe {
    async fn head_ok(&self, url: &str) -> Result<(), ValidationError> {
        let response = self
            .head
            .head(url)
            .send()
            .await
            .map_err(|e| ValidationError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        match response.status().as_u16() {
            200 => Ok(()),
            status => Err(ValidationError::BadStatus {
                url: url.to_string(),
                status,
            }),
        }
    }

    async fn page_html(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .page
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::unreachable(url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::status(url, status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| FetchError::unreachable(url, e.to_string()))
    }
}

/// Keep the asserted image if it is live, otherwise scrape one from the matched page.
/// Only matches with an official page are touched.
pub async fn resolve_official_image(probe: &dyn ImageProbe, mut m: MatchResult) -> MatchResult {
    let Some(page_url) = m.official_page_url.clone().filter(|_| m.match_found) else {
        return m;
    };

    if let Some(image) = m.official_main_image_url.take() {
        match probe.head_ok(&image).await {
            Ok(()) => {
                info!("Image URL validated: {}", image);
                m.official_main_image_url = Some(image);
                return m;
            }
            Err(e) => warn!("Asserted image rejected: {}", e),
        }
    }

    info!("Scraping representative image from {}", page_url);
    m.official_main_image_url = match probe.page_html(&page_url).await {
        Ok(html) => meta::representative_image(&html),
        Err(e) => {
            warn!("Failed to load matched page: {}", e);
            None
        }
    };
    if m.official_main_image_url.is_none() {
        warn!("No representative image found at {}", page_url);
    }
    m
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Live image URLs and page bodies, with a log of HEAD checks.
    #[derive(Default)]
    pub struct FakeProbe {
        pub live: Vec<String>,
        pub pages: HashMap<String, String>,
        pub heads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageProbe for FakeProbe {
        async fn head_ok(&self, url: &str) -> Result<(), ValidationError> {
            self.heads.lock().unwrap().push(url.to_string());
            if self.live.iter().any(|u| u == url) {
                Ok(())
            } else {
                Err(ValidationError::BadStatus {
                    url: url.to_string(),
                    status: 404,
                })
            }
        }

        async fn page_html(&self, url: &str) -> Result<String, FetchError> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::status(url, 404))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::testing::FakeProbe;
    use super::*;
    use crate::error::CollaboratorError;

    const PAGE: &str = "https://www.marcjacobs.com/snapshot.html";

    fn matched(image: Option<&str>) -> MatchResult {
        MatchResult {
            match_found: true,
            match_confidence: 0.9,
            official_page_url: Some(PAGE.into()),
            official_main_image_url: image.map(String::from),
            ..MatchResult::degraded("1", &CollaboratorError::Empty)
        }
    }

    #[tokio::test]
    async fn live_image_is_kept() {
        let probe = FakeProbe {
            live: vec!["https://cdn.shopify.com/a.jpg".into()],
            ..Default::default()
        };
        let m = resolve_official_image(&probe, matched(Some("https://cdn.shopify.com/a.jpg"))).await;
        assert_eq!(m.official_main_image_url.as_deref(), Some("https://cdn.shopify.com/a.jpg"));
    }

    #[tokio::test]
    async fn dead_image_falls_back_to_page_meta() {
        let probe = FakeProbe {
            pages: HashMap::from([(
                PAGE.to_string(),
                r#"<meta property="og:image" content="https://img.marcjacobs.com/og.jpg">"#.to_string(),
            )]),
            ..Default::default()
        };
        let m = resolve_official_image(&probe, matched(Some("https://made.up/cdn.jpg"))).await;
        assert_eq!(m.official_main_image_url.as_deref(), Some("https://img.marcjacobs.com/og.jpg"));
        assert_eq!(probe.heads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn everything_failing_leaves_empty() {
        let probe = FakeProbe::default();
        let m = resolve_official_image(&probe, matched(None)).await;
        assert!(m.official_main_image_url.is_none());
        assert!(probe.heads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_results_are_untouched() {
        let probe = FakeProbe::default();
        let mut m = matched(Some("https://made.up/x.jpg"));
        m.match_found = false;
        let out = resolve_official_image(&probe, m.clone()).await;
        assert_eq!(out, m);
        assert!(probe.heads.lock().unwrap().is_empty());
    }
}
