use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

const DEFAULT_BASE_URL: &str = "https://bags.qiqiyg.com/";
const DEFAULT_SUPPLIER: &str = "QiQiYG";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// URL shapes of the catalog being crawled.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub base_url: url::Url,
    pub supplier_name: String,
    /// Top-level category pages linked from the home page.
    pub category: Regex,
    /// Product detail pages.
    pub product: Regex,
    /// Category or listing pages carrying a hierarchical `path=` parameter.
    pub listing: Regex,
    /// Numeric id embedded in a detail-page path.
    pub product_id: Regex,
    /// Path fragment marking uploaded product imagery.
    pub upload_marker: String,
}

impl SiteProfile {
    pub fn new(base_url: &str, supplier_name: &str) -> Result<Self> {
        Ok(Self {
            base_url: url::Url::parse(base_url)
                .with_context(|| format!("invalid base url {base_url}"))?,
            supplier_name: supplier_name.to_string(),
            category: Regex::new(r"categoryen_\d+\.html\?path=0_\d+")?,
            product: Regex::new(r"productinfoen_\d+")?,
            listing: Regex::new(r"(categoryen|producten)_\d+.*path=0_")?,
            product_id: Regex::new(r"productinfoen_(\d+)")?,
            upload_marker: "upfile".to_string(),
        })
    }
}

#[cfg(test)]
impl Default for SiteProfile {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_SUPPLIER).unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub http_timeout: Duration,
    pub browser_timeout: Duration,
    pub ready_timeout: Duration,
    pub browser_sessions: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(15),
            browser_timeout: Duration::from_secs(15),
            ready_timeout: Duration::from_secs(15),
            browser_sessions: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_depth: u8,
    /// Pages shallower than this are re-rendered in a browser when tier 1 finds no links.
    pub escalate_below_depth: u8,
    pub workers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            escalate_below_depth: 2,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

impl GeminiConfig {
    /// Collaborator credentials are the one thing a run cannot start without.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GOOGLE_API_KEY")
            .or_else(|_| env::var("GEMINI_API_KEY"))
            .map_err(|_| anyhow::anyhow!("GOOGLE_API_KEY or GEMINI_API_KEY must be set"))?;
        let model = env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self { api_key, model })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub site: SiteProfile,
    pub fetch: FetchConfig,
    pub discovery: DiscoveryConfig,
    pub scrape_concurrency: usize,
    pub match_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("CATALOG_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let supplier = env::var("CATALOG_SUPPLIER").unwrap_or_else(|_| DEFAULT_SUPPLIER.into());

        let fetch = FetchConfig {
            http_timeout: Duration::from_secs(env_or("CATALOG_HTTP_TIMEOUT_SECS", 15)?),
            browser_timeout: Duration::from_secs(env_or("CATALOG_BROWSER_TIMEOUT_SECS", 15)?),
            browser_sessions: env_or("CATALOG_BROWSER_SESSIONS", 2)?,
            ..FetchConfig::default()
        };
        let discovery = DiscoveryConfig {
            workers: env_or("CATALOG_DISCOVERY_WORKERS", 4)?,
            ..DiscoveryConfig::default()
        };

        Ok(Self {
            data_dir: env::var("CATALOG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            site: SiteProfile::new(&base_url, &supplier)?,
            fetch,
            discovery,
            scrape_concurrency: env_or("CATALOG_SCRAPE_CONCURRENCY", 4)?,
            match_concurrency: env_or("CATALOG_MATCH_CONCURRENCY", 2)?,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("catalog.sqlite")
    }

    pub fn export_path(&self) -> PathBuf {
        self.data_dir.join("inventory_export.csv")
    }

    pub fn runs_log_path(&self) -> PathBuf {
        self.data_dir.join("runs_log.csv")
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        Err(_) => Ok(default),
    }
}
