use std::collections::BTreeSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::config::SiteProfile;
use crate::fetch::Document;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Links found on one listing page, split by URL shape.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LinkSet {
    pub products: BTreeSet<String>,
    pub listings: BTreeSet<String>,
}

impl LinkSet {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.listings.is_empty()
    }
}

pub fn classify(doc: &Document, site: &SiteProfile) -> LinkSet {
    let mut links = LinkSet::default();
    for url in anchors(doc) {
        let shape = path_and_query(&url);
        if site.product.is_match(&shape) {
            links.products.insert(url.to_string());
        } else if site.listing.is_match(&shape) {
            links.listings.insert(url.to_string());
        }
    }
    links
}

/// Top-level category pages linked from the home page, sorted, capped at `limit`.
pub fn category_seeds(doc: &Document, site: &SiteProfile, limit: Option<usize>) -> Vec<String> {
    let seeds: BTreeSet<String> = anchors(doc)
        .filter(|url| site.category.is_match(&path_and_query(url)))
        .map(|url| url.to_string())
        .collect();
    let take = limit.unwrap_or(usize::MAX);
    seeds.into_iter().take(take).collect()
}

/// Every http(s) anchor on the page, resolved against the document URL.
fn anchors(doc: &Document) -> impl Iterator<Item = Url> + '_ {
    let html = Html::parse_document(&doc.html);
    let resolved: Vec<Url> = html
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| doc.url.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .collect();
    resolved.into_iter()
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}
